//! Scatter-gather engine: scheduling, stage execution, fan-out, per-unit
//! chains, keyed fan-in and run orchestration.

mod aggregate;
mod chain;
mod executor;
mod fanout;
mod metrics;
mod scheduler;
mod stages;


pub use aggregate::{
    AggregateRow, AggregationPolicy, BranchGroup, BranchKind, BranchMessage, BranchSpec,
    BranchValue, ExcludedUnit, KeyedAggregator, MissingParentPolicy, OutcomeTally,
    ParentAggregate,
};
pub use chain::{ChainBuilder, ChainReport, StageRecord, UnitChain, UnitStatus};
pub use executor::{ArtifactKind, Stage, StageExecutor, StageOutcome};
pub use fanout::{ClusterStats, Expansion, FanOut, DEFAULT_MAX_SUB_UNITS, READ_COUNT_ATTR};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use scheduler::{
    Cancellation, ClassBudget, ClassPermit, ClassStats, Footprint, ResourceClass,
    ResourceScheduler, SchedulerStats,
};
pub use stages::{
    LabelingProfile, Pipeline, PipelineConfig, RunOutcome, RunStats, NO_CLUSTERS_REASON,
};
