//! Run orchestration.
//!
//! Parents are pulled from a shared queue by a fixed pool of workers. Each
//! worker labels a parent, fans it out, and feeds the resulting children
//! through the branches:
//!
//! ```text
//!            ┌──────────┐   ┌─────────┐   ┌───────────────┐
//! parent ───▶│ Labeling │──▶│ Fan-out │──▶│ Consensus     │──┐
//!            └──────────┘   └─────────┘   │ chain (N)     │  │
//!                                         └──────┬────────┘  │
//!                                                ▼           ▼
//!                                         ┌───────────────┐ ┌────────────┐
//!                                         │ Classifiers   │▶│ Aggregator │──▶ sink
//!                                         └───────────────┘ └────────────┘
//! ```
//!
//! Every branch reports to the aggregator over its own bounded channel and
//! seals a parent once all of its sub-units are reported. Child units of a
//! parent run concurrently, gated only by their stage's resource class.
//! Each aggregate is joined per branch into the artifact store, then
//! reported to the sink.

use crate::error::{FanOutError, GraphError, ToolError};
use crate::io::{ArtifactStore, ParentReport, ReportSink, RunSummary};
use crate::pipeline::aggregate::{
    AggregationPolicy, BranchMessage, BranchSpec, KeyedAggregator, OutcomeTally, ParentAggregate,
};
use crate::pipeline::chain::{ChainReport, UnitChain, UnitStatus};
use crate::pipeline::executor::{Stage, StageExecutor, StageOutcome};
use crate::pipeline::fanout::{ClusterStats, FanOut};
use crate::pipeline::{Cancellation, Footprint, ResourceClass};
use crate::tools::{Labeler, Labeling};
use crate::unit::{ParentKey, Unit};
use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Reason attached to the lone unassigned unit of a parent with no clusters.
pub const NO_CLUSTERS_REASON: &str = "no clusters discovered; all records unassigned";

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parents labeled and fanned out concurrently
    pub parent_concurrency: usize,
    /// Buffer of each branch channel feeding the aggregator
    pub channel_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parent_concurrency: 4,
            channel_buffer: 256,
        }
    }
}

/// Scheduling contract of the labeling collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelingProfile {
    pub class: ResourceClass,
    pub footprint: Footprint,
    pub timeout: Option<Duration>,
}

impl Default for LabelingProfile {
    fn default() -> Self {
        Self {
            class: ResourceClass::Light,
            footprint: Footprint::new(1, 1.0),
            timeout: None,
        }
    }
}

/// Everything a parent worker needs, shared across workers and child tasks.
struct ParentWorker {
    executor: StageExecutor,
    labeler: Arc<dyn Labeler>,
    labeling: LabelingProfile,
    fanout: FanOut,
    chain: UnitChain,
    classifiers: Vec<Arc<Stage>>,
    artifacts: Option<Arc<ArtifactStore>>,
    clusters: DashMap<ParentKey, (ClusterStats, Option<String>)>,
}

/// One sender per branch.
#[derive(Clone)]
struct BranchSenders(BTreeMap<String, mpsc::Sender<BranchMessage>>);

impl BranchSenders {
    async fn send(&self, branch: &str, message: BranchMessage) {
        if let Some(tx) = self.0.get(branch) {
            // The aggregator stops listening on cancellation or strict failure
            if tx.send(message).await.is_err() {
                tracing::debug!("Aggregator gone; dropping message for branch '{}'", branch);
            }
        }
    }

    async fn fail_all(&self, parent: &ParentKey, reason: &str) {
        for branch in self.0.keys() {
            self.send(
                branch,
                BranchMessage::ParentFailed {
                    parent: parent.clone(),
                    reason: reason.to_string(),
                },
            )
            .await;
        }
    }
}

impl ParentWorker {
    /// Run the labeling collaborator under its class permit and timeout.
    async fn label(&self, parent: &Unit) -> Result<Labeling, FanOutError> {
        let scheduler = self.executor.scheduler();
        let cancel = scheduler.cancellation();
        let wrap = |source: ToolError| FanOutError::Labeler {
            parent: parent.parent_key().clone(),
            source,
        };

        let Some(_permit) = scheduler.acquire(self.labeling.class).await else {
            return Err(wrap(ToolError::fatal("cancelled before admission")));
        };

        let start = Instant::now();
        let labeler = self.labeler.clone();
        let task_parent = parent.clone();
        let handle = tokio::spawn(async move { labeler.label(&task_parent).await });
        let abort = handle.abort_handle();
        let call = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(ToolError::fatal(format!("labeler panicked: {}", e))))
        };
        let result = tokio::select! {
            result = async {
                match self.labeling.timeout {
                    Some(limit) => tokio::time::timeout(limit, call)
                        .await
                        .unwrap_or_else(|_| Err(ToolError::fatal(format!("timed out after {:?}", limit)))),
                    None => call.await,
                }
            } => result,
            _ = cancel.cancelled() => Err(ToolError::fatal("cancelled")),
        };
        // No-op once the task has finished; stops a timed-out labeler
        abort.abort();
        self.executor.metrics().add_labeling_time(start.elapsed());

        result.map_err(wrap)
    }

    /// Write a usable artifact to the store. A storage failure is fatal for
    /// the unit in that branch.
    async fn store(&self, unit: &Unit, branch: &str, outcome: StageOutcome) -> StageOutcome {
        let (Some(store), Some(sub)) = (&self.artifacts, unit.sub_key()) else {
            return outcome;
        };
        let Some(artifact) = outcome.artifact().cloned() else {
            return outcome;
        };

        match store.put(unit.parent_key(), sub, branch, &artifact).await {
            Ok(bytes) => {
                self.executor.metrics().add_bytes_stored(bytes);
                outcome
            }
            Err(e) => {
                tracing::warn!("Failed to store {} artifact for {}: {}", branch, unit.key(), e);
                StageOutcome::Failed(format!("{}: storing artifact: {}", branch, e))
            }
        }
    }

    /// Label, fan out and run every branch for one parent.
    async fn process_parent(self: &Arc<Self>, parent: Unit, senders: &BranchSenders) {
        let key = parent.parent_key().clone();

        let labeling = match self.label(&parent).await {
            Ok(labeling) => labeling,
            Err(e) => {
                tracing::warn!("{}", e);
                senders.fail_all(&key, &e.to_string()).await;
                return;
            }
        };

        let fanout = self.fanout;
        let task_parent = parent.clone();
        let expansion =
            match tokio::task::spawn_blocking(move || fanout.expand(&task_parent, labeling)).await {
                Ok(Ok(expansion)) => expansion,
                Ok(Err(e)) => {
                    tracing::warn!("{}", e);
                    senders.fail_all(&key, &e.to_string()).await;
                    return;
                }
                Err(e) => {
                    let reason = format!("fan-out task panicked: {}", e);
                    tracing::warn!("Parent '{}': {}", key, reason);
                    senders.fail_all(&key, &reason).await;
                    return;
                }
            };

        let zero_cluster = expansion.is_zero_cluster();
        self.executor
            .metrics()
            .add_children(expansion.children.len() as u64);
        self.clusters.insert(
            key.clone(),
            (expansion.stats.clone(), expansion.warning.clone()),
        );
        tracing::info!(
            "Parent '{}': {} sub-units ({} clusters, {} unassigned records)",
            key,
            expansion.children.len(),
            expansion.stats.clusters,
            expansion.stats.unassigned
        );

        let usable = self
            .run_chain(&key, expansion.children, zero_cluster, senders)
            .await;
        self.run_classifiers(&key, usable, senders).await;
    }

    /// Run the consensus chain on every child. Returns the children that
    /// ended with a usable artifact, carrying that artifact as payload.
    async fn run_chain(
        self: &Arc<Self>,
        key: &ParentKey,
        children: Vec<Unit>,
        zero_cluster: bool,
        senders: &BranchSenders,
    ) -> Vec<Unit> {
        let branch = self.chain.name().to_string();
        let metrics = self.executor.metrics().clone();

        let mut pending: FuturesUnordered<_> = children
            .into_iter()
            .map(|child| {
                let worker = self.clone();
                let task_child = child.clone();
                let handle = tokio::spawn(async move {
                    worker.chain.process(&worker.executor, &task_child).await
                });
                let branch = branch.clone();
                async move {
                    let report = match handle.await {
                        Ok(report) => report,
                        Err(e) => {
                            tracing::warn!("Chain '{}' panicked on {}: {}", branch, child.key(), e);
                            ChainReport::failed(child.key().clone(), format!("{} panicked", branch))
                        }
                    };
                    (child, report)
                }
            })
            .collect();

        let mut usable = Vec::new();
        while let Some((child, mut report)) = pending.next().await {
            let Some(sub) = child.sub_key() else {
                continue;
            };
            if zero_cluster && report.artifact.is_some() {
                report.degrade(NO_CLUSTERS_REASON);
            }

            let outcome = self.store(&child, &branch, report.outcome()).await;
            match (&outcome, report.status) {
                (StageOutcome::Failed(_), _) | (_, UnitStatus::Failed) => metrics.add_unit_failed(),
                (_, UnitStatus::Degraded) => metrics.add_unit_degraded(),
                (_, UnitStatus::Succeeded) => metrics.add_unit_succeeded(),
            }
            if let Some(artifact) = outcome.artifact() {
                usable.push(child.with_payload(artifact.clone()));
            }

            senders
                .send(
                    &branch,
                    BranchMessage::Record {
                        parent: key.clone(),
                        sub,
                        outcome,
                    },
                )
                .await;
        }

        senders.send(&branch, BranchMessage::Sealed(key.clone())).await;
        usable
    }

    /// Run every classifier over the chain's usable results, concurrently.
    async fn run_classifiers(&self, key: &ParentKey, units: Vec<Unit>, senders: &BranchSenders) {
        let runs = self.classifiers.iter().map(|stage| {
            let units = units.clone();
            async move {
                let mut results = match self.executor.run(stage.clone(), units) {
                    Ok(results) => results,
                    Err(e) => {
                        tracing::warn!("{}", e);
                        senders
                            .send(
                                &stage.name,
                                BranchMessage::ParentFailed {
                                    parent: key.clone(),
                                    reason: e.to_string(),
                                },
                            )
                            .await;
                        return;
                    }
                };

                while let Some((unit, outcome)) = results.next().await {
                    let Some(sub) = unit.sub_key() else {
                        continue;
                    };
                    let outcome = self.store(&unit, &stage.name, outcome).await;
                    senders
                        .send(
                            &stage.name,
                            BranchMessage::Record {
                                parent: key.clone(),
                                sub,
                                outcome,
                            },
                        )
                        .await;
                }
                senders
                    .send(&stage.name, BranchMessage::Sealed(key.clone()))
                    .await;
            }
        });

        futures::future::join_all(runs).await;
    }
}

/// Adapt a channel receiver into a boxed stream.
fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// The run orchestrator.
pub struct Pipeline {
    executor: StageExecutor,
    labeler: Arc<dyn Labeler>,
    labeling: LabelingProfile,
    fanout: FanOut,
    chain: UnitChain,
    classifiers: Vec<Arc<Stage>>,
    artifacts: Option<Arc<ArtifactStore>>,
    sink: Arc<dyn ReportSink>,
    policy: AggregationPolicy,
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a pipeline with one mandatory chain branch and no classifiers.
    pub fn new(
        executor: StageExecutor,
        labeler: Arc<dyn Labeler>,
        chain: UnitChain,
        sink: Arc<dyn ReportSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            executor,
            labeler,
            labeling: LabelingProfile::default(),
            fanout: FanOut::default(),
            chain,
            classifiers: Vec::new(),
            artifacts: None,
            sink,
            policy: AggregationPolicy::default(),
            config,
        }
    }

    /// Add an optional classification branch fed by the chain's results.
    pub fn with_classifier(mut self, stage: Arc<Stage>) -> Self {
        self.classifiers.push(stage);
        self
    }

    pub fn with_labeling(mut self, labeling: LabelingProfile) -> Self {
        self.labeling = labeling;
        self
    }

    pub fn with_fanout(mut self, fanout: FanOut) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_policy(mut self, policy: AggregationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Cancel the run: scheduled units fail, open parents are abandoned.
    pub fn cancel(&self) {
        self.executor.scheduler().cancel();
    }

    pub fn cancellation(&self) -> Cancellation {
        self.executor.scheduler().cancellation()
    }

    /// Check the graph before any work starts: every stage fits its class,
    /// and every classifier consumes what the chain produces.
    pub fn validate(&self) -> Result<()> {
        let scheduler = self.executor.scheduler();

        scheduler.require_class(self.labeling.class)?;
        scheduler
            .admit("labeling", self.labeling.class, self.labeling.footprint)
            .inspect_err(|_| self.executor.metrics().add_rejection())?;

        for stage in self.chain.stages().iter().chain(&self.classifiers) {
            scheduler.require_class(stage.class)?;
            self.executor.admit(stage)?;
        }

        for stage in &self.classifiers {
            if &stage.input != self.chain.output() {
                return Err(GraphError::PortMismatch {
                    upstream: self.chain.name().to_string(),
                    downstream: stage.name.clone(),
                    produced: self.chain.output().to_string(),
                    expected: stage.input.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn aggregator(&self, parents: &[Unit]) -> Result<KeyedAggregator> {
        let mut specs = vec![BranchSpec::mandatory(self.chain.name())];
        specs.extend(
            self.classifiers
                .iter()
                .map(|s| BranchSpec::optional(s.name.clone())),
        );
        let keys = parents.iter().map(|p| p.parent_key().clone());
        Ok(KeyedAggregator::new(specs, self.policy)?.expect(keys))
    }

    /// Run every parent through all branches and report each aggregate.
    ///
    /// Aggregation errors are reported per parent and the run continues,
    /// unless the policy is strict, in which case the first error cancels
    /// the run and is returned.
    pub async fn run(&self, parents: Vec<Unit>) -> Result<RunOutcome> {
        self.validate()?;

        let mut seen = HashSet::new();
        for parent in &parents {
            if !seen.insert(parent.parent_key().clone()) {
                anyhow::bail!("Parent '{}' supplied more than once", parent.parent_key());
            }
        }

        let metrics = self.executor.metrics().clone();
        let cancel = self.cancellation();
        let total_parents = parents.len();
        let aggregator = self.aggregator(&parents)?;
        let branch_names: Vec<String> =
            aggregator.branches().iter().map(|b| b.name.clone()).collect();

        let mut senders = BTreeMap::new();
        let mut inputs = BTreeMap::new();
        for spec in aggregator.branches() {
            let (tx, rx) = mpsc::channel(self.config.channel_buffer.max(1));
            senders.insert(spec.name.clone(), tx);
            inputs.insert(spec.name.clone(), receiver_stream(rx));
        }
        let senders = BranchSenders(senders);
        let mut results = aggregator.aggregate(inputs, cancel.clone())?;

        let worker = Arc::new(ParentWorker {
            executor: self.executor.clone(),
            labeler: self.labeler.clone(),
            labeling: self.labeling,
            fanout: self.fanout,
            chain: self.chain.clone(),
            classifiers: self.classifiers.clone(),
            artifacts: self.artifacts.clone(),
            clusters: DashMap::new(),
        });

        // Shared work queue, drained by a fixed pool of parent workers
        let (work_tx, work_rx) = async_channel::bounded::<Unit>(total_parents.max(1));
        for parent in parents {
            metrics.add_parent_loaded();
            work_tx
                .send(parent)
                .await
                .map_err(|e| anyhow::anyhow!("queueing parent '{}': {}", e.0.parent_key(), e))?;
        }
        work_tx.close();

        let concurrency = self.config.parent_concurrency.max(1);
        tracing::info!(
            "Processing {} parents with {} workers ({} branches)",
            total_parents,
            concurrency,
            aggregator.branches().len()
        );

        let mut handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let worker = worker.clone();
            let work_rx = work_rx.clone();
            let senders = senders.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                while let Ok(parent) = work_rx.recv().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    worker.process_parent(parent, &senders).await;
                }
            }));
        }
        // Branch streams end once every worker has dropped its senders
        drop(senders);

        let mut aggregates = Vec::new();
        let mut errors = Vec::new();
        let mut tally = OutcomeTally::default();
        let mut strict_failure = None;

        while let Some(result) = results.next().await {
            let report = match &result {
                Ok(aggregate) => {
                    let (clusters, warning) = worker
                        .clusters
                        .remove(&aggregate.parent)
                        .map(|(_, (stats, warning))| (Some(stats), warning))
                        .unwrap_or((None, None));
                    ParentReport::from_aggregate(aggregate, clusters, warning)
                }
                Err(e) => {
                    let clusters = worker.clusters.remove(e.parent()).map(|(_, (s, _))| s);
                    ParentReport::from_error(e, clusters)
                }
            };

            if let (Ok(aggregate), Some(store)) = (&result, &self.artifacts) {
                for branch in &branch_names {
                    match store.put_joined(aggregate, branch).await {
                        Ok(bytes) => metrics.add_bytes_stored(bytes),
                        Err(e) => {
                            self.cancel();
                            return Err(anyhow::Error::new(e).context(format!(
                                "writing joined {} for '{}'",
                                branch, aggregate.parent
                            )));
                        }
                    }
                }
            }

            if let Err(e) = self.sink.write_parent(&report).await {
                self.cancel();
                return Err(e.context(format!("writing report for '{}'", report.parent)));
            }

            match result {
                Ok(aggregate) => {
                    metrics.add_parent_aggregated();
                    tally.succeeded += aggregate.tally.succeeded;
                    tally.degraded += aggregate.tally.degraded;
                    tally.failed += aggregate.tally.failed;
                    tracing::info!(
                        "Aggregated '{}': {} rows, {} excluded",
                        aggregate.parent,
                        aggregate.rows.len(),
                        aggregate.failed_count
                    );
                    aggregates.push(aggregate);
                }
                Err(e) => {
                    metrics.add_aggregation_error();
                    if self.policy.strict {
                        tracing::error!("Strict mode: aborting run after '{}'", e);
                        self.cancel();
                        strict_failure = Some(e.clone());
                    }
                    errors.push(e);
                    if strict_failure.is_some() {
                        break;
                    }
                }
            }
        }
        drop(results);

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Parent worker panicked: {}", e);
            }
        }

        let cancelled = cancel.is_cancelled();
        let summary = RunSummary {
            parents: total_parents,
            aggregated: aggregates.len(),
            errors: errors.iter().map(|e| e.to_string()).collect(),
            cancelled,
            tally,
            metrics: metrics.snapshot(),
            scheduler: self.executor.scheduler().stats(),
        };
        self.sink
            .write_summary(&summary)
            .await
            .context("writing run summary")?;

        if let Some(e) = strict_failure {
            return Err(e.into());
        }

        let stats = RunStats {
            parents: total_parents,
            aggregated: aggregates.len(),
            errors: errors.len(),
            cancelled,
            tally,
        };
        tracing::info!("Run finished: {}", stats);

        Ok(RunOutcome {
            aggregates,
            errors,
            stats,
        })
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Emitted aggregates, in emission order
    pub aggregates: Vec<ParentAggregate>,
    pub errors: Vec<crate::error::AggregationError>,
    pub stats: RunStats,
}

impl RunOutcome {
    pub fn aggregate(&self, parent: &str) -> Option<&ParentAggregate> {
        self.aggregates.iter().find(|a| a.parent.as_str() == parent)
    }
}

/// Statistics from a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub parents: usize,
    pub aggregated: usize,
    pub errors: usize,
    pub cancelled: bool,
    pub tally: OutcomeTally,
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parents: {}, Aggregated: {}, Errors: {}, Units: {} ok / {} degraded / {} failed",
            self.parents,
            self.aggregated,
            self.errors,
            self.tally.succeeded,
            self.tally.degraded,
            self.tally.failed
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CollectingSink;
    use crate::pipeline::{ClassBudget, Metrics, ResourceScheduler};
    use crate::tools::{ColumnLabeler, FnTool, ToolParams};
    use crate::unit::Payload;

    fn executor() -> StageExecutor {
        let classes = BTreeMap::from([(
            ResourceClass::Light,
            ClassBudget {
                max_concurrent: 2,
                max_cpus: 1,
                max_memory_gb: 2.0,
            },
        )]);
        let scheduler = ResourceScheduler::new(&classes, Footprint::new(4, 8.0)).unwrap();
        StageExecutor::new(Arc::new(scheduler), Metrics::new())
    }

    fn echo(name: &str) -> Stage {
        let tool = FnTool::new(name, |unit: Unit, _: ToolParams| async move {
            Ok::<_, ToolError>(unit.payload().clone())
        });
        Stage::new(name, Arc::new(tool))
    }

    fn pipeline(chain: UnitChain) -> Pipeline {
        Pipeline::new(
            executor(),
            Arc::new(ColumnLabeler::new("cluster_id")),
            chain,
            Arc::new(CollectingSink::new()),
            PipelineConfig::default(),
        )
    }

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.parent_concurrency, 4);
        assert_eq!(config.channel_buffer, 256);
    }

    #[test]
    fn test_run_stats_display() {
        let stats = RunStats {
            parents: 3,
            aggregated: 2,
            errors: 1,
            cancelled: true,
            tally: OutcomeTally {
                succeeded: 7,
                degraded: 2,
                failed: 1,
            },
        };
        let display = stats.to_string();
        assert!(display.contains("Parents: 3"));
        assert!(display.contains("7 ok / 2 degraded / 1 failed"));
        assert!(display.ends_with("(cancelled)"));
    }

    #[test]
    fn test_validate_classifier_ports() {
        let chain = UnitChain::builder("consensus")
            .stage(Arc::new(echo("polish").with_ports("reads", "consensus")))
            .build()
            .unwrap();

        let ok = pipeline(chain.clone())
            .with_classifier(Arc::new(echo("blast").with_ports("consensus", "taxonomy")));
        assert!(ok.validate().is_ok());

        let bad = pipeline(chain)
            .with_classifier(Arc::new(echo("blast").with_ports("reads", "taxonomy")));
        let err = bad.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::PortMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_unconfigured_class() {
        let chain = UnitChain::builder("consensus")
            .stage(Arc::new(
                echo("polish").with_class(ResourceClass::Heavy, Footprint::new(1, 1.0)),
            ))
            .build()
            .unwrap();
        assert!(pipeline(chain).validate().is_err());
    }

    #[tokio::test]
    async fn test_labeling_after_cancel_is_not_admitted() {
        let chain = UnitChain::builder("consensus")
            .stage(Arc::new(echo("polish")))
            .build()
            .unwrap();
        let worker = ParentWorker {
            executor: executor(),
            labeler: Arc::new(ColumnLabeler::new("cluster_id")),
            labeling: LabelingProfile::default(),
            fanout: FanOut::default(),
            chain,
            classifiers: Vec::new(),
            artifacts: None,
            clusters: DashMap::new(),
        };
        worker.executor.scheduler().cancel();

        let table = Payload::from("read\tcluster_id\nr1\t0\n");
        let parent = Unit::parent("A", table, Default::default());
        let err = worker.label(&parent).await.unwrap_err();
        assert!(err.to_string().contains("cancelled before admission"));
        assert_eq!(worker.executor.scheduler().stats().classes[0].admitted, 0);
    }

    #[tokio::test]
    async fn test_duplicate_parents_rejected() {
        let chain = UnitChain::builder("consensus")
            .stage(Arc::new(echo("polish")))
            .build()
            .unwrap();
        let parent = Unit::parent("A", Payload::from("read\tcluster_id\n"), Default::default());

        let err = pipeline(chain)
            .run(vec![parent.clone(), parent])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
