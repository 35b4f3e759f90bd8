//! I/O: input loading, artifact storage and report output over object_store.

mod artifacts;
mod input;
mod report;
mod store;

pub use artifacts::{join_branch, ArtifactStore};
pub use input::{discover_samples, load_parents, load_sample, BYTES_ATTR, SOURCE_ATTR};
pub use report::{
    CellReport, CollectingSink, JsonReportSink, ParentReport, ReportSink, RowReport, RunSummary,
};
pub use store::{create_output_store, create_s3_store, get_output_prefix, parse_s3_uri};
