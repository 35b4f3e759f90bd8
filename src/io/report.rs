//! Report sink for per-parent results.

use crate::abundance::Abundance;
use crate::error::AggregationError;
use crate::pipeline::{
    BranchValue, ClusterStats, ExcludedUnit, MetricsSnapshot, OutcomeTally, ParentAggregate,
    SchedulerStats,
};
use crate::unit::{ParentKey, SubKey};
use anyhow::Result;
use async_trait::async_trait;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// State of one branch cell in a report row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CellReport {
    Present {
        bytes: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback: Option<String>,
    },
    Absent,
    Error {
        reason: String,
    },
}

impl From<&BranchValue> for CellReport {
    fn from(value: &BranchValue) -> Self {
        match value {
            BranchValue::Present { artifact, fallback } => CellReport::Present {
                bytes: artifact.len(),
                fallback: fallback.clone(),
            },
            BranchValue::Absent => CellReport::Absent,
            BranchValue::Error(reason) => CellReport::Error {
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowReport {
    pub sub: SubKey,
    pub degraded: bool,
    pub reasons: Vec<String>,
    pub branches: BTreeMap<String, CellReport>,
}

/// Rendered result for one parent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParentReport {
    pub parent: ParentKey,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub unit_count: usize,
    pub failed_count: usize,
    pub tally: OutcomeTally,
    pub rows: Vec<RowReport>,
    pub excluded: Vec<ExcludedUnit>,
    pub warnings: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub clusters: Option<ClusterStats>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub abundance: Option<Abundance>,
}

impl ParentReport {
    pub fn from_aggregate(
        aggregate: &ParentAggregate,
        clusters: Option<ClusterStats>,
        fanout_warning: Option<String>,
    ) -> Self {
        let abundance = clusters.as_ref().map(|c| Abundance::from_counts(&c.sizes));
        let mut warnings: Vec<String> = fanout_warning.into_iter().collect();
        warnings.extend(aggregate.warnings.iter().cloned());

        Self {
            parent: aggregate.parent.clone(),
            error: None,
            unit_count: aggregate.unit_count,
            failed_count: aggregate.failed_count,
            tally: aggregate.tally,
            rows: aggregate
                .rows
                .iter()
                .map(|row| RowReport {
                    sub: row.sub,
                    degraded: row.degraded,
                    reasons: row.reasons.clone(),
                    branches: row
                        .branches
                        .iter()
                        .map(|(name, value)| (name.clone(), CellReport::from(value)))
                        .collect(),
                })
                .collect(),
            excluded: aggregate.excluded.clone(),
            warnings,
            clusters,
            abundance,
        }
    }

    pub fn from_error(error: &AggregationError, clusters: Option<ClusterStats>) -> Self {
        Self {
            parent: error.parent().clone(),
            error: Some(error.to_string()),
            unit_count: 0,
            failed_count: 0,
            tally: OutcomeTally::default(),
            rows: Vec::new(),
            excluded: Vec::new(),
            warnings: Vec::new(),
            clusters,
            abundance: None,
        }
    }
}

/// Totals for a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub parents: usize,
    pub aggregated: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub tally: OutcomeTally,
    pub metrics: MetricsSnapshot,
    pub scheduler: SchedulerStats,
}

/// Consumer of the final per-parent results.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn write_parent(&self, report: &ParentReport) -> Result<()>;

    async fn write_summary(&self, summary: &RunSummary) -> Result<()>;
}

/// Writes JSON reports to `<prefix>/reports/` in an object store.
pub struct JsonReportSink {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl JsonReportSink {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn path(&self, name: &str) -> Path {
        if self.prefix.is_empty() {
            Path::from(format!("reports/{}.json", name))
        } else {
            Path::from(format!("{}/reports/{}.json", self.prefix, name))
        }
    }

    async fn write_json<T: Serialize + Sync>(&self, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value)?;
        let path = self.path(name);
        self.store.put(&path, PutPayload::from(json)).await?;
        tracing::debug!("Wrote report {}", path);
        Ok(())
    }
}

#[async_trait]
impl ReportSink for JsonReportSink {
    async fn write_parent(&self, report: &ParentReport) -> Result<()> {
        self.write_json(report.parent.as_str(), report).await
    }

    async fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        self.write_json("run_summary", summary).await
    }
}

/// Keeps reports in memory.
#[derive(Default)]
pub struct CollectingSink {
    parents: Mutex<Vec<ParentReport>>,
    summary: Mutex<Option<RunSummary>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far, sorted by parent.
    pub fn parents(&self) -> Vec<ParentReport> {
        let mut reports = self
            .parents
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default();
        reports.sort_by(|a, b| a.parent.cmp(&b.parent));
        reports
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.summary.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl ReportSink for CollectingSink {
    async fn write_parent(&self, report: &ParentReport) -> Result<()> {
        self.parents
            .lock()
            .map_err(|_| anyhow::anyhow!("report sink poisoned"))?
            .push(report.clone());
        Ok(())
    }

    async fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        *self
            .summary
            .lock()
            .map_err(|_| anyhow::anyhow!("report sink poisoned"))? = Some(summary.clone());
        Ok(())
    }
}
