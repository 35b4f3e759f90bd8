//! Per-unit chain of dependent stages with fallback.
//!
//! A unit walks the stages in order. A recoverable failure keeps the previous
//! artifact as the stage's output, marks the unit degraded and moves on; a
//! fatal failure ends the chain with no usable artifact.

use crate::error::GraphError;
use crate::pipeline::executor::{ArtifactKind, Stage, StageExecutor, StageOutcome};
use crate::unit::{Payload, Unit, UnitKey};
use serde::Serialize;
use std::sync::Arc;

/// Terminal state of a unit in one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Succeeded,
    Degraded,
    Failed,
}

/// What happened at one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub status: UnitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of running a chain on one unit.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub key: UnitKey,

    /// Last usable artifact, `None` when the chain failed
    pub artifact: Option<Payload>,

    pub status: UnitStatus,
    pub reasons: Vec<String>,
    pub trace: Vec<StageRecord>,
}

impl ChainReport {
    /// Collapse into a branch outcome.
    pub fn outcome(&self) -> StageOutcome {
        match (&self.artifact, self.status) {
            (Some(artifact), UnitStatus::Succeeded) => StageOutcome::Success(artifact.clone()),
            (Some(artifact), UnitStatus::Degraded) => {
                StageOutcome::Fallback(artifact.clone(), self.reasons.join("; "))
            }
            _ => StageOutcome::Failed(self.reasons.join("; ")),
        }
    }

    /// Mark a usable result as degraded for a reason found outside the chain.
    pub fn degrade(&mut self, reason: impl Into<String>) {
        if self.status == UnitStatus::Succeeded {
            self.status = UnitStatus::Degraded;
        }
        self.reasons.push(reason.into());
    }

    /// A failed report for a unit that never ran (panic, storage error).
    pub fn failed(key: UnitKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            artifact: None,
            status: UnitStatus::Failed,
            reasons: vec![reason.into()],
            trace: Vec::new(),
        }
    }
}

/// An ordered, port-checked sequence of stages.
#[derive(Debug, Clone)]
pub struct UnitChain {
    name: String,
    stages: Vec<Arc<Stage>>,
}

impl UnitChain {
    pub fn builder(name: impl Into<String>) -> ChainBuilder {
        ChainBuilder {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Arc<Stage>] {
        &self.stages
    }

    pub fn output(&self) -> &ArtifactKind {
        &self.stages[self.stages.len() - 1].output
    }

    /// Run every stage on `unit` in order.
    pub async fn process(&self, executor: &StageExecutor, unit: &Unit) -> ChainReport {
        let mut current = unit.clone();
        let mut status = UnitStatus::Succeeded;
        let mut reasons = Vec::new();
        let mut trace = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            match executor.execute(stage, &current).await {
                StageOutcome::Success(artifact) => {
                    trace.push(StageRecord {
                        stage: stage.name.clone(),
                        status: UnitStatus::Succeeded,
                        reason: None,
                    });
                    current = current.with_payload(artifact);
                }
                StageOutcome::Fallback(_, reason) => {
                    // The previous artifact stands in for this stage's output
                    status = UnitStatus::Degraded;
                    trace.push(StageRecord {
                        stage: stage.name.clone(),
                        status: UnitStatus::Degraded,
                        reason: Some(reason.clone()),
                    });
                    reasons.push(reason);
                }
                StageOutcome::Failed(reason) => {
                    trace.push(StageRecord {
                        stage: stage.name.clone(),
                        status: UnitStatus::Failed,
                        reason: Some(reason.clone()),
                    });
                    reasons.push(reason);
                    return ChainReport {
                        key: unit.key().clone(),
                        artifact: None,
                        status: UnitStatus::Failed,
                        reasons,
                        trace,
                    };
                }
            }
        }

        ChainReport {
            key: unit.key().clone(),
            artifact: Some(current.payload().clone()),
            status,
            reasons,
            trace,
        }
    }
}

/// Builds a [`UnitChain`], checking adjacent ports.
pub struct ChainBuilder {
    name: String,
    stages: Vec<Arc<Stage>>,
}

impl ChainBuilder {
    pub fn stage(mut self, stage: Arc<Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<UnitChain, GraphError> {
        if self.stages.is_empty() {
            return Err(GraphError::EmptyChain(self.name));
        }

        for pair in self.stages.windows(2) {
            let (up, down) = (&pair[0], &pair[1]);
            if up.output != down.input {
                return Err(GraphError::PortMismatch {
                    upstream: up.name.clone(),
                    downstream: down.name.clone(),
                    produced: up.output.to_string(),
                    expected: down.input.to_string(),
                });
            }
        }

        Ok(UnitChain {
            name: self.name,
            stages: self.stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::pipeline::{ClassBudget, Footprint, Metrics, ResourceClass, ResourceScheduler};
    use crate::tools::FnTool;
    use crate::unit::{Attributes, SubKey};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor() -> StageExecutor {
        let mut classes = BTreeMap::new();
        classes.insert(
            ResourceClass::Light,
            ClassBudget {
                max_concurrent: 4,
                max_cpus: 2,
                max_memory_gb: 4.0,
            },
        );
        let scheduler = ResourceScheduler::new(&classes, Footprint::new(4, 8.0)).unwrap();
        StageExecutor::new(Arc::new(scheduler), Metrics::new())
    }

    fn unit() -> Unit {
        let parent = Unit::parent("A", Payload::from("raw"), Attributes::new());
        Unit::child(&parent, SubKey::Cluster(0), Payload::from("reads"), Attributes::new())
    }

    /// Appends `suffix` to the artifact.
    fn append(name: &str, suffix: &'static str) -> Arc<Stage> {
        let tool = FnTool::new(name, move |unit: Unit, _| async move {
            let mut bytes = unit.payload().bytes().to_vec();
            bytes.extend_from_slice(suffix.as_bytes());
            Ok(Payload::from(bytes))
        });
        Arc::new(Stage::new(name, Arc::new(tool)))
    }

    fn failing(name: &str, error: ToolError, calls: Arc<AtomicUsize>) -> Arc<Stage> {
        let tool = FnTool::new(name, move |_: Unit, _| {
            let error = error.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(error)
            }
        });
        Arc::new(Stage::new(name, Arc::new(tool)))
    }

    #[tokio::test]
    async fn test_clean_chain_threads_artifacts() {
        let chain = UnitChain::builder("consensus")
            .stage(append("correct", "+c"))
            .stage(append("polish", "+p"))
            .build()
            .unwrap();

        let report = chain.process(&executor(), &unit()).await;

        assert_eq!(report.status, UnitStatus::Succeeded);
        assert_eq!(report.artifact, Some(Payload::from("reads+c+p")));
        assert_eq!(report.outcome(), StageOutcome::Success(Payload::from("reads+c+p")));
        assert_eq!(report.trace.len(), 2);
    }

    #[tokio::test]
    async fn test_recoverable_substitutes_previous_artifact() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = UnitChain::builder("consensus")
            .stage(append("correct", "+c"))
            .stage(failing("draft", ToolError::recoverable("too few reads"), calls.clone()))
            .stage(append("polish", "+p"))
            .build()
            .unwrap();

        let report = chain.process(&executor(), &unit()).await;

        assert_eq!(report.status, UnitStatus::Degraded);
        // draft fell back to the corrected artifact; polish still ran on it
        assert_eq!(report.artifact, Some(Payload::from("reads+c+p")));
        assert_eq!(report.reasons.len(), 1);
        assert!(report.reasons[0].contains("too few reads"));
        assert_eq!(report.trace[1].status, UnitStatus::Degraded);
        assert!(report.outcome().fallback_reason().is_some());
    }

    #[tokio::test]
    async fn test_fatal_stops_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let chain = UnitChain::builder("consensus")
            .stage(failing("correct", ToolError::fatal("malformed input"), calls.clone()))
            .stage(failing("polish", ToolError::fatal("unreachable"), after.clone()))
            .build()
            .unwrap();

        let report = chain.process(&executor(), &unit()).await;

        assert_eq!(report.status, UnitStatus::Failed);
        assert!(report.artifact.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert!(report.outcome().is_failed());
    }

    #[test]
    fn test_port_mismatch_rejected_at_build() {
        let tool = Arc::new(FnTool::new("t", |unit: Unit, _| async move { Ok(unit.payload().clone()) }));
        let correct = Arc::new(Stage::new("correct", tool.clone()).with_ports("reads", "corrected"));
        let polish = Arc::new(Stage::new("polish", tool).with_ports("draft", "polished"));

        let err = UnitChain::builder("consensus")
            .stage(correct)
            .stage(polish)
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::PortMismatch { ref downstream, .. } if downstream == "polish"));

        let err = UnitChain::builder("empty").build().unwrap_err();
        assert_eq!(err, GraphError::EmptyChain("empty".into()));
    }

    #[test]
    fn test_degrade_keeps_failed_status() {
        let mut report = ChainReport::failed(unit().key().clone(), "boom");
        report.degrade("no clusters");
        assert_eq!(report.status, UnitStatus::Failed);
        assert_eq!(report.reasons.len(), 2);
    }
}
