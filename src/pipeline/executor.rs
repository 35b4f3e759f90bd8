//! Stage descriptors and the stage executor.
//!
//! The executor runs one stage over a collection of independent units. Every
//! input unit yields exactly one [`StageOutcome`], outcomes arrive in
//! completion order, and each unit's tool is invoked at most once. Retries
//! are the caller's business.

use crate::error::{ResourceRejection, ToolError};
use crate::pipeline::{Footprint, Metrics, ResourceClass, ResourceScheduler};
use crate::tools::{Tool, ToolParams};
use crate::unit::{Payload, Unit};
use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Type tag of an artifact flowing between stages.
///
/// Adjacent stages in a chain must agree on it; this is checked when the
/// chain is built, not while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKind(String);

impl ArtifactKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ArtifactKind {
    fn default() -> Self {
        Self("artifact".to_string())
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One processing step: a tool plus its scheduling contract.
pub struct Stage {
    pub name: String,
    pub class: ResourceClass,
    pub footprint: Footprint,
    pub timeout: Option<Duration>,
    pub input: ArtifactKind,
    pub output: ArtifactKind,
    pub params: ToolParams,
    pub tool: Arc<dyn Tool>,
}

impl Stage {
    /// A light, single-core stage with untyped ports and no timeout.
    pub fn new(name: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        Self {
            name: name.into(),
            class: ResourceClass::Light,
            footprint: Footprint::new(1, 1.0),
            timeout: None,
            input: ArtifactKind::default(),
            output: ArtifactKind::default(),
            params: ToolParams::new(),
            tool,
        }
    }

    pub fn with_class(mut self, class: ResourceClass, footprint: Footprint) -> Self {
        self.class = class;
        self.footprint = footprint;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_ports(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input = ArtifactKind::new(input);
        self.output = ArtifactKind::new(output);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("footprint", &self.footprint)
            .field("timeout", &self.timeout)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("tool", &self.tool.name())
            .finish()
    }
}

/// Result of running one stage on one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Success(Payload),

    /// Degraded but usable: the artifact is a substitute, `reason` says why.
    Fallback(Payload, String),

    Failed(String),
}

impl StageOutcome {
    /// The usable artifact, if any.
    pub fn artifact(&self) -> Option<&Payload> {
        match self {
            StageOutcome::Success(p) | StageOutcome::Fallback(p, _) => Some(p),
            StageOutcome::Failed(_) => None,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.is_failed()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed(_))
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            StageOutcome::Fallback(_, reason) => Some(reason),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            StageOutcome::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Runs stages under the scheduler's admission control.
#[derive(Clone)]
pub struct StageExecutor {
    scheduler: Arc<ResourceScheduler>,
    metrics: Arc<Metrics>,
}

impl StageExecutor {
    pub fn new(scheduler: Arc<ResourceScheduler>, metrics: Arc<Metrics>) -> Self {
        Self { scheduler, metrics }
    }

    pub fn scheduler(&self) -> &Arc<ResourceScheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Submission-time check of `stage` against its class ceiling.
    pub fn admit(&self, stage: &Stage) -> Result<(), ResourceRejection> {
        self.scheduler
            .admit(&stage.name, stage.class, stage.footprint)
            .inspect_err(|_| self.metrics.add_rejection())
    }

    /// Run `stage` over independent `units`.
    ///
    /// The stage is checked against its class ceiling before anything is
    /// scheduled. The returned stream yields one `(unit, outcome)` per input
    /// unit, in completion order.
    pub fn run(
        &self,
        stage: Arc<Stage>,
        units: Vec<Unit>,
    ) -> Result<BoxStream<'static, (Unit, StageOutcome)>, ResourceRejection> {
        self.admit(&stage)?;

        let pending: FuturesUnordered<_> = units
            .into_iter()
            .map(|unit| {
                let executor = self.clone();
                let stage = stage.clone();
                let task_unit = unit.clone();
                let stage_name = stage.name.clone();
                let handle =
                    tokio::spawn(async move { executor.execute(&stage, &task_unit).await });
                let metrics = self.metrics.clone();
                async move {
                    match handle.await {
                        Ok(outcome) => (unit, outcome),
                        Err(e) => {
                            tracing::warn!("Stage '{}' panicked on {}: {}", stage_name, unit.key(), e);
                            metrics.add_stage_failure();
                            (unit, StageOutcome::Failed(format!("{} panicked", stage_name)))
                        }
                    }
                }
            })
            .collect();

        Ok(pending.boxed())
    }

    /// Run one stage on one unit and classify the result.
    ///
    /// A recoverable tool error substitutes the unit's incoming payload as a
    /// fallback artifact. The stage must already have been admitted.
    pub async fn execute(&self, stage: &Stage, unit: &Unit) -> StageOutcome {
        match self.invoke(stage, unit).await {
            Ok(artifact) => StageOutcome::Success(artifact),
            Err(ToolError::Recoverable(reason)) => {
                self.metrics.add_stage_fallback();
                tracing::warn!(
                    "Stage '{}' degraded on {}: {}",
                    stage.name,
                    unit.key(),
                    reason
                );
                StageOutcome::Fallback(unit.payload().clone(), format!("{}: {}", stage.name, reason))
            }
            Err(ToolError::Fatal(reason)) => {
                tracing::warn!("Stage '{}' failed on {}: {}", stage.name, unit.key(), reason);
                StageOutcome::Failed(format!("{}: {}", stage.name, reason))
            }
        }
    }

    /// Invoke the stage's tool once, under class admission, timeout and
    /// cancellation. Timeout and cancellation are fatal for the unit.
    pub async fn invoke(&self, stage: &Stage, unit: &Unit) -> Result<Payload, ToolError> {
        let cancel = self.scheduler.cancellation();

        let Some(_permit) = self.scheduler.acquire(stage.class).await else {
            self.metrics.add_stage_failure();
            return Err(ToolError::fatal("cancelled before admission"));
        };

        self.metrics.add_stage_invocation();
        let start = Instant::now();

        let call = stage.tool.invoke(unit, &stage.params);
        let result = tokio::select! {
            result = async {
                match stage.timeout {
                    Some(limit) => tokio::time::timeout(limit, call)
                        .await
                        .unwrap_or_else(|_| Err(ToolError::fatal(format!("timed out after {:?}", limit)))),
                    None => call.await,
                }
            } => result,
            _ = cancel.cancelled() => Err(ToolError::fatal("cancelled")),
        };

        self.metrics.add_stage_time(start.elapsed());
        if matches!(result, Err(ToolError::Fatal(_))) {
            self.metrics.add_stage_failure();
        }

        tracing::debug!(
            "Stage '{}' on {} finished in {:.3}s",
            stage.name,
            unit.key(),
            start.elapsed().as_secs_f64()
        );

        result
    }
}
