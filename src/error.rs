//! Error taxonomy.
//!
//! Unit-level errors ([`ToolError`]) are contained: the executor turns them
//! into stage outcomes and they never abort sibling units or other branches.
//! The remaining types surface to the caller.

use crate::pipeline::{Footprint, ResourceClass};
use crate::unit::{ParentKey, SubKey};

/// Structured error returned by a collaborator (labeler, correction,
/// polishing or classification tool).
///
/// The tag decides fallback policy: a recoverable error lets the chain carry
/// the previous artifact forward, a fatal one ends the unit's chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    /// Insufficient input, or the tool reported that it found no result.
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// I/O failure, malformed artifact, timeout, or resource exhaustion.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ToolError {
    pub fn recoverable(reason: impl Into<String>) -> Self {
        ToolError::Recoverable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        ToolError::Fatal(reason.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, ToolError::Recoverable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            ToolError::Recoverable(r) | ToolError::Fatal(r) => r,
        }
    }
}

/// A stage asked for more than its resource class allows.
///
/// Raised at submission time, never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("resource request exceeds limit: stage '{stage}' ({class}) requested {requested}, class limit is {limit}")]
pub struct ResourceRejection {
    pub stage: String,
    pub class: ResourceClass,
    pub requested: Footprint,
    pub limit: Footprint,
}

/// Startup validation of the resource profile against the host.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("resource class {0} has no configured budget")]
    UnknownClass(ResourceClass),

    #[error("resource class {0} must allow at least one concurrent unit")]
    ZeroBudget(ResourceClass),

    #[error("resource class {class} ceiling {limit} exceeds host capacity {host}")]
    ExceedsHost {
        class: ResourceClass,
        limit: Footprint,
        host: Footprint,
    },
}

/// Failure to join branch outputs for one parent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregationError {
    /// A mandatory branch never mentioned this parent.
    #[error("mandatory branch '{branch}' has no output for parent '{parent}'")]
    MissingParent { branch: String, parent: ParentKey },

    /// A mandatory branch reported a parent-wide failure.
    #[error("mandatory branch '{branch}' failed for parent '{parent}': {reason}")]
    ParentFailed {
        branch: String,
        parent: ParentKey,
        reason: String,
    },

    /// The same `(parent, sub)` was reported twice by one branch.
    #[error("branch '{branch}' reported sub-unit {sub} of parent '{parent}' more than once")]
    DuplicateRecord {
        branch: String,
        parent: ParentKey,
        sub: SubKey,
    },
}

impl AggregationError {
    pub fn parent(&self) -> &ParentKey {
        match self {
            AggregationError::MissingParent { parent, .. }
            | AggregationError::ParentFailed { parent, .. }
            | AggregationError::DuplicateRecord { parent, .. } => parent,
        }
    }
}

/// Contract violations detected while wiring stages and branches together.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("stage '{downstream}' expects '{expected}' but '{upstream}' produces '{produced}'")]
    PortMismatch {
        upstream: String,
        downstream: String,
        produced: String,
        expected: String,
    },

    #[error("branch '{0}' has no stages")]
    EmptyChain(String),

    #[error("stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("stage '{0}' is not defined")]
    UnknownStage(String),

    #[error("branch '{0}' is declared more than once")]
    DuplicateBranch(String),

    #[error("branch '{0}' was not declared")]
    UnknownBranch(String),

    #[error("no input stream supplied for declared branch '{0}'")]
    MissingBranchInput(String),
}

/// Failure of the fan-out stage for one parent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanOutError {
    #[error("parent '{parent}' produced more than {ceiling} distinct labels (saw {count})")]
    TooManyLabels {
        parent: ParentKey,
        count: usize,
        ceiling: usize,
    },

    #[error("labeling failed for parent '{parent}': {source}")]
    Labeler {
        parent: ParentKey,
        #[source]
        source: ToolError,
    },
}

/// Failure writing to or reading from the artifact store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Each artifact key has exactly one writer.
    #[error("artifact '{0}' was already written")]
    AlreadyWritten(String),

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
}
