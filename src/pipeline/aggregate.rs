//! Keyed fan-in.
//!
//! Branch outputs arrive as per-branch message streams in any order. The
//! aggregator buffers them per parent and holds each parent behind a barrier
//! until every declared branch has sealed it (or ended). Only then is the
//! parent joined, with rows keyed and sorted by sub-key.
//!
//! Mandatory branches are inner-joined: a sub-key without a usable artifact
//! in every mandatory branch is excluded from the rows. Optional branches are
//! left-joined: every row carries an explicit cell for every optional branch.

use crate::error::{AggregationError, GraphError};
use crate::pipeline::executor::StageOutcome;
use crate::pipeline::Cancellation;
use crate::unit::{ParentKey, Payload, SubKey};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio::sync::mpsc;

/// Whether a branch must produce output for a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchKind {
    /// Inner join; a missing parent is an aggregation error
    Mandatory,

    /// Left join; missing output is an explicit absent cell
    Optional,
}

/// A declared branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSpec {
    pub name: String,
    pub kind: BranchKind,
}

impl BranchSpec {
    pub fn mandatory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BranchKind::Mandatory,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BranchKind::Optional,
        }
    }
}

/// One item on a branch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchMessage {
    /// Outcome of one sub-unit.
    Record {
        parent: ParentKey,
        sub: SubKey,
        outcome: StageOutcome,
    },

    /// The branch has nothing more for this parent.
    Sealed(ParentKey),

    /// The branch could not produce anything for this parent. Also seals it.
    ParentFailed { parent: ParentKey, reason: String },
}

impl BranchMessage {
    pub fn parent(&self) -> &ParentKey {
        match self {
            BranchMessage::Record { parent, .. }
            | BranchMessage::Sealed(parent)
            | BranchMessage::ParentFailed { parent, .. } => parent,
        }
    }
}

/// Everything one branch reported for one parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchGroup {
    pub records: BTreeMap<SubKey, StageOutcome>,
    pub failure: Option<String>,
    pub duplicates: BTreeSet<SubKey>,
}

impl BranchGroup {
    fn insert(&mut self, sub: SubKey, outcome: StageOutcome) {
        if self.records.contains_key(&sub) {
            self.duplicates.insert(sub);
        } else {
            self.records.insert(sub, outcome);
        }
    }
}

/// A branch's value in one row.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchValue {
    /// Usable artifact; `fallback` carries the reason if it is a substitute
    Present {
        artifact: Payload,
        fallback: Option<String>,
    },

    Absent,

    /// The branch failed for the whole parent
    Error(String),
}

impl BranchValue {
    pub fn artifact(&self) -> Option<&Payload> {
        match self {
            BranchValue::Present { artifact, .. } => Some(artifact),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, BranchValue::Absent)
    }

    fn from_outcome(outcome: &StageOutcome) -> Self {
        match outcome {
            StageOutcome::Success(artifact) => BranchValue::Present {
                artifact: artifact.clone(),
                fallback: None,
            },
            StageOutcome::Fallback(artifact, reason) => BranchValue::Present {
                artifact: artifact.clone(),
                fallback: Some(reason.clone()),
            },
            StageOutcome::Failed(_) => BranchValue::Absent,
        }
    }
}

/// One sub-unit of a parent, joined across branches.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub sub: SubKey,
    pub branches: BTreeMap<String, BranchValue>,
    pub degraded: bool,
    pub reasons: Vec<String>,
}

impl AggregateRow {
    pub fn value(&self, branch: &str) -> Option<&BranchValue> {
        self.branches.get(branch)
    }
}

/// A sub-unit dropped by the inner join.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedUnit {
    pub sub: SubKey,
    pub reasons: Vec<String>,
}

/// Succeeded / degraded / failed sub-unit counts for a parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeTally {
    pub succeeded: usize,
    pub degraded: usize,
    pub failed: usize,
}

/// Joined result for one parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentAggregate {
    pub parent: ParentKey,

    /// Rows in ascending sub-key order
    pub rows: Vec<AggregateRow>,

    /// Distinct sub-units reported by the row-defining branches
    pub unit_count: usize,

    /// Sub-units excluded by the inner join
    pub failed_count: usize,

    pub excluded: Vec<ExcludedUnit>,
    pub tally: OutcomeTally,
    pub warnings: Vec<String>,
}

impl ParentAggregate {
    fn empty(parent: ParentKey, warnings: Vec<String>) -> Self {
        Self {
            parent,
            rows: Vec::new(),
            unit_count: 0,
            failed_count: 0,
            excluded: Vec::new(),
            tally: OutcomeTally::default(),
            warnings,
        }
    }

    pub fn subs(&self) -> Vec<SubKey> {
        self.rows.iter().map(|r| r.sub).collect()
    }

    pub fn row(&self, sub: SubKey) -> Option<&AggregateRow> {
        self.rows.iter().find(|r| r.sub == sub)
    }
}

/// What to do when a mandatory branch never mentions a parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingParentPolicy {
    /// Report an aggregation error for that parent
    #[default]
    Fail,

    /// Emit the parent with zero rows and a warning
    #[serde(alias = "empty_output")]
    Empty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationPolicy {
    pub missing_parent: MissingParentPolicy,

    /// End the output stream after the first aggregation error
    pub strict: bool,
}

/// Per-parent barrier bookkeeping.
#[derive(Debug, Default)]
struct Pending {
    groups: BTreeMap<String, BranchGroup>,
    sealed: BTreeSet<String>,
}

#[derive(Debug)]
struct Barrier {
    branches: Vec<String>,
    ended: BTreeSet<String>,
    pending: BTreeMap<ParentKey, Pending>,
    closed: HashSet<ParentKey>,
}

impl Barrier {
    fn new(branches: Vec<String>, expected: &BTreeSet<ParentKey>) -> Self {
        let pending = expected
            .iter()
            .map(|p| (p.clone(), Pending::default()))
            .collect();
        Self {
            branches,
            ended: BTreeSet::new(),
            pending,
            closed: HashSet::new(),
        }
    }

    fn apply(&mut self, branch: String, message: BranchMessage) {
        let parent = message.parent().clone();
        if self.closed.contains(&parent) {
            tracing::warn!(
                "Branch '{}' sent output for '{}' after its barrier closed; ignoring",
                branch,
                parent
            );
            return;
        }

        let pending = self.pending.entry(parent.clone()).or_default();
        if pending.sealed.contains(&branch) {
            tracing::warn!(
                "Branch '{}' sent output for '{}' after sealing it; ignoring",
                branch,
                parent
            );
            return;
        }

        let group = pending.groups.entry(branch.clone()).or_default();
        match message {
            BranchMessage::Record { sub, outcome, .. } => group.insert(sub, outcome),
            BranchMessage::Sealed(_) => {
                pending.sealed.insert(branch);
            }
            BranchMessage::ParentFailed { reason, .. } => {
                group.failure = Some(reason);
                pending.sealed.insert(branch);
            }
        }
    }

    fn end(&mut self, branch: String) {
        tracing::debug!("Branch '{}' ended", branch);
        self.ended.insert(branch);
    }

    /// Remove and return every parent whose barrier is now closed, in key order.
    fn take_ready(&mut self) -> Vec<(ParentKey, BTreeMap<String, BranchGroup>)> {
        let ready: Vec<ParentKey> = self
            .pending
            .iter()
            .filter(|(_, p)| {
                self.branches
                    .iter()
                    .all(|b| self.ended.contains(b) || p.sealed.contains(b))
            })
            .map(|(k, _)| k.clone())
            .collect();

        ready
            .into_iter()
            .filter_map(|key| {
                let pending = self.pending.remove(&key)?;
                self.closed.insert(key.clone());
                Some((key, pending.groups))
            })
            .collect()
    }
}

enum Event {
    Message(String, BranchMessage),
    Ended(String),
}

/// Joins branch streams per parent.
#[derive(Debug, Clone)]
pub struct KeyedAggregator {
    branches: Vec<BranchSpec>,
    policy: AggregationPolicy,
    expected: BTreeSet<ParentKey>,
}

impl KeyedAggregator {
    pub fn new(branches: Vec<BranchSpec>, policy: AggregationPolicy) -> Result<Self, GraphError> {
        let mut seen = HashSet::new();
        for spec in &branches {
            if !seen.insert(spec.name.as_str()) {
                return Err(GraphError::DuplicateBranch(spec.name.clone()));
            }
        }
        Ok(Self {
            branches,
            policy,
            expected: BTreeSet::new(),
        })
    }

    /// Register parents that must be emitted even if no branch mentions them.
    pub fn expect(mut self, parents: impl IntoIterator<Item = ParentKey>) -> Self {
        self.expected.extend(parents);
        self
    }

    pub fn branches(&self) -> &[BranchSpec] {
        &self.branches
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Join the completed outputs of every branch for `parent`.
    ///
    /// `groups` is keyed by branch name; a branch with no entry never
    /// mentioned the parent. Pure and deterministic: the same input always
    /// yields the same aggregate.
    pub fn join(
        &self,
        parent: &ParentKey,
        groups: &BTreeMap<String, BranchGroup>,
    ) -> Result<ParentAggregate, AggregationError> {
        for (branch, group) in groups {
            if let Some(sub) = group.duplicates.iter().next() {
                return Err(AggregationError::DuplicateRecord {
                    branch: branch.clone(),
                    parent: parent.clone(),
                    sub: *sub,
                });
            }
        }

        let (mandatory, optional): (Vec<&BranchSpec>, Vec<&BranchSpec>) = self
            .branches
            .iter()
            .partition(|b| b.kind == BranchKind::Mandatory);

        let mut warnings = Vec::new();
        let mut row_groups = Vec::with_capacity(mandatory.len());
        for spec in &mandatory {
            match groups.get(&spec.name) {
                None => {
                    let error = AggregationError::MissingParent {
                        branch: spec.name.clone(),
                        parent: parent.clone(),
                    };
                    match self.policy.missing_parent {
                        MissingParentPolicy::Fail => return Err(error),
                        MissingParentPolicy::Empty => warnings.push(error.to_string()),
                    }
                }
                Some(group) => {
                    if let Some(reason) = &group.failure {
                        return Err(AggregationError::ParentFailed {
                            branch: spec.name.clone(),
                            parent: parent.clone(),
                            reason: reason.clone(),
                        });
                    }
                    row_groups.push((*spec, group));
                }
            }
        }
        if !warnings.is_empty() {
            return Ok(ParentAggregate::empty(parent.clone(), warnings));
        }

        // Rows come from the mandatory branches; with none declared, every
        // optional output defines a row.
        let candidates: BTreeSet<SubKey> = if mandatory.is_empty() {
            optional
                .iter()
                .filter_map(|spec| groups.get(&spec.name))
                .flat_map(|g| g.records.keys().copied())
                .collect()
        } else {
            row_groups
                .iter()
                .flat_map(|(_, g)| g.records.keys().copied())
                .collect()
        };

        let mut rows = Vec::new();
        let mut excluded = Vec::new();
        let mut tally = OutcomeTally::default();

        for sub in &candidates {
            let mut branches = BTreeMap::new();
            let mut reasons = Vec::new();
            let mut missing = Vec::new();

            for (spec, group) in &row_groups {
                match group.records.get(sub) {
                    Some(StageOutcome::Failed(reason)) => {
                        missing.push(format!("{}: {}", spec.name, reason))
                    }
                    Some(outcome) => {
                        branches.insert(spec.name.clone(), BranchValue::from_outcome(outcome));
                    }
                    None => missing.push(format!("{}: no output", spec.name)),
                }
            }

            if !missing.is_empty() {
                tally.failed += 1;
                excluded.push(ExcludedUnit {
                    sub: *sub,
                    reasons: missing,
                });
                continue;
            }

            for spec in &optional {
                let value = match groups.get(&spec.name) {
                    Some(group) => match (&group.failure, group.records.get(sub)) {
                        (Some(reason), _) => BranchValue::Error(reason.clone()),
                        (None, Some(StageOutcome::Failed(reason))) => {
                            reasons.push(format!("{}: {}", spec.name, reason));
                            BranchValue::Absent
                        }
                        (None, Some(outcome)) => BranchValue::from_outcome(outcome),
                        (None, None) => BranchValue::Absent,
                    },
                    None => BranchValue::Absent,
                };
                branches.insert(spec.name.clone(), value);
            }

            let mut degraded = false;
            for (name, value) in &branches {
                if let BranchValue::Present {
                    fallback: Some(reason),
                    ..
                } = value
                {
                    degraded = true;
                    reasons.push(format!("{}: {}", name, reason));
                }
            }

            if degraded {
                tally.degraded += 1;
            } else {
                tally.succeeded += 1;
            }
            rows.push(AggregateRow {
                sub: *sub,
                branches,
                degraded,
                reasons,
            });
        }

        Ok(ParentAggregate {
            parent: parent.clone(),
            unit_count: candidates.len(),
            failed_count: excluded.len(),
            rows,
            excluded,
            tally,
            warnings,
        })
    }

    /// Run the barrier over `inputs`, one stream per declared branch.
    ///
    /// A parent is emitted once every branch has sealed it or ended. On
    /// cancellation, parents whose barrier is still open are abandoned and
    /// the output ends. In strict mode the output also ends after the first
    /// error.
    pub fn aggregate(
        &self,
        inputs: BTreeMap<String, BoxStream<'static, BranchMessage>>,
        cancel: Cancellation,
    ) -> Result<BoxStream<'static, Result<ParentAggregate, AggregationError>>, GraphError> {
        for name in inputs.keys() {
            if !self.branches.iter().any(|b| &b.name == name) {
                return Err(GraphError::UnknownBranch(name.clone()));
            }
        }
        for spec in &self.branches {
            if !inputs.contains_key(&spec.name) {
                return Err(GraphError::MissingBranchInput(spec.name.clone()));
            }
        }

        let streams: Vec<BoxStream<'static, Event>> = inputs
            .into_iter()
            .map(|(name, input)| {
                let tag = name.clone();
                input
                    .map(move |m| Event::Message(tag.clone(), m))
                    .chain(stream::once(async move { Event::Ended(name) }))
                    .boxed()
            })
            .collect();

        let names = self.branches.iter().map(|b| b.name.clone()).collect();
        let mut barrier = Barrier::new(names, &self.expected);
        let aggregator = self.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut events = stream::select_all(streams);

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::warn!(
                            "Aggregation cancelled; abandoning {} open parents",
                            barrier.pending.len()
                        );
                        return;
                    }
                    event = events.next() => event,
                };

                match event {
                    Some(Event::Message(branch, message)) => barrier.apply(branch, message),
                    Some(Event::Ended(branch)) => barrier.end(branch),
                    None => break,
                }

                for (parent, groups) in barrier.take_ready() {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let result = aggregator.join(&parent, &groups);
                    let stop = aggregator.policy.strict && result.is_err();
                    if let Err(e) = &result {
                        tracing::warn!("{}", e);
                    }
                    if tx.send(result).await.is_err() || stop {
                        return;
                    }
                }
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}
