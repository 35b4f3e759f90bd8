//! Keyed durable artifact storage.
//!
//! Each `(parent, sub, branch)` maps to exactly one object key and is written
//! by exactly one unit, so writers never contend. Readers only look up a key
//! after its writer has reported completion.
//!
//! Once a parent is aggregated, each branch's row artifacts are also joined
//! into one object under `<prefix>/joined/<parent>/<branch>`.

use crate::error::StoreError;
use crate::pipeline::{BranchValue, ParentAggregate};
use crate::unit::{ParentKey, Payload, SubKey};
use bytes::Bytes;
use dashmap::DashSet;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use std::sync::Arc;

/// Write-once artifact store over an object store.
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    written: DashSet<String>,
    joined: DashSet<String>,
}

impl ArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            written: DashSet::new(),
            joined: DashSet::new(),
        }
    }

    fn prefixed(&self, key: String) -> Path {
        if self.prefix.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", self.prefix, key))
        }
    }

    /// Object key for an artifact: `<prefix>/artifacts/<parent>/<sub>/<branch>`.
    pub fn path(&self, parent: &ParentKey, sub: SubKey, branch: &str) -> Path {
        self.prefixed(format!("artifacts/{}/{}/{}", parent, sub.as_segment(), branch))
    }

    /// Object key for a joined branch: `<prefix>/joined/<parent>/<branch>`.
    pub fn joined_path(&self, parent: &ParentKey, branch: &str) -> Path {
        self.prefixed(format!("joined/{}/{}", parent, branch))
    }

    /// Store an artifact. Fails if the key was already written in this run.
    pub async fn put(
        &self,
        parent: &ParentKey,
        sub: SubKey,
        branch: &str,
        payload: &Payload,
    ) -> Result<u64, StoreError> {
        let path = self.path(parent, sub, branch);
        if !self.written.insert(path.to_string()) {
            return Err(StoreError::AlreadyWritten(path.to_string()));
        }
        self.write(&path, payload).await
    }

    /// Join one branch of an aggregate (see [`join_branch`]) and store it.
    /// Fails if that parent's branch was already joined in this run.
    pub async fn put_joined(
        &self,
        aggregate: &ParentAggregate,
        branch: &str,
    ) -> Result<u64, StoreError> {
        let path = self.joined_path(&aggregate.parent, branch);
        if !self.joined.insert(path.to_string()) {
            return Err(StoreError::AlreadyWritten(path.to_string()));
        }
        self.write(&path, &join_branch(aggregate, branch)).await
    }

    async fn write(&self, path: &Path, payload: &Payload) -> Result<u64, StoreError> {
        let size = payload.len() as u64;
        self.store
            .put(path, PutPayload::from(payload.bytes().clone()))
            .await?;

        tracing::debug!("Stored {} bytes at {}", size, path);
        Ok(size)
    }

    pub async fn get_joined(&self, parent: &ParentKey, branch: &str) -> Result<Payload, StoreError> {
        let path = self.joined_path(parent, branch);
        let bytes = self.store.get(&path).await?.bytes().await?;
        Ok(Payload::new(bytes))
    }

    pub async fn get(
        &self,
        parent: &ParentKey,
        sub: SubKey,
        branch: &str,
    ) -> Result<Payload, StoreError> {
        let path = self.path(parent, sub, branch);
        let bytes = self.store.get(&path).await?.bytes().await?;
        Ok(Payload::new(bytes))
    }

    /// Number of unit artifacts written so far.
    pub fn len(&self) -> usize {
        self.written.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }
}

fn cell_state(value: &BranchValue) -> &'static str {
    match value {
        BranchValue::Present { fallback: None, .. } => "present",
        BranchValue::Present { fallback: Some(_), .. } => "fallback",
        BranchValue::Absent => "absent",
        BranchValue::Error(_) => "error",
    }
}

/// Concatenate one branch's row artifacts in sub-key order.
///
/// Each row starts with a header line naming the parent, the sub-unit and
/// the state of every branch cell in that row:
///
/// ```text
/// >A|cluster1 classify=absent consensus=present
/// ```
///
/// followed by the branch artifact when the row has one. Rows without an
/// artifact keep their header, so positions line up across branches.
pub fn join_branch(aggregate: &ParentAggregate, branch: &str) -> Payload {
    let mut out = Vec::new();
    for row in &aggregate.rows {
        let mut header = format!(">{}|{}", aggregate.parent, row.sub.as_segment());
        for (name, value) in &row.branches {
            header.push_str(&format!(" {}={}", name, cell_state(value)));
        }
        if row.degraded {
            header.push_str(" degraded");
        }
        header.push('\n');
        out.extend_from_slice(header.as_bytes());

        if let Some(artifact) = row.value(branch).and_then(BranchValue::artifact) {
            let bytes = artifact.bytes();
            out.extend_from_slice(bytes);
            if !bytes.is_empty() && !bytes.ends_with(b"\n") {
                out.push(b'\n');
            }
        }
    }
    Payload::new(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AggregateRow, OutcomeTally};
    use object_store::memory::InMemory;
    use std::collections::BTreeMap;

    fn store(prefix: &str) -> ArtifactStore {
        ArtifactStore::new(Arc::new(InMemory::new()), prefix)
    }

    #[test]
    fn test_path_layout() {
        let artifacts = store("runs/r1/");
        assert_eq!(
            artifacts
                .path(&"barcode01".into(), SubKey::Cluster(3), "consensus")
                .as_ref(),
            "runs/r1/artifacts/barcode01/cluster3/consensus"
        );
        assert_eq!(
            store("")
                .path(&"A".into(), SubKey::Unassigned, "classify")
                .as_ref(),
            "artifacts/A/unassigned/classify"
        );
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let artifacts = store("out");
        let parent = ParentKey::new("A");

        let size = artifacts
            .put(&parent, SubKey::Cluster(0), "consensus", &Payload::from(">c0\nACGT\n"))
            .await
            .unwrap();
        assert_eq!(size, 9);

        let read = artifacts.get(&parent, SubKey::Cluster(0), "consensus").await.unwrap();
        assert_eq!(read, Payload::from(">c0\nACGT\n"));
        assert_eq!(artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_second_write_is_rejected() {
        let artifacts = store("out");
        let parent = ParentKey::new("A");

        artifacts
            .put(&parent, SubKey::Cluster(1), "consensus", &Payload::from("x"))
            .await
            .unwrap();
        let err = artifacts
            .put(&parent, SubKey::Cluster(1), "consensus", &Payload::from("y"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyWritten(_)));

        // Other branches of the same unit are separate keys
        assert!(artifacts
            .put(&parent, SubKey::Cluster(1), "classify", &Payload::from("z"))
            .await
            .is_ok());
    }

    fn row(sub: SubKey, consensus: &str, classify: BranchValue) -> AggregateRow {
        AggregateRow {
            sub,
            branches: BTreeMap::from([
                ("classify".to_string(), classify),
                (
                    "consensus".to_string(),
                    BranchValue::Present {
                        artifact: Payload::from(consensus.to_string().into_bytes()),
                        fallback: None,
                    },
                ),
            ]),
            degraded: false,
            reasons: Vec::new(),
        }
    }

    fn aggregate() -> ParentAggregate {
        let hit = |taxon: &str| BranchValue::Present {
            artifact: Payload::from(taxon.to_string().into_bytes()),
            fallback: None,
        };
        ParentAggregate {
            parent: "A".into(),
            rows: vec![
                row(SubKey::Cluster(0), ">c0\nAAAA\n", hit("E. coli")),
                row(SubKey::Cluster(1), ">c1\nCCCC\n", BranchValue::Absent),
                row(SubKey::Cluster(2), ">c2\nGGGG", BranchValue::Error("db offline".into())),
            ],
            unit_count: 3,
            failed_count: 0,
            excluded: Vec::new(),
            tally: OutcomeTally::default(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_join_keeps_row_order_and_absent_rows() {
        let joined = join_branch(&aggregate(), "consensus");
        assert_eq!(
            std::str::from_utf8(joined.bytes()).unwrap(),
            ">A|cluster0 classify=present consensus=present\n>c0\nAAAA\n\
             >A|cluster1 classify=absent consensus=present\n>c1\nCCCC\n\
             >A|cluster2 classify=error consensus=present\n>c2\nGGGG\n"
        );

        let joined = join_branch(&aggregate(), "classify");
        assert_eq!(
            std::str::from_utf8(joined.bytes()).unwrap(),
            ">A|cluster0 classify=present consensus=present\nE. coli\n\
             >A|cluster1 classify=absent consensus=present\n\
             >A|cluster2 classify=error consensus=present\n"
        );
    }

    #[tokio::test]
    async fn test_put_joined_is_write_once() {
        let artifacts = store("out");
        let agg = aggregate();

        assert!(artifacts.put_joined(&agg, "consensus").await.unwrap() > 0);
        assert_eq!(
            artifacts.joined_path(&agg.parent, "consensus").as_ref(),
            "out/joined/A/consensus"
        );
        let read = artifacts.get_joined(&agg.parent, "consensus").await.unwrap();
        assert_eq!(read, join_branch(&agg, "consensus"));

        let err = artifacts.put_joined(&agg, "consensus").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyWritten(_)));
        // Joined objects are not unit artifacts
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let err = store("out")
            .get(&"A".into(), SubKey::Cluster(9), "consensus")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ObjectStore(_)));
    }
}
