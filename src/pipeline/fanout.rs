//! Dynamic fan-out: one labeled parent becomes one child per distinct label.

use crate::error::FanOutError;
use crate::tools::Labeling;
use crate::unit::{Attributes, Payload, SubKey, Unit};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::collections::BTreeMap;

/// Default sanity ceiling on distinct labels per parent.
pub const DEFAULT_MAX_SUB_UNITS: usize = 1000;

/// Attribute carrying the number of records in a child unit.
pub const READ_COUNT_ATTR: &str = "read_count";

/// Per-parent clustering summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterStats {
    /// Labeled records in the parent
    pub records: u64,

    /// Numbered clusters (the unassigned bucket is not a cluster)
    pub clusters: usize,

    pub unassigned: u64,
    pub unassigned_fraction: f64,

    /// Records per numbered cluster
    pub sizes: BTreeMap<u32, u64>,

    pub largest: u64,
    pub smallest: u64,
    pub mean_size: f64,
}

impl ClusterStats {
    fn from_counts(counts: &BTreeMap<SubKey, u64>) -> Self {
        let records: u64 = counts.values().sum();
        let unassigned = counts.get(&SubKey::Unassigned).copied().unwrap_or(0);
        let sizes: BTreeMap<u32, u64> = counts
            .iter()
            .filter_map(|(sub, n)| match sub {
                SubKey::Cluster(id) => Some((*id, *n)),
                SubKey::Unassigned => None,
            })
            .collect();

        let clustered = records - unassigned;
        Self {
            records,
            clusters: sizes.len(),
            unassigned,
            unassigned_fraction: if records > 0 {
                unassigned as f64 / records as f64
            } else {
                0.0
            },
            largest: sizes.values().copied().max().unwrap_or(0),
            smallest: sizes.values().copied().min().unwrap_or(0),
            mean_size: if sizes.is_empty() {
                0.0
            } else {
                clustered as f64 / sizes.len() as f64
            },
            sizes,
        }
    }
}

/// Children produced from one parent, in ascending sub-key order.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub children: Vec<Unit>,
    pub stats: ClusterStats,

    /// Build-time warning (zero clusters, zero records)
    pub warning: Option<String>,
}

impl Expansion {
    /// Every record fell into the unassigned bucket.
    pub fn is_zero_cluster(&self) -> bool {
        self.stats.clusters == 0 && self.stats.unassigned > 0
    }
}

/// The fan-out stage.
///
/// Labels are taken verbatim from the labeler; this stage only groups.
#[derive(Debug, Clone, Copy)]
pub struct FanOut {
    max_sub_units: usize,
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUB_UNITS)
    }
}

impl FanOut {
    pub fn new(max_sub_units: usize) -> Self {
        Self { max_sub_units }
    }

    pub fn max_sub_units(&self) -> usize {
        self.max_sub_units
    }

    /// Split `parent` into one child per distinct label in `labeling`.
    ///
    /// Each child's payload is the labeling header followed by exactly the
    /// records carrying its label, in input order. Fails as soon as the
    /// number of distinct labels passes the ceiling.
    pub fn expand(&self, parent: &Unit, labeling: Labeling) -> Result<Expansion, FanOutError> {
        let header = labeling.header.unwrap_or_default();
        let mut groups: BTreeMap<SubKey, (BytesMut, u64)> = BTreeMap::new();

        for record in labeling.records {
            if !groups.contains_key(&record.label) && groups.len() == self.max_sub_units {
                return Err(FanOutError::TooManyLabels {
                    parent: parent.parent_key().clone(),
                    count: groups.len() + 1,
                    ceiling: self.max_sub_units,
                });
            }

            let (buf, count) = groups.entry(record.label).or_insert_with(|| {
                let mut buf = BytesMut::with_capacity(header.len() + record.data.len());
                put_line(&mut buf, &header);
                (buf, 0)
            });
            put_line(buf, &record.data);
            *count += 1;
        }

        let counts: BTreeMap<SubKey, u64> = groups.iter().map(|(k, (_, n))| (*k, *n)).collect();
        let stats = ClusterStats::from_counts(&counts);

        let children: Vec<Unit> = groups
            .into_iter()
            .map(|(sub, (buf, count))| {
                let mut extra = Attributes::new();
                extra.insert(READ_COUNT_ATTR.to_string(), count.into());
                Unit::child(parent, sub, Payload::new(buf.freeze()), extra)
            })
            .collect();

        let warning = if stats.records == 0 {
            Some(format!(
                "parent '{}' has no labeled records; no sub-units created",
                parent.parent_key()
            ))
        } else if stats.clusters == 0 {
            Some(format!(
                "no clusters discovered for parent '{}'; all {} records unassigned",
                parent.parent_key(),
                stats.unassigned
            ))
        } else {
            None
        };

        if let Some(w) = &warning {
            tracing::warn!("{}", w);
        }
        tracing::debug!(
            "Fan-out of '{}': {} clusters, {} unassigned of {} records",
            parent.parent_key(),
            stats.clusters,
            stats.unassigned,
            stats.records
        );

        Ok(Expansion {
            children,
            stats,
            warning,
        })
    }
}

/// Append `line`, terminating it with a newline if it lacks one.
fn put_line(buf: &mut BytesMut, line: &Bytes) {
    if line.is_empty() {
        return;
    }
    buf.put_slice(line);
    if !line.ends_with(b"\n") {
        buf.put_u8(b'\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::LabeledRecord;

    fn parent() -> Unit {
        Unit::parent("A", Payload::from("raw"), Attributes::new())
    }

    fn labeling(labels: &[SubKey]) -> Labeling {
        Labeling {
            header: Some(Bytes::from_static(b"read\tcluster_id\n")),
            records: labels
                .iter()
                .enumerate()
                .map(|(i, label)| LabeledRecord {
                    label: *label,
                    data: Bytes::from(format!("r{}\t{}", i, label)),
                })
                .collect(),
        }
    }

    #[test]
    fn test_one_child_per_label_sorted() {
        use SubKey::*;
        let labels = [Cluster(2), Unassigned, Cluster(0), Cluster(2), Cluster(1), Cluster(0)];

        let expansion = FanOut::default().expand(&parent(), labeling(&labels)).unwrap();

        let subs: Vec<_> = expansion.children.iter().map(|c| c.sub_key()).collect();
        assert_eq!(
            subs,
            vec![Some(Cluster(0)), Some(Cluster(1)), Some(Cluster(2)), Some(Unassigned)]
        );
        assert!(expansion.children.iter().all(|c| c.parent_key().as_str() == "A"));
        assert!(expansion.warning.is_none());

        let cluster2 = &expansion.children[2];
        assert_eq!(
            cluster2.payload().bytes().as_ref(),
            b"read\tcluster_id\nr0\t2\nr3\t2\n"
        );
        assert_eq!(cluster2.attribute_u64(READ_COUNT_ATTR), Some(2));
    }

    #[test]
    fn test_cluster_stats() {
        use SubKey::*;
        let labels = [Cluster(0), Cluster(0), Cluster(0), Cluster(1), Unassigned];

        let stats = FanOut::default().expand(&parent(), labeling(&labels)).unwrap().stats;

        assert_eq!(stats.records, 5);
        assert_eq!(stats.clusters, 2);
        assert_eq!(stats.unassigned, 1);
        assert!((stats.unassigned_fraction - 0.2).abs() < 1e-9);
        assert_eq!(stats.largest, 3);
        assert_eq!(stats.smallest, 1);
        assert!((stats.mean_size - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_clusters_emits_only_unassigned() {
        let labels = [SubKey::Unassigned; 3];

        let expansion = FanOut::default().expand(&parent(), labeling(&labels)).unwrap();

        assert_eq!(expansion.children.len(), 1);
        assert_eq!(expansion.children[0].sub_key(), Some(SubKey::Unassigned));
        assert!(expansion.is_zero_cluster());
        assert!(expansion.warning.unwrap().contains("no clusters discovered"));
    }

    #[test]
    fn test_zero_records_emits_nothing() {
        let expansion = FanOut::default().expand(&parent(), labeling(&[])).unwrap();

        assert!(expansion.children.is_empty());
        assert!(!expansion.is_zero_cluster());
        assert!(expansion.warning.is_some());
        assert_eq!(expansion.stats, ClusterStats::default());
    }

    #[test]
    fn test_label_ceiling_fails_fast() {
        let labels: Vec<SubKey> = (0..10).map(SubKey::Cluster).collect();

        let err = FanOut::new(4).expand(&parent(), labeling(&labels)).unwrap_err();
        assert_eq!(
            err,
            FanOutError::TooManyLabels {
                parent: "A".into(),
                count: 5,
                ceiling: 4
            }
        );

        // Exactly at the ceiling is fine
        assert!(FanOut::new(10).expand(&parent(), labeling(&labels)).is_ok());
    }
}
