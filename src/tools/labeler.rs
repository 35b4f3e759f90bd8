//! Labeling collaborator boundary.
//!
//! A labeler consumes a parent payload and returns one label per record.
//! "Zero clusters found" is a valid labeling (every record unassigned);
//! only a structurally broken input is an error.

use crate::error::ToolError;
use crate::unit::{SubKey, Unit};
use async_trait::async_trait;
use bytes::Bytes;

/// One record of a parent payload and the label it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRecord {
    pub label: SubKey,
    pub data: Bytes,
}

/// Result of labeling a parent payload.
#[derive(Debug, Clone, Default)]
pub struct Labeling {
    /// Header repeated at the top of every child artifact
    pub header: Option<Bytes>,

    /// Records in input order
    pub records: Vec<LabeledRecord>,
}

#[async_trait]
pub trait Labeler: Send + Sync {
    fn name(&self) -> &str;

    async fn label(&self, unit: &Unit) -> Result<Labeling, ToolError>;
}

/// Reads labels from a named column of a tab-separated assignment table.
///
/// This is the shape the clustering step writes: a header row followed by one
/// row per record, with the cluster id in `column` and `-1` for records that
/// were not assigned to any cluster.
pub struct ColumnLabeler {
    column: String,
}

impl ColumnLabeler {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }

    /// Parse a table held in `bytes`.
    pub fn parse(&self, bytes: &Bytes) -> Result<Labeling, ToolError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ToolError::fatal(format!("assignment table is not UTF-8: {}", e)))?;

        let mut offset = 0;
        let mut header: Option<(Bytes, usize)> = None;
        let mut records = Vec::new();

        for (line_no, line) in text.split_inclusive('\n').enumerate() {
            let start = offset;
            offset += line.len();

            let content = line.trim_end_matches(['\n', '\r']);
            if content.trim().is_empty() {
                continue;
            }

            let column_idx = match header.as_ref().map(|(_, idx)| *idx) {
                Some(idx) => idx,
                None => {
                    let idx = content
                        .split('\t')
                        .position(|name| name.trim() == self.column)
                        .ok_or_else(|| {
                            ToolError::fatal(format!(
                                "assignment table has no '{}' column",
                                self.column
                            ))
                        })?;
                    header = Some((bytes.slice(start..offset), idx));
                    continue;
                }
            };

            let raw = content.split('\t').nth(column_idx).ok_or_else(|| {
                ToolError::fatal(format!("line {}: missing '{}' field", line_no + 1, self.column))
            })?;
            let label = raw
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(SubKey::from_label)
                .ok_or_else(|| {
                    ToolError::fatal(format!("line {}: malformed label '{}'", line_no + 1, raw))
                })?;

            records.push(LabeledRecord {
                label,
                data: bytes.slice(start..offset),
            });
        }

        let header = header
            .map(|(h, _)| h)
            .ok_or_else(|| ToolError::fatal("assignment table is empty"))?;

        Ok(Labeling {
            header: Some(header),
            records,
        })
    }
}

#[async_trait]
impl Labeler for ColumnLabeler {
    fn name(&self) -> &str {
        "column"
    }

    async fn label(&self, unit: &Unit) -> Result<Labeling, ToolError> {
        self.parse(unit.payload().bytes())
    }
}
