//! Collaborator boundary.
//!
//! The engine never looks inside artifacts. Correction, polishing and
//! classification tools are [`Tool`]s mapping one artifact to another; the
//! clustering step is a [`Labeler`] assigning each record of a parent payload
//! to a sub-unit.

mod command;
mod labeler;

pub use command::{CommandSpec, CommandTool};
pub use labeler::{ColumnLabeler, LabeledRecord, Labeler, Labeling};

use crate::error::ToolError;
use crate::unit::{Payload, Unit};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;

/// Per-stage tool parameters, passed through verbatim.
pub type ToolParams = BTreeMap<String, String>;

/// A per-unit processing collaborator.
///
/// `unit` carries the artifact to process as its payload, along with the
/// unit's identity and provenance attributes.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, unit: &Unit, params: &ToolParams) -> Result<Payload, ToolError>;
}

/// A tool backed by an async closure.
pub struct FnTool<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Unit, ToolParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, ToolError>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Unit, ToolParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, ToolError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, unit: &Unit, params: &ToolParams) -> Result<Payload, ToolError> {
        (self.f)(unit.clone(), params.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Attributes;

    #[tokio::test]
    async fn test_fn_tool_passes_payload_and_params() {
        let tool = FnTool::new("upper", |unit: Unit, params: ToolParams| async move {
            let suffix = params.get("suffix").cloned().unwrap_or_default();
            let text = String::from_utf8_lossy(unit.payload().bytes()).to_uppercase();
            Ok(Payload::from(format!("{}{}", text, suffix).into_bytes()))
        });

        let unit = Unit::parent("A", Payload::from("acgt"), Attributes::new());
        let mut params = ToolParams::new();
        params.insert("suffix".into(), "!".into());

        let out = tool.invoke(&unit, &params).await.unwrap();
        assert_eq!(tool.name(), "upper");
        assert_eq!(out.bytes().as_ref(), b"ACGT!");
    }
}
