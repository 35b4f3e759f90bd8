//! Unit identity model.
//!
//! Every piece of work in a run is a [`Unit`] keyed by `(ParentKey, SubKey)`.
//! Parent units come from the input loader and carry no sub-key; child units
//! are created by the fan-out stage and carry the label assigned by the
//! external clustering step. The sub-key is the join key for all downstream
//! aggregation, so it is fixed at creation and never changes.

use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Raw label used by clustering tools for records that belong to no cluster.
pub const UNASSIGNED_LABEL: i64 = -1;

/// Sample identifier, stable for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParentKey(Arc<str>);

impl ParentKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParentKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for ParentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Sub-unit identifier assigned by fan-out.
///
/// Numbered clusters order ascending and always sort before `Unassigned`
/// (the variant order below is what `Ord` uses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubKey {
    Cluster(u32),
    Unassigned,
}

impl SubKey {
    /// Interpret a raw label exactly as the clustering tool emitted it.
    ///
    /// `-1` is the unassigned bucket. Any other negative value, or a value
    /// that does not fit a cluster index, is rejected.
    pub fn from_label(raw: i64) -> Option<Self> {
        if raw == UNASSIGNED_LABEL {
            return Some(SubKey::Unassigned);
        }
        u32::try_from(raw).ok().map(SubKey::Cluster)
    }

    pub fn is_unassigned(&self) -> bool {
        matches!(self, SubKey::Unassigned)
    }

    /// Path segment used for storage keys.
    pub fn as_segment(&self) -> String {
        match self {
            SubKey::Cluster(id) => format!("cluster{}", id),
            SubKey::Unassigned => "unassigned".to_string(),
        }
    }
}

impl fmt::Display for SubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubKey::Cluster(id) => write!(f, "{}", id),
            SubKey::Unassigned => f.write_str("unassigned"),
        }
    }
}

impl Serialize for SubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SubKey::Cluster(id) => serializer.serialize_u32(*id),
            SubKey::Unassigned => serializer.serialize_str("unassigned"),
        }
    }
}

/// Composite identity of a unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UnitKey {
    pub parent: ParentKey,
    pub sub: Option<SubKey>,
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub {
            Some(sub) => write!(f, "{}/{}", self.parent, sub),
            None => write!(f, "{}", self.parent),
        }
    }
}

/// Opaque handle to a unit's data artifact.
///
/// Backed by reference-counted bytes so that passing a payload between
/// stages and branches never copies the data.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Payload(Bytes);

impl Payload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<&'static str> for Payload {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

/// Open provenance map (read counts, source paths, ...).
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// The atomic work item.
///
/// Units are immutable once built: stage outcomes are carried next to the
/// unit, never written into it.
#[derive(Debug, Clone)]
pub struct Unit {
    key: UnitKey,
    payload: Payload,
    attributes: Arc<Attributes>,
}

impl Unit {
    /// Create a parent unit as produced by the input loader.
    pub fn parent(parent: impl Into<ParentKey>, payload: Payload, attributes: Attributes) -> Self {
        Self {
            key: UnitKey {
                parent: parent.into(),
                sub: None,
            },
            payload,
            attributes: Arc::new(attributes),
        }
    }

    /// Create a child of `parent` carrying `sub`.
    ///
    /// The child inherits the parent's attributes; `extra` entries override
    /// inherited ones.
    pub fn child(parent: &Unit, sub: SubKey, payload: Payload, extra: Attributes) -> Self {
        let mut attributes = (*parent.attributes).clone();
        attributes.extend(extra);
        Self {
            key: UnitKey {
                parent: parent.key.parent.clone(),
                sub: Some(sub),
            },
            payload,
            attributes: Arc::new(attributes),
        }
    }

    /// Same identity and provenance, different payload.
    ///
    /// Used when a downstream branch consumes an upstream branch's artifact
    /// for the same `(parent, sub)`.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            key: self.key.clone(),
            payload,
            attributes: self.attributes.clone(),
        }
    }

    pub fn key(&self) -> &UnitKey {
        &self.key
    }

    pub fn parent_key(&self) -> &ParentKey {
        &self.key.parent
    }

    pub fn sub_key(&self) -> Option<SubKey> {
        self.key.sub
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Integer attribute lookup (e.g. `read_count`).
    pub fn attribute_u64(&self, name: &str) -> Option<u64> {
        self.attributes.get(name).and_then(|v| v.as_u64())
    }
}

impl From<String> for ParentKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
