//! Loading parent units from assignment tables.

use super::store::{create_s3_store, parse_s3_uri};
use crate::config::{InputConfig, SampleConfig};
use crate::unit::{Attributes, Payload, Unit};
use anyhow::{Context, Result};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStoreExt;
use std::collections::HashSet;
use std::path::Path;

/// Attribute holding where a parent was loaded from.
pub const SOURCE_ATTR: &str = "source";

/// Attribute holding the size of a parent's payload.
pub const BYTES_ATTR: &str = "bytes";

/// Resolve the configured samples: explicit entries first, then every
/// `*.tsv` in `directory`, sorted by name.
pub fn discover_samples(input: &InputConfig) -> Result<Vec<SampleConfig>> {
    let mut samples = input.samples.clone();

    if let Some(dir) = &input.directory {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("tsv") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            found.push(SampleConfig {
                name: stem.to_string(),
                path: path.to_string_lossy().into_owned(),
            });
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        samples.extend(found);
    }

    let mut names = HashSet::new();
    for sample in &samples {
        if !names.insert(sample.name.as_str()) {
            anyhow::bail!("Duplicate sample name '{}'", sample.name);
        }
    }
    Ok(samples)
}

/// Read one sample into a parent unit.
pub async fn load_sample(sample: &SampleConfig) -> Result<Unit> {
    let bytes = if sample.path.starts_with("s3://") {
        let (bucket, key) = parse_s3_uri(&sample.path)?;
        let store = create_s3_store(bucket)?;
        store
            .get(&ObjectPath::from(key))
            .await
            .with_context(|| format!("fetching {}", sample.path))?
            .bytes()
            .await?
    } else {
        tokio::fs::read(Path::new(&sample.path))
            .await
            .with_context(|| format!("reading {}", sample.path))?
            .into()
    };

    let mut attributes = Attributes::new();
    attributes.insert(SOURCE_ATTR.to_string(), sample.path.clone().into());
    attributes.insert(BYTES_ATTR.to_string(), (bytes.len() as u64).into());

    tracing::debug!("Loaded sample '{}' ({} bytes)", sample.name, bytes.len());
    Ok(Unit::parent(sample.name.clone(), Payload::new(bytes), attributes))
}

/// Load every configured sample.
pub async fn load_parents(input: &InputConfig) -> Result<Vec<Unit>> {
    let samples = discover_samples(input)?;
    if samples.is_empty() {
        anyhow::bail!("No input samples found");
    }

    let mut parents = Vec::with_capacity(samples.len());
    for sample in &samples {
        parents.push(load_sample(sample).await?);
    }
    tracing::info!("Loaded {} samples", parents.len());
    Ok(parents)
}
