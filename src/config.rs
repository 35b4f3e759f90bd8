//! Configuration for a scatter-gather run.

use crate::error::GraphError;
use crate::pipeline::{
    AggregationPolicy, ClassBudget, Footprint, MissingParentPolicy, ResourceClass,
    ResourceScheduler, DEFAULT_MAX_SUB_UNITS,
};
use crate::tools::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input samples
    pub input: InputConfig,

    /// Artifact and report destination
    pub output: OutputConfig,

    /// Host capacity and per-class budgets
    #[serde(default)]
    pub resources: ResourcesConfig,

    /// Labeling collaborator profile
    #[serde(default)]
    pub labeling: LabelingConfig,

    /// Stage definitions by name
    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,

    /// Name of the per-unit chain's branch
    #[serde(default = "default_chain_name")]
    pub chain_name: String,

    /// Ordered stage names forming the per-unit chain
    #[serde(default)]
    pub chain: Vec<String>,

    /// Stage names run on each chain result, one optional branch each
    #[serde(default)]
    pub classifiers: Vec<String>,

    #[serde(default)]
    pub fanout: FanOutConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// One input sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    /// Parent key
    pub name: String,

    /// Assignment table path
    pub path: String,
}

/// Input configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    /// Explicit samples
    #[serde(default)]
    pub samples: Vec<SampleConfig>,

    /// Directory scanned for `*.tsv` assignment tables (file stem = sample name)
    #[serde(default)]
    pub directory: Option<String>,

    /// Column holding the cluster label
    #[serde(default = "default_label_column")]
    pub label_column: String,
}

/// Output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Local filesystem directory.
    /// Mutually exclusive with bucket/prefix.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket (required if local_path is not set)
    #[serde(default)]
    pub bucket: Option<String>,

    /// S3 path prefix (required if local_path is not set)
    #[serde(default)]
    pub prefix: Option<String>,
}

impl OutputConfig {
    /// Check if output is to local filesystem.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Get the output path as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!(
                "s3://{}/{}",
                self.bucket.as_deref().unwrap_or(""),
                self.prefix.as_deref().unwrap_or("")
            )
        }
    }

    /// Get the S3 prefix if this is an S3 output.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// Host capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// CPU cores (detected if unset)
    #[serde(default)]
    pub cpus: Option<u32>,

    /// Memory in GB
    #[serde(default = "default_host_memory_gb")]
    pub memory_gb: f64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            cpus: None,
            memory_gb: default_host_memory_gb(),
        }
    }
}

/// Resource profile, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub host: HostConfig,

    #[serde(default = "default_classes")]
    pub classes: BTreeMap<ResourceClass, ClassBudget>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            classes: default_classes(),
        }
    }
}

impl ResourcesConfig {
    /// Host capacity, detecting the CPU count if it is not configured.
    pub fn host(&self) -> Footprint {
        let cpus = self.host.cpus.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        });
        Footprint::new(cpus, self.host.memory_gb)
    }
}

/// A stage: its resource contract plus the external tool it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default = "default_class")]
    pub class: ResourceClass,

    #[serde(default = "default_cpus")]
    pub cpus: u32,

    #[serde(default = "default_memory_gb")]
    pub memory_gb: f64,

    /// Per-unit timeout; a timeout is fatal for the unit
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Artifact kind consumed
    #[serde(default = "default_port")]
    pub input: String,

    /// Artifact kind produced
    #[serde(default = "default_port")]
    pub output: String,

    pub tool: CommandSpec,

    /// Passed to the tool as `--key value`
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl StageConfig {
    pub fn footprint(&self) -> Footprint {
        Footprint::new(self.cpus, self.memory_gb)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Resource profile of the labeling collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelingConfig {
    #[serde(default = "default_class")]
    pub class: ResourceClass,

    #[serde(default = "default_cpus")]
    pub cpus: u32,

    #[serde(default = "default_memory_gb")]
    pub memory_gb: f64,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            class: default_class(),
            cpus: default_cpus(),
            memory_gb: default_memory_gb(),
            timeout_secs: None,
        }
    }
}

impl LabelingConfig {
    pub fn footprint(&self) -> Footprint {
        Footprint::new(self.cpus, self.memory_gb)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutConfig {
    /// Sanity ceiling on distinct labels per parent
    #[serde(default = "default_max_sub_units")]
    pub max_sub_units: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_sub_units: DEFAULT_MAX_SUB_UNITS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// `fail` or `empty`
    #[serde(default)]
    pub missing_parent: MissingParentPolicy,

    /// Abort the run on the first aggregation error
    #[serde(default)]
    pub strict: bool,
}

impl AggregationConfig {
    pub fn policy(&self) -> AggregationPolicy {
        AggregationPolicy {
            missing_parent: self.missing_parent,
            strict: self.strict,
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Parents labeled and fanned out concurrently
    #[serde(default = "default_parent_concurrency")]
    pub parent_concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Buffer of each branch channel feeding the aggregator
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            parent_concurrency: default_parent_concurrency(),
            worker_threads: None,
            channel_buffer: default_channel_buffer(),
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Result<&StageConfig, GraphError> {
        self.stages
            .get(name)
            .ok_or_else(|| GraphError::UnknownStage(name.to_string()))
    }

    /// Validate the configuration.
    ///
    /// Also checks the resource profile against host capacity and every
    /// stage against its class ceiling, so an oversized stage is rejected
    /// before any work starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.output.local_path, &self.output.bucket, &self.output.prefix) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                anyhow::bail!("Cannot specify both local_path and bucket/prefix");
            }
            (None, None, _) | (None, _, None) => {
                anyhow::bail!("Must specify either local_path or both bucket and prefix");
            }
            _ => {}
        }

        if self.input.samples.is_empty() && self.input.directory.is_none() {
            anyhow::bail!("No input: specify input.samples or input.directory");
        }
        if self.input.label_column.trim().is_empty() {
            anyhow::bail!("input.label_column must not be empty");
        }
        let mut names = HashSet::new();
        for sample in &self.input.samples {
            if !names.insert(sample.name.as_str()) {
                anyhow::bail!("Sample '{}' is listed more than once", sample.name);
            }
        }

        if self.chain.is_empty() {
            return Err(GraphError::EmptyChain(self.chain_name.clone()).into());
        }
        let mut seen = HashSet::new();
        for name in &self.chain {
            self.stage(name)?;
            if !seen.insert(name.as_str()) {
                return Err(GraphError::DuplicateStage(name.clone()).into());
            }
        }
        let mut branches = HashSet::from([self.chain_name.as_str()]);
        for name in &self.classifiers {
            self.stage(name)?;
            if !branches.insert(name.as_str()) {
                return Err(GraphError::DuplicateBranch(name.clone()).into());
            }
        }

        let scheduler = ResourceScheduler::new(&self.resources.classes, self.resources.host())?;
        scheduler.require_class(self.labeling.class)?;
        scheduler.admit("labeling", self.labeling.class, self.labeling.footprint())?;
        for name in self.chain.iter().chain(&self.classifiers) {
            let stage = self.stage(name)?;
            scheduler.require_class(stage.class)?;
            scheduler.admit(name, stage.class, stage.footprint())?;
        }

        if self.fanout.max_sub_units == 0 {
            anyhow::bail!("fanout.max_sub_units must be > 0");
        }
        if self.processing.parent_concurrency == 0 {
            anyhow::bail!("processing.parent_concurrency must be > 0");
        }
        if self.processing.channel_buffer == 0 {
            anyhow::bail!("processing.channel_buffer must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_label_column() -> String { "cluster_id".to_string() }
fn default_chain_name() -> String { "consensus".to_string() }
fn default_host_memory_gb() -> f64 { 32.0 }
fn default_class() -> ResourceClass { ResourceClass::Light }
fn default_cpus() -> u32 { 1 }
fn default_memory_gb() -> f64 { 1.0 }
fn default_port() -> String { "artifact".to_string() }
fn default_max_sub_units() -> usize { DEFAULT_MAX_SUB_UNITS }
fn default_parent_concurrency() -> usize { 4 }
fn default_channel_buffer() -> usize { 256 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }

fn default_classes() -> BTreeMap<ResourceClass, ClassBudget> {
    BTreeMap::from([
        (
            ResourceClass::Light,
            ClassBudget { max_concurrent: 8, max_cpus: 1, max_memory_gb: 2.0 },
        ),
        (
            ResourceClass::Medium,
            ClassBudget { max_concurrent: 4, max_cpus: 2, max_memory_gb: 8.0 },
        ),
        (
            ResourceClass::Heavy,
            ClassBudget { max_concurrent: 1, max_cpus: 4, max_memory_gb: 16.0 },
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
input:
  samples:
    - name: barcode01
      path: /data/barcode01.tsv
output:
  local_path: /tmp/sg-out
resources:
  host:
    cpus: 16
    memory_gb: 64
  classes:
    light: { max_concurrent: 8, max_cpus: 1, max_memory_gb: 2 }
    medium: { max_concurrent: 2, max_cpus: 8, max_memory_gb: 16 }
stages:
  correct:
    class: medium
    cpus: 4
    memory_gb: 8
    timeout_secs: 600
    input: reads
    output: corrected
    tool: { program: canu-correct, recoverable_exit_codes: [3] }
  polish:
    class: medium
    cpus: 4
    memory_gb: 8
    input: corrected
    output: consensus
    tool: { program: medaka }
    params: { model: r941 }
  blast:
    input: consensus
    output: taxonomy
    tool: { program: blastn }
chain: [correct, polish]
classifiers: [blast]
aggregation:
  missing_parent: empty
  strict: true
"#;

    fn config() -> Config {
        Config::from_yaml(YAML).unwrap()
    }

    #[test]
    fn test_parse_yaml_with_defaults() {
        let config = config();

        assert!(config.validate().is_ok());
        assert_eq!(config.chain_name, "consensus");
        assert_eq!(config.input.label_column, "cluster_id");
        assert_eq!(config.fanout.max_sub_units, 1000);
        assert_eq!(config.processing.parent_concurrency, 4);
        assert_eq!(config.labeling.class, ResourceClass::Light);

        let correct = config.stage("correct").unwrap();
        assert_eq!(correct.footprint(), Footprint::new(4, 8.0));
        assert_eq!(correct.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(correct.tool.recoverable_exit_codes, vec![3]);
        assert_eq!(config.stage("polish").unwrap().params["model"], "r941");
        assert_eq!(config.stage("blast").unwrap().class, ResourceClass::Light);

        let policy = config.aggregation.policy();
        assert_eq!(policy.missing_parent, MissingParentPolicy::Empty);
        assert!(policy.strict);
    }

    #[test]
    fn test_output_destination_is_exclusive() {
        let mut config = config();
        config.output.bucket = Some("bucket".into());
        assert!(config.validate().is_err());

        config.output.local_path = None;
        assert!(config.validate().is_err());

        config.output.prefix = Some("runs/1".into());
        assert!(config.validate().is_ok());
        assert_eq!(config.output.path_display(), "s3://bucket/runs/1");
    }

    #[test]
    fn test_oversized_stage_rejected() {
        let mut config = config();
        config.stages.get_mut("blast").unwrap().cpus = 4;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resource request exceeds limit"));
    }

    #[test]
    fn test_class_exceeding_host_rejected() {
        let mut config = config();
        config.resources.host.cpus = Some(4);
        assert!(config.validate().unwrap_err().to_string().contains("exceeds host"));
    }

    #[test]
    fn test_unconfigured_class_rejected() {
        let mut config = config();
        config.stages.get_mut("blast").unwrap().class = ResourceClass::Heavy;
        assert!(config.validate().unwrap_err().to_string().contains("no configured budget"));
    }

    #[test]
    fn test_graph_errors() {
        let mut config = config();
        config.chain.push("missing".into());
        assert!(config.validate().unwrap_err().to_string().contains("not defined"));

        let mut config = self::config();
        config.classifiers.push("consensus".into());
        config.stages.insert("consensus".into(), config.stages["blast"].clone());
        assert!(config.validate().unwrap_err().to_string().contains("more than once"));

        let mut config = self::config();
        config.chain.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let json = serde_json::to_string(&config()).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.chain, vec!["correct", "polish"]);
        assert!(config().to_yaml().unwrap().contains("classifiers"));
    }

    #[test]
    fn test_detected_host_cpus() {
        let resources = ResourcesConfig::default();
        assert!(resources.host().cpus >= 1);
        assert_eq!(resources.host().memory_gb, 32.0);
    }
}
