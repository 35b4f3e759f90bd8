//! Scatter-Gather CLI
//!
//! Fan samples out into sub-units, run each through a stage chain, and
//! gather the results per sample.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scatter_gather::{build_runtime, io, run_pipeline, Config};

#[derive(Parser)]
#[command(name = "scatter-gather")]
#[command(about = "Dynamic scatter-gather over per-sample sub-units", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the number of parents processed concurrently
    #[arg(long, global = true)]
    parent_concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Print the resource plan without processing
    Analyze,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config, cli.parent_concurrency)?;
        }

        Some(Commands::Analyze) => {
            analyze_command(cli.config)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(config_path: &PathBuf, parent_concurrency: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;

    // Apply overrides
    if let Some(c) = parent_concurrency {
        config.processing.parent_concurrency = c;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, parent_concurrency: Option<usize>) -> Result<()> {
    let config = load_config(&config_path, parent_concurrency)?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let stats = runtime.block_on(async { run_pipeline(config).await })?;

    if stats.errors > 0 {
        tracing::warn!("{} parents failed to aggregate", stats.errors);
    }
    Ok(())
}

fn analyze_command(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path, None)?;
    let samples = io::discover_samples(&config.input)?;
    let host = config.resources.host();

    println!("\n=== Resource Plan ===");
    println!("Host: {}", host);
    println!("Samples: {}", samples.len());
    println!(
        "Parent concurrency: {} (max {} sub-units per parent)",
        config.processing.parent_concurrency, config.fanout.max_sub_units
    );

    println!("\n--- Classes ---");
    for (class, budget) in &config.resources.classes {
        println!(
            "{:<8} {:>3} concurrent, ceiling {} per unit",
            class.as_str(),
            budget.max_concurrent,
            budget.limit()
        );
    }

    println!("\n--- Stages ---");
    println!(
        "{:<16} labeling     {:<8} {}",
        "(labeler)",
        config.labeling.class.as_str(),
        config.labeling.footprint()
    );
    for name in &config.chain {
        let stage = config.stage(name)?;
        println!(
            "{:<16} {:<12} {:<8} {} {} -> {}",
            name,
            config.chain_name,
            stage.class.as_str(),
            stage.footprint(),
            stage.input,
            stage.output
        );
    }
    for name in &config.classifiers {
        let stage = config.stage(name)?;
        println!(
            "{:<16} {:<12} {:<8} {} {} -> {}",
            name,
            "(optional)",
            stage.class.as_str(),
            stage.footprint(),
            stage.input,
            stage.output
        );
    }

    println!(
        "\nAggregation: missing parent = {:?}, strict = {}",
        config.aggregation.missing_parent, config.aggregation.strict
    );
    println!("Output: {}", config.output.path_display());
    println!("=====================\n");

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    load_config(&config_path, None)?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Scatter-Gather Configuration

# === INPUT: One assignment table per sample ===
input:
  # Explicit samples (name becomes the parent key)
  samples:
    - name: barcode01
      path: "/data/clusters/barcode01.tsv"

  # Or scan a directory for *.tsv tables (file stem = sample name)
  # directory: "/data/clusters"

  # Column holding the cluster id (-1 = unassigned)
  label_column: "cluster_id"

# === OUTPUT: Where to write artifacts and reports ===
# Choose ONE of: local_path (local disk) OR bucket+prefix (S3)
output:
  local_path: "/tmp/scatter-gather"

  # bucket: "output-bucket"
  # prefix: "runs/2024-06-01"

# === RESOURCES: Host capacity and per-class ceilings ===
resources:
  host:
    # cpus: 16        # detected if omitted
    memory_gb: 32
  classes:
    light:  { max_concurrent: 8, max_cpus: 1, max_memory_gb: 2 }
    medium: { max_concurrent: 4, max_cpus: 2, max_memory_gb: 8 }
    heavy:  { max_concurrent: 1, max_cpus: 4, max_memory_gb: 16 }

# === LABELING: Resource profile of the clustering labeler ===
labeling:
  class: light
  cpus: 1
  memory_gb: 1

# === STAGES: External tools ===
# The artifact is written to stdin and stdout becomes the new artifact.
# Exit codes listed in recoverable_exit_codes (or empty output) mean
# "no result": the previous artifact is kept and the unit is degraded.
stages:
  correct:
    class: heavy
    cpus: 4
    memory_gb: 16
    timeout_secs: 3600
    input: reads
    output: corrected
    tool:
      program: "correct-reads"
      recoverable_exit_codes: [3]

  draft:
    class: medium
    cpus: 2
    memory_gb: 4
    input: corrected
    output: draft
    tool:
      program: "select-draft"
      recoverable_exit_codes: [3]

  polish:
    class: medium
    cpus: 2
    memory_gb: 8
    timeout_secs: 1800
    input: draft
    output: consensus
    tool:
      program: "polish-consensus"
    params:
      model: "r941_min_high_g351"

  blast:
    class: light
    input: consensus
    output: taxonomy
    tool:
      program: "classify-blast"
      recoverable_exit_codes: [3]

# Per-unit chain (mandatory branch)
chain_name: consensus
chain: [correct, draft, polish]

# Zero or more classifiers (one optional branch each)
classifiers: [blast]

# === FAN-OUT ===
fanout:
  # Sanity ceiling on distinct labels per sample
  max_sub_units: 1000

# === AGGREGATION ===
aggregation:
  # fail: report an error for the sample; empty: emit it with no rows
  missing_parent: fail

  # Abort the run on the first aggregation error
  strict: false

# === PROCESSING ===
processing:
  # Samples labeled and fanned out concurrently
  parent_concurrency: 4

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 16

  # Print progress metrics during processing
  enable_metrics: true
  metrics_interval_secs: 10

  # Save final metrics as JSON
  # metrics_output_path: "/tmp/scatter-gather-metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
