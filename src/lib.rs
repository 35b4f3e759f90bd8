//! Scatter-Gather
//!
//! Dynamic scatter-gather orchestration for per-sample processing pipelines:
//! each input sample is split into a number of sub-units that is only known
//! at run time, every sub-unit runs through a chain of dependent stages with
//! per-stage fallback, and the results are re-joined per sample in
//! deterministic order.
//!
//! # Architecture
//!
//! - **Unit**: parent/sub-unit identity and immutable payloads
//! - **Tools**: collaborator boundary (labelers, per-unit tools, external commands)
//! - **Pipeline**: resource-aware scheduling, stage execution, fan-out,
//!   per-unit chains, keyed fan-in and run orchestration
//! - **I/O**: sample loading, write-once artifact store and JSON reports over object_store
//!
//! # Usage
//!
//! ```no_run
//! use scatter_gather::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod abundance;
pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod tools;
pub mod unit;

pub use config::Config;
pub use error::{AggregationError, GraphError, ResourceRejection, ToolError};
pub use pipeline::{
    KeyedAggregator, Metrics, Pipeline, PipelineConfig, ResourceScheduler, RunOutcome, RunStats,
    Stage, StageExecutor, UnitChain,
};
pub use unit::{ParentKey, Payload, SubKey, Unit, UnitKey};

use anyhow::{Context, Result};
use config::StageConfig;
use io::{ArtifactStore, ReportSink};
use pipeline::{FanOut, LabelingProfile, MetricsReporter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tools::{ColumnLabeler, CommandTool};

/// Build a stage backed by an external command.
pub fn build_stage(name: &str, config: &StageConfig) -> Stage {
    let tool = Arc::new(CommandTool::new(name, config.tool.clone()));
    let mut stage = Stage::new(name, tool)
        .with_class(config.class, config.footprint())
        .with_ports(&config.input, &config.output);
    if let Some(timeout) = config.timeout() {
        stage = stage.with_timeout(timeout);
    }
    for (key, value) in &config.params {
        stage = stage.with_param(key, value);
    }
    stage
}

/// Wire a [`Pipeline`] from configuration.
pub fn build_pipeline(
    config: &Config,
    metrics: Arc<Metrics>,
    artifacts: Option<Arc<ArtifactStore>>,
    sink: Arc<dyn ReportSink>,
) -> Result<Pipeline> {
    let scheduler = ResourceScheduler::new(&config.resources.classes, config.resources.host())?;
    let executor = StageExecutor::new(Arc::new(scheduler), metrics);

    let mut chain = UnitChain::builder(&config.chain_name);
    for name in &config.chain {
        chain = chain.stage(Arc::new(build_stage(name, config.stage(name)?)));
    }
    let chain = chain.build()?;

    let labeling = LabelingProfile {
        class: config.labeling.class,
        footprint: config.labeling.footprint(),
        timeout: config.labeling.timeout_secs.map(Duration::from_secs),
    };

    let mut pipeline = Pipeline::new(
        executor,
        Arc::new(ColumnLabeler::new(&config.input.label_column)),
        chain,
        sink,
        PipelineConfig {
            parent_concurrency: config.processing.parent_concurrency,
            channel_buffer: config.processing.channel_buffer,
        },
    )
    .with_labeling(labeling)
    .with_fanout(FanOut::new(config.fanout.max_sub_units))
    .with_policy(config.aggregation.policy());

    for name in &config.classifiers {
        pipeline = pipeline.with_classifier(Arc::new(build_stage(name, config.stage(name)?)));
    }
    if let Some(artifacts) = artifacts {
        pipeline = pipeline.with_artifacts(artifacts);
    }

    pipeline.validate()?;
    Ok(pipeline)
}

/// Run the full pipeline with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<RunStats> {
    config.validate()?;

    tracing::info!("Starting scatter-gather run");

    let store = io::create_output_store(&config.output)?;
    let prefix = io::get_output_prefix(&config.output).to_string();
    tracing::info!("Writing artifacts and reports to: {}", config.output.path_display());

    let artifacts = Arc::new(ArtifactStore::new(store.clone(), prefix.clone()));
    let sink = Arc::new(io::JsonReportSink::new(store, prefix));

    let parents = io::load_parents(&config.input)
        .await
        .context("loading input samples")?;
    let total_parents = parents.len() as u64;

    let metrics = Metrics::new();
    let pipeline = Arc::new(build_pipeline(&config, metrics.clone(), Some(artifacts), sink)?);

    // Ctrl-C cancels the run; parents still in flight are abandoned
    let interrupt = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted");
                pipeline.cancel();
            }
        })
    };

    // Start metrics reporter if enabled
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter_handle = if config.processing.enable_metrics {
        let reporter = MetricsReporter::new(
            metrics.clone(),
            config.processing.metrics_interval_secs,
            total_parents,
        );
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        drop(shutdown_rx);
        None
    };

    let result = pipeline.run(parents).await;

    // Shutdown metrics reporter
    let _ = shutdown_tx.send(()).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }
    interrupt.abort();

    if config.processing.enable_metrics {
        let reporter = MetricsReporter::new(
            metrics.clone(),
            config.processing.metrics_interval_secs,
            total_parents,
        );
        reporter.print_summary();

        if let Some(ref path) = config.processing.metrics_output_path {
            if let Err(e) = metrics.snapshot().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }
    }

    let outcome = result?;
    tracing::info!("Pipeline complete: {}", outcome.stats);
    Ok(outcome.stats)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
