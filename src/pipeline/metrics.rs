//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Parent units loaded from input
    pub parents_loaded: AtomicU64,

    /// Parent aggregates emitted
    pub parents_aggregated: AtomicU64,

    /// Child units created by fan-out
    pub children_created: AtomicU64,

    /// Child units whose chain succeeded cleanly
    pub units_succeeded: AtomicU64,

    /// Child units that completed with a fallback artifact
    pub units_degraded: AtomicU64,

    /// Child units whose chain failed
    pub units_failed: AtomicU64,

    /// Tool invocations admitted by the scheduler
    pub stage_invocations: AtomicU64,

    /// Invocations that ended fatally (including timeouts and cancellation)
    pub stage_failures: AtomicU64,

    /// Invocations that ended recoverably
    pub stage_fallbacks: AtomicU64,

    /// Stages rejected at submission for exceeding their class ceiling
    pub rejections: AtomicU64,

    /// Parents dropped by an aggregation error
    pub aggregation_errors: AtomicU64,

    /// Bytes written to the artifact store
    pub bytes_stored: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    /// Time spent in the labeling collaborator (microseconds)
    pub labeling_us: AtomicU64,

    /// Time spent inside stage tools (microseconds)
    pub stage_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_parent_loaded(&self) {
        self.parents_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_parent_aggregated(&self) {
        self.parents_aggregated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record child units created by one fan-out.
    pub fn add_children(&self, count: u64) {
        self.children_created.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_unit_succeeded(&self) {
        self.units_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unit_degraded(&self) {
        self.units_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unit_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_invocation(&self) {
        self.stage_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_failure(&self) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_fallback(&self) {
        self.stage_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_aggregation_error(&self) {
        self.aggregation_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes written to the artifact store.
    pub fn add_bytes_stored(&self, bytes: u64) {
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record time spent labeling (in microseconds).
    pub fn add_labeling_time(&self, duration: Duration) {
        self.labeling_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent inside a stage tool (in microseconds).
    pub fn add_stage_time(&self, duration: Duration) {
        self.stage_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Child units finished (any outcome) per second.
    pub fn units_per_second(&self) -> f64 {
        let units = self.units_succeeded.load(Ordering::Relaxed)
            + self.units_degraded.load(Ordering::Relaxed)
            + self.units_failed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            units as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            parents_loaded: self.parents_loaded.load(Ordering::Relaxed),
            parents_aggregated: self.parents_aggregated.load(Ordering::Relaxed),
            children_created: self.children_created.load(Ordering::Relaxed),
            units_succeeded: self.units_succeeded.load(Ordering::Relaxed),
            units_degraded: self.units_degraded.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            stage_invocations: self.stage_invocations.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            stage_fallbacks: self.stage_fallbacks.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            aggregation_errors: self.aggregation_errors.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            units_per_second: self.units_per_second(),
            labeling_secs: self.labeling_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            stage_secs: self.stage_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub parents_loaded: u64,
    pub parents_aggregated: u64,
    pub children_created: u64,
    pub units_succeeded: u64,
    pub units_degraded: u64,
    pub units_failed: u64,
    pub stage_invocations: u64,
    pub stage_failures: u64,
    pub stage_fallbacks: u64,
    pub rejections: u64,
    pub aggregation_errors: u64,
    pub bytes_stored: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub units_per_second: f64,
    /// Total time spent labeling (seconds, summed across workers)
    pub labeling_secs: f64,
    /// Total time spent inside stage tools (seconds, summed across workers)
    pub stage_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Child units that reached a terminal outcome.
    pub fn units_finished(&self) -> u64 {
        self.units_succeeded + self.units_degraded + self.units_failed
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parents: {}/{} aggregated, {} errors | Units: {} created, {} ok, {} degraded, {} failed | \
             Stages: {} runs, {} fallbacks, {} failures, {} rejected | \
             Rate: {:.1} units/s | Stored: {:.2} MB | Elapsed: {:.1}s",
            self.parents_aggregated,
            self.parents_loaded,
            self.aggregation_errors,
            self.children_created,
            self.units_succeeded,
            self.units_degraded,
            self.units_failed,
            self.stage_invocations,
            self.stage_fallbacks,
            self.stage_failures,
            self.rejections,
            self.units_per_second,
            self.bytes_stored as f64 / (1024.0 * 1024.0),
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_parents: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_parents: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_parents,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_parents > 0 {
                        (snapshot.parents_aggregated + snapshot.aggregation_errors) as f64
                            / self.total_parents as f64
                            * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Run Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Parents loaded: {}", snapshot.parents_loaded);
        println!("Parents aggregated: {}", snapshot.parents_aggregated);
        println!("Aggregation errors: {}", snapshot.aggregation_errors);
        println!("Child units: {}", snapshot.children_created);
        println!(
            "  succeeded {} / degraded {} / failed {}",
            snapshot.units_succeeded, snapshot.units_degraded, snapshot.units_failed
        );
        println!(
            "Stage invocations: {} ({} fallbacks, {} failures)",
            snapshot.stage_invocations, snapshot.stage_fallbacks, snapshot.stage_failures
        );
        println!("Resource rejections: {}", snapshot.rejections);
        println!(
            "Artifacts stored: {:.2} MB",
            snapshot.bytes_stored as f64 / (1024.0 * 1024.0)
        );

        let total = snapshot.labeling_secs + snapshot.stage_secs;
        if total > 0.0 {
            println!("\n--- Time Breakdown ---");
            println!(
                "Labeling:  {:>7.1}s ({:>5.1}%)",
                snapshot.labeling_secs,
                snapshot.labeling_secs / total * 100.0
            );
            println!(
                "Stages:    {:>7.1}s ({:>5.1}%)",
                snapshot.stage_secs,
                snapshot.stage_secs / total * 100.0
            );
        }
        println!("===================\n");
    }
}
