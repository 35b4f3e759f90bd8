//! Resource-aware admission control.
//!
//! Every stage declares a [`ResourceClass`] and a per-unit [`Footprint`].
//! The scheduler keeps one semaphore per class; a unit may only begin a stage
//! once its class has headroom. Classes are independent, so a heavy backlog
//! never blocks light work.

use crate::error::{ResourceRejection, SchedulerError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// Scheduling bucket for stages of similar cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Light,
    Medium,
    Heavy,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] = [ResourceClass::Light, ResourceClass::Medium, ResourceClass::Heavy];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Light => "light",
            ResourceClass::Medium => "medium",
            ResourceClass::Heavy => "heavy",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimated per-unit resource use of a stage, or a class ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    /// CPU cores
    pub cpus: u32,

    /// Memory in GB
    pub memory_gb: f64,
}

impl Footprint {
    pub const ZERO: Footprint = Footprint { cpus: 0, memory_gb: 0.0 };

    pub fn new(cpus: u32, memory_gb: f64) -> Self {
        Self { cpus, memory_gb }
    }

    /// True if this footprint fits inside `limit` on every axis.
    pub fn fits_within(&self, limit: &Footprint) -> bool {
        self.cpus <= limit.cpus && self.memory_gb <= limit.memory_gb
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cpu / {:.1} GB", self.cpus, self.memory_gb)
    }
}

/// Concurrency budget and per-unit ceiling of one resource class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassBudget {
    /// Maximum units of this class running at once
    pub max_concurrent: usize,

    /// Largest CPU request a single unit may make
    pub max_cpus: u32,

    /// Largest memory request (GB) a single unit may make
    pub max_memory_gb: f64,
}

impl ClassBudget {
    pub fn limit(&self) -> Footprint {
        Footprint::new(self.max_cpus, self.max_memory_gb)
    }
}

/// Run-wide cancellation signal.
///
/// Cloning shares the signal; cancelling any clone cancels all of them.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the run has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

struct ClassSlot {
    class: ResourceClass,
    budget: ClassBudget,
    semaphore: Arc<Semaphore>,
    running: AtomicUsize,
    peak: AtomicUsize,
    admitted: AtomicU64,
}

/// Held while a unit runs a stage; releases the class slot on drop.
pub struct ClassPermit {
    slot: Arc<ClassSlot>,
    _permit: OwnedSemaphorePermit,
}

impl ClassPermit {
    pub fn class(&self) -> ResourceClass {
        self.slot.class
    }
}

impl Drop for ClassPermit {
    fn drop(&mut self) {
        self.slot.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Admission control in front of the stage executor.
pub struct ResourceScheduler {
    slots: HashMap<ResourceClass, Arc<ClassSlot>>,
    host: Footprint,
    cancel: Cancellation,
}

impl ResourceScheduler {
    /// Build a scheduler from the resource profile, validating every class
    /// ceiling against host capacity.
    pub fn new(
        classes: &BTreeMap<ResourceClass, ClassBudget>,
        host: Footprint,
    ) -> Result<Self, SchedulerError> {
        let mut slots = HashMap::with_capacity(classes.len());

        for (class, budget) in classes {
            if budget.max_concurrent == 0 {
                return Err(SchedulerError::ZeroBudget(*class));
            }
            if !budget.limit().fits_within(&host) {
                return Err(SchedulerError::ExceedsHost {
                    class: *class,
                    limit: budget.limit(),
                    host,
                });
            }

            slots.insert(
                *class,
                Arc::new(ClassSlot {
                    class: *class,
                    budget: budget.clone(),
                    semaphore: Arc::new(Semaphore::new(budget.max_concurrent)),
                    running: AtomicUsize::new(0),
                    peak: AtomicUsize::new(0),
                    admitted: AtomicU64::new(0),
                }),
            );
        }

        Ok(Self {
            slots,
            host,
            cancel: Cancellation::new(),
        })
    }

    /// Fail unless `class` is configured.
    pub fn require_class(&self, class: ResourceClass) -> Result<(), SchedulerError> {
        if self.slots.contains_key(&class) {
            Ok(())
        } else {
            Err(SchedulerError::UnknownClass(class))
        }
    }

    /// Submission-time check of a stage's footprint against its class ceiling.
    pub fn admit(
        &self,
        stage: &str,
        class: ResourceClass,
        footprint: Footprint,
    ) -> Result<(), ResourceRejection> {
        let limit = self
            .slots
            .get(&class)
            .map(|slot| slot.budget.limit())
            .unwrap_or(Footprint::ZERO);

        if footprint.fits_within(&limit) {
            Ok(())
        } else {
            Err(ResourceRejection {
                stage: stage.to_string(),
                class,
                requested: footprint,
                limit,
            })
        }
    }

    /// Wait for headroom in `class`.
    ///
    /// Returns `None` if the run was cancelled (or the class is unknown).
    pub async fn acquire(&self, class: ResourceClass) -> Option<ClassPermit> {
        let slot = self.slots.get(&class)?.clone();

        let permit = tokio::select! {
            permit = slot.semaphore.clone().acquire_owned() => permit.ok()?,
            _ = self.cancel.cancelled() => return None,
        };

        let now = slot.running.fetch_add(1, Ordering::AcqRel) + 1;
        slot.peak.fetch_max(now, Ordering::AcqRel);
        slot.admitted.fetch_add(1, Ordering::Relaxed);

        Some(ClassPermit {
            slot,
            _permit: permit,
        })
    }

    /// Cancel everything scheduled under this scheduler.
    pub fn cancel(&self) {
        tracing::warn!("Cancelling run: closing all resource classes");
        self.cancel.cancel();
        for slot in self.slots.values() {
            slot.semaphore.close();
        }
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Units of `class` running right now.
    pub fn running(&self, class: ResourceClass) -> usize {
        self.slots
            .get(&class)
            .map_or(0, |slot| slot.running.load(Ordering::Acquire))
    }

    /// Highest concurrent count observed for `class`.
    pub fn peak(&self, class: ResourceClass) -> usize {
        self.slots
            .get(&class)
            .map_or(0, |slot| slot.peak.load(Ordering::Acquire))
    }

    pub fn budget(&self, class: ResourceClass) -> Option<&ClassBudget> {
        self.slots.get(&class).map(|slot| &slot.budget)
    }

    pub fn host(&self) -> Footprint {
        self.host
    }

    /// Per-class usage summary.
    pub fn stats(&self) -> SchedulerStats {
        let mut classes: Vec<ClassStats> = self
            .slots
            .values()
            .map(|slot| ClassStats {
                class: slot.class,
                max_concurrent: slot.budget.max_concurrent,
                peak: slot.peak.load(Ordering::Acquire),
                admitted: slot.admitted.load(Ordering::Relaxed),
            })
            .collect();
        classes.sort_by_key(|c| c.class);

        SchedulerStats {
            host: self.host,
            classes,
        }
    }
}

/// Usage of one class over a run.
#[derive(Debug, Clone, Serialize)]
pub struct ClassStats {
    pub class: ResourceClass,
    pub max_concurrent: usize,
    pub peak: usize,
    pub admitted: u64,
}

/// Usage of every configured class.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub host: Footprint,
    pub classes: Vec<ClassStats>,
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Host: {}", self.host)?;
        for c in &self.classes {
            write!(
                f,
                " | {}: peak {}/{}, admitted {}",
                c.class, c.peak, c.max_concurrent, c.admitted
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn profile(light: usize, heavy: usize) -> BTreeMap<ResourceClass, ClassBudget> {
        let mut classes = BTreeMap::new();
        classes.insert(
            ResourceClass::Light,
            ClassBudget {
                max_concurrent: light,
                max_cpus: 1,
                max_memory_gb: 2.0,
            },
        );
        classes.insert(
            ResourceClass::Heavy,
            ClassBudget {
                max_concurrent: heavy,
                max_cpus: 8,
                max_memory_gb: 32.0,
            },
        );
        classes
    }

    fn host() -> Footprint {
        Footprint::new(16, 64.0)
    }

    #[test]
    fn test_rejects_class_larger_than_host() {
        let result = ResourceScheduler::new(&profile(2, 1), Footprint::new(4, 64.0));
        assert!(matches!(
            result,
            Err(SchedulerError::ExceedsHost { class: ResourceClass::Heavy, .. })
        ));
    }

    #[test]
    fn test_rejects_zero_budget() {
        let result = ResourceScheduler::new(&profile(0, 1), host());
        assert_eq!(result.err(), Some(SchedulerError::ZeroBudget(ResourceClass::Light)));
    }

    #[test]
    fn test_admit_checks_ceiling() {
        let scheduler = ResourceScheduler::new(&profile(2, 1), host()).unwrap();

        assert!(scheduler
            .admit("kmer", ResourceClass::Light, Footprint::new(1, 1.5))
            .is_ok());

        let err = scheduler
            .admit("polish", ResourceClass::Light, Footprint::new(4, 1.0))
            .unwrap_err();
        assert_eq!(err.limit, Footprint::new(1, 2.0));

        // Unconfigured class admits nothing
        assert!(scheduler
            .admit("x", ResourceClass::Medium, Footprint::new(1, 0.5))
            .is_err());
        assert!(scheduler.require_class(ResourceClass::Medium).is_err());
    }

    #[tokio::test]
    async fn test_peak_never_exceeds_budget() {
        let scheduler = Arc::new(ResourceScheduler::new(&profile(3, 1), host()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let _permit = scheduler.acquire(ResourceClass::Light).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(scheduler.peak(ResourceClass::Light), 3);
        assert_eq!(scheduler.running(ResourceClass::Light), 0);
        assert_eq!(scheduler.stats().classes[0].admitted, 20);
    }

    #[tokio::test]
    async fn test_classes_are_independent() {
        let scheduler = ResourceScheduler::new(&profile(2, 1), host()).unwrap();

        let _heavy = scheduler.acquire(ResourceClass::Heavy).await.unwrap();
        // Heavy is saturated; light must still be admitted immediately.
        let light = tokio::time::timeout(
            Duration::from_millis(100),
            scheduler.acquire(ResourceClass::Light),
        )
        .await;
        assert!(matches!(light, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_cancel_releases_waiters() {
        let scheduler = Arc::new(ResourceScheduler::new(&profile(1, 1), host()).unwrap());
        let held = scheduler.acquire(ResourceClass::Light).await.unwrap();

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.acquire(ResourceClass::Light).await.is_none() })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.cancel();

        assert!(waiter.await.unwrap());
        assert!(scheduler.is_cancelled());
        drop(held);
    }

    #[tokio::test]
    async fn test_cancellation_signal() {
        let cancel = Cancellation::new();
        let clone = cancel.clone();
        let waiter = tokio::spawn(async move { clone.cancelled().await });
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_stats_display() {
        let scheduler = ResourceScheduler::new(&profile(2, 1), host()).unwrap();
        let display = scheduler.stats().to_string();
        assert!(display.contains("light: peak 0/2"));
        assert!(display.contains("heavy: peak 0/1"));
    }
}
