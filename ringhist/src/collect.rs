//! Periodic metrics collection.
//!
//! The [`Scheduler`] drives ingestion. Every collection period it:
//!
//! 1. asks the [`Readiness`] signal whether the backing store is usable and
//!    skips the cycle if not
//! 2. requests a snapshot from the [`MetricSource`] for each configured group,
//!    in order
//! 3. opens or creates the series of every returned registry and submits one
//!    sample with the values present in the snapshot
//!
//! Failures are isolated: a failing group or registry is logged and skipped,
//! and a failed cycle never stops the next one. Missed periods are skipped,
//! not replayed.
//!
//! # Cancellation
//!
//! A [`CancellationToken`] is checked before the readiness check, between
//! the readiness check and collection, and between groups. Each series write
//! is atomic (see [`SeriesStore::sample`]), so stopping mid-cycle never
//! leaves a half-applied sample behind.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ringhist::backend::MemoryBackend;
//! use ringhist::collect::{AlwaysReady, Scheduler, StaticSource};
//! use ringhist::config::CollectorConfig;
//! use ringhist::store::SeriesStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SeriesStore::new(Arc::new(MemoryBackend::new())));
//! let source = Arc::new(StaticSource::default());
//! let scheduler = Scheduler::new(
//!     CollectorConfig::default(),
//!     Arc::clone(&store),
//!     source,
//!     Arc::new(AlwaysReady),
//! );
//!
//! let handle = scheduler.spawn();
//! // ...
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CollectorConfig, GroupConfig};
use crate::error::{CollectError, Result};
use crate::schema::SeriesDefinition;
use crate::store::SeriesStore;

/// Metric values of one registry, keyed by metric name.
pub type RegistryValues = BTreeMap<String, f64>;

/// Snapshot of one group: registry name to metric values.
pub type Snapshot = BTreeMap<String, RegistryValues>;

/// Produces metric snapshots on demand.
pub trait MetricSource: Send + Sync {
    /// Returns the current values of `counters` and `gauges` for every
    /// registry in `group`. Metrics a registry does not have are omitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be produced; the scheduler
    /// logs it and moves on to the next group.
    fn snapshot(&self, group: &str, counters: &[String], gauges: &[String]) -> Result<Snapshot>;
}

/// Tells whether the backing store can accept writes.
pub trait Readiness: Send + Sync {
    /// Returns `true` if the backing store exists and has at least one active
    /// replica.
    ///
    /// # Errors
    ///
    /// An error is treated as "not ready".
    fn is_ready(&self) -> Result<bool>;
}

/// Source of the current time in epoch seconds.
pub trait Clock: Send + Sync {
    /// Current epoch seconds.
    fn now(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

/// Readiness signal for local backends, which are always usable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl Readiness for AlwaysReady {
    fn is_ready(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Metric source serving values pushed into it.
///
/// Useful for embedding (the host process publishes its own gauges) and for
/// tests.
#[derive(Debug, Default)]
pub struct StaticSource {
    groups: Mutex<BTreeMap<String, Snapshot>>,
}

impl StaticSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value of `metric` in `registry` of `group`.
    pub fn set(&self, group: &str, registry: &str, metric: &str, value: f64) {
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .entry(registry.to_string())
            .or_default()
            .insert(metric.to_string(), value);
    }

    /// Removes `metric` from `registry` of `group`.
    pub fn remove(&self, group: &str, registry: &str, metric: &str) {
        if let Some(registry) = self
            .groups
            .lock()
            .get_mut(group)
            .and_then(|snapshot| snapshot.get_mut(registry))
        {
            registry.remove(metric);
        }
    }
}

impl MetricSource for StaticSource {
    fn snapshot(&self, group: &str, counters: &[String], gauges: &[String]) -> Result<Snapshot> {
        let groups = self.groups.lock();
        let Some(snapshot) = groups.get(group) else {
            return Ok(Snapshot::new());
        };
        Ok(snapshot
            .iter()
            .map(|(registry, values)| {
                let values = values
                    .iter()
                    .filter(|(metric, _)| counters.contains(metric) || gauges.contains(metric))
                    .map(|(metric, &value)| (metric.clone(), value))
                    .collect();
                (registry.clone(), values)
            })
            .collect())
    }
}

/// Scheduler state between and during cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// The backing store was not ready at the last check.
    WaitingForBackend,
    /// A cycle is collecting.
    Collecting,
    /// The last cycle finished collecting.
    Idle,
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Timestamp the cycle sampled at.
    pub timestamp: u64,
    /// Whether the backing store was ready.
    pub ready: bool,
    /// Groups whose snapshot was processed.
    pub groups: usize,
    /// Samples committed.
    pub samples: usize,
    /// Registries skipped because none of their metrics were present.
    pub empty: usize,
    /// Samples rejected as stale.
    pub stale: usize,
    /// Groups or registries that failed.
    pub failures: usize,
    /// Whether the cycle was cut short by cancellation.
    pub cancelled: bool,
}

/// Periodic collector feeding a [`SeriesStore`].
pub struct Scheduler {
    config: CollectorConfig,
    period: Duration,
    store: Arc<SeriesStore>,
    source: Arc<dyn MetricSource>,
    readiness: Arc<dyn Readiness>,
    clock: Arc<dyn Clock>,
    state: SchedulerState,
    /// Armed while ready; a not-ready condition is logged only when armed.
    log_not_ready: bool,
    not_ready_transitions: u64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("period", &self.period)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler using the wall clock and the configured period.
    pub fn new(
        config: CollectorConfig,
        store: Arc<SeriesStore>,
        source: Arc<dyn MetricSource>,
        readiness: Arc<dyn Readiness>,
    ) -> Self {
        Self {
            period: config.period(),
            config,
            store,
            source,
            readiness,
            clock: Arc::new(SystemClock),
            state: SchedulerState::WaitingForBackend,
            log_not_ready: true,
            not_ready_transitions: 0,
        }
    }

    /// Replaces the clock used for sample timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the tick period of [`run`](Self::run). The base step of new
    /// series still follows the configured collect period.
    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Returns how many times the scheduler went from ready (or start) to not
    /// ready.
    pub fn not_ready_transitions(&self) -> u64 {
        self.not_ready_transitions
    }

    /// Runs one collection cycle.
    pub fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleReport {
        let now = self.clock.now();
        let mut report = CycleReport {
            timestamp: now,
            ..CycleReport::default()
        };
        if cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        self.state = SchedulerState::WaitingForBackend;
        if !self.check_ready() {
            return report;
        }
        report.ready = true;
        if cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        self.state = SchedulerState::Collecting;
        debug!(timestamp = now, "collecting metrics");
        for group in &self.config.groups {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.collect_group(group, now, &mut report);
        }

        if let Err(e) = self.store.sync_if_due(now) {
            warn!(error = %e, "write-back sync failed, will retry");
        }
        self.state = SchedulerState::Idle;
        debug!(
            samples = report.samples,
            empty = report.empty,
            stale = report.stale,
            failures = report.failures,
            "collection cycle finished"
        );
        report
    }

    fn check_ready(&mut self) -> bool {
        let reason = match self.readiness.is_ready() {
            Ok(true) => {
                if !self.log_not_ready {
                    info!("backing store ready, resuming metrics collection");
                }
                self.log_not_ready = true;
                return true;
            }
            Ok(false) => CollectError::NotReady.to_string(),
            Err(e) => CollectError::Readiness {
                reason: e.to_string(),
            }
            .to_string(),
        };

        if self.log_not_ready {
            warn!(reason = %reason, "skipping metrics collection");
            self.log_not_ready = false;
            self.not_ready_transitions += 1;
        } else {
            debug!(reason = %reason, "backing store still not ready");
        }
        false
    }

    fn collect_group(&self, group: &GroupConfig, now: u64, report: &mut CycleReport) {
        debug!(group = %group.name, "collecting group");
        let snapshot = match self
            .source
            .snapshot(&group.name, &group.counters, &group.gauges)
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(group = %group.name, error = %e, "metric snapshot failed");
                report.failures += 1;
                return;
            }
        };
        report.groups += 1;

        let step = self.config.collect_period;
        for (registry, values) in &snapshot {
            let make_def = || SeriesDefinition::for_collection(&group.counters, &group.gauges, step, now);
            if let Err(e) = self.store.open_or_create(registry, make_def) {
                warn!(series = %registry, error = %e, "failed to open series");
                report.failures += 1;
                continue;
            }

            let sample: Vec<(&str, f64)> = group
                .counters
                .iter()
                .chain(&group.gauges)
                .filter_map(|metric| values.get(metric).map(|&v| (metric.as_str(), v)))
                .collect();
            if sample.is_empty() {
                report.empty += 1;
                continue;
            }

            match self.store.sample(registry, now, sample) {
                Ok(()) => report.samples += 1,
                Err(e) if e.is_stale() => {
                    debug!(series = %registry, error = %e, "dropped stale sample");
                    report.stale += 1;
                }
                Err(e) => {
                    warn!(series = %registry, error = %e, "failed to record sample");
                    report.failures += 1;
                }
            }
        }
    }

    /// Runs cycles every period until `cancel` fires, then flushes a
    /// write-back store.
    ///
    /// The first cycle runs one period after start. Cycles execute on the
    /// blocking pool since backend calls may block.
    ///
    /// # Errors
    ///
    /// Returns [`CollectError::Task`] if a cycle panics, or the error of the
    /// final flush.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        info!(period = ?self.period, groups = self.config.groups.len(), "metrics collection started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let token = cancel.clone();
                    let (scheduler, report) = tokio::task::spawn_blocking(move || {
                        let report = self.run_cycle(&token);
                        (self, report)
                    })
                    .await
                    .map_err(|e| CollectError::Task { reason: e.to_string() })?;
                    self = scheduler;
                    if report.cancelled {
                        break;
                    }
                }
            }
        }

        let store = Arc::clone(&self.store);
        let synced = tokio::task::spawn_blocking(move || store.sync())
            .await
            .map_err(|e| CollectError::Task { reason: e.to_string() })??;
        info!(synced, "metrics collection stopped");
        Ok(())
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self) -> CollectorHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        CollectorHandle { cancel, task }
    }
}

/// Handle to a spawned scheduler.
#[derive(Debug)]
pub struct CollectorHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl CollectorHandle {
    /// Stops the scheduler and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns the error the scheduler finished with.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| CollectError::Task { reason: e.to_string() })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    const T0: u64 = 1_700_006_400;

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn advance(&self, secs: u64) {
            self.0.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Switch(AtomicBool);

    impl Readiness for Switch {
        fn is_ready(&self) -> Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    struct FailingSource;

    impl MetricSource for FailingSource {
        fn snapshot(&self, group: &str, _: &[String], _: &[String]) -> Result<Snapshot> {
            Err(CollectError::Source {
                group: group.to_string(),
                reason: "boom".to_string(),
            }
            .into())
        }
    }

    fn setup(
        ready: bool,
    ) -> (
        Arc<SeriesStore>,
        Arc<StaticSource>,
        Arc<Switch>,
        Arc<ManualClock>,
        Scheduler,
    ) {
        let store = Arc::new(SeriesStore::new(Arc::new(MemoryBackend::new())));
        let source = Arc::new(StaticSource::new());
        let readiness = Arc::new(Switch(AtomicBool::new(ready)));
        let clock = Arc::new(ManualClock(AtomicU64::new(T0)));
        let scheduler = Scheduler::new(
            CollectorConfig::default(),
            Arc::clone(&store),
            source.clone(),
            readiness.clone(),
        )
        .with_clock(clock.clone());
        (store, source, readiness, clock, scheduler)
    }

    #[test]
    fn test_cycle_creates_and_samples() {
        let (store, source, _, _, mut scheduler) = setup(true);
        source.set("jvm", "solr.jvm", "memory.heap.used", 512.0);
        source.set("jvm", "solr.jvm", "not.configured", 1.0);
        source.set("core", "solr.core.main", "INDEX.sizeInBytes", 2048.0);

        let report = scheduler.run_cycle(&CancellationToken::new());
        assert!(report.ready);
        assert_eq!(report.groups, 3);
        assert_eq!(report.samples, 2);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let jvm = store.open("solr.jvm").unwrap();
        assert_eq!(jvm.last_update(), T0);
        assert_eq!(jvm.definition().step, 60);
        assert_eq!(jvm.definition().start_time, T0 - 60);
        assert_eq!(
            jvm.definition().datasource_names(),
            vec!["memory.heap.used", "os.processCpuLoad", "os.systemLoadAverage"]
        );
        assert_eq!(jvm.last_values()[0].1, Some(512.0));
        assert_eq!(jvm.last_values()[1].1, None);

        let core = store.open("solr.core.main").unwrap();
        assert_eq!(core.definition().datasources.len(), 3);
    }

    #[test]
    fn test_registry_without_values_is_created_but_not_sampled() {
        let (store, source, _, _, mut scheduler) = setup(true);
        source.set("jvm", "solr.jvm", "unrelated", 1.0);

        let report = scheduler.run_cycle(&CancellationToken::new());
        assert_eq!(report.samples, 0);
        assert_eq!(report.empty, 1);
        assert_eq!(store.last_update("solr.jvm").unwrap(), T0 - 60);
    }

    #[test]
    fn test_not_ready_logged_once_per_transition() {
        let (store, source, readiness, clock, mut scheduler) = setup(false);
        source.set("jvm", "solr.jvm", "memory.heap.used", 1.0);
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let report = scheduler.run_cycle(&cancel);
            assert!(!report.ready);
            assert_eq!(scheduler.state(), SchedulerState::WaitingForBackend);
            clock.advance(60);
        }
        assert_eq!(scheduler.not_ready_transitions(), 1);
        assert!(store.list(10).unwrap().is_empty());

        readiness.0.store(true, Ordering::SeqCst);
        let report = scheduler.run_cycle(&cancel);
        assert_eq!(report.samples, 1);
        // Only the current timestamp was sampled; missed cycles are not replayed
        let series = store.open("solr.jvm").unwrap();
        assert_eq!(series.last_update(), T0 + 300);
        assert_eq!(series.definition().start_time, T0 + 240);

        readiness.0.store(false, Ordering::SeqCst);
        clock.advance(60);
        scheduler.run_cycle(&cancel);
        assert_eq!(scheduler.not_ready_transitions(), 2);
    }

    #[test]
    fn test_readiness_error_is_not_ready() {
        struct Broken;
        impl Readiness for Broken {
            fn is_ready(&self) -> Result<bool> {
                Err(CollectError::Readiness {
                    reason: "cluster state unavailable".to_string(),
                }
                .into())
            }
        }

        let store = Arc::new(SeriesStore::new(Arc::new(MemoryBackend::new())));
        let mut scheduler = Scheduler::new(
            CollectorConfig::default(),
            store,
            Arc::new(StaticSource::new()),
            Arc::new(Broken),
        );
        let report = scheduler.run_cycle(&CancellationToken::new());
        assert!(!report.ready);
        assert_eq!(scheduler.not_ready_transitions(), 1);
    }

    #[test]
    fn test_failing_group_does_not_abort_cycle() {
        let store = Arc::new(SeriesStore::new(Arc::new(MemoryBackend::new())));
        let mut scheduler = Scheduler::new(
            CollectorConfig::default(),
            store,
            Arc::new(FailingSource),
            Arc::new(AlwaysReady),
        );
        let report = scheduler.run_cycle(&CancellationToken::new());
        assert_eq!(report.failures, 3);
        assert_eq!(report.groups, 0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_same_second_cycle_is_stale() {
        let (_, source, _, _, mut scheduler) = setup(true);
        source.set("jvm", "solr.jvm", "memory.heap.used", 1.0);
        let cancel = CancellationToken::new();
        assert_eq!(scheduler.run_cycle(&cancel).samples, 1);
        let report = scheduler.run_cycle(&cancel);
        assert_eq!(report.samples, 0);
        assert_eq!(report.stale, 1);
        assert_eq!(report.failures, 0);
    }

    #[test]
    fn test_cancelled_cycle_does_nothing() {
        let (store, source, _, _, mut scheduler) = setup(true);
        source.set("jvm", "solr.jvm", "memory.heap.used", 1.0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = scheduler.run_cycle(&cancel);
        assert!(report.cancelled);
        assert!(store.list(10).unwrap().is_empty());
    }

    #[test]
    fn test_static_source_filters_metrics() {
        let source = StaticSource::new();
        source.set("core", "solr.core.a", "INDEX.sizeInBytes", 1.0);
        source.set("core", "solr.core.a", "other", 2.0);
        source.remove("core", "solr.core.a", "INDEX.sizeInBytes");
        source.set("core", "solr.core.b", "INDEX.sizeInBytes", 3.0);

        let snapshot = source
            .snapshot("core", &[], &["INDEX.sizeInBytes".to_string()])
            .unwrap();
        assert!(snapshot["solr.core.a"].is_empty());
        assert_eq!(snapshot["solr.core.b"]["INDEX.sizeInBytes"], 3.0);
        assert!(source.snapshot("jvm", &[], &[]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let (store, source, _, clock, scheduler) = setup(true);
        source.set("jvm", "solr.jvm", "memory.heap.used", 1.0);
        // Each cycle needs a fresh timestamp
        struct Ticking(Arc<ManualClock>);
        impl Clock for Ticking {
            fn now(&self) -> u64 {
                self.0.advance(60);
                self.0.now()
            }
        }
        let scheduler = scheduler
            .with_clock(Arc::new(Ticking(clock)))
            .with_period(Duration::from_millis(10));

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await.unwrap();

        let last_update = store.last_update("solr.jvm").unwrap();
        assert!(last_update > T0);
    }

    #[tokio::test]
    async fn test_run_flushes_write_back_on_stop() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(SeriesStore::new(backend.clone()).with_sync_period(3600));
        let source = Arc::new(StaticSource::new());
        source.set("jvm", "solr.jvm", "memory.heap.used", 1.0);
        let clock = Arc::new(ManualClock(AtomicU64::new(T0)));
        let mut scheduler = Scheduler::new(
            CollectorConfig::default(),
            Arc::clone(&store),
            source,
            Arc::new(AlwaysReady),
        )
        .with_clock(clock.clone());

        // First cycle syncs immediately, the second stays dirty
        scheduler.run_cycle(&CancellationToken::new());
        clock.advance(60);
        scheduler.run_cycle(&CancellationToken::new());
        let persisted = crate::codec::decode(&backend.load("solr.jvm").unwrap().unwrap()).unwrap();
        assert_eq!(persisted.last_update(), T0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler.run(cancel).await.unwrap();
        let persisted = crate::codec::decode(&backend.load("solr.jvm").unwrap().unwrap()).unwrap();
        assert_eq!(persisted.last_update(), T0 + 60);
    }
}
