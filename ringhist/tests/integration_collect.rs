//! Integration tests for the collection scheduler.
//!
//! Drives the scheduler both cycle by cycle and as a spawned task, checking
//! the readiness gate, cancellation and what ends up in the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ringhist::backend::{Backend, MemoryBackend};
use ringhist::collect::{Clock, MetricSource, Readiness, Scheduler, SchedulerState, StaticSource};
use ringhist::config::{CollectorConfig, GroupConfig};
use ringhist::query;
use ringhist::store::SeriesStore;
use tokio_util::sync::CancellationToken;

const T0: u64 = 1_700_006_400;

/// Clock that moves one collect period forward on every read.
struct SteppingClock(AtomicU64);

impl Clock for SteppingClock {
    fn now(&self) -> u64 {
        self.0.fetch_add(60, Ordering::SeqCst)
    }
}

struct Gate(AtomicBool);

impl Readiness for Gate {
    fn is_ready(&self) -> ringhist::Result<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

fn config() -> CollectorConfig {
    CollectorConfig {
        groups: vec![
            GroupConfig::new("jvm", &[], &["memory.heap.used"]),
            GroupConfig::new("core", &["QUERY./select.requests"], &[]),
        ],
        ..CollectorConfig::default()
    }
}

fn source() -> Arc<StaticSource> {
    let source = Arc::new(StaticSource::new());
    source.set("jvm", "solr.jvm", "memory.heap.used", 256.0);
    source.set("core", "solr.core.main", "QUERY./select.requests", 0.0);
    source
}

#[test]
fn test_not_ready_cycles_write_nothing() {
    let store = Arc::new(SeriesStore::new(Arc::new(MemoryBackend::new())));
    let gate = Arc::new(Gate(AtomicBool::new(false)));
    let mut scheduler = Scheduler::new(config(), Arc::clone(&store), source(), gate.clone())
        .with_clock(Arc::new(SteppingClock(AtomicU64::new(T0))));
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let report = scheduler.run_cycle(&cancel);
        assert!(!report.ready);
        assert_eq!(report.samples, 0);
        assert_eq!(scheduler.state(), SchedulerState::WaitingForBackend);
    }
    assert!(store.list(100).unwrap().is_empty());
    assert_eq!(scheduler.not_ready_transitions(), 1);

    gate.0.store(true, Ordering::SeqCst);
    let report = scheduler.run_cycle(&cancel);
    assert!(report.ready);
    assert_eq!(report.groups, 2);
    assert_eq!(report.samples, 2);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert_eq!(store.list(100).unwrap(), vec!["solr.core.main", "solr.jvm"]);

    // Collected series start one step before their first sample
    let status = query::status(&store, "solr.jvm").unwrap();
    assert_eq!(status.step, 60);
    assert_eq!(status.last_update, T0 + 3 * 60);
    assert_eq!(status.datasources[0].last_value, Some(256.0));
}

#[test]
fn test_counters_become_rates() {
    let store = Arc::new(SeriesStore::new(Arc::new(MemoryBackend::new())));
    let source = source();
    let mut scheduler = Scheduler::new(
        config(),
        Arc::clone(&store),
        source.clone(),
        Arc::new(Gate(AtomicBool::new(true))),
    )
    .with_clock(Arc::new(SteppingClock(AtomicU64::new(T0))));
    let cancel = CancellationToken::new();

    for requests in [0.0, 120.0, 360.0] {
        source.set("core", "solr.core.main", "QUERY./select.requests", requests);
        scheduler.run_cycle(&cancel);
    }

    let data = query::fetch(&store, "solr.core.main", &["QUERY./select.requests"], None).unwrap();
    assert_eq!(data.archives[0].timestamps, vec![T0, T0 + 60, T0 + 120]);
    assert_eq!(
        data.archives[0].datasources[0].values,
        vec![None, Some(2.0), Some(4.0)]
    );
}

#[test]
fn test_cancelled_before_cycle_writes_nothing() {
    let store = Arc::new(SeriesStore::new(Arc::new(MemoryBackend::new())));
    let mut scheduler = Scheduler::new(
        config(),
        Arc::clone(&store),
        source(),
        Arc::new(Gate(AtomicBool::new(true))),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = scheduler.run_cycle(&cancel);
    assert!(report.cancelled);
    assert!(store.list(100).unwrap().is_empty());
}

#[tokio::test]
async fn test_spawned_scheduler_collects_until_stopped() {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(SeriesStore::new(backend.clone()));
    let scheduler = Scheduler::new(
        config(),
        Arc::clone(&store),
        source(),
        Arc::new(Gate(AtomicBool::new(true))),
    )
    .with_clock(Arc::new(SteppingClock(AtomicU64::new(T0))))
    .with_period(Duration::from_millis(10));

    let handle = scheduler.spawn();
    let mut waited = 0;
    while !backend.exists("solr.jvm").unwrap() && waited < 500 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    handle.stop().await.unwrap();

    let last_update = store.last_update("solr.jvm").unwrap();
    assert!(last_update >= T0);

    // Nothing is written once stopped
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.last_update("solr.jvm").unwrap(), last_update);
}

#[tokio::test]
async fn test_external_token_stops_run() {
    struct Panicking;

    impl MetricSource for Panicking {
        fn snapshot(
            &self,
            _: &str,
            _: &[String],
            _: &[String],
        ) -> ringhist::Result<ringhist::collect::Snapshot> {
            panic!("no cycle should run");
        }
    }

    let store = Arc::new(SeriesStore::new(Arc::new(MemoryBackend::new())));
    let scheduler = Scheduler::new(
        config(),
        store,
        Arc::new(Panicking),
        Arc::new(Gate(AtomicBool::new(true))),
    )
    .with_period(Duration::from_secs(3600));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));
    cancel.cancel();
    task.await.unwrap().unwrap();
}
