use cache_pressure::{
    CacheParticipant, MemoryMonitor, MemorySnapshot, MonitorConfig, ReleaseError, SampleOutcome,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy)]
enum Behavior {
    Clear,
    Fail,
    Panic,
}

struct TestCache {
    name: String,
    behavior: Behavior,
    releases: AtomicUsize,
}

impl TestCache {
    fn new(name: &str) -> Arc<Self> {
        Self::with_behavior(name, Behavior::Clear)
    }

    fn with_behavior(name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            releases: AtomicUsize::new(0),
        })
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl CacheParticipant for TestCache {
    fn release_cache(&self) -> Result<(), ReleaseError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Clear => Ok(()),
            Behavior::Fail => Err(ReleaseError::new("backing store is locked")),
            Behavior::Panic => panic!("{} exploded while clearing", self.name),
        }
    }

    fn request_detach(&self) {}

    fn name(&self) -> &str {
        &self.name
    }
}

/// A memory source whose reading the test controls.
#[derive(Clone)]
struct FakeUsage(Arc<Mutex<Option<MemorySnapshot>>>);

impl FakeUsage {
    fn new(used: u64, total: u64) -> Self {
        Self(Arc::new(Mutex::new(Some(MemorySnapshot::new(used, total)))))
    }

    fn unavailable() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    fn set(&self, used: u64, total: u64) {
        *self.0.lock() = Some(MemorySnapshot::new(used, total));
    }
}

fn monitor_with(usage: &FakeUsage, config: MonitorConfig) -> MemoryMonitor {
    let usage = usage.clone();
    MemoryMonitor::with_source(config, Arc::new(move || *usage.0.lock())).unwrap()
}

/// A monitor whose background sampler is stopped, for driving cycles by hand.
fn manual_monitor(usage: &FakeUsage) -> MemoryMonitor {
    let monitor = monitor_with(usage, MonitorConfig::default());
    monitor.stop_sampling();
    monitor
}

#[test]
fn usage_above_threshold_clears_every_participant() {
    let usage = FakeUsage::new(900, 1_000);
    let monitor = manual_monitor(&usage);
    let caches = [TestCache::new("a"), TestCache::new("b"), TestCache::new("c")];
    for cache in &caches {
        assert!(monitor.register(cache));
    }

    let outcome = monitor.check_memory_usage_once();

    assert_eq!(
        outcome,
        SampleOutcome::Broadcast {
            snapshot: MemorySnapshot::new(900, 1_000),
            ratio: 0.9,
            notified: 3,
            failed: 0,
        }
    );
    for cache in &caches {
        assert_eq!(cache.releases(), 1);
    }
}

#[test]
fn usage_at_or_below_threshold_clears_nothing() {
    let usage = FakeUsage::new(700, 1_000);
    let monitor = manual_monitor(&usage);
    let cache = TestCache::new("a");
    monitor.register(&cache);

    assert!(matches!(
        monitor.check_memory_usage_once(),
        SampleOutcome::BelowThreshold { .. }
    ));

    // The threshold must be strictly exceeded.
    usage.set(800, 1_000);
    assert!(!monitor.check_memory_usage_once().is_broadcast());

    assert_eq!(cache.releases(), 0);
    assert_eq!(monitor.stats().broadcasts, 0);
}

#[test]
fn unavailable_introspection_is_skipped_quietly() {
    let usage = FakeUsage::unavailable();
    let monitor = manual_monitor(&usage);
    let cache = TestCache::new("a");
    monitor.register(&cache);

    assert_eq!(monitor.check_memory_usage_once(), SampleOutcome::Unavailable);
    assert_eq!(monitor.check_memory_usage_once(), SampleOutcome::Unavailable);

    usage.set(10, 0);
    assert_eq!(monitor.check_memory_usage_once(), SampleOutcome::Unavailable);

    assert_eq!(cache.releases(), 0);
    let stats = monitor.stats();
    assert_eq!(stats.cycles, 3);
    assert_eq!(stats.unavailable_samples, 3);
}

#[test]
fn duplicate_registration_is_a_no_op() {
    let usage = FakeUsage::new(950, 1_000);
    let monitor = manual_monitor(&usage);
    let cache = TestCache::new("a");

    assert!(monitor.register(&cache));
    assert!(!monitor.register(&cache));
    assert_eq!(monitor.participant_count(), 1);

    monitor.check_memory_usage_once();
    assert_eq!(cache.releases(), 1);
}

#[test]
fn deregistered_participants_are_not_cleared() {
    let usage = FakeUsage::new(950, 1_000);
    let monitor = manual_monitor(&usage);
    let kept = TestCache::new("kept");
    let removed = TestCache::new("removed");
    monitor.register(&kept);
    monitor.register(&removed);

    assert!(monitor.deregister(&*removed));
    assert!(!monitor.deregister(&*removed));
    assert!(!monitor.deregister(&*TestCache::new("stranger")));

    monitor.check_memory_usage_once();
    assert_eq!(kept.releases(), 1);
    assert_eq!(removed.releases(), 0);
}

#[test]
fn failing_participants_do_not_stop_the_broadcast() {
    let usage = FakeUsage::new(950, 1_000);
    let monitor = manual_monitor(&usage);
    let healthy = TestCache::new("healthy");
    let failing = TestCache::with_behavior("failing", Behavior::Fail);
    let panicking = TestCache::with_behavior("panicking", Behavior::Panic);
    monitor.register(&failing);
    monitor.register(&panicking);
    monitor.register(&healthy);

    let outcome = monitor.check_memory_usage_once();

    assert!(matches!(
        outcome,
        SampleOutcome::Broadcast {
            notified: 3,
            failed: 2,
            ..
        }
    ));
    assert_eq!(healthy.releases(), 1);
    assert_eq!(failing.releases(), 1);
    assert_eq!(panicking.releases(), 1);

    // The monitor keeps working after a participant panicked.
    monitor.check_memory_usage_once();
    assert_eq!(healthy.releases(), 2);
    let stats = monitor.stats();
    assert_eq!(stats.release_calls, 6);
    assert_eq!(stats.release_failures, 4);
}

/// Detaches itself through the monitor it was registered with.
struct SelfDetaching {
    monitor: MemoryMonitor,
    releases: AtomicUsize,
}

impl CacheParticipant for SelfDetaching {
    fn release_cache(&self) -> Result<(), ReleaseError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        // One-shot cache: nothing left to release after the first call.
        self.request_detach();
        Ok(())
    }

    fn request_detach(&self) {
        self.monitor.deregister(self);
    }
}

#[test]
fn participant_can_detach_from_inside_release() {
    let usage = FakeUsage::new(950, 1_000);
    let monitor = manual_monitor(&usage);
    let participant = Arc::new(SelfDetaching {
        monitor: monitor.clone(),
        releases: AtomicUsize::new(0),
    });
    monitor.register(&participant);

    monitor.check_memory_usage_once();
    monitor.check_memory_usage_once();

    assert_eq!(participant.releases.load(Ordering::SeqCst), 1);
    assert!(!monitor.is_registered(&*participant));
}

#[test]
fn request_detach_removes_participant() {
    let usage = FakeUsage::new(950, 1_000);
    let monitor = manual_monitor(&usage);
    let participant = Arc::new(SelfDetaching {
        monitor: monitor.clone(),
        releases: AtomicUsize::new(0),
    });
    monitor.register(&participant);

    participant.request_detach();
    monitor.check_memory_usage_once();

    assert_eq!(participant.releases.load(Ordering::SeqCst), 0);
    assert_eq!(monitor.participant_count(), 0);
}

#[test]
fn registry_does_not_keep_participants_alive() {
    let usage = FakeUsage::new(950, 1_000);
    let monitor = manual_monitor(&usage);
    let cache = TestCache::new("short-lived");
    let weak = Arc::downgrade(&cache);
    monitor.register(&cache);

    drop(cache);
    assert!(weak.upgrade().is_none());

    let outcome = monitor.check_memory_usage_once();
    assert!(matches!(
        outcome,
        SampleOutcome::Broadcast { notified: 0, .. }
    ));
    assert_eq!(monitor.participant_count(), 0);
}

#[test]
fn invalid_config_is_rejected() {
    let usage = FakeUsage::new(1, 2);
    let result = MemoryMonitor::with_source(
        MonitorConfig {
            sample_interval_ms: 0,
            ..MonitorConfig::default()
        },
        Arc::new(move || *usage.0.lock()),
    );
    assert!(result.is_err());
}

#[test]
fn concurrent_registration_during_broadcasts() {
    let usage = FakeUsage::new(950, 1_000);
    let monitor = manual_monitor(&usage);
    let stable = TestCache::new("stable");
    monitor.register(&stable);

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let monitor = monitor.clone();
            scope.spawn(move || {
                for round in 0..200 {
                    let cache = TestCache::new(&format!("worker-{worker}-{round}"));
                    monitor.register(&cache);
                    monitor.deregister(&*cache);
                }
            });
        }
        for _ in 0..50 {
            monitor.check_memory_usage_once();
        }
    });

    assert_eq!(stable.releases(), 50);
    assert_eq!(monitor.participant_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn sampler_clears_on_each_interval_until_stopped() {
    let usage = FakeUsage::new(950, 1_000);
    let monitor = monitor_with(
        &usage,
        MonitorConfig {
            sample_interval_ms: 1_000,
            ..MonitorConfig::default()
        },
    );
    assert!(monitor.is_sampling());
    let cache = TestCache::new("a");
    monitor.register(&cache);

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(cache.releases(), 3);

    monitor.stop_sampling();
    assert!(!monitor.is_sampling());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(cache.releases(), 3);
    assert_eq!(monitor.stats().cycles, 3);

    // Sampling can be resumed explicitly.
    monitor.start_sampling().unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(cache.releases(), 5);
}

#[tokio::test(start_paused = true)]
async fn sampler_follows_usage_changes() {
    let usage = FakeUsage::new(100, 1_000);
    let monitor = monitor_with(
        &usage,
        MonitorConfig {
            sample_interval_ms: 1_000,
            threshold_ratio: 0.5,
        },
    );
    let cache = TestCache::new("a");
    monitor.register(&cache);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(cache.releases(), 0);

    usage.set(600, 1_000);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(cache.releases(), 1);

    monitor.deregister(&*cache);
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(cache.releases(), 1);
    assert_eq!(monitor.stats().cycles, 8);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_monitor_ends_sampling() {
    let usage = FakeUsage::new(950, 1_000);
    let cache = TestCache::new("a");
    {
        let monitor = monitor_with(
            &usage,
            MonitorConfig {
                sample_interval_ms: 1_000,
                ..MonitorConfig::default()
            },
        );
        monitor.register(&cache);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(cache.releases(), 1);
}

/// Stops the sampler and registers another cache from inside `release_cache`.
struct StopsSampling {
    monitor: MemoryMonitor,
    other: Arc<TestCache>,
    releases: AtomicUsize,
}

impl CacheParticipant for StopsSampling {
    fn release_cache(&self) -> Result<(), ReleaseError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.monitor.stop_sampling();
        self.monitor.register(&self.other);
        Ok(())
    }

    fn request_detach(&self) {
        self.monitor.deregister(self);
    }
}

#[tokio::test(start_paused = true)]
async fn participant_can_stop_sampling_from_inside_release() {
    let usage = FakeUsage::new(950, 1_000);
    let monitor = monitor_with(
        &usage,
        MonitorConfig {
            sample_interval_ms: 1_000,
            ..MonitorConfig::default()
        },
    );
    let other = TestCache::new("late");
    let participant = Arc::new(StopsSampling {
        monitor: monitor.clone(),
        other: other.clone(),
        releases: AtomicUsize::new(0),
    });
    monitor.register(&participant);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(participant.releases.load(Ordering::SeqCst), 1);
    assert!(!monitor.is_sampling());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(participant.releases.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.stats().cycles, 1);
    assert!(monitor.is_registered(&*other));
    // Registered after the cycle took its snapshot.
    assert_eq!(other.releases(), 0);

    participant.request_detach();
}

#[test]
fn sampling_outlives_the_runtime_it_started_on() {
    let usage = FakeUsage::new(950, 1_000);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let monitor = runtime.block_on(async {
        monitor_with(
            &usage,
            MonitorConfig {
                sample_interval_ms: 20,
                ..MonitorConfig::default()
            },
        )
    });
    let cache = TestCache::new("a");
    monitor.register(&cache);
    drop(runtime);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while monitor.stats().cycles == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(monitor.stats().cycles > 0);
    assert!(cache.releases() > 0);
    assert!(monitor.is_sampling());

    monitor.stop_sampling();
    assert!(!monitor.is_sampling());
}
