use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::participant::{CacheParticipant, ParticipantId};
use crate::report::{MonitorStats, SampleOutcome};
use crate::sampler::{self, SamplerDriver, SamplerHandle};
use crate::source::{MemorySnapshot, MemorySource, SystemMemorySource};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

static GLOBAL: OnceLock<MemoryMonitor> = OnceLock::new();

type Registry = HashMap<ParticipantId, Weak<dyn CacheParticipant>>;

struct Inner {
    config: MonitorConfig,
    source: Arc<dyn MemorySource>,
    driver: SamplerDriver,
    participants: Mutex<Registry>,
    sampler: Mutex<Option<SamplerHandle>>,
    stats: Mutex<MonitorStats>,
    reported_unavailable: AtomicBool,
}

/// Samples memory usage on a fixed interval and asks every registered
/// [`CacheParticipant`] to release its cache when usage crosses the threshold.
///
/// Cloning is cheap and yields a handle to the same monitor. Most processes
/// only need [`MemoryMonitor::global`].
#[derive(Clone)]
pub struct MemoryMonitor {
    inner: Arc<Inner>,
}

impl MemoryMonitor {
    /// The process-wide monitor.
    ///
    /// Built on first access from [`MonitorConfig::from_env`] (falling back to
    /// defaults when the environment is invalid) and starts sampling on a
    /// dedicated background thread.
    pub fn global() -> &'static MemoryMonitor {
        GLOBAL.get_or_init(|| {
            let config = MonitorConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(
                    target: "cache_pressure.monitor",
                    error = %err,
                    "invalid memory monitor configuration; using defaults"
                );
                MonitorConfig::default()
            });
            Self::global_with(config)
        })
    }

    /// Builds the process-wide monitor with an explicit configuration.
    ///
    /// Fails if [`MemoryMonitor::global`] or this function already ran.
    pub fn init_global(config: MonitorConfig) -> Result<&'static MemoryMonitor, MonitorError> {
        config.validate()?;
        let mut created = false;
        let monitor = GLOBAL.get_or_init(|| {
            created = true;
            Self::global_with(config)
        });
        if created {
            Ok(monitor)
        } else {
            Err(MonitorError::AlreadyInitialized)
        }
    }

    fn global_with(config: MonitorConfig) -> MemoryMonitor {
        let monitor = Self::stopped(
            config,
            Arc::new(SystemMemorySource::new()),
            SamplerDriver::Thread,
        );
        if let Err(err) = monitor.start_sampling() {
            tracing::error!(
                target: "cache_pressure.monitor",
                error = %err,
                "memory monitor could not start sampling"
            );
        }
        monitor
    }

    /// A standalone monitor sampling the current process. Starts sampling.
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        Self::with_source(config, Arc::new(SystemMemorySource::new()))
    }

    /// A standalone monitor reading from `source`. Starts sampling.
    ///
    /// Inside a Tokio runtime the sampler runs as a task on that runtime,
    /// otherwise on a dedicated thread. If that runtime shuts down while the
    /// monitor is still sampling, the sampler continues on a dedicated thread.
    pub fn with_source(
        config: MonitorConfig,
        source: Arc<dyn MemorySource>,
    ) -> Result<Self, MonitorError> {
        config.validate()?;
        let monitor = Self::stopped(config, source, SamplerDriver::Ambient);
        monitor.start_sampling()?;
        Ok(monitor)
    }

    fn stopped(
        config: MonitorConfig,
        source: Arc<dyn MemorySource>,
        driver: SamplerDriver,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                driver,
                participants: Mutex::new(HashMap::new()),
                sampler: Mutex::new(None),
                stats: Mutex::new(MonitorStats::default()),
                reported_unavailable: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> MonitorConfig {
        self.inner.config
    }

    pub fn stats(&self) -> MonitorStats {
        *self.inner.stats.lock()
    }

    /// Whether `self` and `other` are handles to the same monitor.
    pub fn ptr_eq(&self, other: &MemoryMonitor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Adds `participant` to the broadcast set.
    ///
    /// Only a weak reference is kept. Returns `false` if it was already
    /// registered, in which case nothing changes.
    pub fn register<P>(&self, participant: &Arc<P>) -> bool
    where
        P: CacheParticipant + 'static,
    {
        let participant: Arc<dyn CacheParticipant> = participant.clone();
        self.register_dyn(&participant)
    }

    pub fn register_dyn(&self, participant: &Arc<dyn CacheParticipant>) -> bool {
        let id = ParticipantId::of(&**participant);
        let mut participants = self.inner.participants.lock();
        // Replace an entry whose participant is already gone.
        let live = participants
            .get(&id)
            .is_some_and(|existing| existing.strong_count() > 0);
        if live {
            return false;
        }
        participants.insert(id, Arc::downgrade(participant));
        drop(participants);

        tracing::debug!(
            target: "cache_pressure.monitor",
            participant = participant.name(),
            "registered cache participant"
        );
        true
    }

    /// Like [`register`](Self::register), but deregisters when the returned
    /// guard is dropped.
    pub fn register_scoped<P>(&self, participant: &Arc<P>) -> ParticipantRegistration
    where
        P: CacheParticipant + 'static,
    {
        let participant: Arc<dyn CacheParticipant> = participant.clone();
        self.register_dyn(&participant);
        ParticipantRegistration {
            id: ParticipantId::of(&*participant),
            participant: Arc::downgrade(&participant),
            monitor: Arc::downgrade(&self.inner),
        }
    }

    /// Removes `participant` from the broadcast set. Returns `false` if it
    /// was not registered.
    ///
    /// Pass the participant itself (`&*arc`, or `self` from inside an
    /// implementation), not the `Arc`.
    pub fn deregister<P>(&self, participant: &P) -> bool
    where
        P: CacheParticipant + ?Sized,
    {
        self.deregister_id(ParticipantId::of(participant))
    }

    pub fn deregister_id(&self, id: ParticipantId) -> bool {
        let removed = self.inner.participants.lock().remove(&id).is_some();
        if removed {
            tracing::debug!(
                target: "cache_pressure.monitor",
                ?id,
                "deregistered cache participant"
            );
        }
        removed
    }

    pub fn is_registered<P>(&self, participant: &P) -> bool
    where
        P: CacheParticipant + ?Sized,
    {
        self.inner
            .participants
            .lock()
            .get(&ParticipantId::of(participant))
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Number of registered participants that are still alive.
    pub fn participant_count(&self) -> usize {
        self.inner
            .participants
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Starts the periodic sampler. No-op while it is already running.
    ///
    /// Restarts use the same driver the monitor was built with: the global
    /// monitor always samples on its own thread.
    pub fn start_sampling(&self) -> Result<(), MonitorError> {
        let mut sampler = self.inner.sampler.lock();
        if sampler.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let handle = sampler::spawn(
            Arc::downgrade(&self.inner),
            Inner::sample_cycle,
            self.inner.config.sample_interval(),
            self.inner.driver,
        )
        .map_err(MonitorError::SpawnSampler)?;
        *sampler = Some(handle);

        tracing::info!(
            target: "cache_pressure.monitor",
            interval_ms = self.inner.config.sample_interval_ms,
            threshold_ratio = self.inner.config.threshold_ratio,
            "memory monitor sampling started"
        );
        Ok(())
    }

    /// Stops the periodic sampler. No cycle starts after this returns; one
    /// that is already running may finish. No-op when already stopped.
    pub fn stop_sampling(&self) {
        let Some(handle) = self.inner.sampler.lock().take() else {
            return;
        };
        handle.cancel();
        tracing::info!(target: "cache_pressure.monitor", "memory monitor sampling stopped");
    }

    pub fn is_sampling(&self) -> bool {
        self.inner
            .sampler
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Runs one sampling cycle right now, independent of the sampler.
    pub fn check_memory_usage_once(&self) -> SampleOutcome {
        self.inner.check_memory_usage_once()
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("config", &self.inner.config)
            .field("participants", &self.participant_count())
            .field("sampling", &self.is_sampling())
            .finish()
    }
}

impl Inner {
    fn sample_cycle(&self) {
        self.check_memory_usage_once();
    }

    fn check_memory_usage_once(&self) -> SampleOutcome {
        self.stats.lock().cycles += 1;

        let Some(snapshot) = self.source.sample() else {
            self.record_unavailable("memory introspection is unavailable on this host");
            return SampleOutcome::Unavailable;
        };
        let Some(ratio) = snapshot.usage_ratio() else {
            self.record_unavailable("memory source reported zero total memory");
            return SampleOutcome::Unavailable;
        };

        if ratio <= self.config.threshold_ratio {
            tracing::trace!(
                target: "cache_pressure.monitor",
                used_bytes = snapshot.used_bytes,
                total_bytes = snapshot.total_bytes,
                ratio,
                "memory usage within threshold"
            );
            return SampleOutcome::BelowThreshold { snapshot, ratio };
        }

        self.broadcast(snapshot, ratio)
    }

    fn record_unavailable(&self, reason: &'static str) {
        self.stats.lock().unavailable_samples += 1;
        // Every cycle hits this on hosts without introspection; warn once.
        if !self.reported_unavailable.swap(true, Ordering::Relaxed) {
            tracing::warn!(target: "cache_pressure.monitor", reason, "skipping memory check");
        } else {
            tracing::debug!(target: "cache_pressure.monitor", reason, "skipping memory check");
        }
    }

    fn broadcast(&self, snapshot: MemorySnapshot, ratio: f64) -> SampleOutcome {
        // Snapshot so the lock is never held while calling into participants;
        // they may register or deregister from `release_cache`.
        let entries: Vec<(ParticipantId, Weak<dyn CacheParticipant>)> = self
            .participants
            .lock()
            .iter()
            .map(|(id, weak)| (*id, weak.clone()))
            .collect();

        tracing::info!(
            target: "cache_pressure.monitor",
            used_bytes = snapshot.used_bytes,
            total_bytes = snapshot.total_bytes,
            ratio,
            threshold_ratio = self.config.threshold_ratio,
            participants = entries.len(),
            "memory usage above threshold; asking caches to release memory"
        );

        let mut notified = 0;
        let mut failed = 0;
        let mut dropped = Vec::new();
        for (id, weak) in entries {
            let Some(participant) = weak.upgrade() else {
                dropped.push(id);
                continue;
            };
            // Best-effort: skip participants deregistered since the snapshot.
            if !self.still_registered(id, &weak) {
                continue;
            }

            notified += 1;
            match catch_unwind(AssertUnwindSafe(|| participant.release_cache())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    tracing::error!(
                        target: "cache_pressure.monitor",
                        participant = participant.name(),
                        error = %err,
                        "cache participant failed to release memory"
                    );
                }
                Err(payload) => {
                    failed += 1;
                    tracing::error!(
                        target: "cache_pressure.monitor",
                        participant = participant.name(),
                        panic = panic_message(payload.as_ref()),
                        "cache participant panicked while releasing memory"
                    );
                }
            }
        }

        if !dropped.is_empty() {
            self.prune(&dropped);
        }

        let mut stats = self.stats.lock();
        stats.broadcasts += 1;
        stats.release_calls += notified as u64;
        stats.release_failures += failed as u64;
        drop(stats);

        SampleOutcome::Broadcast {
            snapshot,
            ratio,
            notified,
            failed,
        }
    }

    fn still_registered(&self, id: ParticipantId, weak: &Weak<dyn CacheParticipant>) -> bool {
        self.participants
            .lock()
            .get(&id)
            .is_some_and(|current| Weak::ptr_eq(current, weak))
    }

    /// Drops entries whose participant was destroyed without deregistering.
    fn prune(&self, ids: &[ParticipantId]) {
        let mut participants = self.participants.lock();
        let mut pruned = 0usize;
        for id in ids {
            if participants
                .get(id)
                .is_some_and(|weak| weak.strong_count() == 0)
            {
                participants.remove(id);
                pruned += 1;
            }
        }
        drop(participants);

        if pruned > 0 {
            tracing::debug!(
                target: "cache_pressure.monitor",
                pruned,
                "pruned cache participants dropped without deregistering"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Guard returned by [`MemoryMonitor::register_scoped`]. Dropping it
/// deregisters the participant.
#[must_use = "dropping the registration deregisters the participant immediately"]
pub struct ParticipantRegistration {
    id: ParticipantId,
    participant: Weak<dyn CacheParticipant>,
    monitor: Weak<Inner>,
}

impl ParticipantRegistration {
    pub fn id(&self) -> ParticipantId {
        self.id
    }
}

impl std::fmt::Debug for ParticipantRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantRegistration")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for ParticipantRegistration {
    fn drop(&mut self) {
        let Some(monitor) = self.monitor.upgrade() else {
            return;
        };
        let mut participants = monitor.participants.lock();
        // Leave the entry alone if the slot now belongs to someone else.
        if participants
            .get(&self.id)
            .is_some_and(|current| Weak::ptr_eq(current, &self.participant))
        {
            participants.remove(&self.id);
        }
    }
}
