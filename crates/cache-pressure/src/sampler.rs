//! Periodic background task that drives sampling cycles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const THREAD_NAME: &str = "cache-pressure-sampler";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SamplerDriver {
    /// Spawn on the ambient Tokio runtime if there is one, else on a thread.
    ///
    /// If that runtime shuts down before the sampler is cancelled, the
    /// sampler moves to a dedicated thread.
    Ambient,
    /// Always use a dedicated thread, independent of any caller runtime.
    Thread,
}

/// Handle to a running sampler. Dropping it cancels the sampler.
pub(crate) struct SamplerHandle {
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl SamplerHandle {
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// The sampling loop has exited (cancelled, target dropped, or it could
    /// not be moved off a runtime that shut down).
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Sampler<T: Send + Sync + 'static> {
    target: Weak<T>,
    cycle: fn(&T),
    period: Duration,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl<T: Send + Sync + 'static> Clone for Sampler<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            cycle: self.cycle,
            period: self.period,
            token: self.token.clone(),
            finished: self.finished.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Sampler<T> {
    async fn run(self) {
        let mut ticks = tokio::time::interval_at(Instant::now() + self.period, self.period);
        // Cycles never overlap; a late cycle does not cause a burst of catch-up cycles.
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticks.tick() => {}
            }
            if self.token.is_cancelled() {
                break;
            }
            let Some(target) = self.target.upgrade() else {
                break;
            };
            (self.cycle)(&target);
        }

        self.finished.store(true, Ordering::Release);
        tracing::debug!(target: "cache_pressure.sampler", "sampler stopped");
    }

    fn spawn_thread(self) -> std::io::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(self.run()))?;
        Ok(())
    }
}

/// Moves a sampler to a dedicated thread when its runtime drops it before it
/// was cancelled.
struct RelaunchOnDrop<T: Send + Sync + 'static>(Option<Sampler<T>>);

impl<T: Send + Sync + 'static> Drop for RelaunchOnDrop<T> {
    fn drop(&mut self) {
        let Some(sampler) = self.0.take() else {
            return;
        };
        if sampler.token.is_cancelled() || sampler.target.strong_count() == 0 {
            sampler.finished.store(true, Ordering::Release);
            return;
        }

        tracing::debug!(
            target: "cache_pressure.sampler",
            "runtime shut down under the sampler; moving it to a dedicated thread"
        );
        let finished = sampler.finished.clone();
        if let Err(err) = sampler.spawn_thread() {
            finished.store(true, Ordering::Release);
            tracing::error!(
                target: "cache_pressure.sampler",
                error = %err,
                "failed to move sampler to a dedicated thread; sampling stopped"
            );
        }
    }
}

/// Starts calling `cycle` every `period`, first one `period` from now.
///
/// Only a weak reference to `target` is held; the sampler exits once it can
/// no longer be upgraded. Neither driver keeps the process alive.
pub(crate) fn spawn<T>(
    target: Weak<T>,
    cycle: fn(&T),
    period: Duration,
    driver: SamplerDriver,
) -> std::io::Result<SamplerHandle>
where
    T: Send + Sync + 'static,
{
    let token = CancellationToken::new();
    let finished = Arc::new(AtomicBool::new(false));
    let sampler = Sampler {
        target,
        cycle,
        period,
        token: token.clone(),
        finished: finished.clone(),
    };

    let ambient = match driver {
        SamplerDriver::Ambient => tokio::runtime::Handle::try_current().ok(),
        SamplerDriver::Thread => None,
    };
    match ambient {
        Some(handle) => {
            let mut relaunch = RelaunchOnDrop(Some(sampler.clone()));
            handle.spawn(async move {
                sampler.run().await;
                relaunch.0 = None;
            });
        }
        None => sampler.spawn_thread()?,
    }

    tracing::debug!(
        target: "cache_pressure.sampler",
        interval_ms = period.as_millis() as u64,
        ?driver,
        "sampler started"
    );
    Ok(SamplerHandle { token, finished })
}
