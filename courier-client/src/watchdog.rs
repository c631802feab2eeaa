//! Update Watchdog.
//!
//! The server pushes updates over the primary session; a stalled stream is
//! otherwise silent. Every dispatched update touches the [`UpdateClock`].
//! When nothing arrives for a whole interval the watchdog fires one probe
//! (`updates.getState`) so the server resumes pushing, then waits again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::InvocationError;

/// When the last update arrived, plus a signal that re-arms the watchdog.
#[derive(Debug)]
pub struct UpdateClock {
    last:   Mutex<Instant>,
    notify: Notify,
}

impl UpdateClock {
    pub fn new() -> Self {
        Self { last: Mutex::new(Instant::now()), notify: Notify::new() }
    }

    /// Record that an update just arrived.
    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.notify.notify_one();
    }

    pub fn last_update(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for UpdateClock {
    fn default() -> Self { Self::new() }
}

/// What the watchdog does when the stream has been idle too long.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> Result<(), InvocationError>;
}

/// Run the watchdog until `cancel` fires.
pub fn spawn_watchdog(
    clock:    Arc<UpdateClock>,
    interval: Duration,
    cancel:   CancellationToken,
    probe:    Arc<dyn Probe>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut anchor = clock.last_update();
        loop {
            let deadline = anchor.max(clock.last_update()) + interval;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = clock.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!("[courier] no updates for {interval:?}, probing");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = probe.probe() => if let Err(e) = res {
                            tracing::warn!("[courier] update probe failed: {e}");
                        },
                    }
                    anchor = Instant::now();
                }
            }
        }
        tracing::debug!("[courier] watchdog stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::sleep;

    use super::*;

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
        fail:  bool,
    }

    #[async_trait]
    impl Probe for Counter {
        async fn probe(&self) -> Result<(), InvocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail { Err(InvocationError::NotStarted) } else { Ok(()) }
        }
    }

    impl Counter {
        fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
    }

    #[tokio::test(start_paused = true)]
    async fn touch_postpones_probe() {
        let clock = Arc::new(UpdateClock::new());
        let probe = Arc::new(Counter::default());
        let cancel = CancellationToken::new();
        let task = spawn_watchdog(Arc::clone(&clock), Duration::from_secs(60), cancel.clone(), probe.clone());

        sleep(Duration::from_secs(30)).await;
        clock.touch();
        sleep(Duration::from_secs(59)).await;
        assert_eq!(probe.calls(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(probe.calls(), 1);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.calls(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_keeps_watching() {
        let clock = Arc::new(UpdateClock::new());
        let probe = Arc::new(Counter { fail: true, ..Default::default() });
        let cancel = CancellationToken::new();
        let task = spawn_watchdog(clock, Duration::from_secs(10), cancel.clone(), probe.clone());

        sleep(Duration::from_secs(35)).await;
        assert_eq!(probe.calls(), 3);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_prompt() {
        let cancel = CancellationToken::new();
        let task = spawn_watchdog(
            Arc::new(UpdateClock::new()),
            Duration::from_secs(15 * 60),
            cancel.clone(),
            Arc::new(Counter::default()),
        );
        let started = Instant::now();
        cancel.cancel();
        task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
