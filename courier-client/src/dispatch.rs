//! Update dispatch: session reader → watchdog touch → worker pool.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::governor::WorkerPool;
use crate::watchdog::UpdateClock;

/// Error a handler may return; logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// One `Updates` object pushed by a datacenter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateEvent {
    /// Datacenter the update arrived from.
    pub dc_id:   i32,
    /// Serialized `Updates` constructor.
    pub payload: Vec<u8>,
}

/// Receives updates on a worker thread.
///
/// Implemented for any `Fn(&UpdateEvent) -> Result<(), HandlerError>`.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, event: &UpdateEvent) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&UpdateEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, event: &UpdateEvent) -> Result<(), HandlerError> {
        self(event)
    }
}

pub(crate) type Handlers = Arc<RwLock<Vec<Arc<dyn Handler>>>>;

/// Drain `rx` until cancelled, touching `clock` before each dispatch.
///
/// Jobs are submitted in arrival order; with one worker they also run in it.
pub(crate) fn spawn_dispatcher(
    mut rx:   mpsc::UnboundedReceiver<UpdateEvent>,
    clock:    Arc<UpdateClock>,
    pool:     Arc<WorkerPool>,
    handlers: Handlers,
    cancel:   CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => Arc::new(ev),
                    None => break,
                },
            };
            clock.touch();

            let snapshot: Vec<Arc<dyn Handler>> =
                handlers.read().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect();
            for handler in snapshot {
                let event = Arc::clone(&event);
                let submitted = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = pool.submit(Box::new(move || handler.handle(&event))) => r,
                };
                if submitted.is_err() {
                    tracing::debug!("[courier] worker pool closed, dropping update");
                    return;
                }
            }
        }
        tracing::debug!("[courier] dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn updates_reach_handlers_in_order() {
        let pool = Arc::new(WorkerPool::new(1, 4).unwrap());
        let clock = Arc::new(UpdateClock::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handlers: Handlers = Arc::new(RwLock::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            handlers.write().unwrap().push(Arc::new(move |ev: &UpdateEvent| -> Result<(), HandlerError> {
                seen.lock().unwrap().push(ev.payload[0]);
                Ok(())
            }));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = spawn_dispatcher(rx, Arc::clone(&clock), Arc::clone(&pool), handlers, cancel.clone());

        let before = clock.last_update();
        tokio::time::sleep(Duration::from_millis(5)).await;
        for i in 0..20u8 {
            tx.send(UpdateEvent { dc_id: 2, payload: vec![i] }).unwrap();
        }
        drop(tx);
        task.await.unwrap();
        pool.shutdown().await;

        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<u8>>());
        assert!(clock.last_update() > before);
    }
}
