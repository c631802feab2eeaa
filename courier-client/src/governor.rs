//! Concurrency Governor: transfer permits and the handler worker pool.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

use crate::dispatch::HandlerError;
use crate::errors::InvocationError;

// ─── Transfer permits ─────────────────────────────────────────────────────────

/// Bounds concurrent uploads and downloads independently.
#[derive(Debug)]
pub struct Governor {
    upload:   Arc<Semaphore>,
    download: Arc<Semaphore>,
}

/// Held for the duration of one transfer; released on drop.
#[derive(Debug)]
pub struct TransferPermit {
    _permit: OwnedSemaphorePermit,
}

impl Governor {
    pub fn new(max_concurrent_transmissions: usize) -> Self {
        Self {
            upload:   Arc::new(Semaphore::new(max_concurrent_transmissions)),
            download: Arc::new(Semaphore::new(max_concurrent_transmissions)),
        }
    }

    /// Wait for an upload slot. Fails with `Cancelled` once the governor is closed.
    pub async fn acquire_upload(&self) -> Result<TransferPermit, InvocationError> {
        acquire(&self.upload).await
    }

    /// Wait for a download slot. Fails with `Cancelled` once the governor is closed.
    pub async fn acquire_download(&self) -> Result<TransferPermit, InvocationError> {
        acquire(&self.download).await
    }

    pub fn available_uploads(&self) -> usize { self.upload.available_permits() }

    pub fn available_downloads(&self) -> usize { self.download.available_permits() }

    /// Wake every waiter with `Cancelled` and refuse new acquisitions.
    pub fn close(&self) {
        self.upload.close();
        self.download.close();
    }
}

async fn acquire(sem: &Arc<Semaphore>) -> Result<TransferPermit, InvocationError> {
    let permit = Arc::clone(sem).acquire_owned().await.map_err(|_| InvocationError::Cancelled)?;
    Ok(TransferPermit { _permit: permit })
}

// ─── Worker pool ──────────────────────────────────────────────────────────────

/// A unit of handler work.
pub type Job = Box<dyn FnOnce() -> Result<(), HandlerError> + Send>;

/// Fixed set of OS threads (`Handler-0`, `Handler-1`, ...) draining a bounded
/// queue. A failing or panicking job is logged and the thread keeps going.
pub struct WorkerPool {
    tx:      Mutex<Option<mpsc::Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `workers` threads sharing a queue of `queue` pending jobs.
    pub fn new(workers: usize, queue: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>(queue.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = Arc::clone(&rx);
            let handle = std::thread::Builder::new()
                .name(format!("Handler-{i}"))
                .spawn(move || worker_loop(&rx))?;
            threads.push(handle);
        }
        tracing::debug!("[courier] started {workers} handler threads");

        Ok(Self { tx: Mutex::new(Some(tx)), threads: Mutex::new(threads) })
    }

    /// Queue `job`, waiting while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), InvocationError> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match tx {
            Some(tx) => tx.send(job).await.map_err(|_| InvocationError::Cancelled),
            None => Err(InvocationError::Cancelled),
        }
    }

    /// Stop accepting jobs, let queued ones finish, and join every thread.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        if threads.is_empty() {
            return;
        }
        let joined = tokio::task::spawn_blocking(move || {
            for t in threads {
                let _ = t.join();
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!("[courier] handler threads did not join cleanly");
        }
    }
}

fn worker_loop(rx: &Mutex<mpsc::Receiver<Job>>) {
    loop {
        let job = rx.lock().unwrap_or_else(|e| e.into_inner()).blocking_recv();
        let Some(job) = job else { break };
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("[courier] handler failed: {e}"),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic>".into());
                tracing::error!("[courier] handler panicked: {msg}");
            }
        }
    }
}
