//! Fixed-size worker pool fed by a bounded queue.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is stopped")]
    Stopped,
    #[error("Worker pool queue is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// How long an idle worker waits for a job before re-checking the stop flag.
    pub poll_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Default)]
struct PoolShared {
    pending: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    stopped: AtomicBool,
    drained: Notify,
}

impl PoolShared {
    fn finish(&self, cancelled: bool) {
        if cancelled {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        } else {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

pub struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(PoolShared::default());
        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let shared = shared.clone();
                let poll_timeout = config.poll_timeout;
                tokio::spawn(async move { run_worker(worker, receiver, shared, poll_timeout).await })
            })
            .collect();
        Self {
            sender: Some(sender),
            shared,
            workers,
        }
    }

    /// Queues a job, waiting for room when the queue is full.
    pub async fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Stopped);
        }
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(Box::pin(job)).await.is_err() {
            self.shared.finish(true);
            return Err(PoolError::Closed);
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Returns once the queue is empty and no job is running.
    pub async fn wait_for_drain(&self) {
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Raises the stop flag. Running jobs finish; queued jobs are dropped.
    pub fn stop_all(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }

    /// Closes the queue and joins every worker once remaining jobs are handled.
    pub async fn shutdown(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "worker task failed");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    shared: Arc<PoolShared>,
    poll_timeout: Duration,
) {
    tracing::debug!(worker, "worker started");
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::time::timeout(poll_timeout, receiver.recv()).await
        };
        match next {
            Ok(Some(job)) => {
                if shared.stopped.load(Ordering::SeqCst) {
                    drop(job);
                    shared.finish(true);
                } else {
                    job.await;
                    shared.finish(false);
                }
            }
            Ok(None) => break,
            Err(_) if shared.stopped.load(Ordering::SeqCst) => break,
            Err(_) => continue,
        }
    }
    tracing::debug!(worker, "worker stopped");
}
