//! Fixed-size worker thread pools.
//!
//! Jobs queue on a bounded channel, so `submit` blocks once the queue is
//! full. Workers poll the queue with a short timeout and watch a cancel flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{PlanError, PlanResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

const WORKER_POLL: Duration = Duration::from_millis(10);

/// Cloneable handle to a pool of named worker threads.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    threads: usize,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    cancelled: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one) sharing a queue of `capacity` jobs.
    pub fn new(name: &str, threads: usize, capacity: usize) -> PlanResult<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = bounded::<Job>(capacity.max(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));

        for i in 0..threads {
            let receiver = receiver.clone();
            let cancelled = Arc::clone(&cancelled);
            let active = Arc::clone(&active);
            thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || Self::worker_loop(receiver, cancelled, active))?;
        }
        debug!(pool = name, threads, "started worker pool");

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                threads,
                sender: Mutex::new(Some(sender)),
                receiver,
                cancelled,
                active,
            }),
        })
    }

    fn worker_loop(receiver: Receiver<Job>, cancelled: Arc<AtomicBool>, active: Arc<AtomicUsize>) {
        loop {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            match receiver.recv_timeout(WORKER_POLL) {
                Ok(job) => {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    active.fetch_add(1, Ordering::SeqCst);
                    job();
                    active.fetch_sub(1, Ordering::SeqCst);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        trace!(thread = ?thread::current().name(), "worker exiting");
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn threads(&self) -> usize {
        self.inner.threads
    }

    /// Jobs currently running.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Queue a job, blocking while the queue is full.
    pub fn submit<F>(&self, job: F) -> PlanResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .inner
            .sender
            .lock()
            .clone()
            .ok_or_else(|| PlanError::PoolClosed(self.inner.name.clone()))?;
        if self.is_cancelled() {
            return Err(PlanError::PoolClosed(self.inner.name.clone()));
        }
        sender
            .send(Box::new(job))
            .map_err(|_| PlanError::PoolClosed(self.inner.name.clone()))
    }

    /// Stop accepting jobs; queued jobs still run.
    pub fn shutdown(&self) {
        if self.inner.sender.lock().take().is_some() {
            debug!(pool = %self.inner.name, "shutting down worker pool");
        }
    }

    /// Stop accepting jobs and discard everything still queued without
    /// waiting for running jobs. Returns how many queued jobs were dropped.
    pub fn shutdown_now(&self) -> usize {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.sender.lock().take();
        let mut dropped = 0;
        while self.inner.receiver.try_recv().is_ok() {
            dropped += 1;
        }
        debug!(
            pool = %self.inner.name,
            dropped,
            running = self.active(),
            "interrupted worker pool"
        );
        dropped
    }
}
