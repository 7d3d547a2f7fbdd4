//! Fixed-size worker pool for asynchronous physical commits.
//!
//! The pool exists solely so a caller can hand off the COMMIT of a
//! transaction without blocking; it runs nothing else. There is no
//! cancellation: a submitted commit either resolves its future or fails
//! it.

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, StoreError};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct CommitExecutor {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CommitExecutor {
    pub(crate) fn new(name: &str, threads: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Job> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-commit-{}", i + 1))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Submit a job to the pool. Fails with [`StoreError::StoreClosed`]
    /// once the pool has shut down.
    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(StoreError::StoreClosed);
        };
        sender.send(job).map_err(|_| StoreError::StoreClosed)
    }

    /// Drain queued jobs and stop the workers. Idempotent.
    pub(crate) fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock());
        debug!(workers = workers.len(), "shutting down commit pool");
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for CommitExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Single-resolution future for an asynchronous commit.
///
/// Resolves with the value passed to
/// [`Transaction::commit_async`](crate::store::Transaction::commit_async)
/// once the physical commit succeeds, or with the commit error.
#[derive(Debug)]
pub struct CommitFuture<T> {
    receiver: Receiver<Result<T>>,
}

impl<T> CommitFuture<T> {
    pub(crate) fn new() -> (Sender<Result<T>>, Self) {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        (sender, Self { receiver })
    }

    /// Block until the background commit completes.
    pub fn wait(self) -> Result<T> {
        self.receiver.recv().map_err(|_| StoreError::StoreClosed)?
    }

    /// Poll for completion without blocking.
    pub fn try_wait(&self) -> Option<Result<T>> {
        self.receiver.try_recv().ok()
    }
}
