//! Deferred execution of user callbacks
//!
//! Liveness callbacks and custom PDO receive callbacks may perform slow work
//! (including SDO transfers), so they must never run on the receive thread.
//! A single worker thread drains a job queue instead; panics in jobs are
//! caught and logged at the dispatch boundary.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

type Job = Box<dyn FnOnce() + Send>;

/// A cloneable handle for enqueuing jobs onto the callback worker
#[derive(Clone)]
pub(crate) struct TaskSpawner {
    tx: Sender<Job>,
}

impl TaskSpawner {
    /// Enqueue a job; dropped with a log message if the worker is gone
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            log::warn!("Callback worker is shut down, dropping deferred callback");
        }
    }
}

pub(crate) struct CallbackExecutor {
    spawner: TaskSpawner,
    worker: Option<JoinHandle<()>>,
    terminating: Arc<AtomicBool>,
}

impl CallbackExecutor {
    pub fn new(terminating: Arc<AtomicBool>) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let worker_terminating = terminating.clone();
        let worker = std::thread::Builder::new()
            .name("canmaster-callbacks".into())
            .spawn(move || run_worker(rx, worker_terminating))
            .expect("failed to spawn callback worker");
        Self {
            spawner: TaskSpawner { tx },
            worker: Some(worker),
            terminating,
        }
    }

    pub fn spawner(&self) -> TaskSpawner {
        self.spawner.clone()
    }

    /// Drain outstanding jobs and join the worker; requires the terminating
    /// flag to be set by the caller
    pub fn shutdown(&mut self) {
        debug_assert!(self.terminating.load(Ordering::SeqCst));
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Callback worker panicked");
            }
        }
    }
}

fn run_worker(rx: Receiver<Job>, terminating: Arc<AtomicBool>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!("Panic in user callback (isolated)");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if terminating.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn jobs_run_and_panics_are_isolated() {
        let terminating = Arc::new(AtomicBool::new(false));
        let mut executor = CallbackExecutor::new(terminating.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let spawner = executor.spawner();
        spawner.spawn(|| panic!("callback panic"));
        let c = counter.clone();
        spawner.spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while counter.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(1, counter.load(Ordering::SeqCst));

        terminating.store(true, Ordering::SeqCst);
        executor.shutdown();
    }
}
