//! Executors for blocking cache I/O.
//!
//! Two tiers: a single-threaded sequenced runner for index I/O (blocking
//! allowed; queued work is drained before thread exit, so a final index
//! write survives shutdown) and the tokio blocking pool for per-entry file
//! I/O (blocking work that has started finishes on its own and must not
//! stall teardown).

use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use futures::channel::oneshot;

use crate::error::{CacheError, CacheResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A named worker thread executing closures strictly in dispatch order.
pub struct SequencedRunner {
    tx: Mutex<Option<Sender<Task>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SequencedRunner {
    pub fn new(name: &str) -> std::sync::Arc<SequencedRunner> {
        let (tx, rx) = unbounded::<Task>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in rx.iter() {
                    task();
                }
            })
            .expect("failed to spawn sequenced runner thread");
        std::sync::Arc::new(SequencedRunner {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a task; fire and forget.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Box::new(task));
        }
    }

    /// Queue a task and await its result.
    pub async fn run<T, F>(&self, task: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move || {
            let _ = tx.send(task());
        });
        rx.await.map_err(|_| CacheError::Cancelled)
    }
}

impl Drop for SequencedRunner {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain what is already queued
        // and exit; joining makes the last dispatched write durable.
        self.tx.lock().unwrap().take();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Run blocking per-entry file I/O on the shared worker pool.
pub(crate) async fn run_blocking<T, F>(task: F) -> CacheResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|_| CacheError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_tasks_in_dispatch_order() {
        let runner = SequencedRunner::new("test-runner");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            runner.dispatch(move || log.lock().unwrap().push(i));
        }
        drop(runner);
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn drains_queue_before_exit() {
        let runner = SequencedRunner::new("test-runner");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            runner.dispatch(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(runner);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
}
