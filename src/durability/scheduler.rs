use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

struct Shared {
    stopped: Mutex<bool>,
    signal: Condvar,
}

/// Background worker running a task on a fixed interval until dropped.
/// Stopping wakes the sleep immediately; an in-flight task finishes first.
pub(crate) struct PeriodicWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicWorker {
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut task: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            stopped: Mutex::new(false),
            signal: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let thread_name = name.to_owned();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut stopped = worker_shared.stopped.lock();
                loop {
                    if *stopped {
                        break;
                    }
                    let result = worker_shared.signal.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    if result.timed_out() {
                        drop(stopped);
                        task();
                        stopped = worker_shared.stopped.lock();
                    }
                }
                debug!(worker = %thread_name, "periodic worker stopped");
            })
            .expect("failed to spawn periodic worker thread");
        Self {
            shared,
            handle: Some(handle),
        }
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.signal.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn worker_runs_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let worker = PeriodicWorker::spawn("test-worker", Duration::from_millis(5), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(60));
        drop(worker);
        let ticks = counter.load(Ordering::SeqCst);
        assert!(ticks > 0, "worker never ticked");
        let after = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(after, counter.load(Ordering::SeqCst));
    }
}
