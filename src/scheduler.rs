//! Shared worker pool for packet decoding, message handling and deferred
//! write events. Keeps the reactor thread free of anything but socket calls.

use std::thread;

use tracing::trace;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle to a fixed-size thread pool draining a shared task queue.
///
/// Workers exit when every handle has been dropped and the queue has drained.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tx: flume::Sender<Task>,
}

impl Scheduler {
    /// Spawns `threads` workers; `0` means one per available core.
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };

        let (tx, rx) = flume::unbounded::<Task>();

        for n in 0..threads {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("krpc-worker-{n}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                    trace!("scheduler worker exiting");
                })
                .expect("failed to spawn scheduler worker");
        }

        Self { tx }
    }

    /// Queue a short task for execution on the pool.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        // Send only fails when all workers are gone, i.e. during teardown.
        let _ = self.tx.send(Box::new(task));
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(0)
    }
}
