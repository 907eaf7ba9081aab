use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool with a bounded queue.
///
/// Saturation is surfaced, not absorbed: `try_post` fails when the queue is
/// full, and the scheduler answers by dropping that client's tick.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize, queue_depth: usize) -> Self {
        let (tx, rx) = bounded::<Job>(queue_depth);

        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("sync-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn sync worker")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Enqueue a job; false when the pool is saturated or shut down.
    pub fn try_post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        match tx.try_send(Box::new(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
