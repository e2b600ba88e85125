//! Bounded worker pool running checkpoint and reset work items.
//!
//! Completions must never run inline on the operator thread that triggered
//! them, so work items go through a bounded queue drained by a small fixed
//! set of workers. Submitting blocks once the queue is full.

use std::thread::JoinHandle;

use super::RegionError;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Option<flume::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = flume::bounded::<Job>(queue_capacity);
        let workers = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("ckpt-worker-{i}"))
                    .spawn(move || {
                        tracing::debug!("checkpoint worker started");
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        tracing::debug!("checkpoint worker exiting");
                    })
                    .expect("failed to spawn checkpoint worker")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Enqueue a work item, blocking while the queue is full.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), RegionError> {
        let tx = self.tx.as_ref().ok_or(RegionError::PoolShutdown)?;
        tx.send(Box::new(job)).map_err(|_| RegionError::PoolShutdown)
    }

    /// Stop accepting work and wait for queued items to finish.
    pub fn shutdown(&mut self) {
        drop(self.tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
