//! Fixed-size decode worker pool.
//!
//! Backed by `rayon::ThreadPool`. A bounded `crossbeam_channel` pre-filled
//! with tokens acts as a semaphore limiting how many jobs may be queued or
//! running. Submission never blocks: when no token is free the job is handed
//! back, and the service loop runs it itself.

use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::ThreadPool as RayonPool;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

pub type JobFn = Box<dyn FnOnce() + Send + 'static>;

/// Decode worker pool.
pub struct DecodePool {
    pool: RayonPool,
    /// Free job slots; one token per slot.
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    /// Submitted-but-unfinished job count.
    pending: Arc<(Mutex<usize>, Condvar)>,
    threads: usize,
}

impl DecodePool {
    /// `nb_threads` workers and room for `queue_size` jobs waiting beyond
    /// the ones running. Returns `None` if either is zero or the threads
    /// cannot be spawned.
    pub fn new(nb_threads: usize, queue_size: usize) -> Option<Self> {
        if nb_threads < 1 || queue_size < 1 {
            return None;
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nb_threads)
            .thread_name(|i| format!("iostore-decode-{}", i))
            .build()
            .ok()?;

        let capacity = queue_size + nb_threads;
        let (slot_tx, slot_rx) = bounded(capacity);
        for _ in 0..capacity {
            slot_tx.send(()).ok()?;
        }

        Some(DecodePool {
            pool,
            slot_tx,
            slot_rx,
            pending: Arc::new((Mutex::new(0), Condvar::new())),
            threads: nb_threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Queues `job`, or returns it when every slot is taken.
    pub fn try_submit(&self, job: JobFn) -> Result<(), JobFn> {
        if self.slot_rx.try_recv().is_err() {
            return Err(job);
        }
        {
            let (lock, _) = &*self.pending;
            *lock.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        }

        let pending = Arc::clone(&self.pending);
        let slot_tx = self.slot_tx.clone();
        self.pool.spawn(move || {
            job();

            let (lock, cvar) = &*pending;
            let mut n = lock.lock().unwrap_or_else(PoisonError::into_inner);
            *n -= 1;
            if *n == 0 {
                cvar.notify_all();
            }
            let _ = slot_tx.send(());
        });
        Ok(())
    }

    /// Blocks until every submitted job has finished.
    pub fn wait_idle(&self) {
        let (lock, cvar) = &*self.pending;
        let mut n = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *n > 0 {
            n = cvar.wait(n).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rejects_zero_sizes() {
        assert!(DecodePool::new(0, 1).is_none());
        assert!(DecodePool::new(1, 0).is_none());
    }

    #[test]
    fn runs_all_submitted_jobs() {
        let pool = DecodePool::new(2, 8).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut inline = 0;
        for _ in 0..50 {
            let c = Arc::clone(&counter);
            if let Err(job) = pool.try_submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })) {
                job();
                inline += 1;
            }
        }
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert!(inline <= 50);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn full_pool_hands_job_back() {
        let pool = DecodePool::new(1, 1).unwrap();
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(2);
        for _ in 0..2 {
            let rx = release_rx.clone();
            let started = started_tx.clone();
            assert!(pool
                .try_submit(Box::new(move || {
                    let _ = started.send(());
                    let _ = rx.recv();
                }))
                .is_ok());
        }
        assert!(pool.try_submit(Box::new(|| {})).is_err());
        started_rx.recv().unwrap();
        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        pool.wait_idle();
    }
}
