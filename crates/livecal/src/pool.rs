//! Bounded worker pool for detection tasks.
//!
//! The pool never queues: [`DetectionPool::try_spawn`] either starts the job
//! on a free slot immediately or reports that every slot is busy.

use std::sync::Arc;

use log::error;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("detection pool needs at least one slot")]
    ZeroCapacity,
    #[error("failed to build detection thread pool: {0}")]
    Build(#[from] ThreadPoolBuildError),
}

#[derive(Default)]
struct Slots {
    active: Mutex<usize>,
    idle: Condvar,
}

/// Releases a slot when the job finishes, including by unwinding.
struct SlotGuard(Arc<Slots>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut active = self.0.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct DetectionPool {
    pool: ThreadPool,
    capacity: usize,
    slots: Arc<Slots>,
}

impl std::fmt::Debug for DetectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionPool")
            .field("capacity", &self.capacity)
            .field("active", &self.active())
            .finish()
    }
}

impl DetectionPool {
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(capacity)
            .thread_name(|i| format!("livecal-detect-{i}"))
            .panic_handler(|_| error!("detection job panicked outside its task boundary"))
            .build()?;
        Ok(Self {
            pool,
            capacity,
            slots: Arc::new(Slots::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs started and not yet finished.
    pub fn active(&self) -> usize {
        *self.slots.active.lock()
    }

    /// Start `job` if a slot is free. Returns `false` without running it
    /// otherwise.
    pub fn try_spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut active = self.slots.active.lock();
            if *active >= self.capacity {
                return false;
            }
            *active += 1;
        }
        let guard = SlotGuard(Arc::clone(&self.slots));
        self.pool.spawn(move || {
            let _guard = guard;
            job();
        });
        true
    }

    /// Block until no job is running.
    pub fn wait_idle(&self) {
        let mut active = self.slots.active.lock();
        while *active > 0 {
            self.slots.idle.wait(&mut active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn full_pool_rejects_without_queueing() {
        let pool = DetectionPool::new(2).expect("pool");
        let (release_tx, release_rx) = bounded::<()>(0);
        for _ in 0..2 {
            let rx = release_rx.clone();
            assert!(pool.try_spawn(move || {
                let _ = rx.recv();
            }));
        }
        assert_eq!(pool.active(), 2);
        assert!(!pool.try_spawn(|| {}));

        drop(release_tx);
        pool.wait_idle();
        assert_eq!(pool.active(), 0);
        assert!(pool.try_spawn(|| {}));
        pool.wait_idle();
    }

    #[test]
    fn wait_idle_sees_every_job_finish() {
        let pool = DetectionPool::new(3).expect("pool");
        let done = Arc::new(AtomicUsize::new(0));
        let mut started = 0;
        while started < 9 {
            let d = Arc::clone(&done);
            if pool.try_spawn(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }) {
                started += 1;
            } else {
                pool.wait_idle();
            }
        }
        pool.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn panicking_job_frees_its_slot() {
        let pool = DetectionPool::new(1).expect("pool");
        assert!(pool.try_spawn(|| panic!("boom")));
        pool.wait_idle();
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(DetectionPool::new(0), Err(PoolError::ZeroCapacity)));
    }
}
