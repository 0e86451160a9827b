//! Fixed-size worker pool with cooperative cancellation
//!
//! Every slot is a long-lived thread parked on its own start channel.
//! `submit` claims the first idle slot and never blocks: when all slots are
//! busy it fails with [`PoolError::Busy`].

use super::cancel::{cancel_pair, CancelHandle, CancelToken};
use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::utils::CachePadded;
use minstrel_core::domain::RoutingError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, trace};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("All {0} workers are busy")]
    Busy(usize),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Worker pool is shut down")]
    ShutDown,
}

impl From<PoolError> for RoutingError {
    fn from(err: PoolError) -> Self {
        RoutingError::NotPossible(err.to_string())
    }
}

/// Unit of work executed on a worker thread
pub trait Job: Send + 'static {
    fn run(self: Box<Self>, cancel: &CancelToken);
}

impl<F> Job for F
where
    F: FnOnce(&CancelToken) + Send + 'static,
{
    fn run(self: Box<Self>, cancel: &CancelToken) {
        (*self)(cancel)
    }
}

/// Identifies one submission, valid until the job finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobTicket {
    pub slot: usize,
    generation: u64,
}

struct Start {
    job: Box<dyn Job>,
    token: CancelToken,
}

struct Running {
    generation: u64,
    cancel: CancelHandle,
}

#[derive(Default)]
struct SlotState {
    busy: CachePadded<AtomicBool>,
    running: Mutex<Option<Running>>,
}

struct Slot {
    start: Option<Sender<Start>>,
    state: Arc<SlotState>,
    join: Option<JoinHandle<()>>,
}

pub struct WorkerPool {
    slots: Vec<Slot>,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    /// Spawn `size` worker threads named `{name}-{n}`
    pub fn new(name: &str, size: usize) -> Result<Self, PoolError> {
        let size = size.max(1);
        let mut slots = Vec::with_capacity(size);

        for index in 0..size {
            let (start_tx, start_rx) = bounded::<Start>(1);
            let state = Arc::new(SlotState::default());
            let worker_state = Arc::clone(&state);

            let join = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_main(index, start_rx, worker_state))?;

            slots.push(Slot {
                start: Some(start_tx),
                state,
                join: Some(join),
            });
        }

        info!(workers = size, name, "Worker pool started");
        Ok(Self {
            slots,
            generation: AtomicU64::new(1),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn idle(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.state.busy.load(Ordering::Acquire))
            .count()
    }

    /// Run `job` on the first idle slot
    pub fn submit(&self, job: impl Job) -> Result<JobTicket, PoolError> {
        self.submit_boxed(Box::new(job))
    }

    pub fn submit_boxed(&self, job: Box<dyn Job>) -> Result<JobTicket, PoolError> {
        for (index, slot) in self.slots.iter().enumerate() {
            let claimed = slot
                .state
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if !claimed {
                continue;
            }

            let Some(start) = slot.start.as_ref() else {
                slot.state.busy.store(false, Ordering::Release);
                return Err(PoolError::ShutDown);
            };

            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            let (cancel, token) = cancel_pair();
            *lock(&slot.state.running) = Some(Running { generation, cancel });

            if start.send(Start { job, token }).is_err() {
                *lock(&slot.state.running) = None;
                slot.state.busy.store(false, Ordering::Release);
                return Err(PoolError::ShutDown);
            }

            trace!(slot = index, generation, "Job submitted");
            return Ok(JobTicket {
                slot: index,
                generation,
            });
        }

        debug!(workers = self.slots.len(), "No idle worker");
        Err(PoolError::Busy(self.slots.len()))
    }

    /// Ask the job behind `ticket` to stop
    ///
    /// Returns `false` if that job already finished.
    pub fn cancel(&self, ticket: JobTicket) -> bool {
        let Some(slot) = self.slots.get(ticket.slot) else {
            return false;
        };
        match lock(&slot.state.running).as_ref() {
            Some(running) if running.generation == ticket.generation => {
                running.cancel.cancel();
                debug!(slot = ticket.slot, "Job cancellation requested");
                true
            }
            _ => false,
        }
    }

    fn cancel_all(&self) {
        for slot in &self.slots {
            if let Some(running) = lock(&slot.state.running).as_ref() {
                running.cancel.cancel();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        debug!("Shutting down worker pool");
        self.cancel_all();
        for slot in &mut self.slots {
            slot.start.take();
        }
        for slot in &mut self.slots {
            if let Some(join) = slot.join.take() {
                if join.join().is_err() {
                    error!("Worker thread panicked during shutdown");
                }
            }
        }
    }
}

fn worker_main(index: usize, start: Receiver<Start>, state: Arc<SlotState>) {
    trace!(slot = index, "Worker started");

    while let Ok(Start { job, token }) = start.recv() {
        if catch_unwind(AssertUnwindSafe(|| job.run(&token))).is_err() {
            error!(slot = index, "Job panicked");
        }
        *lock(&state.running) = None;
        state.busy.store(false, Ordering::Release);
    }

    trace!(slot = index, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::time::Duration;

    const LONG: Duration = Duration::from_secs(10);

    fn wait_idle(pool: &WorkerPool, expected: usize) {
        for _ in 0..500 {
            if pool.idle() == expected {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("pool never reached {expected} idle workers");
    }

    #[test]
    fn test_runs_job_and_frees_slot() {
        let pool = WorkerPool::new("test-worker", 2).unwrap();
        let (tx, rx) = unbounded();

        pool.submit(move |_: &CancelToken| {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        })
        .unwrap();

        let name = rx.recv_timeout(LONG).unwrap().unwrap();
        assert!(name.starts_with("test-worker-"));
        wait_idle(&pool, 2);
    }

    #[test]
    fn test_saturated_pool_rejects_instead_of_blocking() {
        let pool = WorkerPool::new("test-worker", 2).unwrap();
        let (release_tx, release_rx) = unbounded::<()>();

        for _ in 0..2 {
            let release = release_rx.clone();
            pool.submit(move |_: &CancelToken| {
                let _ = release.recv_timeout(LONG);
            })
            .unwrap();
        }

        let err = pool.submit(|_: &CancelToken| {}).unwrap_err();
        assert!(matches!(err, PoolError::Busy(2)));
        assert!(matches!(RoutingError::from(err), RoutingError::NotPossible(_)));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        wait_idle(&pool, 2);
        assert!(pool.submit(|_: &CancelToken| {}).is_ok());
    }

    #[test]
    fn test_cancel_stops_job_early() {
        let pool = WorkerPool::new("test-worker", 1).unwrap();
        let (tx, rx) = unbounded();

        let ticket = pool
            .submit(move |cancel: &CancelToken| {
                let mut steps = 0;
                while steps < 1000 && !cancel.wait(Duration::from_millis(5)) {
                    steps += 1;
                }
                tx.send((steps, cancel.is_cancelled())).unwrap();
            })
            .unwrap();

        thread::sleep(Duration::from_millis(20));
        assert!(pool.cancel(ticket));

        let (steps, cancelled) = rx.recv_timeout(LONG).unwrap();
        assert!(cancelled);
        assert!(steps < 1000);

        // Stale tickets are ignored once the job is gone
        wait_idle(&pool, 1);
        assert!(!pool.cancel(ticket));
    }

    #[test]
    fn test_stale_ticket_does_not_cancel_next_job() {
        let pool = WorkerPool::new("test-worker", 1).unwrap();
        let first = pool.submit(|_: &CancelToken| {}).unwrap();
        wait_idle(&pool, 1);

        let (tx, rx) = unbounded();
        let second = pool
            .submit(move |cancel: &CancelToken| {
                tx.send(cancel.wait(Duration::from_millis(50))).unwrap();
            })
            .unwrap();

        assert_eq!(first.slot, second.slot);
        assert!(!pool.cancel(first));
        assert!(!rx.recv_timeout(LONG).unwrap());
    }

    #[test]
    fn test_panicking_job_releases_slot() {
        let pool = WorkerPool::new("test-worker", 1).unwrap();
        pool.submit(|_: &CancelToken| panic!("job failure")).unwrap();
        wait_idle(&pool, 1);
        assert!(pool.submit(|_: &CancelToken| {}).is_ok());
    }

    #[test]
    fn test_drop_cancels_running_jobs() {
        let pool = WorkerPool::new("test-worker", 1).unwrap();
        let (tx, rx) = unbounded();
        pool.submit(move |cancel: &CancelToken| {
            tx.send(cancel.wait(LONG)).unwrap();
        })
        .unwrap();

        thread::sleep(Duration::from_millis(10));
        drop(pool);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }
}
