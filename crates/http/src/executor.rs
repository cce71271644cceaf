//! Named, bounded executor pools.
//!
//! Each server owns five pools. On the tokio runtime a "pool" is an
//! admission gate: a semaphore bounds how many tasks of that kind run at
//! once, a counter bounds how many may wait for a slot, and the overflow
//! policy decides what happens beyond that. The observable contract is the
//! classic one: at most `running_cap` running, at most `queue_cap` queued,
//! overflow either rejected or run regardless.
//!
//! - **service** — P running, Q queued, overflow rejected (the engine
//!   answers `503` with `Retry-After`).
//! - **keepAlive** — P×4 running, no queue, overflow rejected (the engine
//!   ends the idle connection quietly).
//! - **upgrade** — P×2 running, no queue, overflow rejected.
//! - **encoder** — P×2 running, no queue, overflow *runs anyway* with a
//!   warning: a dropped encoder task could stall a response forever.
//! - **closer** — P running, P×4 queued, overflow runs anyway.
//!
//! All spawned work is tracked by a per-server [`TaskTracker`] (the
//! named-thread-group analog) so the server can shut the whole set down
//! together, closing the pools in a fixed order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::warn;

pub(crate) const KEEP_ALIVE_FACTOR: usize = 4;
pub(crate) const UPGRADE_FACTOR: usize = 2;
pub(crate) const ENCODER_FACTOR: usize = 2;
pub(crate) const CLOSER_QUEUE_FACTOR: usize = 4;

/// A task was refused by a pool whose overflow policy rejects.
#[derive(Debug, Error)]
#[error("executor pool '{pool}' rejected the task")]
pub struct Rejected {
    pool: &'static str,
}

impl Rejected {
    pub fn pool(&self) -> &'static str {
        self.pool
    }
}

/// A slot in a pool, held for the duration of the admitted work.
///
/// Overflow admissions on never-reject pools hold no permit.
#[derive(Debug)]
pub struct Admission {
    permit: Option<OwnedSemaphorePermit>,
}

impl Admission {
    fn overflow() -> Self {
        Self { permit: None }
    }

    #[cfg(test)]
    fn is_pooled(&self) -> bool {
        self.permit.is_some()
    }
}

/// One named, bounded pool.
#[derive(Debug)]
pub struct Pool {
    name: &'static str,
    server_id: usize,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_cap: usize,
    never_reject: bool,
}

impl Pool {
    fn new(name: &'static str, server_id: usize, running_cap: usize, queue_cap: usize, never_reject: bool) -> Self {
        Self {
            name,
            server_id,
            semaphore: Arc::new(Semaphore::new(running_cap)),
            waiting: AtomicUsize::new(0),
            queue_cap,
            never_reject,
        }
    }

    /// Immediate admission: a free slot or the overflow policy, never a wait.
    pub fn try_admit(&self) -> Result<Admission, Rejected> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(Admission { permit: Some(permit) }),
            Err(_) => self.overflow(),
        }
    }

    /// Admission that may wait in the pool's queue for a free slot.
    pub async fn admit(&self) -> Result<Admission, Rejected> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(Admission { permit: Some(permit) });
        }

        if self.waiting.fetch_add(1, Ordering::AcqRel) >= self.queue_cap {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
            return self.overflow();
        }

        let acquired = Arc::clone(&self.semaphore).acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);

        match acquired {
            Ok(permit) => Ok(Admission { permit: Some(permit) }),
            // pool closed while waiting
            Err(_) => self.overflow(),
        }
    }

    fn overflow(&self) -> Result<Admission, Rejected> {
        if self.never_reject {
            warn!(pool = self.name, server = self.server_id, "pool exhausted, running task unpooled");
            Ok(Admission::overflow())
        } else {
            Err(Rejected { pool: self.name })
        }
    }

    /// Stops handing out slots; waiting `admit` calls resolve per the
    /// overflow policy.
    fn close(&self) {
        self.semaphore.close();
    }
}

/// The five pools attached to one server instance.
#[derive(Debug)]
pub struct ExecutorSet {
    pub service: Pool,
    pub keep_alive: Pool,
    pub upgrade: Pool,
    pub encoder: Pool,
    pub closer: Pool,
    tracker: TaskTracker,
}

impl ExecutorSet {
    pub fn new(server_id: usize, pool_size: usize, queue_size: usize) -> Self {
        Self {
            service: Pool::new("service", server_id, pool_size, queue_size, false),
            keep_alive: Pool::new("keepAlive", server_id, pool_size * KEEP_ALIVE_FACTOR, 0, false),
            upgrade: Pool::new("upgrade", server_id, pool_size * UPGRADE_FACTOR, 0, false),
            encoder: Pool::new("encoder", server_id, pool_size * ENCODER_FACTOR, 0, true),
            closer: Pool::new("closer", server_id, pool_size, pool_size * CLOSER_QUEUE_FACTOR, true),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawns tracked work that holds its admission until completion.
    pub fn spawn<F>(&self, admission: Admission, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            let _admission = admission;
            task.await;
        })
    }

    /// Spawns tracked work outside any pool (the accept loop and the
    /// connection drivers between their pooled steps).
    pub fn spawn_unpooled<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Closes all pools in the fixed shutdown order, then stops accepting
    /// new tracked tasks.
    pub fn shutdown(&self) {
        for pool in [&self.keep_alive, &self.upgrade, &self.encoder, &self.service, &self.closer] {
            pool.close();
        }
        self.tracker.close();
    }

    /// Waits until every tracked task has finished.
    pub async fn wait_idle(&self) {
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn service_pool_gives_back_slots() {
        let executors = ExecutorSet::new(0, 1, 1);

        let slot = executors.service.try_admit().unwrap();
        assert!(executors.service.try_admit().is_err());

        drop(slot);
        assert!(executors.service.try_admit().is_ok());
    }

    #[tokio::test]
    async fn queue_overflow_rejects() {
        let executors = Arc::new(ExecutorSet::new(0, 1, 1));

        let slot = executors.service.admit().await.unwrap();

        let waiting = {
            let executors = Arc::clone(&executors);
            tokio::spawn(async move { executors.service.admit().await.is_ok() })
        };
        // let the waiter enqueue
        tokio::time::sleep(Duration::from_millis(20)).await;

        // running slot taken, queue full: the next admission is rejected
        assert!(executors.service.admit().await.is_err());

        drop(slot);
        assert!(waiting.await.unwrap());
    }

    #[tokio::test]
    async fn encoder_pool_never_rejects() {
        let executors = ExecutorSet::new(0, 1, 0);

        let held: Vec<_> = (0..ENCODER_FACTOR).map(|_| executors.encoder.try_admit().unwrap()).collect();

        // beyond capacity the encoder pool still admits, without a permit
        let overflow = executors.encoder.try_admit().unwrap();
        assert!(!overflow.is_pooled());

        drop(held);
        assert!(executors.encoder.try_admit().unwrap().is_pooled());
    }

    #[tokio::test]
    async fn keep_alive_pool_has_no_queue() {
        let executors = ExecutorSet::new(0, 1, 4);

        let held: Vec<_> = (0..KEEP_ALIVE_FACTOR).map(|_| executors.keep_alive.try_admit().unwrap()).collect();
        assert!(executors.keep_alive.try_admit().is_err());
        drop(held);
    }

    #[tokio::test]
    async fn shutdown_resolves_waiters() {
        let executors = Arc::new(ExecutorSet::new(0, 1, 2));
        let slot = executors.service.admit().await.unwrap();

        let waiting = {
            let executors = Arc::clone(&executors);
            tokio::spawn(async move { executors.service.admit().await.is_err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        executors.shutdown();
        assert!(waiting.await.unwrap());
        drop(slot);
    }
}
