// SPDX-License-Identifier: GPL-3.0-only

//! Bounded pool of interactive workers
//!
//! Workers are idle (in the free set), working (checked out) or dead
//! (terminated and forgotten). `idle + working` never exceeds the maximum;
//! a slot reserved for a worker that is still launching counts as working.
//!
//! When the pool is saturated, `acquire` registers a waiter and parks. Every
//! release hands its result to exactly one registered waiter: the washed
//! worker itself, or, if the worker had to be evicted, its free slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hostdisk_contracts::DiskError;
use hostdisk_types::GuestfsConfig;

use crate::fish::Guestfish;

#[async_trait]
pub trait PoolWorker: Send + Sync + 'static {
    fn id(&self) -> u64;

    fn is_alive(&self) -> bool;

    /// Restore the worker to the state of a fresh one
    async fn wash(&self) -> Result<(), DiskError>;

    async fn terminate(&self);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    type Worker: PoolWorker;

    async fn launch(&self, id: u64) -> Result<Self::Worker, DiskError>;
}

enum Handoff<W> {
    Worker(Arc<W>),
    /// Permission to launch a replacement
    Slot,
}

struct IdleWorker<W> {
    worker: Arc<W>,
    since: Instant,
}

struct PoolState<W> {
    idle: Vec<IdleWorker<W>>,
    working: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<W>>>,
    last_alloc: Instant,
    next_id: u64,
    closed: bool,
}

enum Checkout<W> {
    Ready(Arc<W>),
    Launch(u64),
    Wait(oneshot::Receiver<Handoff<W>>),
}

pub struct WorkerPool<L: WorkerLauncher> {
    launcher: L,
    maximum: usize,
    attempts: usize,
    state: Mutex<PoolState<L::Worker>>,
}

impl<L: WorkerLauncher> WorkerPool<L> {
    pub fn new(launcher: L, maximum: usize, attempts: usize) -> Self {
        Self {
            launcher,
            maximum: maximum.max(1),
            attempts: attempts.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                working: 0,
                waiters: VecDeque::new(),
                last_alloc: Instant::now(),
                next_id: 1,
                closed: false,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<L::Worker>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn maximum(&self) -> usize {
        self.maximum
    }

    /// Idle workers ready for reuse
    pub fn happy_count(&self) -> usize {
        self.lock_state().idle.len()
    }

    /// Checked-out workers, including slots still launching
    pub fn working_count(&self) -> usize {
        self.lock_state().working
    }

    /// Check out a live worker, waiting while the pool is saturated
    pub async fn acquire(self: &Arc<Self>) -> Result<Arc<L::Worker>, DiskError> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            let worker = match self.checkout().await {
                Ok(worker) => worker,
                Err(error) if self.is_closed() => return Err(error),
                Err(error) => {
                    warn!(attempt, "worker launch failed: {error}");
                    last_error = Some(error);
                    continue;
                }
            };

            if worker.is_alive() {
                debug!(worker = worker.id(), "worker acquired");
                return Ok(worker);
            }

            warn!(worker = worker.id(), attempt, "acquired a dead worker, retrying");
            let pool = self.clone();
            tokio::spawn(async move { pool.release(worker).await });
        }

        let detail = last_error
            .map(|error| format!(": {}", error.message))
            .unwrap_or_default();
        Err(DiskError::workers_died(format!(
            "no live worker after {} attempts{detail}",
            self.attempts
        )))
    }

    async fn checkout(self: &Arc<Self>) -> Result<Arc<L::Worker>, DiskError> {
        let next = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(DiskError::unavailable("worker pool is shut down"));
            }
            state.last_alloc = Instant::now();
            if let Some(idle) = state.idle.pop() {
                state.working += 1;
                Checkout::Ready(idle.worker)
            } else if state.idle.len() + state.working < self.maximum {
                state.working += 1;
                Checkout::Launch(Self::take_id(&mut state))
            } else {
                let (sender, receiver) = oneshot::channel();
                state.waiters.push_back(sender);
                Checkout::Wait(receiver)
            }
        };

        match next {
            Checkout::Ready(worker) => Ok(worker),
            Checkout::Launch(id) => self.launch_into_slot(id).await,
            Checkout::Wait(receiver) => {
                debug!("worker pool saturated, waiting for a release");
                let mut waiter = Waiter {
                    pool: self.clone(),
                    receiver: Some(receiver),
                };
                match waiter.wait().await {
                    Some(Handoff::Worker(worker)) => Ok(worker),
                    Some(Handoff::Slot) => {
                        let id = Self::take_id(&mut self.lock_state());
                        self.launch_into_slot(id).await
                    }
                    None => Err(DiskError::unavailable("worker pool is shut down")),
                }
            }
        }
    }

    fn take_id(state: &mut PoolState<L::Worker>) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Launch into an already reserved slot, giving the slot back on failure
    async fn launch_into_slot(&self, id: u64) -> Result<Arc<L::Worker>, DiskError> {
        match self.launcher.launch(id).await {
            Ok(worker) => Ok(Arc::new(worker)),
            Err(error) => {
                self.free_slot();
                Err(error)
            }
        }
    }

    /// Return a worker; it is washed first and evicted if that fails
    pub async fn release(&self, worker: Arc<L::Worker>) {
        let clean = !self.is_closed()
            && worker.is_alive()
            && match worker.wash().await {
                Ok(()) => true,
                Err(error) => {
                    warn!(worker = worker.id(), "wash failed, evicting worker: {error}");
                    false
                }
            };

        if !clean {
            worker.terminate().await;
            self.free_slot();
            return;
        }
        self.hand_back(worker);
    }

    fn hand_back(&self, worker: Arc<L::Worker>) {
        let mut state = self.lock_state();
        let mut handoff = Handoff::Worker(worker);
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(handoff) {
                Ok(()) => return,
                Err(returned) => handoff = returned,
            }
        }

        state.working = state.working.saturating_sub(1);
        if let Handoff::Worker(worker) = handoff {
            debug!(worker = worker.id(), "worker back to idle");
            state.idle.push(IdleWorker {
                worker,
                since: Instant::now(),
            });
        }
    }

    /// A checked-out worker is gone; pass its slot to a waiter or free it
    fn free_slot(&self) {
        let mut state = self.lock_state();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(Handoff::Slot).is_ok() {
                return;
            }
        }
        state.working = state.working.saturating_sub(1);
    }

    /// Terminate every idle worker once nothing was allocated for `idle_for`
    pub async fn recycle_idle(&self, idle_for: Duration) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock_state();
            if state.last_alloc.elapsed() < idle_for {
                return 0;
            }
            state.idle.drain(..).collect()
        };

        for idle in &drained {
            debug!(
                worker = idle.worker.id(),
                idle_secs = idle.since.elapsed().as_secs(),
                "recycling idle worker"
            );
            idle.worker.terminate().await;
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "idle workers recycled");
        }
        drained.len()
    }

    /// Periodic idle recycling; ends when the pool is dropped
    pub fn spawn_idle_sweeper(self: &Arc<Self>, interval: Duration, idle_for: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.recycle_idle(idle_for).await;
            }
        })
    }

    /// Refuse new checkouts and terminate idle workers; checked-out ones
    /// are terminated as they are released
    pub async fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut state = self.lock_state();
            state.closed = true;
            state.waiters.clear();
            state.idle.drain(..).collect()
        };
        for idle in drained {
            idle.worker.terminate().await;
        }
        info!("worker pool shut down");
    }
}

/// A parked `acquire`; a handoff that arrives after it is abandoned goes back to the pool
struct Waiter<L: WorkerLauncher> {
    pool: Arc<WorkerPool<L>>,
    receiver: Option<oneshot::Receiver<Handoff<L::Worker>>>,
}

impl<L: WorkerLauncher> Waiter<L> {
    async fn wait(&mut self) -> Option<Handoff<L::Worker>> {
        let receiver = self.receiver.as_mut()?;
        let handoff = receiver.await.ok();
        self.receiver = None;
        handoff
    }
}

impl<L: WorkerLauncher> Drop for Waiter<L> {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        receiver.close();
        match receiver.try_recv() {
            Ok(Handoff::Worker(worker)) => self.pool.hand_back(worker),
            Ok(Handoff::Slot) => self.pool.free_slot(),
            Err(_) => {}
        }
    }
}

/// Starts guestfish workers from configuration
pub struct GuestfishLauncher {
    config: GuestfsConfig,
}

impl GuestfishLauncher {
    pub fn new(config: GuestfsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for GuestfishLauncher {
    type Worker = Guestfish;

    async fn launch(&self, id: u64) -> Result<Guestfish, DiskError> {
        Guestfish::start(&self.config, id).await
    }
}

#[async_trait]
impl PoolWorker for Guestfish {
    fn id(&self) -> u64 {
        Guestfish::id(self)
    }

    fn is_alive(&self) -> bool {
        Guestfish::is_alive(self)
    }

    async fn wash(&self) -> Result<(), DiskError> {
        if self.label().is_empty() {
            return Ok(());
        }
        self.umount_all().await?;
        self.remove_drive().await
    }

    async fn terminate(&self) {
        Guestfish::terminate(self).await
    }
}

pub type GuestfsPool = WorkerPool<GuestfishLauncher>;

impl GuestfsPool {
    pub fn from_config(config: &GuestfsConfig) -> Self {
        WorkerPool::new(
            GuestfishLauncher::new(config.clone()),
            config.maximum,
            config.acquire_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use hostdisk_contracts::DiskErrorKind;

    #[derive(Debug, Default)]
    struct FakeWorker {
        id: u64,
        dead: AtomicBool,
        dirty: AtomicBool,
        wash_fails: AtomicBool,
        terminated: AtomicBool,
    }

    #[async_trait]
    impl PoolWorker for FakeWorker {
        fn id(&self) -> u64 {
            self.id
        }

        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst) && !self.terminated.load(Ordering::SeqCst)
        }

        async fn wash(&self) -> Result<(), DiskError> {
            if self.wash_fails.load(Ordering::SeqCst) {
                return Err(DiskError::command_failed("remove-drive", "busy"));
            }
            self.dirty.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launched: AtomicUsize,
        born_dead: bool,
    }

    #[async_trait]
    impl WorkerLauncher for Arc<FakeLauncher> {
        type Worker = FakeWorker;

        async fn launch(&self, id: u64) -> Result<FakeWorker, DiskError> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(FakeWorker {
                id,
                dead: AtomicBool::new(self.born_dead),
                ..FakeWorker::default()
            })
        }
    }

    fn pool(maximum: usize, born_dead: bool) -> (Arc<WorkerPool<Arc<FakeLauncher>>>, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher {
            born_dead,
            ..FakeLauncher::default()
        });
        (Arc::new(WorkerPool::new(launcher.clone(), maximum, 3)), launcher)
    }

    #[tokio::test]
    async fn saturated_acquire_waits_for_a_release() {
        let (pool, launcher) = pool(1, false);
        let first = pool.acquire().await.unwrap();

        let started = Instant::now();
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());
        pool.release(first.clone()).await;

        let second = waiting.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(second.id(), first.id());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);
        assert_eq!(pool.working_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn created_workers_never_exceed_the_maximum() {
        let (pool, launcher) = pool(2, false);
        let held = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let held = held.clone();
            tasks.push(tokio::spawn(async move {
                let worker = pool.acquire().await.unwrap();
                assert!(held.fetch_add(1, Ordering::SeqCst) < 2);
                tokio::time::sleep(Duration::from_millis(5)).await;
                held.fetch_sub(1, Ordering::SeqCst);
                pool.release(worker).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(launcher.launched.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.working_count(), 0);
        assert_eq!(pool.happy_count(), launcher.launched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_wash_evicts_the_worker() {
        let (pool, launcher) = pool(1, false);
        let worker = pool.acquire().await.unwrap();
        worker.dirty.store(true, Ordering::SeqCst);
        worker.wash_fails.store(true, Ordering::SeqCst);

        pool.release(worker.clone()).await;

        assert!(worker.terminated.load(Ordering::SeqCst));
        assert_eq!(pool.happy_count(), 0);
        assert_eq!(pool.working_count(), 0);

        let replacement = pool.acquire().await.unwrap();
        assert_ne!(replacement.id(), worker.id());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn washed_worker_returns_clean() {
        let (pool, _) = pool(1, false);
        let worker = pool.acquire().await.unwrap();
        worker.dirty.store(true, Ordering::SeqCst);

        pool.release(worker.clone()).await;

        assert_eq!(pool.happy_count(), 1);
        assert!(!worker.dirty.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn eviction_hands_the_slot_to_a_waiter() {
        let (pool, launcher) = pool(1, false);
        let first = pool.acquire().await.unwrap();
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        first.wash_fails.store(true, Ordering::SeqCst);
        pool.release(first.clone()).await;

        let second = waiting.await.unwrap().unwrap();
        assert_ne!(second.id(), first.id());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 2);
        assert_eq!(pool.working_count(), 1);
    }

    #[tokio::test]
    async fn repeatedly_dead_workers_fail_fast() {
        let (pool, launcher) = pool(3, true);

        let error = pool.acquire().await.unwrap_err();

        assert_eq!(error.kind, DiskErrorKind::WorkersDied);
        assert!(error.is_resource_exhaustion());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_swallow_the_worker() {
        let (pool, _) = pool(1, false);
        let worker = pool.acquire().await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(abandoned.is_err());

        pool.release(worker).await;
        assert_eq!(pool.happy_count(), 1);
        assert_eq!(pool.working_count(), 0);
    }

    #[tokio::test]
    async fn idle_workers_are_recycled_after_quiet_period() {
        let (pool, _) = pool(2, false);
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        pool.release(first.clone()).await;
        pool.release(second.clone()).await;

        assert_eq!(pool.recycle_idle(Duration::from_secs(600)).await, 0);
        assert_eq!(pool.happy_count(), 2);

        assert_eq!(pool.recycle_idle(Duration::ZERO).await, 2);
        assert_eq!(pool.happy_count(), 0);
        assert!(first.terminated.load(Ordering::SeqCst));
        assert!(second.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_checkouts() {
        let (pool, _) = pool(2, false);
        let held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        pool.release(idle.clone()).await;

        pool.shutdown().await;

        assert!(idle.terminated.load(Ordering::SeqCst));
        assert_eq!(pool.acquire().await.unwrap_err().kind, DiskErrorKind::Unavailable);

        pool.release(held.clone()).await;
        assert!(held.terminated.load(Ordering::SeqCst));
        assert_eq!(pool.working_count(), 0);
    }

    #[tokio::test]
    async fn guestfish_pool_reuses_a_washed_worker() {
        let pool = Arc::new(GuestfsPool::from_config(&GuestfsConfig {
            maximum: 1,
            ..crate::fish::tests::fake_config()
        }));

        let fish = pool.acquire().await.unwrap();
        fish.add_drive("/data/vm.qcow2", "pooltest", true).await.unwrap();
        pool.release(fish.clone()).await;

        assert_eq!(fish.label(), "");
        assert_eq!(pool.happy_count(), 1);
        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), fish.id());

        pool.release(again).await;
        pool.shutdown().await;
        assert!(!fish.is_alive());
    }
}
