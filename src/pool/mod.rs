//! Keyed pool of idle workers.
//!
//! The pool holds slots per [`PoolKey`]. A slot carries either a live
//! worker or the error captured while constructing one; construction
//! failures are deferred and rethrown on the next checkout so every
//! construction attempt is eventually observed by some caller. Checkout is
//! self-replenishing: extracting a worker immediately triggers background
//! construction of a replacement for the same key.
//!
//! Bookkeeping sits behind a single coarse mutex; construction and
//! destruction always run outside of it.

pub mod factory;
pub mod key;
pub mod queue;

#[cfg(test)]
pub(crate) mod stub;

pub use factory::ProcessWorkerFactory;
pub use key::{ModuleSpec, PoolKey};
pub use queue::WorkerQueue;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WorkerError};
use crate::worker::WorkerOptions;

/// A worker as the pool sees it: configurable on checkout, closeable on
/// eviction. Shutdown failures are the implementation's to log; no caller
/// waits on them.
pub trait PooledWorker: Send + Sized + 'static {
    fn configure(
        &mut self,
        options: &WorkerOptions,
    ) -> impl Future<Output = Result<()>> + Send;

    fn shutdown(self) -> impl Future<Output = ()> + Send;
}

/// Construction strategy for pool slots.
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: PooledWorker;

    fn create(&self, key: &PoolKey) -> impl Future<Output = Result<Self::Worker>> + Send;
}

/// Pool tuning. `capacity` bounds the total number of slots (idle plus
/// handed out); 0 disables pooling entirely and every checkout constructs
/// directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub capacity: usize,
    pub idle_expiration: Duration,
    pub sweep_interval: Duration,
    pub cancel_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            idle_expiration: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            cancel_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Exactly one of `worker` or `error` is set while a slot sits idle.
struct Slot<W> {
    worker: Option<W>,
    error: Option<WorkerError>,
    idle_since: Instant,
}

impl<W> Slot<W> {
    fn filled(result: Result<W>) -> Self {
        let (worker, error) = match result {
            Ok(worker) => (Some(worker), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            worker,
            error,
            idle_since: Instant::now(),
        }
    }

    /// Extract the worker or rethrow the captured construction error.
    fn take(&mut self) -> Result<W> {
        if let Some(worker) = self.worker.take() {
            return Ok(worker);
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Err(WorkerError::Construction("slot already emptied".into())),
        }
    }
}

struct Waiter<W> {
    id: u64,
    tx: oneshot::Sender<Slot<W>>,
}

struct Inner<W> {
    idle: HashMap<PoolKey, VecDeque<Slot<W>>>,
    waiters: HashMap<PoolKey, VecDeque<Waiter<W>>>,
    /// Idle slots plus slots currently handed out or replenishing.
    total: usize,
    closed: bool,
}

impl<W> Inner<W> {
    fn new() -> Self {
        Self {
            idle: HashMap::new(),
            waiters: HashMap::new(),
            total: 0,
            closed: false,
        }
    }
}

enum Plan<W> {
    Got(Slot<W>),
    Build,
    Wait(oneshot::Receiver<Slot<W>>, u64),
}

/// Keyed, self-replenishing worker pool.
pub struct SlotPool<F: WorkerFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    inner: Arc<StdMutex<Inner<F::Worker>>>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    waiter_seq: AtomicU64,
}

impl<F: WorkerFactory> SlotPool<F> {
    pub fn new(factory: Arc<F>, config: PoolConfig) -> Self {
        let inner: Arc<StdMutex<Inner<F::Worker>>> = Arc::new(StdMutex::new(Inner::new()));
        let sweeper = if config.capacity > 0 {
            Some(spawn_sweeper(
                inner.clone(),
                config.sweep_interval,
                config.idle_expiration,
            ))
        } else {
            None
        };
        Self {
            factory,
            config,
            inner,
            sweeper: StdMutex::new(sweeper),
            waiter_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of idle slots across all keys. Monitoring only.
    pub fn idle_count(&self) -> usize {
        self.lock_inner().idle.values().map(VecDeque::len).sum()
    }

    /// Total slots (idle plus handed out). Monitoring only.
    pub fn slot_count(&self) -> usize {
        self.lock_inner().total
    }

    /// Take the next worker for `key`, configured according to `options`.
    ///
    /// Blocks until a slot is available, polling `cancel` once per
    /// configured interval. The returned worker is owned by the caller and
    /// must be shut down after use; a replacement slot is constructed in
    /// the background as soon as one is extracted here.
    pub async fn checkout(
        &self,
        key: &PoolKey,
        options: &WorkerOptions,
        cancel: &CancellationToken,
    ) -> Result<F::Worker> {
        if self.config.capacity == 0 {
            // No slots to go through: construct directly, no recovery.
            let mut worker = self.factory.create(key).await?;
            if let Err(e) = worker.configure(options).await {
                worker.shutdown().await;
                return Err(e);
            }
            return Ok(worker);
        }

        let mut slot = self.obtain_slot(key, cancel).await?;
        let extracted = slot.take();
        self.spawn_replenish(key.clone());
        let worker = extracted?;
        self.configure_or_recover(key, worker, options).await
    }

    /// Drain and close every idle slot for every key, without replacement.
    /// Used when the external execution environment changes.
    pub fn invalidate_all(&self) {
        let drained = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let mut drained = Vec::new();
            for (_, mut slots) in inner.idle.drain() {
                while let Some(mut slot) = slots.pop_front() {
                    inner.total -= 1;
                    if let Ok(worker) = slot.take() {
                        drained.push(worker);
                    }
                }
            }
            drained
        };
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "invalidating all idle workers");
        }
        for worker in drained {
            tokio::spawn(worker.shutdown());
        }
    }

    /// Close the pool: stop the sweeper, refuse further checkouts, wake all
    /// waiters and shut down every idle worker.
    pub async fn close(&self) {
        if let Some(sweeper) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            sweeper.abort();
        }
        let drained = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            inner.closed = true;
            // Dropping the senders wakes every waiter with an error.
            inner.waiters.clear();
            let mut drained = Vec::new();
            for (_, mut slots) in inner.idle.drain() {
                while let Some(mut slot) = slots.pop_front() {
                    inner.total -= 1;
                    if let Ok(worker) = slot.take() {
                        drained.push(worker);
                    }
                }
            }
            drained
        };
        for worker in drained {
            worker.shutdown().await;
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<F::Worker>> {
        self.inner.lock().expect("pool lock poisoned")
    }

    async fn obtain_slot(
        &self,
        key: &PoolKey,
        cancel: &CancellationToken,
    ) -> Result<Slot<F::Worker>> {
        let plan = {
            let mut inner = self.lock_inner();
            if inner.closed {
                return Err(pool_closed());
            }
            if let Some(slot) = inner.idle.get_mut(key).and_then(VecDeque::pop_front) {
                Plan::Got(slot)
            } else if inner.total < self.config.capacity {
                inner.total += 1;
                Plan::Build
            } else {
                let (tx, rx) = oneshot::channel();
                let id = self.waiter_seq.fetch_add(1, Ordering::Relaxed);
                inner
                    .waiters
                    .entry(key.clone())
                    .or_default()
                    .push_back(Waiter { id, tx });
                Plan::Wait(rx, id)
            }
        };
        match plan {
            Plan::Got(slot) => Ok(slot),
            Plan::Build => Ok(Slot::filled(self.factory.create(key).await)),
            Plan::Wait(rx, id) => self.wait_for_slot(key, rx, id, cancel).await,
        }
    }

    /// FIFO wait for a slot, re-polling cancellation and freed capacity at
    /// the configured interval. The timeout is purely a poll trigger, never
    /// a deadline.
    async fn wait_for_slot(
        &self,
        key: &PoolKey,
        mut rx: oneshot::Receiver<Slot<F::Worker>>,
        waiter_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Slot<F::Worker>> {
        loop {
            match tokio::time::timeout(self.config.cancel_poll_interval, &mut rx).await {
                Ok(Ok(slot)) => return Ok(slot),
                Ok(Err(_)) => return Err(pool_closed()),
                Err(_) => {}
            }

            // A handoff may have raced the timeout.
            if let Ok(slot) = rx.try_recv() {
                return Ok(slot);
            }

            if cancel.is_cancelled() {
                if !self.remove_waiter(key, waiter_id) {
                    // Already served: put the slot back rather than leak it.
                    if let Ok(slot) = rx.try_recv() {
                        self.release_slot(key, slot);
                    }
                }
                return Err(WorkerError::Canceled);
            }

            let build = {
                let mut inner = self.lock_inner();
                if inner.closed {
                    remove_waiter_locked(&mut inner, key, waiter_id);
                    return Err(pool_closed());
                }
                if let Some(slot) = inner.idle.get_mut(key).and_then(VecDeque::pop_front) {
                    remove_waiter_locked(&mut inner, key, waiter_id);
                    return Ok(slot);
                }
                if inner.total < self.config.capacity {
                    inner.total += 1;
                    remove_waiter_locked(&mut inner, key, waiter_id);
                    true
                } else {
                    false
                }
            };
            if build {
                return Ok(Slot::filled(self.factory.create(key).await));
            }
        }
    }

    fn remove_waiter(&self, key: &PoolKey, waiter_id: u64) -> bool {
        let mut inner = self.lock_inner();
        remove_waiter_locked(&mut inner, key, waiter_id)
    }

    /// Hand a slot to the oldest waiter for `key`, or park it idle.
    fn release_slot(&self, key: &PoolKey, slot: Slot<F::Worker>) {
        let mut inner = self.lock_inner();
        deliver_slot(&mut inner, key, slot);
    }

    /// Background construction of a replacement slot for `key`.
    fn spawn_replenish(&self, key: PoolKey) {
        let factory = self.factory.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = factory.create(&key).await;
            let mut slot = Slot::filled(result);
            let worker = {
                let mut guard = inner.lock().expect("pool lock poisoned");
                if guard.closed {
                    guard.total -= 1;
                    slot.take().ok()
                } else {
                    deliver_slot(&mut guard, &key, slot);
                    None
                }
            };
            // The pool went away while we were constructing.
            if let Some(worker) = worker {
                worker.shutdown().await;
            }
        });
    }

    /// Apply the caller's configuration, recovering exactly once when the
    /// pooled worker died between enqueue and checkout. A second failure
    /// surfaces both errors.
    async fn configure_or_recover(
        &self,
        key: &PoolKey,
        mut worker: F::Worker,
        options: &WorkerOptions,
    ) -> Result<F::Worker> {
        let original = match worker.configure(options).await {
            Ok(()) => return Ok(worker),
            Err(e) => e,
        };
        tracing::warn!(
            error = %original,
            "configuring pooled worker failed, building a fresh one"
        );
        worker.shutdown().await;
        match self.factory.create(key).await {
            Ok(mut fresh) => match fresh.configure(options).await {
                Ok(()) => Ok(fresh),
                Err(retry) => {
                    fresh.shutdown().await;
                    Err(WorkerError::RecoveryFailed {
                        original: Box::new(original),
                        retry: Box::new(retry),
                    })
                }
            },
            Err(retry) => Err(WorkerError::RecoveryFailed {
                original: Box::new(original),
                retry: Box::new(retry),
            }),
        }
    }
}

impl<F: WorkerFactory> Drop for SlotPool<F> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            sweeper.abort();
        }
    }
}

fn pool_closed() -> WorkerError {
    WorkerError::Construction("worker pool is closed".into())
}

fn remove_waiter_locked<W>(inner: &mut Inner<W>, key: &PoolKey, waiter_id: u64) -> bool {
    if let Some(queue) = inner.waiters.get_mut(key) {
        let before = queue.len();
        queue.retain(|w| w.id != waiter_id);
        return queue.len() != before;
    }
    false
}

fn deliver_slot<W>(inner: &mut Inner<W>, key: &PoolKey, mut slot: Slot<W>) {
    loop {
        let waiter = inner.waiters.get_mut(key).and_then(VecDeque::pop_front);
        match waiter {
            Some(waiter) => match waiter.tx.send(slot) {
                Ok(()) => return,
                // Receiver gave up; serve the next in line.
                Err(returned) => slot = returned,
            },
            None => {
                slot.idle_since = Instant::now();
                inner.idle.entry(key.clone()).or_default().push_back(slot);
                return;
            }
        }
    }
}

fn spawn_sweeper<W: PooledWorker>(
    inner: Arc<StdMutex<Inner<W>>>,
    sweep_interval: Duration,
    idle_expiration: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let expired = {
                let mut guard = inner.lock().expect("pool lock poisoned");
                let inner = &mut *guard;
                let now = Instant::now();
                let mut expired = Vec::new();
                for slots in inner.idle.values_mut() {
                    loop {
                        let is_expired = matches!(
                            slots.front(),
                            Some(slot)
                                if now.duration_since(slot.idle_since) >= idle_expiration
                        );
                        if !is_expired {
                            break;
                        }
                        if let Some(mut slot) = slots.pop_front() {
                            inner.total -= 1;
                            if let Ok(worker) = slot.take() {
                                expired.push(worker);
                            }
                        }
                    }
                }
                inner.idle.retain(|_, slots| !slots.is_empty());
                expired
            };
            if !expired.is_empty() {
                tracing::debug!(count = expired.len(), "evicting expired idle workers");
            }
            for worker in expired {
                worker.shutdown().await;
            }
        }
    })
}
