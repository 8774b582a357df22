//! Application-wide pool façade.
//!
//! Holds the active [`SlotPool`] behind a lock so reconfiguration can swap
//! in a freshly built pool atomically instead of mutating a live one.
//! Hosts construct exactly one queue, keep it in application state and
//! drive it through an explicit init / reconfigure / invalidate / teardown
//! lifecycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{PoolConfig, PoolKey, SlotPool, WorkerFactory};
use crate::error::Result;
use crate::worker::WorkerOptions;

pub struct WorkerQueue<F: WorkerFactory> {
    factory: Arc<F>,
    pool: tokio::sync::RwLock<Arc<SlotPool<F>>>,
}

impl<F: WorkerFactory> WorkerQueue<F> {
    pub fn new(factory: Arc<F>, config: PoolConfig) -> Self {
        let pool = Arc::new(SlotPool::new(factory.clone(), config));
        Self {
            factory,
            pool: tokio::sync::RwLock::new(pool),
        }
    }

    /// Checkout from the currently active pool. In-flight checkouts keep
    /// their pool alive even across a concurrent reconfigure.
    pub async fn checkout(
        &self,
        key: &PoolKey,
        options: &WorkerOptions,
        cancel: &CancellationToken,
    ) -> Result<F::Worker> {
        let pool = self.pool.read().await.clone();
        pool.checkout(key, options, cancel).await
    }

    /// Apply new tuning by atomically replacing the pool: the old pool is
    /// closed (idle workers included) and a fresh one takes its place.
    /// Unchanged settings are a no-op; reconfiguration is rare and never
    /// mutates a live pool.
    pub async fn reconfigure(&self, config: PoolConfig) {
        {
            let current = self.pool.read().await;
            if *current.config() == config {
                return;
            }
        }
        tracing::info!(
            capacity = config.capacity,
            idle_expiration_secs = config.idle_expiration.as_secs(),
            "reconfiguring worker queue"
        );
        let fresh = Arc::new(SlotPool::new(self.factory.clone(), config));
        let old = {
            let mut guard = self.pool.write().await;
            std::mem::replace(&mut *guard, fresh)
        };
        old.close().await;
    }

    /// Drop every idle worker for every key. Called when the external
    /// execution environment changes; scoping invalidation to affected
    /// keys is deliberately not attempted.
    pub async fn invalidate_all(&self) {
        self.pool.read().await.invalidate_all();
    }

    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }

    pub async fn idle_count(&self) -> usize {
        self.pool.read().await.idle_count()
    }

    pub async fn slot_count(&self) -> usize {
        self.pool.read().await.slot_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::stub::{StubFactory, StubState};
    use crate::pool::ModuleSpec;
    use crate::worker::{BackendKind, LaunchSpec, WorkerOptions};
    use std::time::Duration;

    fn queue_with(state: &Arc<StubState>, capacity: usize) -> WorkerQueue<StubFactory> {
        WorkerQueue::new(
            Arc::new(StubFactory {
                state: state.clone(),
            }),
            PoolConfig {
                capacity,
                cancel_poll_interval: Duration::from_millis(50),
                ..PoolConfig::default()
            },
        )
    }

    fn test_key() -> PoolKey {
        PoolKey::new(
            LaunchSpec::new("python3"),
            BackendKind::Current,
            vec![ModuleSpec::new("numpy")],
            vec![],
        )
    }

    #[tokio::test]
    async fn reconfigure_swaps_the_pool_and_closes_the_old_one() {
        let state = StubState::new();
        let queue = queue_with(&state, 2);
        let key = test_key();
        let cancel = CancellationToken::new();

        let worker = queue
            .checkout(&key, &WorkerOptions::default(), &cancel)
            .await
            .unwrap();
        drop(worker);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.idle_count().await, 1);

        queue
            .reconfigure(PoolConfig {
                capacity: 1,
                cancel_poll_interval: Duration::from_millis(50),
                ..PoolConfig::default()
            })
            .await;

        // Old pool's idle worker was shut down with the swap.
        assert_eq!(queue.idle_count().await, 0);
        assert!(state.shutdowns.load(std::sync::atomic::Ordering::SeqCst) >= 1);

        // The fresh pool serves normally.
        let worker = queue
            .checkout(&key, &WorkerOptions::default(), &cancel)
            .await
            .unwrap();
        assert!(worker.serial >= 2);
    }

    #[tokio::test]
    async fn reconfigure_with_unchanged_settings_is_a_noop() {
        let state = StubState::new();
        let queue = queue_with(&state, 2);
        let key = test_key();
        let cancel = CancellationToken::new();

        let _worker = queue
            .checkout(&key, &WorkerOptions::default(), &cancel)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.idle_count().await, 1);

        queue
            .reconfigure(PoolConfig {
                capacity: 2,
                cancel_poll_interval: Duration::from_millis(50),
                ..PoolConfig::default()
            })
            .await;

        // Same settings: the idle worker survived, nothing was closed.
        assert_eq!(queue.idle_count().await, 1);
        assert_eq!(state.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalidate_all_goes_through_the_active_pool() {
        let state = StubState::new();
        let queue = queue_with(&state, 2);
        let key = test_key();
        let cancel = CancellationToken::new();

        let _worker = queue
            .checkout(&key, &WorkerOptions::default(), &cancel)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.idle_count().await, 1);

        queue.invalidate_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.idle_count().await, 0);
        assert_eq!(queue.slot_count().await, 0);
    }
}
