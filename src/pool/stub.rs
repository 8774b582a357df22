//! Scriptable stub factory for pool tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use super::{PoolKey, PooledWorker, WorkerFactory};
use crate::error::{Result, WorkerError};
use crate::worker::WorkerOptions;

#[derive(Debug)]
pub(crate) struct StubState {
    pub created: AtomicUsize,
    pub configured: AtomicUsize,
    pub shutdowns: AtomicUsize,
    fail_creates: StdMutex<HashSet<usize>>,
    pub fail_configures: AtomicUsize,
    create_delay: StdMutex<Duration>,
    pub hold_creates: AtomicBool,
}

impl StubState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            configured: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            fail_creates: StdMutex::new(HashSet::new()),
            fail_configures: AtomicUsize::new(0),
            create_delay: StdMutex::new(Duration::ZERO),
            hold_creates: AtomicBool::new(false),
        })
    }

    /// Fail the n-th construction (1-based serial).
    pub fn fail_create(&self, serial: usize) {
        self.fail_creates.lock().unwrap().insert(serial);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }
}

#[derive(Debug)]
pub(crate) struct StubWorker {
    pub serial: usize,
    state: Arc<StubState>,
}

impl PooledWorker for StubWorker {
    async fn configure(&mut self, _options: &WorkerOptions) -> Result<()> {
        self.state.configured.fetch_add(1, Ordering::SeqCst);
        let remaining = self.state.fail_configures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .fail_configures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(WorkerError::Channel("stub worker crashed".into()));
        }
        Ok(())
    }

    async fn shutdown(self) {
        self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct StubFactory {
    pub state: Arc<StubState>,
}

impl WorkerFactory for StubFactory {
    type Worker = StubWorker;

    async fn create(&self, _key: &PoolKey) -> Result<StubWorker> {
        while self.state.hold_creates.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let delay = *self.state.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let serial = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        if self.state.fail_creates.lock().unwrap().contains(&serial) {
            return Err(WorkerError::Construction("stub create failure".into()));
        }
        Ok(StubWorker {
            serial,
            state: self.state.clone(),
        })
    }
}
