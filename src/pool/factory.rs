//! Process-backed construction strategy.
//!
//! Launches a worker for the key's backend, preloads the key's modules and
//! hands the ready handle to the pool.

use super::{PoolKey, PooledWorker, WorkerFactory};
use crate::error::{Result, WorkerError};
use crate::worker::{WorkerHandle, WorkerOptions};

/// Constructs [`WorkerHandle`]s by spawning real interpreter processes.
#[derive(Debug, Default)]
pub struct ProcessWorkerFactory;

impl ProcessWorkerFactory {
    pub fn new() -> Self {
        Self
    }

    /// Import the key's preload modules. Required modules fail
    /// construction when missing; optional ones are imported behind a
    /// guard and allowed to be absent.
    async fn preload_modules(handle: &WorkerHandle, key: &PoolKey) -> Result<()> {
        let profile = key.backend().profile();
        if !key.required_modules().is_empty() {
            let code = key
                .required_modules()
                .iter()
                .map(|m| profile.import_statement(&m.name))
                .collect::<Vec<_>>()
                .join("\n");
            handle.execute(&code).await.map_err(|e| {
                WorkerError::Construction(format!("required module preload failed: {}", e))
            })?;
        }
        if !key.optional_modules().is_empty() {
            let code = key
                .optional_modules()
                .iter()
                .map(|m| profile.guarded_import_statement(&m.name))
                .collect::<Vec<_>>()
                .join("\n");
            handle.execute(&code).await.map_err(|e| {
                WorkerError::Construction(format!("optional module preload failed: {}", e))
            })?;
        }
        Ok(())
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    type Worker = WorkerHandle;

    async fn create(&self, key: &PoolKey) -> Result<WorkerHandle> {
        let handle = WorkerHandle::launch(key.launch(), key.backend()).await?;
        if let Err(e) = Self::preload_modules(&handle, key).await {
            handle.close().await;
            return Err(e);
        }
        Ok(handle)
    }
}

impl PooledWorker for WorkerHandle {
    async fn configure(&mut self, options: &WorkerOptions) -> Result<()> {
        WorkerHandle::configure(self, options).await
    }

    async fn shutdown(self) {
        // Cleanup errors are aggregated and logged by close(); nobody is
        // waiting on them here.
        self.close().await;
    }
}
