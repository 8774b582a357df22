//! Pool-backed worker manager.
//!
//! Thin façade callers use to issue asynchronous requests against one
//! checked-out worker. Requests run on a small bounded task pool and
//! deliver their result through a callback, but only if the worker they
//! were issued against is still the manager's current worker. Results from
//! a hot-swapped worker are dropped instead of being delivered against the
//! wrong generation.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Semaphore;

use crate::codec::Column;
use crate::error::Result;
use crate::worker::{Suggestion, VariableInfo, WorkerHandle};

/// Default width of the manager's task pool.
const DEFAULT_TASK_WIDTH: usize = 8;

/// Callback receiving an asynchronous operation's result.
pub type ResponseHandler<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

struct Shared {
    current: StdMutex<Arc<WorkerHandle>>,
    tasks: StdMutex<Arc<Semaphore>>,
    width: usize,
}

pub struct WorkerManager {
    shared: Arc<Shared>,
}

impl WorkerManager {
    pub fn new(handle: Arc<WorkerHandle>) -> Self {
        Self::with_width(handle, DEFAULT_TASK_WIDTH)
    }

    pub fn with_width(handle: Arc<WorkerHandle>, width: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                current: StdMutex::new(handle),
                tasks: StdMutex::new(Arc::new(Semaphore::new(width))),
                width,
            }),
        }
    }

    /// The currently active worker.
    pub fn current(&self) -> Arc<WorkerHandle> {
        self.shared
            .current
            .lock()
            .expect("manager lock poisoned")
            .clone()
    }

    /// Hot-swap the active worker. In-flight requests against the previous
    /// worker finish silently; their results are never delivered. The
    /// previous worker is returned for the caller to close.
    pub fn swap(&self, fresh: Arc<WorkerHandle>) -> Arc<WorkerHandle> {
        let mut current = self.shared.current.lock().expect("manager lock poisoned");
        std::mem::replace(&mut *current, fresh)
    }

    pub fn execute(&self, source: String, handler: ResponseHandler<(String, String)>) {
        self.dispatch(
            move |worker| async move { worker.execute(&source).await },
            handler,
        );
    }

    pub fn put_variable(&self, name: String, column: Column, handler: ResponseHandler<()>) {
        self.dispatch(
            move |worker| async move { worker.put_variable(&name, &column).await },
            handler,
        );
    }

    pub fn get_variable(&self, name: String, handler: ResponseHandler<Column>) {
        self.dispatch(
            move |worker| async move { worker.get_variable(&name).await },
            handler,
        );
    }

    pub fn list_variables(&self, handler: ResponseHandler<Vec<VariableInfo>>) {
        self.dispatch(
            move |worker| async move { worker.list_variables().await },
            handler,
        );
    }

    pub fn auto_complete(
        &self,
        source: String,
        cursor: usize,
        handler: ResponseHandler<Vec<Suggestion>>,
    ) {
        self.dispatch(
            move |worker| async move { worker.auto_complete(&source, cursor).await },
            handler,
        );
    }

    /// Shut down the task pool and the current worker, then install a
    /// fresh task pool so the manager can serve a new worker.
    pub async fn close(&self) {
        let old_tasks = self
            .shared
            .tasks
            .lock()
            .expect("manager lock poisoned")
            .clone();
        old_tasks.close();

        let handle = self.current();
        handle.close().await;

        let mut tasks = self.shared.tasks.lock().expect("manager lock poisoned");
        *tasks = Arc::new(Semaphore::new(self.shared.width));
    }

    /// Run one operation on the task pool, capturing the current worker at
    /// call time and suppressing the result if it was replaced mid-flight.
    fn dispatch<T, Op, Fut>(&self, op: Op, handler: ResponseHandler<T>)
    where
        T: Send + 'static,
        Op: FnOnce(Arc<WorkerHandle>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = self.shared.clone();
        let worker = self.current();
        let semaphore = self
            .shared
            .tasks
            .lock()
            .expect("manager lock poisoned")
            .clone();
        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!("task pool closed, dropping request");
                    return;
                }
            };
            let result = op(worker.clone()).await;
            drop(permit);

            let still_current = {
                let current = shared.current.lock().expect("manager lock poisoned");
                Arc::ptr_eq(&worker, &current)
            };
            if still_current {
                handler(result);
            } else {
                tracing::debug!(worker = %worker.id(), "dropping result from superseded worker");
            }
        });
    }
}
