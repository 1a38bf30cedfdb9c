use crate::core::{DbError, Result};
use std::future::Future;
use std::sync::{Arc, mpsc};
use tokio::runtime::{Builder, Handle, Runtime};

/// Tokio runtime a database schedules its background work on.
///
/// Binds to the runtime current at construction time; when there is none,
/// a private multi-threaded runtime is built and owned for the database's
/// lifetime.
#[derive(Clone)]
pub struct RuntimeBinding {
    handle: Handle,
    _owned: Option<Arc<OwnedRuntime>>,
}

struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

impl RuntimeBinding {
    pub fn current_or_owned() -> Result<Self> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Self {
                handle,
                _owned: None,
            });
        }

        let runtime = Builder::new_multi_thread()
            .thread_name("rustentitydb-worker")
            .enable_all()
            .build()
            .map_err(|e| DbError::ExecutionError(format!("Failed to start runtime: {}", e)))?;
        let handle = runtime.handle().clone();
        Ok(Self {
            handle,
            _owned: Some(Arc::new(OwnedRuntime(Some(runtime)))),
        })
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _owned: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Runs `future` on the bound runtime and blocks the calling thread until
    /// it completes.
    ///
    /// Must not be called from inside an async task; use
    /// `tokio::task::spawn_blocking` there.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.recv().map_err(|_| {
            DbError::ExecutionError("Background task ended without a result".to_string())
        })
    }
}

impl std::fmt::Debug for RuntimeBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBinding")
            .field("owned", &self._owned.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_runtime_outside_async() {
        let runtime = RuntimeBinding::current_or_owned().unwrap();
        let value = runtime.block_on(async { 21 * 2 }).unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_binds_current_runtime() {
        let runtime = RuntimeBinding::current_or_owned().unwrap();
        assert!(format!("{:?}", runtime).contains("owned: false"));
        let value = runtime.handle().spawn(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }
}
