//! Dedicated worker runtimes
//!
//! Watchers share one single-threaded scheduling loop per database; the
//! publisher gets its own. Each loop runs on a named OS thread so protocol
//! I/O never competes with request handling on the main runtime.

use mailpulse_common::{Error, Result};
use std::future::Future;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A current-thread tokio runtime parked on its own OS thread
pub struct WorkerRuntime {
    name: String,
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerRuntime {
    /// Start the thread and wait until its runtime is ready
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (handle_tx, handle_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| Error::Internal(format!("worker {} exited during startup", name)))??;

        debug!(worker = %name, "Worker runtime started");

        Ok(Self {
            name,
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a task on this worker's loop
    pub fn spawn_task<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Stop the loop. Tasks still pending on it are dropped.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
