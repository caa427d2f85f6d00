//! Worker supervision and graceful shutdown.
//!
//! Every worker shares one `watch` shutdown channel. Shutdown flips the
//! channel once, waits for the workers to report completion, and aborts
//! whatever is still running once the grace period is spent.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::follower::{ArtifactSource, Follower};

/// Default time workers get to stop after shutdown is signalled.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("{pending} worker(s) still running after {grace:?}")]
    ShutdownTimeout { grace: Duration, pending: usize },
}

/// Resolve once shutdown has been signalled.
///
/// A dropped sender means shutdown can no longer be requested, so the
/// future then stays pending.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Counts running workers; [`CompletionCounter::wait`] resolves at zero.
#[derive(Debug, Clone, Default)]
pub struct CompletionCounter {
    inner: Arc<CounterInner>,
}

#[derive(Debug, Default)]
struct CounterInner {
    active: AtomicUsize,
    notify: Notify,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. Dropping the guard marks it complete.
    pub fn register(&self) -> CompletionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        CompletionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        while self.active() > 0 {
            self.inner.notify.notified().await;
        }
    }
}

/// Completion token held by a running worker.
#[derive(Debug)]
pub struct CompletionGuard {
    inner: Arc<CounterInner>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_one();
        }
    }
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

/// Owns the worker tasks of a follow session.
pub struct Supervisor {
    grace: Duration,
    shutdown_tx: watch::Sender<bool>,
    counter: CompletionCounter,
    workers: Vec<Worker>,
}

impl Supervisor {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            grace,
            shutdown_tx,
            counter: CompletionCounter::new(),
            workers: Vec::new(),
        }
    }

    /// A receiver on the shared shutdown channel.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a worker on its own task.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, worker: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let guard = self.counter.register();
        let task = worker(self.shutdown_tx.subscribe());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
        self.workers.push(Worker { name, handle });
    }

    /// Spawn a follower loop.
    pub fn spawn_follower<S>(&mut self, follower: Follower<S>)
    where
        S: ArtifactSource + 'static,
    {
        let name = follower.reference().to_string();
        self.spawn(name, move |shutdown| async move {
            let report = follower.run(shutdown).await;
            info!(
                reference = %report.reference,
                installs = report.installs,
                digest = report.last_digest.as_deref().unwrap_or("-"),
                "Follower stopped"
            );
        });
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal shutdown and wait for workers, bounded by the grace period.
    pub async fn shutdown(self) -> Result<(), SupervisorError> {
        info!(workers = self.workers.len(), "Stopping workers");
        self.shutdown_tx.send_replace(true);

        if tokio::time::timeout(self.grace, self.counter.wait())
            .await
            .is_ok()
        {
            info!("All workers stopped");
            return Ok(());
        }

        let pending = self.counter.active();
        for worker in &self.workers {
            if !worker.handle.is_finished() {
                warn!(worker = %worker.name, "Force aborting worker");
                worker.handle.abort();
            }
        }
        Err(SupervisorError::ShutdownTimeout {
            grace: self.grace,
            pending,
        })
    }

    /// Run until `cancel` resolves, then shut down.
    pub async fn run_until<F>(self, cancel: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        cancel.await;
        self.shutdown().await
    }
}
