//! Worker pool
//!
//! A pool of cooperative worker loops sharing one store and registry. Each
//! loop claims one task at a time, dispatches it, and polls again; an extra
//! background loop requeues tasks orphaned by crashed workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::dispatcher::{Dispatcher, WorkerError};
use super::poller::TaskPoller;
use crate::config::{ActivityConfig, WorkerConfig};
use crate::persistence::WorkflowStore;
use crate::registry::Registry;

/// Worker pool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Pool is starting its loops
    Starting,
    /// Loops are polling and dispatching
    Running,
    /// Shutdown signalled; loops finish their current task and exit
    Draining,
    /// All loops have exited
    Stopped,
}

/// A pool of worker loops over a shared store and registry
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(store, registry, config.worker, config.activity);
/// pool.start()?;
/// // ... serve traffic ...
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn WorkflowStore>,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    pool_id: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    in_flight: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool (not yet polling)
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<Registry>,
        config: WorkerConfig,
        activity_defaults: ActivityConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            registry,
            activity_defaults,
        ));

        Self {
            store,
            dispatcher,
            config,
            pool_id: format!("worker-{}", Uuid::now_v7()),
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            in_flight: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker loops and the stale-task reclaimer
    #[instrument(skip(self), fields(pool_id = %self.pool_id))]
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Starting;
        }

        info!(count = self.config.count, "starting worker pool");

        let mut handles = self.handles.lock();
        for index in 0..self.config.count {
            handles.push(self.spawn_worker_loop(index));
        }
        handles.push(self.spawn_reclaim_loop());
        drop(handles);

        *self.status.write() = WorkerPoolStatus::Running;
        Ok(())
    }

    /// Signal shutdown and wait for loops to drain
    #[instrument(skip(self), fields(pool_id = %self.pool_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("draining worker pool");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(self.config.shutdown_timeout, join_all)
            .await
            .is_err()
        {
            error!("shutdown timed out with tasks in flight");
            return Err(WorkerError::ShutdownTimeout);
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    /// Current lifecycle state
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of tasks currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn spawn_worker_loop(&self, index: usize) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let config = self.config.clone();
        let worker_id = format!("{}-{index}", self.pool_id);
        let shutdown_rx = self.shutdown_rx.clone();
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            let mut poller = TaskPoller::new(store, worker_id.clone(), &config, shutdown_rx);

            loop {
                if poller.is_shutdown() {
                    break;
                }

                match poller.poll().await {
                    Ok(Some(task)) => {
                        in_flight.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = dispatcher.dispatch(task).await {
                            error!(%worker_id, "task dispatch failed: {e}");
                        }
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        // Poll again immediately while the queue has work
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(%worker_id, "claim failed: {e}");
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!(%worker_id, "worker loop exited");
        })
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.reclaim_interval;
        let threshold = self.config.stale_task_timeout;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.reclaim_stale_tasks(threshold).await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                info!(count = reclaimed.len(), "requeued stale tasks");
                            }
                            Ok(_) => {}
                            Err(e) => error!("stale task reclamation failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            debug!("reclaim loop exited");
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Loops notice the closed channel and exit; an explicit shutdown()
        // is still the way to drain gracefully.
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use std::time::Duration;

    fn fast_poll_config(base: Duration) -> WorkerConfig {
        WorkerConfig {
            poll_interval: base,
            poll_max_interval: base * 4,
            ..Default::default()
        }
    }

    fn empty_pool() -> WorkerPool {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(Registry::builder().build());
        WorkerPool::new(
            store,
            registry,
            fast_poll_config(Duration::from_millis(10)),
            ActivityConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let pool = empty_pool();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);

        pool.start().unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Running);
        assert_eq!(pool.in_flight(), 0);

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let pool = empty_pool();
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(WorkerError::AlreadyRunning)));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pool = empty_pool();
        pool.start().unwrap();
        pool.shutdown().await.unwrap();
        pool.shutdown().await.unwrap();
    }
}
