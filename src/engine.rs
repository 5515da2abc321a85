use anyhow::Result;
use log::{error, info};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::consumer::{ConsumerRegistry, TaskConsumer};
use crate::db::{create_pool, run_migrations};
use crate::executor::{AsyncExecutor, TaskRequest, WorkerPool};
use crate::queue_manager::{QueueManager, QueueStats};
use crate::recovery::{RecoveryStats, RecoverySweeper};
use crate::retry::TaskRetryManager;
use crate::runner::TaskRunner;
use crate::store::{PgTaskStore, StoreError, TaskStore};

/// Builder for a queue engine: settings plus the consumer registry,
/// populated at start-up.
pub struct EngineBuilder {
    settings: Settings,
    registry: ConsumerRegistry,
}

impl EngineBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            registry: ConsumerRegistry::new(),
        }
    }

    /// Register a consumer under its id. Duplicate ids are refused.
    pub fn register(mut self, consumer_id: &str, consumer: Arc<dyn TaskConsumer>) -> Result<Self> {
        self.registry.register(consumer_id, consumer)?;
        Ok(self)
    }

    /// Production path: connect to PostgreSQL, run migrations, and start
    /// the engine on the durable store.
    pub async fn connect(self) -> Result<Engine> {
        let pool = create_pool(&self.settings)?;
        run_migrations(&pool).await?;

        let store = Arc::new(PgTaskStore::new(pool));
        self.build_with_store(store)
    }

    /// Start the engine on an externally-provided store.
    pub fn build_with_store(self, store: Arc<dyn TaskStore>) -> Result<Engine> {
        self.settings.validate()?;

        let node = self.settings.queue.node;
        let registry = Arc::new(self.registry);
        let queue = Arc::new(QueueManager::new(
            self.settings.queue.max_queue_size,
            self.settings.queue.max_inflight(),
        ));

        let runner = Arc::new(TaskRunner::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            TaskRetryManager::new(self.settings.retry.clone()),
            node,
        ));

        let executor = Arc::new(AsyncExecutor::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            node,
        ));

        let sweeper = Arc::new(RecoverySweeper::new(
            store.clone(),
            queue.clone(),
            self.settings.recovery.clone(),
            node,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = WorkerPool::spawn(
            self.settings.queue.worker_count,
            queue.clone(),
            runner,
            shutdown_rx.clone(),
        );

        // The sweeper's first pass resumes any work left over from a
        // previous run before the periodic schedule takes over.
        let sweeper_handle = sweeper.clone().spawn(shutdown_rx);

        info!(
            "Queue engine started: node {node}, {} workers, capacity {}",
            self.settings.queue.worker_count, self.settings.queue.max_queue_size
        );

        Ok(Engine {
            settings: self.settings,
            store,
            queue,
            registry,
            executor,
            sweeper,
            shutdown_tx,
            workers: Mutex::new(Some(workers)),
            sweeper_handle: Mutex::new(Some(sweeper_handle)),
        })
    }
}

/// The running task-queue engine: submission boundary, worker pool, and
/// recovery sweeper over one durable store.
pub struct Engine {
    settings: Settings,
    store: Arc<dyn TaskStore>,
    queue: Arc<QueueManager>,
    registry: Arc<ConsumerRegistry>,
    executor: Arc<AsyncExecutor>,
    sweeper: Arc<RecoverySweeper>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Option<WorkerPool>>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(settings: Settings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    /// Enqueue a unit of work. See `AsyncExecutor::submit`.
    pub async fn submit<P>(&self, principal: &str, consumer_id: &str, payload: &P) -> Result<i64>
    where
        P: Serialize + ?Sized,
    {
        self.executor.submit(principal, consumer_id, payload).await
    }

    pub async fn submit_request(&self, request: TaskRequest) -> Result<i64> {
        self.executor.submit_request(request).await
    }

    /// The durable store, for polling task outcomes and history.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Fetch a task record by id, tolerating the short window where a
    /// freshly-created record is not yet visible to reads.
    pub async fn get_task(&self, id: i64) -> Result<crate::store::TaskRecord, StoreError> {
        self.store.get_with_retry(id).await
    }

    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one recovery pass on demand, outside the periodic schedule.
    pub async fn recover_now(&self) -> Result<RecoveryStats> {
        self.sweeper.run_once().await
    }

    /// Shutdown with the default 30 second timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(30).await
    }

    /// Stop the workers and the recovery sweeper. Workers finish their
    /// in-flight task first; queued-but-unstarted tasks stay durable and
    /// are resumed by the next start-up recovery pass.
    pub async fn shutdown_with_timeout(&self, timeout_secs: u64) -> Result<()> {
        info!("Shutting down queue engine with {timeout_secs}s timeout...");

        let _ = self.shutdown_tx.send(true);

        let workers = self.workers.lock().unwrap().take();
        let sweeper_handle = self.sweeper_handle.lock().unwrap().take();

        let shutdown_future = async {
            if let Some(workers) = workers {
                workers.join().await;
            }
            if let Some(handle) = sweeper_handle {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            shutdown_future,
        )
        .await
        {
            Ok(()) => {
                info!("Queue engine shutdown complete");
            }
            Err(_) => {
                error!(
                    "Engine shutdown timed out after {timeout_secs}s, some workers may still \
                     be finishing"
                );
            }
        }

        Ok(())
    }
}
