//! Worker wiring and its long-running loops.
//!
//! Four loops share one shutdown signal: the reset sweep and the budget
//! fan-out on fixed intervals, and consumers for the lease change feed and
//! the reset queue. Each batch is handed to the engine whole; failures are
//! logged and the loop moves on, since every handler is safe to re-run.
//! Consumer offsets are committed only after their batch was handled, so a
//! crash mid-batch redelivers it.

use crate::collaborators::{TopicBudgetChecker, TopicResetPipeline};
use crate::config::{Config, ConfigError};
use futures::{Stream, StreamExt};
use lease_pool_core::change_feed::ChangeRecord;
use lease_pool_core::environment::{Clock, SystemClock};
use lease_pool_core::notification::NotificationPublisher;
use lease_pool_core::reset_queue::ResetQueue;
use lease_pool_core::state_store::{StateStore, StoreError};
use lease_pool_postgres::{PoolSettings, PostgresStateStore};
use lease_pool_redpanda::{
    Delivery, OffsetCommit, RedpandaError, RedpandaProducer, RedpandaSubscriber,
};
use lease_pool_runtime::budget::BudgetCheckFanout;
use lease_pool_runtime::reset::{ResetDispatcher, ResetQueueConsumer};
use lease_pool_runtime::router::RouterTopics;
use lease_pool_runtime::ChangeEventRouter;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Errors that stop the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The state store could not be reached or migrated.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A Redpanda client could not be created or subscribed.
    #[error(transparent)]
    Redpanda(#[from] RedpandaError),

    /// A loop panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Receiver side of the shutdown signal. The loops stop once it reads `true`
/// or the sender is dropped.
pub type Shutdown = watch::Receiver<bool>;

/// The engine components the loops drive.
pub struct Worker {
    dispatcher: Arc<ResetDispatcher>,
    budget: Arc<BudgetCheckFanout>,
    router: Arc<ChangeEventRouter>,
    consumer: Arc<ResetQueueConsumer>,
}

impl Worker {
    /// Assemble the components over the given store and publisher.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Config`] if the transition model is unknown.
    pub fn new(
        config: &Config,
        store: Arc<dyn StateStore>,
        producer: Arc<RedpandaProducer>,
    ) -> Result<Self, WorkerError> {
        let publisher: Arc<dyn NotificationPublisher> = producer.clone();
        Self::assemble(config, store, publisher, producer)
    }

    /// Assemble from trait objects; the reset queue is usually the producer.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Config`] if the transition model is unknown.
    pub fn assemble(
        config: &Config,
        store: Arc<dyn StateStore>,
        publisher: Arc<dyn NotificationPublisher>,
        reset_queue: Arc<dyn ResetQueue>,
    ) -> Result<Self, WorkerError> {
        let redpanda = &config.redpanda;
        let checker =
            TopicBudgetChecker::new(Arc::clone(&publisher), &redpanda.budget_check_topic);
        let pipeline =
            TopicResetPipeline::new(Arc::clone(&publisher), &redpanda.reset_run_topic);
        let topics = RouterTopics {
            locked: redpanda.locked_topic.clone(),
            unlocked: redpanda.unlocked_topic.clone(),
        };

        Ok(Self {
            dispatcher: Arc::new(ResetDispatcher::new(Arc::clone(&store), reset_queue)),
            budget: Arc::new(BudgetCheckFanout::new(Arc::clone(&store), Arc::new(checker))),
            router: Arc::new(ChangeEventRouter::new(
                Arc::clone(&store),
                publisher,
                topics,
                config.transition_model()?,
            )),
            consumer: Arc::new(ResetQueueConsumer::new(store, Arc::new(pipeline))),
        })
    }

    /// Connect to `PostgreSQL` and Redpanda, migrate, and run every loop
    /// until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if a connection, migration or subscription
    /// fails, or a loop dies.
    pub async fn run_from_config(config: Config, shutdown: Shutdown) -> Result<(), WorkerError> {
        config.validate()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let settings = PoolSettings {
            max_connections: config.postgres.max_connections,
            min_connections: config.postgres.min_connections,
            acquire_timeout: Duration::from_secs(config.postgres.acquire_timeout),
        };
        let store = PostgresStateStore::connect(&config.postgres.url, settings, clock).await?;
        store.migrate().await?;

        let redpanda = &config.redpanda;
        let producer = RedpandaProducer::builder()
            .brokers(&redpanda.brokers)
            .reset_topic(&redpanda.reset_topic)
            .build()?;
        let subscriber = RedpandaSubscriber::builder()
            .brokers(&redpanda.brokers)
            .consumer_group(&redpanda.consumer_group)
            .build()?;
        let change_feed = subscriber.change_feed(&redpanda.change_feed_topic)?;
        let reset_requests = subscriber.reset_queue(&redpanda.reset_topic)?;

        let worker = Self::new(&config, Arc::new(store), Arc::new(producer))?;
        tracing::info!(
            brokers = %redpanda.brokers,
            consumer_group = %redpanda.consumer_group,
            model = ?worker.router.model(),
            "Lease pool worker started"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(sweep_loop(
            Arc::clone(&worker.dispatcher),
            config.reset_sweep_interval(),
            shutdown.clone(),
        ));
        tasks.spawn(budget_loop(
            Arc::clone(&worker.budget),
            config.budget_check_interval(),
            shutdown.clone(),
        ));
        tasks.spawn(change_feed_loop(
            Arc::clone(&worker.router),
            change_feed,
            redpanda.batch_size,
            shutdown.clone(),
        ));
        tasks.spawn(reset_queue_loop(
            Arc::clone(&worker.consumer),
            reset_requests,
            redpanda.batch_size,
            shutdown,
        ));

        while let Some(joined) = tasks.join_next().await {
            joined?;
        }
        tracing::info!("Lease pool worker stopped");
        Ok(())
    }

    /// Run one reset sweep.
    pub async fn sweep_once(&self) {
        run_sweep(&self.dispatcher).await;
    }

    /// Run one budget check fan-out.
    pub async fn check_budgets_once(&self) {
        run_budget_checks(&self.budget).await;
    }

    /// The change-feed router.
    #[must_use]
    pub fn router(&self) -> &ChangeEventRouter {
        &self.router
    }

    /// The reset-queue consumer.
    #[must_use]
    pub fn consumer(&self) -> &ResetQueueConsumer {
        &self.consumer
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

async fn run_sweep(dispatcher: &ResetDispatcher) {
    match dispatcher.sweep().await {
        Ok(report) => tracing::debug!(enqueued = report.enqueued, "Reset sweep succeeded"),
        Err(e) => {
            metrics::counter!("lease_pool.worker.sweep_failures").increment(1);
            tracing::warn!(error = %e, "Reset sweep failed");
        }
    }
}

async fn run_budget_checks(budget: &BudgetCheckFanout) {
    match budget.run().await {
        Ok(checked) => tracing::debug!(checked, "Budget checks succeeded"),
        Err(e) => {
            metrics::counter!("lease_pool.worker.budget_failures").increment(1);
            tracing::warn!(error = %e, "Budget check fan-out failed");
        }
    }
}

// True once shutdown was requested or the sender is gone.
fn stopping(shutdown: &Shutdown) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Run a reset sweep every `period` until shutdown. The first sweep runs
/// immediately.
pub async fn sweep_loop(
    dispatcher: Arc<ResetDispatcher>,
    period: Duration,
    mut shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    while !stopping(&shutdown) {
        tokio::select! {
            _ = ticker.tick() => run_sweep(&dispatcher).await,
            _ = shutdown.changed() => {}
        }
    }
    tracing::info!("Reset sweep loop stopped");
}

/// Run a budget check fan-out every `period` until shutdown. The first run
/// happens immediately.
pub async fn budget_loop(
    budget: Arc<BudgetCheckFanout>,
    period: Duration,
    mut shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    while !stopping(&shutdown) {
        tokio::select! {
            _ = ticker.tick() => run_budget_checks(&budget).await,
            _ = shutdown.changed() => {}
        }
    }
    tracing::info!("Budget check loop stopped");
}

/// Route change-feed records in batches of up to `batch_size` until the
/// stream ends or shutdown fires.
///
/// Records that fail to decode are logged and skipped. Offsets of the batch
/// are committed after the router has handled it.
pub async fn change_feed_loop<S>(
    router: Arc<ChangeEventRouter>,
    records: S,
    batch_size: usize,
    mut shutdown: Shutdown,
) where
    S: Stream<Item = Delivery<ChangeRecord>> + Send + Unpin,
{
    let mut batches = records.ready_chunks(batch_size.max(1));
    while !stopping(&shutdown) {
        let batch = tokio::select! {
            batch = batches.next() => batch,
            _ = shutdown.changed() => continue,
        };
        let Some(batch) = batch else {
            tracing::warn!("Change feed stream ended");
            break;
        };

        let (records, commits) = split_batch(batch, "change feed");
        if !records.is_empty() {
            match router.handle_batch(&records).await {
                Ok(outcomes) => {
                    tracing::debug!(records = outcomes.len(), "Change feed batch routed");
                }
                Err(e) => {
                    metrics::counter!("lease_pool.worker.change_feed_failures")
                        .increment(e.len() as u64);
                    tracing::warn!(error = %e, "Change feed batch had failures");
                }
            }
        }
        commit_all(commits);
    }
    tracing::info!("Change feed loop stopped");
}

/// Handle reset requests in batches of up to `batch_size` until the stream
/// ends or shutdown fires. Offsets of the batch are committed after the
/// consumer has handled it.
pub async fn reset_queue_loop<S>(
    consumer: Arc<ResetQueueConsumer>,
    requests: S,
    batch_size: usize,
    mut shutdown: Shutdown,
) where
    S: Stream<Item = Delivery<String>> + Send + Unpin,
{
    let mut batches = requests.ready_chunks(batch_size.max(1));
    while !stopping(&shutdown) {
        let batch = tokio::select! {
            batch = batches.next() => batch,
            _ = shutdown.changed() => continue,
        };
        let Some(batch) = batch else {
            tracing::warn!("Reset queue stream ended");
            break;
        };

        let (account_ids, commits) = split_batch(batch, "reset queue");
        if !account_ids.is_empty() {
            match consumer.handle_batch(&account_ids).await {
                Ok(started) => tracing::debug!(started = started.len(), "Reset batch handled"),
                Err(e) => {
                    metrics::counter!("lease_pool.worker.reset_failures")
                        .increment(e.errors.len() as u64);
                    tracing::warn!(
                        started = e.completed.len(),
                        error = %e,
                        "Reset batch had failures"
                    );
                }
            }
        }
        commit_all(commits);
    }
    tracing::info!("Reset queue loop stopped");
}

// Decoded messages of a batch, plus the commit handles of every message in it.
fn split_batch<T>(
    batch: Vec<Delivery<T>>,
    source: &'static str,
) -> (Vec<T>, Vec<Box<dyn OffsetCommit>>) {
    let mut commits = Vec::with_capacity(batch.len());
    let messages = batch
        .into_iter()
        .filter_map(|delivery| {
            let (message, commit) = delivery.into_parts();
            commits.extend(commit);
            skip_undecodable(message, source)
        })
        .collect();
    (messages, commits)
}

fn commit_all(commits: Vec<Box<dyn OffsetCommit>>) {
    for commit in commits {
        commit.commit();
    }
}

fn skip_undecodable<T>(item: Result<T, RedpandaError>, source: &'static str) -> Option<T> {
    match item {
        Ok(value) => Some(value),
        Err(e) => {
            metrics::counter!("lease_pool.worker.undecodable", "source" => source).increment(1);
            tracing::warn!(source, error = %e, "Skipping message");
            None
        }
    }
}
