//! Caller-facing entry point: queues addressed by name over one shared connection.

use bytes::Bytes;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

use crate::config::Config;
use crate::core::broker::{Connection, ConnectionEvent, ConnectionState, QueueOptions};
use crate::core::error::{validate_queue_name, QueueError};
use crate::core::message::PublishOptions;
use crate::core::queue::{Handler, LogicalQueue, SubscribeOptions};
use crate::core::registry::QueueRegistry;
use crate::core::worker_pool::WorkerPool;

/// Owns the connection, the queue registry and the handler pool for one application.
///
/// Every logical queue obtained through a messenger shares its connection and worker
/// pool; nothing below it opens another connection.
#[derive(Debug)]
pub struct Messenger {
    connection: Arc<dyn Connection>,
    registry: Arc<QueueRegistry>,
    pool: Arc<WorkerPool>,
    default_priority: u8,
}

impl Messenger {
    /// Builds the worker pool on the current tokio runtime and starts watching the
    /// connection for transport failures.
    pub fn new(connection: Arc<dyn Connection>, config: &Config) -> Result<Self, QueueError> {
        let pool = Arc::new(WorkerPool::new(config.workers.pool_size)?);
        let registry = Arc::new(QueueRegistry::new(
            Arc::clone(&connection),
            Arc::clone(&pool),
            config.queue_defaults(),
        ));

        let watched: Weak<QueueRegistry> = Arc::downgrade(&registry);
        connection.on_connection_event(Arc::new(move |event: ConnectionEvent| match event {
            ConnectionEvent::Lost => {
                warn!(target: "priomq::messenger", "TCP connection failure detected");
                if let Some(registry) = watched.upgrade() {
                    for queue in registry.queues() {
                        queue.discard_buffered();
                    }
                }
            }
            ConnectionEvent::Recovered => {
                info!(target: "priomq::messenger", "Connection recovered");
            }
            ConnectionEvent::Failed => {
                warn!(target: "priomq::messenger", "Connection failed; giving up");
            }
        }));

        info!(
            target: "priomq::messenger",
            pool_size = pool.size(),
            prefetch = config.queues.default_prefetch,
            "Messenger ready"
        );
        Ok(Self {
            connection,
            registry,
            pool,
            default_priority: config.queues.default_priority,
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Returns the logical queue for `name`, creating it on first reference.
    pub async fn get_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<Arc<LogicalQueue>, QueueError> {
        self.registry.get_or_create(name, &options).await
    }

    /// Publishes to `queue_name`. `None` uses the configured default priority.
    pub async fn publish(
        &self,
        payload: impl Into<Bytes>,
        queue_name: &str,
        priority: Option<u8>,
        options: PublishOptions,
    ) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        let queue = self.get_queue(queue_name, QueueOptions::default()).await?;
        queue
            .publish(payload, priority.unwrap_or(self.default_priority), options)
            .await
    }

    pub async fn subscribe(
        &self,
        queue_name: &str,
        options: SubscribeOptions,
        handler: Handler,
    ) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        let queue = self.get_queue(queue_name, QueueOptions::default()).await?;
        queue.subscribe(options, handler).await
    }

    /// Succeeds quietly when `queue_name` was never referenced.
    pub async fn unsubscribe(&self, queue_name: &str) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        match self.registry.get(queue_name) {
            Some(queue) => queue.unsubscribe().await,
            None => Ok(()),
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.registry.names()
    }
}
