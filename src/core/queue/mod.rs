//! Logical queues.
//!
//! A logical queue owns one physical broker queue per priority level. Publishing picks
//! the physical queue by level; subscribing installs a consumer on all of them and feeds
//! a strict-priority dispatcher bounded by a single prefetch budget for the whole queue.

mod delivery;
mod dispatcher;

pub use delivery::{handler_fn, Delivery, Handler};

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::broker::{Connection, ExchangeKind, QueueHandle, QueueOptions, Subscription};
use crate::core::error::{validate_queue_name, BrokerError, QueueError};
use crate::core::message::{Envelope, HeaderValue, PublishOptions, PRIORITY_HEADER};
use crate::core::priority::{physical_queue_name, Priority, PRIORITY_LEVELS};
use crate::core::worker_pool::WorkerPool;
use dispatcher::{Dispatcher, LevelBuffers};

/// Defaults applied when a logical queue is created or used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDefaults {
    pub durable: bool,
    pub persistent: bool,
    pub prefetch: u16,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            durable: true,
            persistent: true,
            prefetch: 50,
        }
    }
}

/// Per-subscription options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Maximum unacknowledged deliveries across all levels. `None` uses the queue default.
    pub prefetch: Option<u16>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}

struct ActiveSubscription {
    consumers: Vec<(Priority, Box<dyn Subscription>)>,
    buffers: Arc<LevelBuffers>,
    stop: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    handler: Handler,
}

enum Route {
    Default,
    Exchange(String),
}

pub struct LogicalQueue {
    name: String,
    connection: Arc<dyn Connection>,
    physical: Vec<Arc<dyn QueueHandle>>,
    route: Route,
    defaults: QueueDefaults,
    pool: Arc<WorkerPool>,
    subscribed: AtomicBool,
    subscription: Mutex<Option<ActiveSubscription>>,
    /// Buffers of the active subscription, reachable from synchronous connection callbacks.
    live_buffers: std::sync::Mutex<Option<Arc<LevelBuffers>>>,
}

impl fmt::Debug for LogicalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalQueue")
            .field("name", &self.name)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl LogicalQueue {
    /// Declares every physical queue (and the optional exchange) before returning, so a
    /// queue that exists is always usable.
    pub async fn declare(
        name: &str,
        connection: Arc<dyn Connection>,
        options: &QueueOptions,
        defaults: QueueDefaults,
        pool: Arc<WorkerPool>,
    ) -> Result<Self, QueueError> {
        validate_queue_name(name)?;

        let route = match options.exchange.as_deref() {
            Some(exchange) => {
                validate_queue_name(exchange)?;
                connection
                    .declare_exchange(exchange, ExchangeKind::Direct, defaults.durable)
                    .await?;
                Route::Exchange(exchange.to_string())
            }
            None => Route::Default,
        };

        let mut physical = Vec::with_capacity(PRIORITY_LEVELS);
        for priority in Priority::all() {
            let physical_name = physical_queue_name(name, priority);
            let handle = connection
                .declare_queue(&physical_name, defaults.durable, options)
                .await?;
            if let Route::Exchange(exchange) = &route {
                connection
                    .bind(&physical_name, exchange, &physical_name)
                    .await?;
            }
            physical.push(handle);
        }

        info!(target: "priomq::queue", queue = %name, durable = defaults.durable, "Declared logical queue");
        Ok(Self {
            name: name.to_string(),
            connection,
            physical,
            route,
            defaults,
            pool,
            subscribed: AtomicBool::new(false),
            subscription: Mutex::new(None),
            live_buffers: std::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical queue names, highest priority first.
    pub fn physical_queue_names(&self) -> Vec<String> {
        self.physical.iter().map(|h| h.name().to_string()).collect()
    }

    /// Routes `payload` to the physical queue for `priority` and nowhere else.
    pub async fn publish(
        &self,
        payload: impl Into<Bytes>,
        priority: u8,
        options: PublishOptions,
    ) -> Result<(), QueueError> {
        let priority = Priority::new(priority)?;

        let mut envelope = Envelope::new(payload);
        envelope.headers = options.headers;
        envelope
            .headers
            .insert(PRIORITY_HEADER.to_string(), HeaderValue::Int(priority.level() as i64));
        envelope.persistent = options.persistent.unwrap_or(self.defaults.persistent);

        let handle = &self.physical[priority.index()];
        match &self.route {
            Route::Default => handle.publish(envelope).await?,
            Route::Exchange(exchange) => {
                self.connection
                    .publish(exchange, handle.name(), envelope)
                    .await?
            }
        }

        debug!(target: "priomq::queue", queue = %self.name, %priority, "Published message");
        Ok(())
    }

    /// Installs `handler` on every level. A second call while subscribed does nothing.
    pub async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Handler,
    ) -> Result<(), QueueError> {
        let mut slot = self.subscription.lock().await;
        if slot.is_some() {
            debug!(target: "priomq::queue", queue = %self.name, "Already subscribed; ignoring");
            return Ok(());
        }

        let prefetch = options.prefetch.unwrap_or(self.defaults.prefetch);
        if prefetch == 0 {
            return Err(QueueError::invalid("prefetch must be at least 1"));
        }

        let buffers = Arc::new(LevelBuffers::new());
        let mut consumers = Vec::with_capacity(self.physical.len());
        for (priority, handle) in Priority::all().zip(&self.physical) {
            let consumer = buffers.consumer(&self.name, priority);
            match handle.subscribe(prefetch, consumer).await {
                Ok(subscription) => consumers.push((priority, subscription)),
                Err(err) => {
                    warn!(
                        target: "priomq::queue",
                        queue = %self.name,
                        %priority,
                        error = %err,
                        "Subscribe failed; rolling back installed consumers"
                    );
                    let leaked = self.cancel_all(&consumers).await;
                    requeue_all(&buffers).await;
                    if leaked.is_empty() {
                        return Err(err.into());
                    }
                    return Err(QueueError::IncompleteRollback {
                        queue: self.name.clone(),
                        cause: err,
                        leaked,
                    });
                }
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        let dispatcher = Dispatcher {
            queue: self.name.clone(),
            buffers: Arc::clone(&buffers),
            credits: Arc::new(Semaphore::new(prefetch as usize)),
            handler: Arc::clone(&handler),
            pool: Arc::clone(&self.pool),
        };
        let dispatcher = tokio::spawn(dispatcher.run(stop_rx));

        self.set_live_buffers(Some(Arc::clone(&buffers)));
        *slot = Some(ActiveSubscription {
            consumers,
            buffers,
            stop,
            dispatcher,
            handler,
        });
        self.subscribed.store(true, Ordering::Release);

        info!(target: "priomq::queue", queue = %self.name, prefetch, "Subscribed");
        Ok(())
    }

    /// Cancels every level's consumer. Attempts all of them even if some fail, then
    /// reports the failures together. A no-op when not subscribed.
    pub async fn unsubscribe(&self) -> Result<(), QueueError> {
        let mut slot = self.subscription.lock().await;
        let Some(active) = slot.take() else {
            return Ok(());
        };
        self.subscribed.store(false, Ordering::Release);
        self.set_live_buffers(None);

        let failures = self.cancel_all(&active.consumers).await;

        let _ = active.stop.send(true);
        if let Err(err) = active.dispatcher.await {
            warn!(target: "priomq::queue", queue = %self.name, error = %err, "Dispatcher task ended abnormally");
        }
        requeue_all(&active.buffers).await;

        if failures.is_empty() {
            info!(target: "priomq::queue", queue = %self.name, "Unsubscribed");
            Ok(())
        } else {
            Err(QueueError::PartialCancel {
                queue: self.name.clone(),
                failures,
            })
        }
    }

    /// Cancels each consumer, carrying on past failures, and returns the ones that failed.
    async fn cancel_all(
        &self,
        consumers: &[(Priority, Box<dyn Subscription>)],
    ) -> Vec<(Priority, BrokerError)> {
        let mut failures = Vec::new();
        for (priority, consumer) in consumers {
            if let Err(err) = consumer.cancel().await {
                warn!(
                    target: "priomq::queue",
                    queue = %self.name,
                    %priority,
                    consumer = consumer.consumer_tag(),
                    error = %err,
                    "Failed to cancel consumer"
                );
                failures.push((*priority, err));
            }
        }
        failures
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Drops buffered deliveries after the connection was lost. The broker has already
    /// requeued them and will deliver them again once it recovers.
    pub fn discard_buffered(&self) -> usize {
        let buffers = self
            .live_buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let discarded = buffers.map(|b| b.drain().len()).unwrap_or(0);
        if discarded > 0 {
            debug!(target: "priomq::queue", queue = %self.name, discarded, "Discarded stale deliveries");
        }
        discarded
    }

    fn set_live_buffers(&self, buffers: Option<Arc<LevelBuffers>>) {
        *self
            .live_buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = buffers;
    }

    /// The handler currently installed, if any.
    pub async fn handler(&self) -> Option<Handler> {
        self.subscription
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.handler))
    }
}

/// Hands buffered, never-dispatched deliveries back to the broker.
async fn requeue_all(buffers: &LevelBuffers) {
    for raw in buffers.drain() {
        if let Err(err) = raw.reject(true).await {
            debug!(
                target: "priomq::queue",
                queue = %raw.queue,
                tag = raw.delivery_tag,
                error = %err,
                "Could not requeue undispatched delivery"
            );
        }
    }
}
