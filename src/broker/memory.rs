//! In-process AMQP-style broker.
//!
//! Queues are FIFO with per-consumer prefetch and round-robin delivery between the
//! consumers of one queue. Messages stay unacknowledged until the consumer settles them.
//! Connection loss requeues every unacknowledged message (marked redelivered) and keeps
//! consumers installed, so delivery resumes by itself once the connection recovers.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::broker::{
    Acknowledger, Connection, ConnectionEvent, ConnectionListener, ConnectionState, Consumer,
    ExchangeKind, QueueHandle, QueueOptions, RawDelivery, Subscription,
};
use crate::core::error::BrokerError;
use crate::core::message::Envelope;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Operation counters, handy for asserting what actually reached the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub queue_declarations: u64,
    pub exchange_declarations: u64,
    pub publishes: u64,
    pub consumers_started: u64,
    pub consumers_cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queue_declarations: AtomicU64,
    exchange_declarations: AtomicU64,
    publishes: AtomicU64,
    consumers_started: AtomicU64,
    consumers_cancelled: AtomicU64,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    /// (routing key, queue name)
    bindings: Vec<(String, String)>,
}

struct BrokerState {
    url: String,
    state: Mutex<ConnectionState>,
    queues: DashMap<String, Arc<MemoryQueue>>,
    exchanges: DashMap<String, Exchange>,
    listeners: Mutex<Vec<ConnectionListener>>,
    next_tag: AtomicU64,
    next_seq: AtomicU64,
    counters: Counters,
}

impl BrokerState {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            other => Err(BrokerError::ChannelDown(other)),
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let listeners: Vec<ConnectionListener> = lock(&self.listeners).clone();
        for listener in listeners {
            listener(event);
        }
    }

    fn route(&self, envelope: Envelope, queue: &str) -> Result<(), BrokerError> {
        let target = self
            .queues
            .get(queue)
            .map(|q| Arc::clone(&*q))
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        target.enqueue(self, envelope);
        Ok(())
    }
}

#[derive(Debug)]
struct Stored {
    seq: u64,
    envelope: Envelope,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    stored: Stored,
    consumer_tag: String,
}

struct ConsumerSlot {
    tag: String,
    prefetch: usize,
    in_flight: usize,
    callback: Consumer,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl QueueInner {
    /// Round-robin over consumers that still have prefetch room.
    fn next_available_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        let start = self.next_consumer;
        let idx = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&idx| self.consumers[idx].in_flight < self.consumers[idx].prefetch)?;
        self.next_consumer = (idx + 1) % count;
        Some(idx)
    }

    /// Puts a message back at its original position.
    fn requeue(&mut self, mut stored: Stored) {
        stored.redelivered = true;
        let at = self.ready.partition_point(|m| m.seq < stored.seq);
        self.ready.insert(at, stored);
    }

    fn release_credit(&mut self, consumer_tag: &str) {
        if let Some(slot) = self.consumers.iter_mut().find(|c| c.tag == consumer_tag) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }
}

pub struct MemoryQueue {
    name: String,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    broker: Weak<BrokerState>,
    inner: Mutex<QueueInner>,
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .finish()
    }
}

impl MemoryQueue {
    fn broker(&self) -> Result<Arc<BrokerState>, BrokerError> {
        let broker = self
            .broker
            .upgrade()
            .ok_or(BrokerError::ChannelDown(ConnectionState::Failed))?;
        broker.ensure_connected()?;
        Ok(broker)
    }

    fn enqueue(self: &Arc<Self>, broker: &BrokerState, envelope: Envelope) {
        let seq = broker.next_seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner).ready.push_back(Stored {
            seq,
            envelope,
            redelivered: false,
        });
        broker.counters.publishes.fetch_add(1, Ordering::Relaxed);
        self.dispatch(broker);
    }

    /// Hands ready messages to consumers with prefetch room. Callbacks run under the
    /// queue lock, which keeps per-queue delivery order intact.
    fn dispatch(self: &Arc<Self>, broker: &BrokerState) {
        if broker.state() != ConnectionState::Connected {
            return;
        }

        let mut inner = lock(&self.inner);
        while !inner.ready.is_empty() {
            let Some(idx) = inner.next_available_consumer() else {
                break;
            };
            let Some(stored) = inner.ready.pop_front() else {
                break;
            };

            let tag = broker.next_tag.fetch_add(1, Ordering::Relaxed);
            let slot = &mut inner.consumers[idx];
            slot.in_flight += 1;
            let callback = Arc::clone(&slot.callback);
            let consumer_tag = slot.tag.clone();

            let acker: Arc<dyn Acknowledger> = Arc::clone(self) as Arc<dyn Acknowledger>;
            let delivery = RawDelivery::new(
                tag,
                self.name.clone(),
                stored.envelope.clone(),
                stored.redelivered,
                acker,
            );
            inner.unacked.insert(
                tag,
                Unacked {
                    stored,
                    consumer_tag,
                },
            );
            callback(delivery);
        }
    }

    /// Moves every unacknowledged message back to ready, as a dropped channel would.
    fn recover_unacked(&self) {
        let mut inner = lock(&self.inner);
        let unacked: Vec<Unacked> = inner.unacked.drain().map(|(_, u)| u).collect();
        for entry in unacked {
            inner.requeue(entry.stored);
        }
        for slot in inner.consumers.iter_mut() {
            slot.in_flight = 0;
        }
    }

    fn settle(self: &Arc<Self>, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let broker = self.broker()?;
        {
            let mut inner = lock(&self.inner);
            let entry = inner
                .unacked
                .remove(&delivery_tag)
                .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
            inner.release_credit(&entry.consumer_tag);
            if requeue {
                inner.requeue(entry.stored);
            }
        }
        self.dispatch(&broker);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryQueue {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.self_arc()?.settle(delivery_tag, false)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.self_arc()?.settle(delivery_tag, requeue)
    }
}

impl MemoryQueue {
    /// Acknowledger and QueueHandle take `&self`; dispatch needs the owning Arc, which
    /// lives in the broker's queue map.
    fn self_arc(&self) -> Result<Arc<MemoryQueue>, BrokerError> {
        let broker = self.broker()?;
        let queue = broker
            .queues
            .get(&self.name)
            .map(|q| Arc::clone(&*q))
            .ok_or_else(|| BrokerError::QueueNotFound(self.name.clone()))?;
        Ok(queue)
    }
}

#[async_trait]
impl QueueHandle for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError> {
        let broker = self.broker()?;
        self.self_arc()?.enqueue(&broker, envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        prefetch: u16,
        consumer: Consumer,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let broker = self.broker()?;
        let queue = self.self_arc()?;
        let tag = format!("ctag-{}", Uuid::new_v4());
        {
            let mut inner = lock(&queue.inner);
            if self.exclusive && !inner.consumers.is_empty() {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue '{}' is exclusive and already has a consumer",
                    self.name
                )));
            }
            inner.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                prefetch: prefetch.max(1) as usize,
                in_flight: 0,
                callback: consumer,
            });
        }
        broker.counters.consumers_started.fetch_add(1, Ordering::Relaxed);
        debug!(target: "priomq::broker", queue = %self.name, consumer = %tag, prefetch, "Consumer installed");

        queue.dispatch(&broker);
        Ok(Box::new(MemorySubscription { queue, tag }))
    }
}

#[derive(Debug)]
struct MemorySubscription {
    queue: Arc<MemoryQueue>,
    tag: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    async fn cancel(&self) -> Result<(), BrokerError> {
        let broker = self.queue.broker()?;
        let now_idle = {
            let mut inner = lock(&self.queue.inner);
            let idx = inner
                .consumers
                .iter()
                .position(|c| c.tag == self.tag)
                .ok_or_else(|| BrokerError::UnknownConsumer(self.tag.clone()))?;
            inner.consumers.remove(idx);
            inner.next_consumer = 0;
            inner.consumers.is_empty()
        };
        broker.counters.consumers_cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(target: "priomq::broker", queue = %self.queue.name, consumer = %self.tag, "Consumer cancelled");

        if now_idle && self.queue.auto_delete {
            broker.queues.remove(&self.queue.name);
            debug!(target: "priomq::broker", queue = %self.queue.name, "Auto-deleted idle queue");
        }
        Ok(())
    }
}

/// Handle to the in-process broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryConnection {
    inner: Arc<BrokerState>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("url", &self.inner.url)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl MemoryConnection {
    pub fn open(url: &str) -> Result<Self, BrokerError> {
        if url.trim().is_empty() {
            return Err(BrokerError::InvalidUrl(url.to_string()));
        }
        info!(target: "priomq::broker", %url, "Opened in-process broker connection");
        Ok(Self {
            inner: Arc::new(BrokerState {
                url: url.to_string(),
                state: Mutex::new(ConnectionState::Connected),
                queues: DashMap::new(),
                exchanges: DashMap::new(),
                listeners: Mutex::new(Vec::new()),
                next_tag: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Drops the transport: Connected → Reconnecting.
    pub fn simulate_connection_loss(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state != ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::Reconnecting;
        }
        for queue in self.inner.queues.iter() {
            queue.value().recover_unacked();
        }
        warn!(target: "priomq::broker", url = %self.inner.url, "Connection lost; recovering");
        self.inner.emit(ConnectionEvent::Lost);
    }

    /// Completes auto-recovery: Reconnecting → Connected. Installed consumers resume.
    pub fn recover(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state != ConnectionState::Reconnecting {
                return;
            }
            *state = ConnectionState::Connected;
        }
        info!(target: "priomq::broker", url = %self.inner.url, "Connection recovered");
        self.inner.emit(ConnectionEvent::Recovered);

        let queues: Vec<Arc<MemoryQueue>> =
            self.inner.queues.iter().map(|q| Arc::clone(q.value())).collect();
        for queue in queues {
            queue.dispatch(&self.inner);
        }
    }

    /// Gives up on recovery. Terminal.
    pub fn fail(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == ConnectionState::Failed {
                return;
            }
            *state = ConnectionState::Failed;
        }
        warn!(target: "priomq::broker", url = %self.inner.url, "Connection failed permanently");
        self.inner.emit(ConnectionEvent::Failed);
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            queue_declarations: c.queue_declarations.load(Ordering::Relaxed),
            exchange_declarations: c.exchange_declarations.load(Ordering::Relaxed),
            publishes: c.publishes.load(Ordering::Relaxed),
            consumers_started: c.consumers_started.load(Ordering::Relaxed),
            consumers_cancelled: c.consumers_cancelled.load(Ordering::Relaxed),
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    /// Messages ready for delivery.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.with_queue(queue, |inner| inner.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.with_queue(queue, |inner| inner.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.with_queue(queue, |inner| inner.consumers.len())
    }

    /// Ready messages in delivery order.
    pub fn peek(&self, queue: &str) -> Option<Vec<Envelope>> {
        self.with_queue(queue, |inner| {
            inner.ready.iter().map(|m| m.envelope.clone()).collect()
        })
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.inner.queues.get(queue).map(|q| q.durable)
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&QueueInner) -> R) -> Option<R> {
        let queue = self.inner.queues.get(queue).map(|q| Arc::clone(&*q))?;
        let inner = lock(&queue.inner);
        Some(f(&inner))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        options: &QueueOptions,
    ) -> Result<Arc<dyn QueueHandle>, BrokerError> {
        self.inner.ensure_connected()?;
        self.inner
            .counters
            .queue_declarations
            .fetch_add(1, Ordering::Relaxed);

        let queue = self
            .inner
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(target: "priomq::broker", queue = %name, durable, "Declaring queue");
                Arc::new(MemoryQueue {
                    name: name.to_string(),
                    durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    broker: Arc::downgrade(&self.inner),
                    inner: Mutex::new(QueueInner::default()),
                })
            })
            .clone();

        if queue.durable != durable
            || queue.exclusive != options.exclusive
            || queue.auto_delete != options.auto_delete
        {
            return Err(BrokerError::PreconditionFailed(format!(
                "queue '{name}' already declared with different properties"
            )));
        }
        Ok(queue)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.inner.ensure_connected()?;
        self.inner
            .counters
            .exchange_declarations
            .fetch_add(1, Ordering::Relaxed);

        let exchange = self
            .inner
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange {
                kind,
                durable,
                bindings: Vec::new(),
            });
        if exchange.kind != kind || exchange.durable != durable {
            return Err(BrokerError::PreconditionFailed(format!(
                "exchange '{name}' already declared with different properties"
            )));
        }
        Ok(())
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner.ensure_connected()?;
        if !self.inner.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let mut entry = self
            .inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let binding = (routing_key.to_string(), queue.to_string());
        if !entry.bindings.contains(&binding) {
            entry.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        self.inner.ensure_connected()?;

        // Default exchange: the routing key is the queue name.
        if exchange.is_empty() {
            return self.inner.route(envelope, routing_key);
        }

        let targets: Vec<String> = {
            let entry = self
                .inner
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
            entry
                .bindings
                .iter()
                .filter(|(key, _)| entry.kind == ExchangeKind::Fanout || key == routing_key)
                .map(|(_, queue)| queue.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(target: "priomq::broker", %exchange, %routing_key, "Unroutable message dropped");
        }
        for queue in targets {
            self.inner.route(envelope.clone(), &queue)?;
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    fn on_connection_event(&self, listener: ConnectionListener) {
        lock(&self.inner.listeners).push(listener);
    }
}
