//! Capabilities the priority engine consumes from a broker connection.
//!
//! The engine never speaks a wire protocol itself. It declares queues, publishes
//! envelopes and installs consumers through these traits; the connection manager
//! behind them owns framing, the channel and reconnection.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::core::error::BrokerError;
use crate::core::message::{Envelope, Headers};

/// Lifecycle of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connected,
    /// Transport lost; auto-recovery is in progress.
    Reconnecting,
    /// Recovery gave up. Terminal.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting => f.write_str("reconnecting"),
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}

/// Notifications emitted on connection state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Lost,
    Recovered,
    Failed,
}

pub type ConnectionListener = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

/// Declaration options for a physical queue. Durability is decided by the
/// connection policy and passed separately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Headers,
    /// Route publishes through this direct exchange instead of the default one.
    pub exchange: Option<String>,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, name: impl Into<String>) -> Self {
        self.exchange = Some(name.into());
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync + Debug {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer by the broker, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub payload: Bytes,
    pub headers: Headers,
    pub persistent: bool,
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
}

impl RawDelivery {
    pub fn new(
        delivery_tag: u64,
        queue: impl Into<String>,
        envelope: Envelope,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            queue: queue.into(),
            payload: envelope.payload,
            headers: envelope.headers,
            persistent: envelope.persistent,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(self.delivery_tag, requeue).await
    }
}

/// Broker-side consumer callback. Invoked on the broker's dispatch path, so it must not block.
pub type Consumer = Arc<dyn Fn(RawDelivery) + Send + Sync>;

/// An installed consumer on one physical queue.
#[async_trait]
pub trait Subscription: Send + Sync + Debug {
    fn consumer_tag(&self) -> &str;
    async fn cancel(&self) -> Result<(), BrokerError>;
}

/// Handle to one declared physical queue.
#[async_trait]
pub trait QueueHandle: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Publishes through the default exchange straight into this queue.
    async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError>;

    /// Installs `consumer`; the broker keeps at most `prefetch` unacknowledged deliveries
    /// outstanding on it.
    async fn subscribe(
        &self,
        prefetch: u16,
        consumer: Consumer,
    ) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// The connection-and-channel capability.
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    /// Idempotent for matching properties.
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        options: &QueueOptions,
    ) -> Result<Arc<dyn QueueHandle>, BrokerError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError>;

    fn state(&self) -> ConnectionState;

    fn on_connection_event(&self, listener: ConnectionListener);
}
