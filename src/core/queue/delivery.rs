use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

use crate::core::broker::RawDelivery;
use crate::core::error::QueueError;
use crate::core::message::Headers;
use crate::core::priority::Priority;

/// A message handed to a subscriber's handler.
///
/// Holds one prefetch credit of its logical queue until it is acknowledged,
/// rejected or dropped. The handler owns settlement; nothing is auto-acknowledged.
#[derive(Debug)]
pub struct Delivery {
    raw: RawDelivery,
    priority: Priority,
    _credit: OwnedSemaphorePermit,
}

impl Delivery {
    pub(crate) fn new(raw: RawDelivery, priority: Priority, credit: OwnedSemaphorePermit) -> Self {
        Self {
            raw,
            priority,
            _credit: credit,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.raw.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.raw.headers
    }

    /// Level of the physical queue this message came from.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Name of the physical queue this message came from.
    pub fn queue(&self) -> &str {
        &self.raw.queue
    }

    pub fn delivery_tag(&self) -> u64 {
        self.raw.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.raw.redelivered
    }

    pub fn persistent(&self) -> bool {
        self.raw.persistent
    }

    /// The credit is returned only after the broker has settled the message.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.raw.ack().await?;
        Ok(())
    }

    pub async fn reject(self, requeue: bool) -> Result<(), QueueError> {
        self.raw.reject(requeue).await?;
        Ok(())
    }
}

/// Subscriber callback. Runs on the worker pool, one invocation per delivery.
pub type Handler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |delivery| f(delivery).boxed())
}
