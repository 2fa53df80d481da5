use thiserror::Error;

use crate::core::broker::ConnectionState;
use crate::core::priority::{Priority, PRIORITY_LEVELS};

/// Failures reported by a broker connection or one of its queue handles.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("channel is down (connection {0})")]
    ChannelDown(ConnectionState),
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),
    #[error("exchange '{0}' does not exist")]
    ExchangeNotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("unknown consumer '{0}'")]
    UnknownConsumer(String),
    #[error("invalid broker url '{0}'")]
    InvalidUrl(String),
}

/// Errors surfaced by logical queues, the registry and the messenger.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Rejected before any broker interaction took place.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The channel is down; retry once the connection manager has recovered it.
    #[error("broker unavailable: {0}")]
    Connectivity(#[source] BrokerError),

    /// Unsubscribe attempted every level; these ones could not be cancelled.
    #[error(
        "failed to cancel {} of {} consumers on queue '{queue}'",
        .failures.len(),
        PRIORITY_LEVELS
    )]
    PartialCancel {
        queue: String,
        failures: Vec<(Priority, BrokerError)>,
    },

    /// Subscribe failed midway and some of the consumers installed before the failure
    /// could not be cancelled. They are still registered at the broker.
    #[error(
        "subscribe to '{queue}' failed ({cause}); {} installed consumers could not be cancelled",
        .leaked.len()
    )]
    IncompleteRollback {
        queue: String,
        #[source]
        cause: BrokerError,
        leaked: Vec<(Priority, BrokerError)>,
    },

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("broker error: {0}")]
    Broker(#[source] BrokerError),
}

impl QueueError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        QueueError::InvalidArgument(msg.into())
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, QueueError::InvalidArgument(_))
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, QueueError::Connectivity(_))
    }
}

impl From<BrokerError> for QueueError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::ChannelDown(_) => QueueError::Connectivity(err),
            other => QueueError::Broker(other),
        }
    }
}

/// Rejects empty or whitespace-only queue names.
pub(crate) fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    if name.trim().is_empty() {
        return Err(QueueError::invalid("queue name must not be blank"));
    }
    Ok(())
}
