//! priomq – priority-aware logical queues on top of a plain FIFO broker.
//!
//! This crate exports
//!  * `core`      – priority levels, logical queues, the strict-priority dispatcher,
//!                  the queue registry and the broker capability traits
//!  * `broker`    – the in-process connection manager implementing those traits
//!  * `messenger` – name-addressed publish / subscribe / unsubscribe
//!  * `config`    – TOML and environment driven configuration
//!
//! Each logical queue is backed by ten broker queues, one per priority level
//! (0 = highest, 9 = lowest). Subscribers always drain the highest non-empty level first.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;
pub mod messenger;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config, CONFIG};
pub use crate::core::error::{BrokerError, QueueError};
pub use crate::core::message::PublishOptions;
pub use crate::core::priority::{Priority, DEFAULT_PRIORITY, PRIORITY_LEVELS};
pub use crate::core::queue::{handler_fn, Delivery, Handler, LogicalQueue, SubscribeOptions};
pub use messenger::Messenger;
