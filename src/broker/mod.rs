//! # Broker Module
//!
//! Connection managers that implement the [`Connection`](crate::core::broker::Connection)
//! capability consumed by the priority engine.
//!
//! - `memory`: an in-process broker with AMQP-style queues, exchanges, prefetch,
//!   acknowledgements and an explicit connected / reconnecting / failed state machine.
//!   Used by the `priomq` binary, the benches and the test suite.

pub mod memory;

pub use self::memory::{BrokerStats, MemoryConnection};
