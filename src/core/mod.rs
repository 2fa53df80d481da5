pub mod broker;
pub mod error;
pub mod message;
pub mod priority;
pub mod queue;
pub mod registry;
pub mod worker_pool;
