//! Priority levels for logical queues.
//!
//! Each logical queue is backed by one physical queue per level. Level 0 is the
//! highest priority and level 9 the lowest.

use std::fmt;

use crate::core::error::QueueError;

/// Number of physical queues behind every logical queue.
pub const PRIORITY_LEVELS: usize = 10;

/// Sits in the middle so callers have room above and below it.
pub const DEFAULT_PRIORITY: u8 = 4;

/// A validated priority level in `0..=9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const LOWEST: Priority = Priority((PRIORITY_LEVELS - 1) as u8);
    pub const DEFAULT: Priority = Priority(DEFAULT_PRIORITY);

    /// Out-of-range levels are rejected, never clamped.
    pub fn new(level: u8) -> Result<Self, QueueError> {
        if (level as usize) < PRIORITY_LEVELS {
            Ok(Priority(level))
        } else {
            Err(QueueError::invalid(format!(
                "priority {level} is outside 0..={}",
                PRIORITY_LEVELS - 1
            )))
        }
    }

    #[inline]
    pub fn level(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// All levels, highest priority first.
    pub fn all() -> impl Iterator<Item = Priority> {
        (0..PRIORITY_LEVELS as u8).map(Priority)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Priority::new(level)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-level name of the physical queue serving `priority` for `logical`.
pub fn physical_queue_name(logical: &str, priority: Priority) -> String {
    format!("{logical}_{}", priority.level())
}
