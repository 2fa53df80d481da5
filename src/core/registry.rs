use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::core::broker::{Connection, QueueOptions};
use crate::core::error::{validate_queue_name, QueueError};
use crate::core::queue::{LogicalQueue, QueueDefaults};
use crate::core::worker_pool::WorkerPool;

type Slot = Arc<OnceCell<Arc<LogicalQueue>>>;

/// [`QueueRegistry`] maps logical queue names to their single [`LogicalQueue`] instance.
///
/// One registry belongs to one connection. The DashMap entry for a name is claimed
/// atomically, and construction runs inside that entry's `OnceCell`, so concurrent first
/// lookups share one construction and never declare the physical queues twice.
#[derive(Debug)]
pub struct QueueRegistry {
    connection: Arc<dyn Connection>,
    pool: Arc<WorkerPool>,
    defaults: QueueDefaults,
    queues: DashMap<String, Slot>,
}

impl QueueRegistry {
    pub fn new(
        connection: Arc<dyn Connection>,
        pool: Arc<WorkerPool>,
        defaults: QueueDefaults,
    ) -> Self {
        Self {
            connection,
            pool,
            defaults,
            queues: DashMap::new(),
        }
    }

    /// Returns the queue for `name`, declaring it on first use.
    ///
    /// `options` only matter to whichever caller creates the queue; later lookups get the
    /// existing instance unchanged. A failed creation removes its empty slot again, so the
    /// next caller starts over and failed names do not accumulate.
    pub async fn get_or_create(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<Arc<LogicalQueue>, QueueError> {
        validate_queue_name(name)?;

        let slot: Slot = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let created = slot
            .get_or_try_init(|| async {
                debug!(target: "priomq::registry", queue = %name, "Queue not cached; declaring");
                LogicalQueue::declare(
                    name,
                    Arc::clone(&self.connection),
                    options,
                    self.defaults,
                    Arc::clone(&self.pool),
                )
                .await
                .map(Arc::new)
            })
            .await;

        match created {
            Ok(queue) => Ok(Arc::clone(queue)),
            Err(err) => {
                self.queues.remove_if(name, |_, cell| {
                    Arc::ptr_eq(cell, &slot) && !cell.initialized()
                });
                Err(err)
            }
        }
    }

    /// Looks up an already-created queue without touching the broker.
    pub fn get(&self, name: &str) -> Option<Arc<LogicalQueue>> {
        self.queues
            .get(name)
            .and_then(|slot| slot.get().map(Arc::clone))
    }

    /// Every fully created queue.
    pub fn queues(&self) -> Vec<Arc<LogicalQueue>> {
        self.queues
            .iter()
            .filter_map(|entry| entry.value().get().map(Arc::clone))
            .collect()
    }

    /// Names of every fully created queue.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.queues.iter().filter(|e| e.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
