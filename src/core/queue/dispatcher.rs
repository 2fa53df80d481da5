//! Strict-priority dispatch from the ten per-level buffers into the worker pool.
//!
//! Broker consumers push raw deliveries into one flume channel per level and ring a
//! shared [`Notify`]. The dispatcher takes a prefetch credit, waits for something to be
//! buffered, reserves a free worker, and only then picks the lowest-numbered non-empty
//! level. Choosing at the moment a worker is free keeps later high-priority deliveries
//! ahead of lower ones that arrived first. Lower levels only run when every level above
//! them is empty, so sustained level-0 traffic starves level 9. That is the chosen policy.

use std::sync::Arc;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, trace, warn};

use crate::core::broker::{Consumer, RawDelivery};
use crate::core::priority::{Priority, PRIORITY_LEVELS};
use crate::core::queue::delivery::{Delivery, Handler};
use crate::core::worker_pool::{WorkerPool, WorkerSlot};

/// Per-level buffers shared between the broker consumers and the dispatcher.
pub(crate) struct LevelBuffers {
    senders: Vec<flume::Sender<RawDelivery>>,
    receivers: Vec<flume::Receiver<RawDelivery>>,
    ready: Arc<Notify>,
}

impl LevelBuffers {
    pub fn new() -> Self {
        let (senders, receivers) = (0..PRIORITY_LEVELS).map(|_| flume::unbounded()).unzip();
        Self {
            senders,
            receivers,
            ready: Arc::new(Notify::new()),
        }
    }

    /// Broker-side callback feeding `priority`'s buffer. Never blocks.
    pub fn consumer(&self, queue: &str, priority: Priority) -> Consumer {
        let tx = self.senders[priority.index()].clone();
        let ready = Arc::clone(&self.ready);
        let queue = queue.to_string();
        Arc::new(move |raw: RawDelivery| {
            if tx.send(raw).is_ok() {
                ready.notify_one();
            } else {
                debug!(
                    target: "priomq::queue",
                    queue = %queue,
                    %priority,
                    "Delivery arrived after unsubscribe"
                );
            }
        })
    }

    /// Removes everything still buffered, highest priority first.
    pub fn drain(&self) -> Vec<RawDelivery> {
        self.receivers.iter().flat_map(|rx| rx.drain()).collect()
    }

    fn poll_ready(&self) -> Option<(Priority, RawDelivery)> {
        Priority::all().find_map(|priority| {
            self.receivers[priority.index()]
                .try_recv()
                .ok()
                .map(|raw| (priority, raw))
        })
    }

    fn has_ready(&self) -> bool {
        self.receivers.iter().any(|rx| !rx.is_empty())
    }

    async fn wait_ready(&self) {
        while !self.has_ready() {
            self.ready.notified().await;
        }
    }
}

pub(crate) struct Dispatcher {
    pub queue: String,
    pub buffers: Arc<LevelBuffers>,
    pub credits: Arc<Semaphore>,
    pub handler: Handler,
    pub pool: Arc<WorkerPool>,
}

impl Dispatcher {
    /// Runs until `stop` flips or its sender goes away.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        debug!(target: "priomq::queue", queue = %self.queue, "Dispatcher started");
        loop {
            let credit = tokio::select! {
                biased;
                _ = stop.changed() => break,
                credit = Arc::clone(&self.credits).acquire_owned() => match credit {
                    Ok(credit) => credit,
                    Err(_) => break,
                },
            };

            let Some((priority, raw, slot)) = self.next_job(&mut stop).await else {
                break;
            };

            trace!(
                target: "priomq::queue",
                queue = %self.queue,
                %priority,
                tag = raw.delivery_tag,
                "Dispatching delivery"
            );

            let job = (self.handler)(Delivery::new(raw, priority, credit));
            if self.pool.submit(slot, job).is_err() {
                warn!(target: "priomq::queue", queue = %self.queue, "Worker pool closed; dispatcher stopping");
                break;
            }
        }
        debug!(target: "priomq::queue", queue = %self.queue, "Dispatcher stopped");
    }

    /// Picks the highest-priority buffered delivery once a worker is free to run it.
    /// `None` means stop or a closed pool.
    async fn next_job(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<(Priority, RawDelivery, WorkerSlot)> {
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => return None,
                _ = self.buffers.wait_ready() => {}
            }

            let slot = tokio::select! {
                biased;
                _ = stop.changed() => return None,
                slot = self.pool.reserve() => match slot {
                    Ok(slot) => slot,
                    Err(_) => {
                        warn!(target: "priomq::queue", queue = %self.queue, "Worker pool closed; dispatcher stopping");
                        return None;
                    }
                },
            };

            // The buffers may have been drained while waiting for the worker.
            if let Some((priority, raw)) = self.buffers.poll_ready() {
                return Some((priority, raw, slot));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::broker::Acknowledger;
    use crate::core::error::BrokerError;
    use crate::core::message::Envelope;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct NoopAcker;

    #[async_trait]
    impl Acknowledger for NoopAcker {
        async fn ack(&self, _: u64) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn reject(&self, _: u64, _: bool) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn raw(tag: u64) -> RawDelivery {
        RawDelivery::new(tag, "q", Envelope::new("x"), false, Arc::new(NoopAcker))
    }

    #[tokio::test]
    async fn lowest_level_wins_regardless_of_arrival_order() {
        let buffers = LevelBuffers::new();
        (buffers.consumer("q", Priority::new(9).unwrap()))(raw(1));
        (buffers.consumer("q", Priority::new(3).unwrap()))(raw(2));
        (buffers.consumer("q", Priority::HIGHEST))(raw(3));

        buffers.wait_ready().await;
        let order: Vec<u8> = std::iter::from_fn(|| buffers.poll_ready())
            .map(|(priority, _)| priority.level())
            .collect();
        assert_eq!(order, vec![0, 3, 9]);
        assert!(!buffers.has_ready());
    }

    #[tokio::test]
    async fn drain_empties_every_level() {
        let buffers = LevelBuffers::new();
        for level in [7u8, 1, 4] {
            (buffers.consumer("q", Priority::new(level).unwrap()))(raw(level as u64));
        }

        let tags: Vec<u64> = buffers.drain().iter().map(|r| r.delivery_tag).collect();
        assert_eq!(tags, vec![1, 4, 7]);
        assert!(buffers.poll_ready().is_none());
    }

    fn dispatcher(
        buffers: &Arc<LevelBuffers>,
        pool: &Arc<WorkerPool>,
        handler: Handler,
    ) -> Dispatcher {
        Dispatcher {
            queue: "q".to_string(),
            buffers: Arc::clone(buffers),
            credits: Arc::new(Semaphore::new(50)),
            handler,
            pool: Arc::clone(pool),
        }
    }

    #[tokio::test]
    async fn level_is_chosen_when_a_worker_frees_up() {
        let buffers = Arc::new(LevelBuffers::new());
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let (seen_tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        let (open_tx, open) = watch::channel(false);

        let handler = crate::core::queue::delivery::handler_fn(move |delivery: Delivery| {
            let seen_tx = seen_tx.clone();
            let mut open = open.clone();
            async move {
                let _ = seen_tx.send(delivery.delivery_tag());
                let _ = open.wait_for(|open| *open).await;
            }
        });
        let (_stop_tx, stop) = watch::channel(false);
        tokio::spawn(dispatcher(&buffers, &pool, handler).run(stop));

        let low = Priority::LOWEST;
        (buffers.consumer("q", low))(raw(1));
        assert_eq!(seen.recv().await, Some(1));
        (buffers.consumer("q", low))(raw(2));
        (buffers.consumer("q", low))(raw(3));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        (buffers.consumer("q", Priority::HIGHEST))(raw(4));

        open_tx.send(true).unwrap();
        let mut rest = Vec::new();
        for _ in 0..3 {
            rest.push(seen.recv().await.unwrap());
        }
        assert_eq!(rest, vec![4, 2, 3]);
    }
}
