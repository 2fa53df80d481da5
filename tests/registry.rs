#[path = "common.rs"]
mod common;

use std::sync::Arc;

use priomq::broker::MemoryConnection;
use priomq::core::broker::QueueOptions;
use priomq::core::registry::QueueRegistry;
use priomq::core::worker_pool::WorkerPool;
use priomq::core::queue::QueueDefaults;

fn registry() -> (MemoryConnection, QueueRegistry) {
    common::init_logging();
    let conn = MemoryConnection::open("memory://registry").unwrap();
    let pool = Arc::new(WorkerPool::new(2).unwrap());
    let registry = QueueRegistry::new(Arc::new(conn.clone()), pool, QueueDefaults::default());
    (conn, registry)
}

#[tokio::test]
async fn same_name_yields_same_instance_and_declares_once() {
    let (conn, registry) = registry();

    let first = registry.get_or_create("jobs", &QueueOptions::default()).await.unwrap();
    let second = registry.get_or_create("jobs", &QueueOptions::default()).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(conn.stats().queue_declarations, 10);
    assert_eq!(conn.queue_names(), common::physical_names("jobs"));
    assert!(common::physical_names("jobs")
        .iter()
        .all(|q| conn.is_durable(q) == Some(true)));
}

#[tokio::test]
async fn blank_names_are_rejected_before_touching_the_broker() {
    let (conn, registry) = registry();

    for name in ["", "   ", "\t\n"] {
        let err = registry
            .get_or_create(name, &QueueOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument(), "{name:?} accepted");
    }
    assert_eq!(conn.stats().queue_declarations, 0);
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_lookups_build_one_queue() {
    let (conn, registry) = registry();
    let registry = Arc::new(registry);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .get_or_create("contended", &QueueOptions::default())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut queues = Vec::new();
    for handle in handles {
        queues.push(handle.await.unwrap());
    }

    assert!(queues.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(conn.stats().queue_declarations, 10);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn options_only_apply_on_creation() {
    let (conn, registry) = registry();

    registry
        .get_or_create("routed", &QueueOptions::new().exchange("work"))
        .await
        .unwrap();
    let again = registry
        .get_or_create("routed", &QueueOptions::new().exchange("other"))
        .await
        .unwrap();

    assert_eq!(again.name(), "routed");
    assert_eq!(conn.stats().exchange_declarations, 1);
    assert_eq!(conn.stats().queue_declarations, 10);
}

#[tokio::test]
async fn creation_during_outage_fails_and_can_be_retried() {
    let (conn, registry) = registry();

    conn.simulate_connection_loss();
    let err = registry
        .get_or_create("later", &QueueOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
    assert!(registry.get("later").is_none());
    assert!(registry.names().is_empty());

    conn.recover();
    let queue = registry.get_or_create("later", &QueueOptions::default()).await.unwrap();
    assert!(Arc::ptr_eq(&queue, &registry.get("later").unwrap()));
    assert_eq!(registry.names(), vec!["later".to_string()]);
}
