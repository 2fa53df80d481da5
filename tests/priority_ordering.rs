#[path = "common.rs"]
mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use priomq::{handler_fn, Delivery, PublishOptions, SubscribeOptions};

#[tokio::test]
async fn highest_priority_first_whatever_the_publish_order() {
    for (first, second) in [(0u8, 9u8), (9, 0)] {
        let (_conn, messenger) = common::messenger();
        messenger
            .publish(format!("p{first}"), "q", Some(first), PublishOptions::new())
            .await
            .unwrap();
        messenger
            .publish(format!("p{second}"), "q", Some(second), PublishOptions::new())
            .await
            .unwrap();

        let (handler, mut rx) = common::recording_handler();
        messenger
            .subscribe("q", SubscribeOptions::new().prefetch(1), handler)
            .await
            .unwrap();

        let order: Vec<u8> = common::collect(&mut rx, 2)
            .await
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(order, vec![0, 9], "publish order {first},{second}");
    }
}

#[tokio::test]
async fn jobs_drain_high_priority_batch_before_low() {
    let (conn, messenger) = common::messenger();

    for i in 0..5 {
        messenger
            .publish(format!("high-{i}"), "jobs", Some(0), PublishOptions::new())
            .await
            .unwrap();
        messenger
            .publish(format!("low-{i}"), "jobs", Some(9), PublishOptions::new())
            .await
            .unwrap();
    }

    let (handler, mut rx) = common::recording_handler();
    messenger
        .subscribe("jobs", SubscribeOptions::new().prefetch(1), handler)
        .await
        .unwrap();

    let recorded = common::collect(&mut rx, 10).await;
    let expected: Vec<(u8, String)> = (0..5)
        .map(|i| (0, format!("high-{i}")))
        .chain((0..5).map(|i| (9, format!("low-{i}"))))
        .collect();
    assert_eq!(recorded, expected);

    messenger.unsubscribe("jobs").await.unwrap();
    for name in common::physical_names("jobs") {
        assert_eq!(conn.queue_depth(&name), Some(0));
    }
}

#[tokio::test]
async fn jobs_drain_in_priority_order_with_default_prefetch_on_one_worker() {
    let (_conn, messenger) = common::messenger_with(&common::single_worker_config());

    for i in 0..5 {
        messenger
            .publish(format!("high-{i}"), "jobs", Some(0), PublishOptions::new())
            .await
            .unwrap();
        messenger
            .publish(format!("low-{i}"), "jobs", Some(9), PublishOptions::new())
            .await
            .unwrap();
    }

    let (handler, mut rx) = common::recording_handler();
    messenger
        .subscribe("jobs", SubscribeOptions::new(), handler)
        .await
        .unwrap();

    let recorded = common::collect(&mut rx, 10).await;
    let expected: Vec<(u8, String)> = (0..5)
        .map(|i| (0, format!("high-{i}")))
        .chain((0..5).map(|i| (9, format!("low-{i}"))))
        .collect();
    assert_eq!(recorded, expected);
}

#[tokio::test]
async fn late_high_priority_runs_before_earlier_low_priority_work() {
    let (_conn, messenger) = common::messenger_with(&common::single_worker_config());
    let (handler, mut started, gate) = common::gated_handler();
    messenger
        .subscribe("q", SubscribeOptions::new(), handler)
        .await
        .unwrap();

    for i in 0..3 {
        messenger
            .publish(format!("low-{i}"), "q", Some(9), PublishOptions::new())
            .await
            .unwrap();
    }
    assert_eq!(common::collect(&mut started, 1).await, vec!["low-0"]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    messenger
        .publish("high", "q", Some(0), PublishOptions::new())
        .await
        .unwrap();
    gate.send(true).unwrap();

    assert_eq!(
        common::collect(&mut started, 3).await,
        vec!["high", "low-1", "low-2"]
    );
}

#[tokio::test]
async fn prefetch_bounds_in_flight_work_across_all_levels() {
    let (_conn, messenger) = common::messenger();
    for level in 0..5u8 {
        for i in 0..2 {
            messenger
                .publish(format!("{level}-{i}"), "q", Some(level), PublishOptions::new())
                .await
                .unwrap();
        }
    }

    let held: Arc<Mutex<Vec<Delivery>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = held.clone();
    let handler = handler_fn(move |delivery| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(delivery);
        }
    });
    messenger
        .subscribe("q", SubscribeOptions::new().prefetch(3), handler)
        .await
        .unwrap();

    wait_until(|| held.lock().unwrap().len() == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first_wave: Vec<Delivery> = held.lock().unwrap().drain(..).collect();
    // Workers may push in any order; which levels got the credits is what matters.
    let mut levels: Vec<u8> = first_wave.iter().map(|d| d.priority().level()).collect();
    levels.sort_unstable();
    assert_eq!(levels, vec![0, 0, 1]);

    for delivery in first_wave {
        delivery.ack().await.unwrap();
    }
    wait_until(|| held.lock().unwrap().len() == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(held.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn connection_loss_redelivers_unacknowledged_work() {
    let (conn, messenger) = common::messenger();

    let held: Arc<Mutex<Vec<Delivery>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = held.clone();
    let handler = handler_fn(move |delivery| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(delivery);
        }
    });
    messenger
        .subscribe("q", SubscribeOptions::new().prefetch(2), handler)
        .await
        .unwrap();
    messenger.publish("a", "q", Some(1), PublishOptions::new()).await.unwrap();
    messenger.publish("b", "q", Some(1), PublishOptions::new()).await.unwrap();
    wait_until(|| held.lock().unwrap().len() == 2).await;

    conn.simulate_connection_loss();
    let stale: Vec<Delivery> = held.lock().unwrap().drain(..).collect();
    for delivery in stale {
        assert!(delivery.ack().await.unwrap_err().is_connectivity());
    }

    conn.recover();
    wait_until(|| held.lock().unwrap().len() == 2).await;
    let again = held.lock().unwrap();
    assert!(again.iter().all(|d| d.redelivered()));
    let mut bodies: Vec<&[u8]> = again.iter().map(|d| d.payload().as_ref()).collect();
    bodies.sort_unstable();
    assert_eq!(bodies, vec![&b"a"[..], &b"b"[..]]);
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
