#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use priomq::broker::MemoryConnection;
use priomq::{handler_fn, Config, Handler, Messenger};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        priomq::logging::init_logging();
    });
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.workers.pool_size = 5;
    config
}

/// A messenger over a fresh in-process broker, plus a handle for inspecting the broker.
pub fn messenger() -> (MemoryConnection, Messenger) {
    messenger_with(&test_config())
}

pub fn messenger_with(config: &Config) -> (MemoryConnection, Messenger) {
    init_logging();
    let connection = MemoryConnection::open("memory://test").expect("open broker");
    let messenger = Messenger::new(Arc::new(connection.clone()), config).expect("messenger");
    (connection, messenger)
}

/// Test config with a single handler worker.
pub fn single_worker_config() -> Config {
    let mut config = Config::default();
    config.workers.pool_size = 1;
    config
}

/// Records `(priority, payload)` for each delivery, then acknowledges it.
pub fn recording_handler() -> (Handler, mpsc::UnboundedReceiver<(u8, String)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |delivery| {
        let tx = tx.clone();
        async move {
            let payload = String::from_utf8_lossy(delivery.payload()).into_owned();
            let _ = tx.send((delivery.priority().level(), payload));
            delivery.ack().await.expect("ack");
        }
    });
    (handler, rx)
}

/// Records each payload as its handler starts, then holds the worker until the gate opens.
pub fn gated_handler() -> (Handler, mpsc::UnboundedReceiver<String>, watch::Sender<bool>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (gate, open) = watch::channel(false);
    let handler = handler_fn(move |delivery| {
        let tx = tx.clone();
        let mut open = open.clone();
        async move {
            let _ = tx.send(String::from_utf8_lossy(delivery.payload()).into_owned());
            let _ = open.wait_for(|open| *open).await;
            delivery.ack().await.expect("ack");
        }
    });
    (handler, rx, gate)
}

pub async fn collect<T>(rx: &mut mpsc::UnboundedReceiver<T>, n: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("handler channel closed");
        out.push(item);
    }
    out
}

pub fn physical_names(logical: &str) -> Vec<String> {
    (0..10).map(|p| format!("{logical}_{p}")).collect()
}
