//! `priomq` command-line driver.
//!
//! Runs workloads against the in-process broker so the priority behaviour can be
//! observed without an external broker.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use priomq::broker::MemoryConnection;
use priomq::config::{load_config, Config, CONFIG};
use priomq::logging::init_logging;
use priomq::{handler_fn, Messenger, PublishOptions, SubscribeOptions};

#[derive(Debug, Parser)]
#[command(
    name = "priomq",
    version,
    about = "Priority-aware logical queues over a FIFO broker"
)]
pub struct Cli {
    /// TOML config file (defaults to $PRIOMQ_CONFIG, then priomq.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Publish a batch at two priorities before subscribing, then print delivery order
    Demo {
        /// Logical queue name
        #[arg(short, long, default_value = "jobs")]
        queue: String,
        /// Messages per priority level
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
        /// Priority of the first batch
        #[arg(long, default_value_t = 9)]
        low: u8,
        /// Priority of the second batch
        #[arg(long, default_value_t = 0)]
        high: u8,
        /// Unacknowledged deliveries allowed at once
        #[arg(short, long, default_value_t = 1)]
        prefetch: u16,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config: Config = match &cli.config {
        Some(path) => load_config(path)?,
        None => CONFIG.clone(),
    };

    match cli.command {
        Command::ShowConfig => {
            println!("{config:#?}");
            Ok(())
        }
        Command::Demo {
            queue,
            count,
            low,
            high,
            prefetch,
        } => run_demo(&config, &queue, count, low, high, prefetch).await,
    }
}

async fn run_demo(
    config: &Config,
    queue: &str,
    count: usize,
    low: u8,
    high: u8,
    prefetch: u16,
) -> anyhow::Result<()> {
    let connection = MemoryConnection::open(&config.broker.url)?;
    let messenger = Messenger::new(Arc::new(connection), config)?;

    for i in 0..count {
        messenger
            .publish(format!("low-{i}"), queue, Some(low), PublishOptions::new())
            .await?;
    }
    for i in 0..count {
        messenger
            .publish(format!("high-{i}"), queue, Some(high), PublishOptions::new())
            .await?;
    }
    info!(queue, count, low, high, "Published demo batches");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |delivery| {
        let tx = tx.clone();
        async move {
            let line = format!(
                "p{} {}",
                delivery.priority(),
                String::from_utf8_lossy(delivery.payload())
            );
            // Record before acking; the ack releases the next delivery.
            let _ = tx.send(line);
            if let Err(err) = delivery.ack().await {
                tracing::warn!(error = %err, "ack failed");
            }
        }
    });

    messenger
        .subscribe(queue, SubscribeOptions::new().prefetch(prefetch), handler)
        .await?;

    for _ in 0..count * 2 {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(line)) => println!("{line}"),
            _ => anyhow::bail!("timed out waiting for deliveries"),
        }
    }

    messenger.unsubscribe(queue).await?;
    Ok(())
}
