use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use synchronized_consumer::{
    Consumer, ConsumerError, KafkaConsumer, PrometheusMetrics, SynchronizedConsumer,
    Partition, SynchronizedConsumerConfig, SynchronizedConsumerOptions, Topic,
};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,synchronized_consumer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  sync-tail <config.toml> <topic>...");
        std::process::exit(1);
    }

    let config = SynchronizedConsumerConfig::load(Some(Path::new(&args[1])))?;
    let topics: Vec<Topic> = args[2..].iter().map(|topic| Topic::new(topic.as_str())).collect();

    info!(
        group_id = %config.group_id,
        commit_log_topic = %config.commit_log_topic,
        tracked_groups = ?config.tracked_groups,
        "Starting sync-tail"
    );

    let mut consumer = SynchronizedConsumer::with_options(
        KafkaConsumer::new(&config.consumer_client_config())?,
        KafkaConsumer::new(&config.commit_log_client_config())?,
        config.commit_log_topic(),
        config.tracked_groups.clone(),
        SynchronizedConsumerOptions {
            startup_timeout: config.startup_timeout(),
            metrics: Arc::new(PrometheusMetrics::with_default_registry()),
        },
    )?;

    consumer.subscribe(
        &topics,
        Some(Box::new(|offsets: &HashMap<Partition, u64>| {
            for (partition, offset) in offsets {
                info!(%partition, offset, "Partition assigned");
            }
        })),
        Some(Box::new(|partitions: &[Partition]| {
            info!(partitions = ?partitions, "Partitions revoked");
        })),
    )?;

    loop {
        match consumer.poll(Some(POLL_TIMEOUT)) {
            Ok(Some(message)) => info!(
                partition = %message.partition,
                offset = message.offset,
                timestamp = %message.timestamp,
                key = ?message.payload.key.as_deref().map(String::from_utf8_lossy),
                bytes = message.payload.value.len(),
                "Released message"
            ),
            Ok(None) => {}
            Err(ConsumerError::EndOfPartition { partition, offset }) => {
                debug!(%partition, offset, "Reached end of partition");
            }
            Err(e) if e.is_commit_log_failure() => {
                warn!(error = %e, "Commit log consumer failed, shutting down");
                consumer.close(None);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
    }
}
