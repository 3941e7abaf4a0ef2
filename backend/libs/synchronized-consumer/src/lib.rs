//! # Synchronized Consumer
//!
//! A consumer decorator that keeps one consumer group behind a set of other
//! groups on the same topic.
//!
//! Groups that should gate this consumer publish their committed offsets to a
//! commit log topic. A background thread follows that topic and records the
//! latest offset per tracked group and partition. The wrapped consumer only
//! hands out a message once every tracked group has committed an offset
//! greater than the message's offset; otherwise the partition is paused and
//! rewound until the groups catch up.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use synchronized_consumer::{
//!     Consumer, KafkaConsumer, SynchronizedConsumer, SynchronizedConsumerConfig, Topic,
//! };
//!
//! fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SynchronizedConsumerConfig::load(None)?;
//!
//!     let mut consumer = SynchronizedConsumer::new(
//!         KafkaConsumer::new(&config.consumer_client_config())?,
//!         KafkaConsumer::new(&config.commit_log_client_config())?,
//!         config.commit_log_topic(),
//!         config.tracked_groups.clone(),
//!     )?;
//!
//!     consumer.subscribe(&[Topic::new("events")], None, None)?;
//!     loop {
//!         if let Some(message) = consumer.poll(Some(Duration::from_secs(1)))? {
//!             // Every tracked group has already committed past this message
//!             println!("{} @ {}", message.partition, message.offset);
//!         }
//!     }
//! }
//! ```
//!
//! ## Commit log records
//!
//! Keys are `"{topic}:{partition}:{group}"`; values are JSON
//! `{"offset": 42, "orig_message_ts": 1700000000.5}` or a bare integer. See
//! [`CommitCodec`].
//!
//! ## Failure behaviour
//!
//! If the commit log thread fails, every later call to
//! [`Consumer::poll`] on the synchronized consumer returns an error
//! describing the failure.

pub mod codec;
pub mod config;
pub mod consumer;
mod error;
pub mod kafka;
pub mod local;
pub mod metrics;
pub mod remote_offsets;
pub mod synchronized;
mod synchronized_consumer;
pub mod types;
mod worker;

pub use codec::CommitCodec;
pub use config::{OffsetReset, SynchronizedConsumerConfig};
pub use consumer::{AssignmentCallback, Consumer, RevocationCallback};
pub use error::{ConsumerError, ConsumerResult};
pub use kafka::KafkaConsumer;
pub use local::{LocalBroker, LocalConsumer};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, PrometheusMetrics};
pub use remote_offsets::RemoteOffsets;
pub use synchronized::Synchronized;
pub use synchronized_consumer::{SynchronizedConsumer, SynchronizedConsumerOptions};
pub use types::{BrokerValue, Commit, KafkaPayload, Partition, Topic};
pub use worker::{WorkerState, COMMIT_LOG_POLL_TIMEOUT};
