//! Error types for the synchronized consumer library

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::types::{Partition, Topic};

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors raised by consumers, the commit log worker and the codec
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Operation attempted after `close()`
    #[error("consumer is closed")]
    Closed,

    /// The consumer reached the end of a partition. Not a failure.
    #[error("end of partition {partition} at offset {offset}")]
    EndOfPartition { partition: Partition, offset: u64 },

    /// Operation referenced partitions that are not currently assigned
    #[error("cannot {action} unassigned partitions: {partitions:?}")]
    UnassignedPartitions {
        action: &'static str,
        partitions: Vec<Partition>,
    },

    #[error("unknown topic: {0}")]
    UnknownTopic(Topic),

    #[error("topic already exists: {0}")]
    TopicExists(Topic),

    /// Broker reported a partition number outside the supported range
    #[error("invalid partition number: {0}")]
    InvalidPartition(i32),

    /// Commit log payload could not be decoded
    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kafka client error
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The commit log thread could not be started
    #[error("failed to spawn commit log thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The commit log worker stopped with an error
    #[error("commit log consumer thread crashed: {0}")]
    CommitLogWorkerCrashed(#[source] Arc<ConsumerError>),

    #[error("commit log consumer thread panicked: {0}")]
    CommitLogWorkerPanicked(String),

    /// The commit log worker returned without being asked to stop
    #[error("commit log consumer thread unexpectedly exited")]
    CommitLogWorkerExited,

    /// The commit log consumer never received an assignment
    #[error("commit log consumer was not assigned partitions within {0:?}")]
    StartupTimeout(Duration),
}

impl ConsumerError {
    /// Check if error only signals the end of a partition
    pub fn is_end_of_partition(&self) -> bool {
        matches!(self, ConsumerError::EndOfPartition { .. })
    }

    /// Check if error was caused by the commit log worker dying
    pub fn is_commit_log_failure(&self) -> bool {
        matches!(
            self,
            ConsumerError::CommitLogWorkerCrashed(_)
                | ConsumerError::CommitLogWorkerPanicked(_)
                | ConsumerError::CommitLogWorkerExited
        )
    }
}
