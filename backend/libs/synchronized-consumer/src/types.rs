//! Core data types shared by every consumer implementation

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of a topic on the log broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::new(name)
    }
}

/// A single partition of a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub topic: Topic,
    pub index: u16,
}

impl Partition {
    pub fn new(topic: Topic, index: u16) -> Self {
        Self { topic, index }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.index)
    }
}

/// A message read from a partition
///
/// `offset` is the position of this message; the consumer's position after
/// reading it is `offset + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerValue<T> {
    pub payload: T,
    pub partition: Partition,
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
}

impl<T> BrokerValue<T> {
    pub fn new(payload: T, partition: Partition, offset: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            payload,
            partition,
            offset,
            timestamp,
        }
    }

    /// Offset of the message that follows this one
    pub fn next_offset(&self) -> u64 {
        self.offset + 1
    }
}

/// Raw Kafka record contents, as carried on the commit log topic
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KafkaPayload {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl KafkaPayload {
    pub fn new(key: Option<Vec<u8>>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            headers: Vec::new(),
        }
    }
}

/// Offset committed by a consumer group, as published on the commit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub group: String,
    pub partition: Partition,
    pub offset: u64,
    /// Timestamp of the message that produced this commit, if known
    pub orig_message_ts: Option<DateTime<Utc>>,
}

impl Commit {
    pub fn new(group: impl Into<String>, partition: Partition, offset: u64) -> Self {
        Self {
            group: group.into(),
            partition,
            offset,
            orig_message_ts: None,
        }
    }

    pub fn with_orig_message_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.orig_message_ts = Some(ts);
        self
    }
}
