//! Commit log record encoding.
//!
//! Each record key is `"{topic}:{partition}:{group}"`. The value is either a
//! JSON object `{"offset": 42, "orig_message_ts": 1700000000.5}` or, for older
//! producers, the bare offset as ASCII digits.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConsumerError, ConsumerResult};
use crate::types::{Commit, KafkaPayload, Partition, Topic};

#[derive(Debug, Serialize, Deserialize)]
struct CommitValue {
    offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    orig_message_ts: Option<f64>,
}

/// Encoder/decoder for commit log payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitCodec;

impl CommitCodec {
    pub fn encode(&self, commit: &Commit) -> ConsumerResult<KafkaPayload> {
        let key = format!(
            "{}:{}:{}",
            commit.partition.topic, commit.partition.index, commit.group
        );
        let value = serde_json::to_vec(&CommitValue {
            offset: commit.offset,
            orig_message_ts: commit.orig_message_ts.map(to_epoch_seconds),
        })?;

        Ok(KafkaPayload::new(Some(key.into_bytes()), value))
    }

    pub fn decode(&self, payload: &KafkaPayload) -> ConsumerResult<Commit> {
        let key = payload
            .key
            .as_deref()
            .ok_or_else(|| ConsumerError::InvalidCommit("payload key is missing".to_string()))?;
        let key = std::str::from_utf8(key)
            .map_err(|e| ConsumerError::InvalidCommit(format!("payload key is not UTF-8: {}", e)))?;

        let mut parts = key.splitn(3, ':');
        let (topic, index, group) = match (parts.next(), parts.next(), parts.next()) {
            (Some(topic), Some(index), Some(group)) if !topic.is_empty() => (topic, index, group),
            _ => {
                return Err(ConsumerError::InvalidCommit(format!(
                    "malformed payload key: {:?}",
                    key
                )))
            }
        };
        let index: u16 = index.parse().map_err(|_| {
            ConsumerError::InvalidCommit(format!("invalid partition index in key: {:?}", key))
        })?;

        let (offset, orig_message_ts) = match serde_json::from_slice::<CommitValue>(&payload.value)
        {
            Ok(value) => (
                value.offset,
                value.orig_message_ts.map(from_epoch_seconds).transpose()?,
            ),
            Err(json_err) => (decode_legacy_offset(&payload.value).ok_or(json_err)?, None),
        };

        Ok(Commit {
            group: group.to_string(),
            partition: Partition::new(Topic::new(topic), index),
            offset,
            orig_message_ts,
        })
    }
}

fn decode_legacy_offset(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

fn to_epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_nanos()) / 1e9
}

fn from_epoch_seconds(seconds: f64) -> ConsumerResult<DateTime<Utc>> {
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;

    Utc.timestamp_opt(whole as i64, nanos).single().ok_or_else(|| {
        ConsumerError::InvalidCommit(format!("invalid orig_message_ts: {}", seconds))
    })
}
