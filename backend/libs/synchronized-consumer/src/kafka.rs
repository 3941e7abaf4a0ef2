//! [`Consumer`] over librdkafka's `BaseConsumer`.
//!
//! Rebalances are detected by comparing the client's assignment with the
//! partitions we track after every underlying poll, so callbacks always run
//! on the thread that called [`Consumer::poll`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer as _};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::config::OffsetReset;
use crate::consumer::{AssignmentCallback, Consumer, RevocationCallback};
use crate::error::{ConsumerError, ConsumerResult};
use crate::types::{BrokerValue, KafkaPayload, Partition, Topic};

/// Timeout for committed offset, watermark and seek requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaConsumer {
    consumer: BaseConsumer,
    member_id: String,
    offset_reset: OffsetReset,
    on_assign: Option<AssignmentCallback>,
    on_revoke: Option<RevocationCallback>,
    offsets: HashMap<Partition, u64>,
    staged: HashMap<Partition, u64>,
    paused: HashSet<Partition>,
    closed: bool,
}

impl KafkaConsumer {
    /// Create a consumer. `auto.offset.reset` decides where newly assigned
    /// partitions without a committed offset start.
    pub fn new(config: &ClientConfig) -> ConsumerResult<Self> {
        let offset_reset = match config.get("auto.offset.reset") {
            Some(value) => value.parse()?,
            None => OffsetReset::default(),
        };
        let member_id = config
            .get("client.id")
            .or_else(|| config.get("group.id"))
            .unwrap_or("rdkafka")
            .to_string();

        let consumer: BaseConsumer = config.create()?;
        info!(member_id = %member_id, offset_reset = %offset_reset, "Created Kafka consumer");

        Ok(Self {
            consumer,
            member_id,
            offset_reset,
            on_assign: None,
            on_revoke: None,
            offsets: HashMap::new(),
            staged: HashMap::new(),
            paused: HashSet::new(),
            closed: false,
        })
    }

    fn ensure_open(&self) -> ConsumerResult<()> {
        if self.closed {
            return Err(ConsumerError::Closed);
        }
        Ok(())
    }

    fn ensure_assigned<'a>(
        &self,
        action: &'static str,
        partitions: impl IntoIterator<Item = &'a Partition>,
    ) -> ConsumerResult<()> {
        let unassigned: Vec<Partition> = partitions
            .into_iter()
            .filter(|partition| !self.offsets.contains_key(*partition))
            .cloned()
            .collect();
        if unassigned.is_empty() {
            Ok(())
        } else {
            Err(ConsumerError::UnassignedPartitions {
                action,
                partitions: unassigned,
            })
        }
    }

    /// Reconcile tracked partitions with the client's current assignment and
    /// fire the rebalance callbacks
    fn sync_assignment(&mut self) -> ConsumerResult<()> {
        let assignment = self.consumer.assignment()?;
        let mut current = HashSet::new();
        for element in assignment.elements() {
            current.insert(Partition::new(
                Topic::new(element.topic()),
                partition_index(element.partition())?,
            ));
        }

        let revoked: Vec<Partition> = self
            .offsets
            .keys()
            .filter(|partition| !current.contains(*partition))
            .cloned()
            .collect();
        if !revoked.is_empty() {
            self.forget(&revoked);
        }

        let added: Vec<Partition> = current
            .into_iter()
            .filter(|partition| !self.offsets.contains_key(partition))
            .collect();
        if !added.is_empty() {
            let positions = self.resolve_positions(&added)?;
            info!(member_id = %self.member_id, partitions = ?added, "Partitions assigned");
            self.offsets
                .extend(positions.iter().map(|(partition, offset)| (partition.clone(), *offset)));
            if let Some(on_assign) = self.on_assign.as_mut() {
                on_assign(&positions);
            }
        }
        Ok(())
    }

    /// Drop local state for partitions we no longer own
    fn forget(&mut self, revoked: &[Partition]) {
        for partition in revoked {
            self.offsets.remove(partition);
            self.staged.remove(partition);
            self.paused.remove(partition);
        }
        info!(member_id = %self.member_id, partitions = ?revoked, "Partitions revoked");
        if let Some(on_revoke) = self.on_revoke.as_mut() {
            on_revoke(revoked);
        }
    }

    fn resolve_positions(&self, partitions: &[Partition]) -> ConsumerResult<HashMap<Partition, u64>> {
        let committed = self
            .consumer
            .committed_offsets(partition_list(partitions), REQUEST_TIMEOUT)?;

        let mut positions = HashMap::new();
        for element in committed.elements() {
            let partition = Partition::new(
                Topic::new(element.topic()),
                partition_index(element.partition())?,
            );
            let position = match element.offset() {
                Offset::Offset(offset) if offset >= 0 => offset as u64,
                _ => self.reset_position(&partition)?,
            };
            positions.insert(partition, position);
        }
        Ok(positions)
    }

    fn reset_position(&self, partition: &Partition) -> ConsumerResult<u64> {
        let (low, high) = self.consumer.fetch_watermarks(
            partition.topic.as_str(),
            i32::from(partition.index),
            REQUEST_TIMEOUT,
        )?;
        match self.offset_reset {
            OffsetReset::Earliest => Ok(low.max(0) as u64),
            OffsetReset::Latest => Ok(high.max(0) as u64),
            OffsetReset::Error => Err(ConsumerError::Configuration(format!(
                "no committed offset for {} and auto.offset.reset is error",
                partition
            ))),
        }
    }

    /// librdkafka only reports the partition number on EOF; resolve it if a
    /// single assigned partition carries that number
    fn end_of_partition(&self, index: i32) -> ConsumerResult<Option<BrokerValue<KafkaPayload>>> {
        let mut matching = self
            .offsets
            .iter()
            .filter(|(partition, _)| i32::from(partition.index) == index);

        match (matching.next(), matching.next()) {
            (Some((partition, offset)), None) => Err(ConsumerError::EndOfPartition {
                partition: partition.clone(),
                offset: *offset,
            }),
            _ => {
                debug!(partition = index, "Ignoring end of partition for ambiguous partition number");
                Ok(None)
            }
        }
    }
}

impl Consumer for KafkaConsumer {
    type Payload = KafkaPayload;

    fn subscribe(
        &mut self,
        topics: &[Topic],
        on_assign: Option<AssignmentCallback>,
        on_revoke: Option<RevocationCallback>,
    ) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.on_assign = on_assign;
        self.on_revoke = on_revoke;

        let topics: Vec<&str> = topics.iter().map(Topic::as_str).collect();
        self.consumer.subscribe(&topics)?;
        debug!(member_id = %self.member_id, topics = ?topics, "Subscribed");
        Ok(())
    }

    fn unsubscribe(&mut self) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.consumer.unsubscribe();
        let revoked: Vec<Partition> = self.offsets.keys().cloned().collect();
        if !revoked.is_empty() {
            self.forget(&revoked);
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> ConsumerResult<Option<BrokerValue<KafkaPayload>>> {
        self.ensure_open()?;

        let polled = self.consumer.poll(timeout).map(|result| {
            result
                .map_err(ConsumerError::from)
                .and_then(|message| broker_value(&message))
        });
        self.sync_assignment()?;

        match polled {
            None => Ok(None),
            Some(Ok(message)) => {
                self.offsets
                    .insert(message.partition.clone(), message.next_offset());
                Ok(Some(message))
            }
            Some(Err(ConsumerError::Kafka(KafkaError::PartitionEOF(index)))) => {
                self.end_of_partition(index)
            }
            Some(Err(e)) => Err(e),
        }
    }

    fn pause(&mut self, partitions: &[Partition]) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.ensure_assigned("pause", partitions)?;
        self.consumer.pause(&partition_list(partitions))?;
        self.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &[Partition]) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.ensure_assigned("resume", partitions)?;
        self.consumer.resume(&partition_list(partitions))?;
        for partition in partitions {
            self.paused.remove(partition);
        }
        Ok(())
    }

    fn paused(&self) -> ConsumerResult<HashSet<Partition>> {
        self.ensure_open()?;
        Ok(self.paused.clone())
    }

    fn tell(&self) -> ConsumerResult<HashMap<Partition, u64>> {
        self.ensure_open()?;
        Ok(self.offsets.clone())
    }

    fn seek(&mut self, offsets: HashMap<Partition, u64>) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.ensure_assigned("seek", offsets.keys())?;
        for (partition, offset) in offsets {
            self.consumer.seek(
                partition.topic.as_str(),
                i32::from(partition.index),
                kafka_offset(offset),
                REQUEST_TIMEOUT,
            )?;
            self.offsets.insert(partition, offset);
        }
        Ok(())
    }

    fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.ensure_assigned("stage", offsets.keys())?;
        self.staged.extend(offsets);
        Ok(())
    }

    fn commit_offsets(&mut self) -> ConsumerResult<HashMap<Partition, u64>> {
        self.ensure_open()?;
        if self.staged.is_empty() {
            return Ok(HashMap::new());
        }

        let mut list = TopicPartitionList::new();
        for (partition, offset) in &self.staged {
            list.add_partition_offset(
                partition.topic.as_str(),
                i32::from(partition.index),
                kafka_offset(*offset),
            )?;
        }
        self.consumer.commit(&list, CommitMode::Sync)?;
        Ok(std::mem::take(&mut self.staged))
    }

    fn close(&mut self, _timeout: Option<Duration>) {
        if self.closed {
            return;
        }
        self.consumer.unsubscribe();
        let revoked: Vec<Partition> = self.offsets.keys().cloned().collect();
        if !revoked.is_empty() {
            self.forget(&revoked);
        }
        self.closed = true;
        info!(member_id = %self.member_id, "Kafka consumer closed");
    }

    fn closed(&self) -> bool {
        self.closed
    }

    fn member_id(&self) -> String {
        self.member_id.clone()
    }
}

fn partition_index(index: i32) -> ConsumerResult<u16> {
    u16::try_from(index).map_err(|_| ConsumerError::InvalidPartition(index))
}

fn kafka_offset(offset: u64) -> Offset {
    Offset::Offset(i64::try_from(offset).unwrap_or(i64::MAX))
}

fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    for partition in partitions {
        list.add_partition(partition.topic.as_str(), i32::from(partition.index));
    }
    list
}

fn broker_value(message: &BorrowedMessage<'_>) -> ConsumerResult<BrokerValue<KafkaPayload>> {
    let partition = Partition::new(
        Topic::new(message.topic()),
        partition_index(message.partition())?,
    );

    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let payload = KafkaPayload {
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    };
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or_else(Utc::now);

    Ok(BrokerValue::new(
        payload,
        partition,
        u64::try_from(message.offset()).unwrap_or_default(),
        timestamp,
    ))
}
