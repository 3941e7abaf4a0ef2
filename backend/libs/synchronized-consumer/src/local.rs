//! In-memory partitioned log with a matching [`Consumer`].
//!
//! Every consumer owns all partitions of the topics it subscribes to; there is
//! no group rebalancing between members. Committed offsets are tracked per
//! group so a new consumer resumes where its group left off.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::consumer::{AssignmentCallback, Consumer, RevocationCallback};
use crate::error::{ConsumerError, ConsumerResult};
use crate::types::{BrokerValue, Partition, Topic};

struct BrokerState<T> {
    topics: HashMap<Topic, Vec<Vec<BrokerValue<T>>>>,
    committed: HashMap<String, HashMap<Partition, u64>>,
}

/// Shared in-memory message store
pub struct LocalBroker<T> {
    state: Mutex<BrokerState<T>>,
    produced: Condvar,
    next_member: AtomicU64,
}

impl<T> Default for LocalBroker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LocalBroker<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                topics: HashMap::new(),
                committed: HashMap::new(),
            }),
            produced: Condvar::new(),
            next_member: AtomicU64::new(0),
        }
    }

    pub fn create_topic(&self, topic: &Topic, partitions: u16) -> ConsumerResult<()> {
        let mut state = self.state.lock();
        if state.topics.contains_key(topic) {
            return Err(ConsumerError::TopicExists(topic.clone()));
        }
        state
            .topics
            .insert(topic.clone(), (0..partitions).map(|_| Vec::new()).collect());
        Ok(())
    }

    /// Offset the next produced message on `partition` will receive
    pub fn high_watermark(&self, partition: &Partition) -> ConsumerResult<u64> {
        let state = self.state.lock();
        Ok(log(&state, partition)?.len() as u64)
    }

    /// Offsets committed by `group`
    pub fn committed(&self, group: &str) -> HashMap<Partition, u64> {
        self.state
            .lock()
            .committed
            .get(group)
            .cloned()
            .unwrap_or_default()
    }
}

impl<T: Clone> LocalBroker<T> {
    /// Append a message and wake any consumer blocked in `poll`
    pub fn produce(&self, partition: &Partition, payload: T) -> ConsumerResult<BrokerValue<T>> {
        let mut state = self.state.lock();
        let messages = state
            .topics
            .get_mut(&partition.topic)
            .and_then(|partitions| partitions.get_mut(usize::from(partition.index)))
            .ok_or_else(|| ConsumerError::UnknownTopic(partition.topic.clone()))?;

        let message = BrokerValue::new(
            payload,
            partition.clone(),
            messages.len() as u64,
            Utc::now(),
        );
        messages.push(message.clone());
        drop(state);

        self.produced.notify_all();
        Ok(message)
    }
}

impl<T: Clone + Send + 'static> LocalBroker<T> {
    /// Create a consumer that belongs to `group`
    pub fn consumer(self: &Arc<Self>, group: &str) -> LocalConsumer<T> {
        let member = self.next_member.fetch_add(1, Ordering::SeqCst);
        LocalConsumer {
            broker: Arc::clone(self),
            group: group.to_string(),
            member_id: format!("{}-{}", group, member),
            enable_end_of_partition: false,
            subscription: None,
            on_assign: None,
            on_revoke: None,
            offsets: BTreeMap::new(),
            staged: HashMap::new(),
            paused: HashSet::new(),
            end_reported: HashMap::new(),
            closed: false,
        }
    }
}

fn log<'a, T>(state: &'a BrokerState<T>, partition: &Partition) -> ConsumerResult<&'a [BrokerValue<T>]> {
    state
        .topics
        .get(&partition.topic)
        .and_then(|partitions| partitions.get(usize::from(partition.index)))
        .map(Vec::as_slice)
        .ok_or_else(|| ConsumerError::UnknownTopic(partition.topic.clone()))
}

/// Consumer over a [`LocalBroker`]
pub struct LocalConsumer<T> {
    broker: Arc<LocalBroker<T>>,
    group: String,
    member_id: String,
    enable_end_of_partition: bool,
    /// Topics whose assignment is delivered on the next poll
    subscription: Option<Vec<Topic>>,
    on_assign: Option<AssignmentCallback>,
    on_revoke: Option<RevocationCallback>,
    offsets: BTreeMap<Partition, u64>,
    staged: HashMap<Partition, u64>,
    paused: HashSet<Partition>,
    end_reported: HashMap<Partition, u64>,
    closed: bool,
}

impl<T: Clone + Send + 'static> LocalConsumer<T> {
    /// Report `EndOfPartition` once every time a partition is drained
    pub fn with_end_of_partition(mut self, enabled: bool) -> Self {
        self.enable_end_of_partition = enabled;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
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

    fn revoke_all(&mut self) {
        if self.offsets.is_empty() {
            return;
        }
        let revoked: Vec<Partition> = self.offsets.keys().cloned().collect();
        self.offsets.clear();
        self.staged.clear();
        self.paused.clear();
        self.end_reported.clear();
        if let Some(on_revoke) = self.on_revoke.as_mut() {
            on_revoke(&revoked);
        }
    }

    fn deliver_assignment(&mut self, topics: Vec<Topic>) -> ConsumerResult<()> {
        self.revoke_all();

        let assignment = {
            let state = self.broker.state.lock();
            let committed = state.committed.get(&self.group);
            let mut assignment = HashMap::new();
            for topic in &topics {
                let partitions = state
                    .topics
                    .get(topic)
                    .ok_or_else(|| ConsumerError::UnknownTopic(topic.clone()))?;
                for index in 0..partitions.len() {
                    let partition = Partition::new(topic.clone(), index as u16);
                    let offset = committed
                        .and_then(|offsets| offsets.get(&partition))
                        .copied()
                        .unwrap_or(0);
                    assignment.insert(partition, offset);
                }
            }
            assignment
        };

        debug!(member_id = %self.member_id, partitions = assignment.len(), "Assigning partitions");
        self.offsets = assignment.iter().map(|(p, o)| (p.clone(), *o)).collect();
        if let Some(on_assign) = self.on_assign.as_mut() {
            on_assign(&assignment);
        }
        Ok(())
    }

    /// Next message from the first unpaused partition that has one, in
    /// partition order
    fn next_message(
        &mut self,
        state: &BrokerState<T>,
    ) -> ConsumerResult<Option<BrokerValue<T>>> {
        let mut end_of_partition = None;

        for (partition, offset) in self.offsets.iter_mut() {
            if self.paused.contains(partition) {
                continue;
            }
            let messages = log(state, partition)?;
            if let Some(message) = messages.get(*offset as usize) {
                *offset += 1;
                return Ok(Some(message.clone()));
            }
            if self.enable_end_of_partition
                && end_of_partition.is_none()
                && self.end_reported.get(partition) != Some(&*offset)
            {
                end_of_partition = Some((partition.clone(), *offset));
            }
        }

        match end_of_partition {
            Some((partition, offset)) => {
                self.end_reported.insert(partition.clone(), offset);
                Err(ConsumerError::EndOfPartition { partition, offset })
            }
            None => Ok(None),
        }
    }
}

impl<T: Clone + Send + 'static> Consumer for LocalConsumer<T> {
    type Payload = T;

    fn subscribe(
        &mut self,
        topics: &[Topic],
        on_assign: Option<AssignmentCallback>,
        on_revoke: Option<RevocationCallback>,
    ) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.revoke_all();
        self.on_assign = on_assign;
        self.on_revoke = on_revoke;
        self.subscription = Some(topics.to_vec());
        Ok(())
    }

    fn unsubscribe(&mut self) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.subscription = None;
        self.revoke_all();
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> ConsumerResult<Option<BrokerValue<T>>> {
        self.ensure_open()?;
        if let Some(topics) = self.subscription.take() {
            self.deliver_assignment(topics)?;
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let broker = Arc::clone(&self.broker);
        let mut state = broker.state.lock();
        loop {
            if let Some(message) = self.next_message(&state)? {
                return Ok(Some(message));
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    broker.produced.wait_until(&mut state, deadline);
                }
                None => broker.produced.wait(&mut state),
            }
        }
    }

    fn pause(&mut self, partitions: &[Partition]) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.ensure_assigned("pause", partitions)?;
        self.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &[Partition]) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.ensure_assigned("resume", partitions)?;
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
        Ok(self
            .offsets
            .iter()
            .map(|(partition, offset)| (partition.clone(), *offset))
            .collect())
    }

    fn seek(&mut self, offsets: HashMap<Partition, u64>) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.ensure_assigned("seek", offsets.keys())?;
        for (partition, offset) in offsets {
            self.end_reported.remove(&partition);
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
        let staged = std::mem::take(&mut self.staged);
        self.broker
            .state
            .lock()
            .committed
            .entry(self.group.clone())
            .or_default()
            .extend(staged.iter().map(|(p, o)| (p.clone(), *o)));
        Ok(staged)
    }

    fn close(&mut self, _timeout: Option<Duration>) {
        self.closed = true;
        self.subscription = None;
    }

    fn closed(&self) -> bool {
        self.closed
    }

    fn member_id(&self) -> String {
        self.member_id.clone()
    }
}
