//! The consumer contract shared by the wrapped consumer, the commit log
//! consumer and the synchronized façade.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::ConsumerResult;
use crate::types::{BrokerValue, Partition, Topic};

/// Invoked with the starting offset of every newly assigned partition
pub type AssignmentCallback = Box<dyn FnMut(&HashMap<Partition, u64>) + Send>;

/// Invoked with the partitions being taken away from this consumer
pub type RevocationCallback = Box<dyn FnMut(&[Partition]) + Send>;

/// A partitioned-log consumer.
///
/// Rebalance callbacks are always invoked from inside [`Consumer::poll`] on
/// the caller's thread.
pub trait Consumer: Send {
    type Payload;

    /// Subscribe to topics, replacing any previous subscription
    fn subscribe(
        &mut self,
        topics: &[Topic],
        on_assign: Option<AssignmentCallback>,
        on_revoke: Option<RevocationCallback>,
    ) -> ConsumerResult<()>;

    fn unsubscribe(&mut self) -> ConsumerResult<()>;

    /// Fetch the next message, waiting up to `timeout` (`None` waits forever)
    fn poll(&mut self, timeout: Option<Duration>)
        -> ConsumerResult<Option<BrokerValue<Self::Payload>>>;

    fn pause(&mut self, partitions: &[Partition]) -> ConsumerResult<()>;

    fn resume(&mut self, partitions: &[Partition]) -> ConsumerResult<()>;

    fn paused(&self) -> ConsumerResult<HashSet<Partition>>;

    /// Current read position of every assigned partition
    fn tell(&self) -> ConsumerResult<HashMap<Partition, u64>>;

    fn seek(&mut self, offsets: HashMap<Partition, u64>) -> ConsumerResult<()>;

    /// Stage offsets to be written by the next [`Consumer::commit_offsets`]
    fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> ConsumerResult<()>;

    /// Commit staged offsets, returning what was committed
    fn commit_offsets(&mut self) -> ConsumerResult<HashMap<Partition, u64>>;

    fn close(&mut self, timeout: Option<Duration>);

    fn closed(&self) -> bool;

    fn member_id(&self) -> String;
}

#[cfg(test)]
use crate::types::KafkaPayload;

#[cfg(test)]
mockall::mock! {
    pub CommitLogConsumer {}

    impl Consumer for CommitLogConsumer {
        type Payload = KafkaPayload;

        fn subscribe(
            &mut self,
            topics: &[Topic],
            on_assign: Option<AssignmentCallback>,
            on_revoke: Option<RevocationCallback>,
        ) -> ConsumerResult<()>;
        fn unsubscribe(&mut self) -> ConsumerResult<()>;
        fn poll(&mut self, timeout: Option<Duration>) -> ConsumerResult<Option<BrokerValue<KafkaPayload>>>;
        fn pause(&mut self, partitions: &[Partition]) -> ConsumerResult<()>;
        fn resume(&mut self, partitions: &[Partition]) -> ConsumerResult<()>;
        fn paused(&self) -> ConsumerResult<HashSet<Partition>>;
        fn tell(&self) -> ConsumerResult<HashMap<Partition, u64>>;
        fn seek(&mut self, offsets: HashMap<Partition, u64>) -> ConsumerResult<()>;
        fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> ConsumerResult<()>;
        fn commit_offsets(&mut self) -> ConsumerResult<HashMap<Partition, u64>>;
        fn close(&mut self, timeout: Option<Duration>);
        fn closed(&self) -> bool;
        fn member_id(&self) -> String;
    }
}
