//! Consumer that holds back messages until tracked groups have committed
//! past them.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::consumer::{AssignmentCallback, Consumer, RevocationCallback};
use crate::error::{ConsumerError, ConsumerResult};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::remote_offsets::RemoteOffsets;
use crate::synchronized::Synchronized;
use crate::types::{BrokerValue, KafkaPayload, Partition, Topic};
use crate::worker::{CommitLogWorker, WorkerState};

/// Interval between liveness checks while waiting for the commit log
/// assignment
const STARTUP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Tuning for [`SynchronizedConsumer::with_options`]
#[derive(Clone)]
pub struct SynchronizedConsumerOptions {
    /// Give up if the commit log consumer is not assigned partitions in time.
    /// `None` waits until assignment or worker failure.
    pub startup_timeout: Option<Duration>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for SynchronizedConsumerOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Some(Duration::from_secs(30)),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

/// Wraps a consumer so that a message is only returned once every tracked
/// consumer group has committed an offset beyond it on the commit log.
///
/// Partitions whose next message is not yet visible are paused on the
/// wrapped consumer and resumed by a later [`Consumer::poll`] once the
/// tracked groups catch up. Pauses requested by the caller are tracked
/// separately and always win over that gating.
pub struct SynchronizedConsumer<C: Consumer> {
    consumer: C,
    commit_log_topic: Topic,
    remote_offsets: Arc<Synchronized<RemoteOffsets>>,
    /// Partitions paused by the caller, as opposed to gated by us
    paused: Arc<Mutex<HashSet<Partition>>>,
    worker: CommitLogWorker,
}

impl<C: Consumer> SynchronizedConsumer<C> {
    /// Wrap `consumer` with default options
    pub fn new<L, I, S>(
        consumer: C,
        commit_log_consumer: L,
        commit_log_topic: Topic,
        tracked_groups: I,
    ) -> ConsumerResult<Self>
    where
        L: Consumer<Payload = KafkaPayload> + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_options(
            consumer,
            commit_log_consumer,
            commit_log_topic,
            tracked_groups,
            SynchronizedConsumerOptions::default(),
        )
    }

    /// Start the commit log worker and wait for its first assignment
    pub fn with_options<L, I, S>(
        consumer: C,
        commit_log_consumer: L,
        commit_log_topic: Topic,
        tracked_groups: I,
        options: SynchronizedConsumerOptions,
    ) -> ConsumerResult<Self>
    where
        L: Consumer<Payload = KafkaPayload> + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let remote_offsets = Arc::new(Synchronized::new(RemoteOffsets::new(tracked_groups)));

        let (mut worker, assigned) = CommitLogWorker::start(
            commit_log_consumer,
            commit_log_topic.clone(),
            Arc::clone(&remote_offsets),
            options.metrics,
        )?;

        debug!(topic = %commit_log_topic, "Waiting for commit log consumer to receive assignment");
        let started = Instant::now();
        loop {
            match assigned.recv_timeout(STARTUP_CHECK_INTERVAL) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) if worker.is_running() => {}
                // Callback dropped without firing; keep waiting on the worker
                Err(RecvTimeoutError::Disconnected) if worker.is_running() => {
                    thread::sleep(STARTUP_CHECK_INTERVAL);
                }
                Err(_) => return Err(startup_failure(&mut worker)),
            }

            if let Some(limit) = options.startup_timeout {
                if started.elapsed() >= limit {
                    worker.request_stop();
                    warn!(
                        topic = %commit_log_topic,
                        timeout_secs = limit.as_secs_f64(),
                        "Commit log consumer was not assigned in time"
                    );
                    return Err(ConsumerError::StartupTimeout(limit));
                }
            }
        }

        info!(
            topic = %commit_log_topic,
            groups = ?remote_offsets.get().groups().collect::<Vec<_>>(),
            "Synchronized consumer started"
        );

        Ok(Self {
            consumer,
            commit_log_topic,
            remote_offsets,
            paused: Arc::new(Mutex::new(HashSet::new())),
            worker,
        })
    }

    pub fn commit_log_topic(&self) -> &Topic {
        &self.commit_log_topic
    }

    pub fn tracked_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.remote_offsets.get().groups().map(str::to_string).collect();
        groups.sort();
        groups
    }

    /// Snapshot of the offsets observed on the commit log so far
    pub fn remote_offsets(&self) -> RemoteOffsets {
        self.remote_offsets.get().clone()
    }

    pub fn commit_log_worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn inner(&self) -> &C {
        &self.consumer
    }

    fn remote_offset(&self, partition: &Partition) -> u64 {
        self.remote_offsets.get().min_offset(partition)
    }

    /// Resume partitions we gated whose tracked groups have caught up
    fn resume_caught_up(&mut self) -> ConsumerResult<()> {
        let paused = self.consumer.paused()?;
        let resume_candidates: Vec<Partition> = {
            let explicitly_paused = self.paused.lock();
            paused
                .into_iter()
                .filter(|partition| !explicitly_paused.contains(partition))
                .collect()
        };
        if resume_candidates.is_empty() {
            return Ok(());
        }

        let local_offsets = self.consumer.tell()?;
        let resumable: Vec<Partition> = {
            let remote_offsets = self.remote_offsets.get();
            resume_candidates
                .into_iter()
                .filter(|partition| {
                    local_offsets
                        .get(partition)
                        .is_some_and(|local| remote_offsets.min_offset(partition) > *local)
                })
                .collect()
        };

        if !resumable.is_empty() {
            debug!(partitions = ?resumable, "Resuming partitions caught up by tracked groups");
            self.consumer.resume(&resumable)?;
        }
        Ok(())
    }

    fn ensure_assigned(&self, action: &'static str, partitions: &[Partition]) -> ConsumerResult<()> {
        if self.consumer.closed() {
            return Err(ConsumerError::Closed);
        }

        let assigned = self.consumer.tell()?;
        let unassigned: Vec<Partition> = partitions
            .iter()
            .filter(|partition| !assigned.contains_key(*partition))
            .cloned()
            .collect();
        if !unassigned.is_empty() {
            return Err(ConsumerError::UnassignedPartitions {
                action,
                partitions: unassigned,
            });
        }
        Ok(())
    }
}

impl<C: Consumer> Consumer for SynchronizedConsumer<C> {
    type Payload = C::Payload;

    fn subscribe(
        &mut self,
        topics: &[Topic],
        mut on_assign: Option<AssignmentCallback>,
        mut on_revoke: Option<RevocationCallback>,
    ) -> ConsumerResult<()> {
        let paused = Arc::clone(&self.paused);
        let assignment_callback: AssignmentCallback =
            Box::new(move |offsets: &HashMap<Partition, u64>| {
                {
                    let mut paused = paused.lock();
                    for partition in offsets.keys() {
                        paused.remove(partition);
                    }
                }
                if let Some(callback) = on_assign.as_mut() {
                    callback(offsets);
                }
            });

        let paused = Arc::clone(&self.paused);
        let revocation_callback: RevocationCallback = Box::new(move |partitions: &[Partition]| {
            {
                let mut paused = paused.lock();
                for partition in partitions {
                    paused.remove(partition);
                }
            }
            if let Some(callback) = on_revoke.as_mut() {
                callback(partitions);
            }
        });

        self.consumer
            .subscribe(topics, Some(assignment_callback), Some(revocation_callback))
    }

    fn unsubscribe(&mut self) -> ConsumerResult<()> {
        self.consumer.unsubscribe()
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
    ) -> ConsumerResult<Option<BrokerValue<Self::Payload>>> {
        self.worker.check()?;
        self.resume_caught_up()?;

        let message = match self.consumer.poll(timeout)? {
            Some(message) => message,
            None => return Ok(None),
        };

        let remote_offset = self.remote_offset(&message.partition);
        if message.offset >= remote_offset {
            debug!(
                partition = %message.partition,
                offset = message.offset,
                remote_offset,
                "Message not yet committed by tracked groups, pausing partition"
            );
            self.consumer.pause(std::slice::from_ref(&message.partition))?;
            self.consumer
                .seek(HashMap::from([(message.partition, message.offset)]))?;
            return Ok(None);
        }

        Ok(Some(message))
    }

    fn pause(&mut self, partitions: &[Partition]) -> ConsumerResult<()> {
        self.ensure_assigned("pause", partitions)?;
        self.paused.lock().extend(partitions.iter().cloned());
        self.consumer.pause(partitions)
    }

    /// Lift a caller pause. The partition is resumed by the next poll if the
    /// tracked groups are ahead of it.
    fn resume(&mut self, partitions: &[Partition]) -> ConsumerResult<()> {
        self.ensure_assigned("resume", partitions)?;
        let mut paused = self.paused.lock();
        for partition in partitions {
            paused.remove(partition);
        }
        Ok(())
    }

    fn paused(&self) -> ConsumerResult<HashSet<Partition>> {
        Ok(self.paused.lock().clone())
    }

    fn tell(&self) -> ConsumerResult<HashMap<Partition, u64>> {
        self.consumer.tell()
    }

    fn seek(&mut self, offsets: HashMap<Partition, u64>) -> ConsumerResult<()> {
        self.consumer.seek(offsets)
    }

    fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> ConsumerResult<()> {
        self.consumer.stage_offsets(offsets)
    }

    fn commit_offsets(&mut self) -> ConsumerResult<HashMap<Partition, u64>> {
        self.consumer.commit_offsets()
    }

    // TODO: join the commit log worker (with a timeout) once callers can
    // tolerate close() blocking for up to one commit log poll interval.
    fn close(&mut self, timeout: Option<Duration>) {
        self.worker.request_stop();
        self.consumer.close(timeout);
    }

    fn closed(&self) -> bool {
        self.consumer.closed()
    }

    fn member_id(&self) -> String {
        self.consumer.member_id()
    }
}

/// Error describing why the worker ended before its first assignment. Only
/// called once the worker thread has finished, so `check` joins it.
fn startup_failure(worker: &mut CommitLogWorker) -> ConsumerError {
    worker
        .check()
        .err()
        .unwrap_or(ConsumerError::CommitLogWorkerExited)
}

impl<C: Consumer> Drop for SynchronizedConsumer<C> {
    fn drop(&mut self) {
        self.worker.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CommitCodec;
    use crate::consumer::MockCommitLogConsumer;
    use crate::local::LocalBroker;
    use crate::types::Commit;
    use chrono::Utc;
    use mockall::mock;

    mock! {
        pub Wrapped {}

        impl Consumer for Wrapped {
            type Payload = String;

            fn subscribe(
                &mut self,
                topics: &[Topic],
                on_assign: Option<AssignmentCallback>,
                on_revoke: Option<RevocationCallback>,
            ) -> ConsumerResult<()>;
            fn unsubscribe(&mut self) -> ConsumerResult<()>;
            fn poll(&mut self, timeout: Option<Duration>) -> ConsumerResult<Option<BrokerValue<String>>>;
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

    struct CommitLog {
        broker: Arc<LocalBroker<KafkaPayload>>,
        partition: Partition,
    }

    impl CommitLog {
        fn new() -> Self {
            let broker = Arc::new(LocalBroker::new());
            let topic = Topic::new("commit-log");
            broker.create_topic(&topic, 1).unwrap();
            Self {
                broker,
                partition: Partition::new(topic, 0),
            }
        }

        fn publish(&self, group: &str, partition: &Partition, offset: u64) {
            let commit = Commit::new(group, partition.clone(), offset);
            self.broker
                .produce(&self.partition, CommitCodec.encode(&commit).unwrap())
                .unwrap();
        }

        fn start(&self, wrapped: MockWrapped, groups: &[&str]) -> SynchronizedConsumer<MockWrapped> {
            SynchronizedConsumer::with_options(
                wrapped,
                self.broker.consumer("synchronizer"),
                self.partition.topic.clone(),
                groups.iter().copied(),
                SynchronizedConsumerOptions {
                    startup_timeout: Some(Duration::from_secs(5)),
                    metrics: Arc::new(NoopMetrics),
                },
            )
            .unwrap()
        }
    }

    fn p0() -> Partition {
        Partition::new(Topic::new("events"), 0)
    }

    fn message(offset: u64) -> BrokerValue<String> {
        BrokerValue::new(format!("m{}", offset), p0(), offset, Utc::now())
    }

    fn wait_for_remote(consumer: &SynchronizedConsumer<MockWrapped>, group: &str, offset: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while consumer.remote_offsets().get(group, &p0()) != Some(offset) {
            assert!(Instant::now() < deadline, "commit was not observed");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn nothing_paused(wrapped: &mut MockWrapped) {
        wrapped.expect_paused().returning(|| Ok(HashSet::new()));
    }

    #[test]
    fn test_message_at_or_beyond_remote_offset_is_gated() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        nothing_paused(&mut wrapped);
        wrapped.expect_poll().times(1).returning(|_| Ok(Some(message(5))));
        wrapped
            .expect_pause()
            .times(1)
            .withf(|partitions| partitions.to_vec() == vec![p0()])
            .returning(|_| Ok(()));
        wrapped
            .expect_seek()
            .times(1)
            .withf(|offsets| offsets.len() == 1 && offsets.get(&p0()) == Some(&5))
            .returning(|_| Ok(()));
        wrapped.expect_resume().times(0);

        let mut consumer = log.start(wrapped, &["g"]);
        log.publish("g", &p0(), 5);
        wait_for_remote(&consumer, "g", 5);

        assert!(consumer.poll(Some(Duration::ZERO)).unwrap().is_none());
    }

    #[test]
    fn test_message_before_remote_offset_passes_through() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        nothing_paused(&mut wrapped);
        wrapped.expect_poll().times(1).returning(|_| Ok(Some(message(4))));
        wrapped.expect_pause().times(0);
        wrapped.expect_seek().times(0);

        let mut consumer = log.start(wrapped, &["g"]);
        log.publish("g", &p0(), 5);
        wait_for_remote(&consumer, "g", 5);

        let released = consumer.poll(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(released.offset, 4);
        assert_eq!(released.payload, "m4");
        assert_eq!(released.partition, p0());
    }

    #[test]
    fn test_slowest_group_gates() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        nothing_paused(&mut wrapped);
        wrapped.expect_poll().times(1).returning(|_| Ok(Some(message(4))));
        wrapped.expect_pause().times(1).returning(|_| Ok(()));
        wrapped.expect_seek().times(1).returning(|_| Ok(()));

        let mut consumer = log.start(wrapped, &["fast", "slow"]);
        log.publish("fast", &p0(), 100);
        log.publish("slow", &p0(), 3);
        wait_for_remote(&consumer, "slow", 3);

        assert!(consumer.poll(Some(Duration::ZERO)).unwrap().is_none());
    }

    #[test]
    fn test_gated_partition_resumed_once_caught_up() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        wrapped
            .expect_paused()
            .returning(|| Ok(HashSet::from([p0()])));
        wrapped
            .expect_tell()
            .returning(|| Ok(HashMap::from([(p0(), 3)])));
        wrapped
            .expect_resume()
            .times(1)
            .withf(|partitions| partitions.to_vec() == vec![p0()])
            .returning(|_| Ok(()));
        wrapped.expect_poll().times(1).returning(|_| Ok(None));

        let mut consumer = log.start(wrapped, &["g"]);
        log.publish("g", &p0(), 4);
        wait_for_remote(&consumer, "g", 4);

        assert!(consumer.poll(Some(Duration::ZERO)).unwrap().is_none());
    }

    #[test]
    fn test_gated_partition_stays_paused_until_remote_passes_position() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        wrapped
            .expect_paused()
            .returning(|| Ok(HashSet::from([p0()])));
        wrapped
            .expect_tell()
            .returning(|| Ok(HashMap::from([(p0(), 3)])));
        wrapped.expect_resume().times(0);
        wrapped.expect_poll().times(1).returning(|_| Ok(None));

        let mut consumer = log.start(wrapped, &["g"]);
        log.publish("g", &p0(), 3);
        wait_for_remote(&consumer, "g", 3);

        assert!(consumer.poll(Some(Duration::ZERO)).unwrap().is_none());
    }

    #[test]
    fn test_explicit_pause_wins_over_remote_progress() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        wrapped.expect_closed().return_const(false);
        wrapped
            .expect_tell()
            .returning(|| Ok(HashMap::from([(p0(), 0)])));
        wrapped.expect_pause().times(1).returning(|_| Ok(()));
        wrapped
            .expect_paused()
            .returning(|| Ok(HashSet::from([p0()])));
        wrapped.expect_resume().times(0);
        wrapped.expect_poll().times(3).returning(|_| Ok(None));

        let mut consumer = log.start(wrapped, &["g"]);
        consumer.pause(&[p0()]).unwrap();
        log.publish("g", &p0(), 10);
        wait_for_remote(&consumer, "g", 10);

        for _ in 0..3 {
            assert!(consumer.poll(Some(Duration::ZERO)).unwrap().is_none());
        }
        assert_eq!(consumer.paused().unwrap(), HashSet::from([p0()]));
    }

    #[test]
    fn test_resume_does_not_resume_wrapped_consumer() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        wrapped.expect_closed().return_const(false);
        wrapped
            .expect_tell()
            .returning(|| Ok(HashMap::from([(p0(), 0)])));
        wrapped.expect_pause().times(1).returning(|_| Ok(()));
        wrapped.expect_resume().times(0);

        let mut consumer = log.start(wrapped, &["g"]);
        consumer.pause(&[p0()]).unwrap();
        consumer.resume(&[p0()]).unwrap();

        assert!(consumer.paused().unwrap().is_empty());
    }

    #[test]
    fn test_pause_and_resume_reject_unassigned_partitions() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        wrapped.expect_closed().return_const(false);
        wrapped.expect_tell().returning(|| Ok(HashMap::new()));
        wrapped.expect_pause().times(0);
        wrapped.expect_resume().times(0);

        let mut consumer = log.start(wrapped, &["g"]);

        let err = consumer.pause(&[p0()]).unwrap_err();
        assert!(err.to_string().starts_with("cannot pause unassigned partitions"));
        let err = consumer.resume(&[p0()]).unwrap_err();
        assert!(err.to_string().starts_with("cannot resume unassigned partitions"));
        assert!(consumer.paused().unwrap().is_empty());
    }

    #[test]
    fn test_pause_on_closed_consumer() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        wrapped.expect_close().times(1).return_const(());
        wrapped.expect_closed().return_const(true);
        wrapped.expect_pause().times(0);

        let mut consumer = log.start(wrapped, &["g"]);
        consumer.close(None);

        assert!(matches!(consumer.pause(&[p0()]), Err(ConsumerError::Closed)));
        assert!(matches!(consumer.resume(&[p0()]), Err(ConsumerError::Closed)));
        assert!(consumer.closed());
    }

    #[test]
    fn test_assignment_clears_explicit_pause() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        let captured: Arc<Mutex<Option<AssignmentCallback>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&captured);
        wrapped
            .expect_subscribe()
            .times(1)
            .returning(move |_, on_assign, _| {
                *slot.lock() = on_assign;
                Ok(())
            });
        wrapped.expect_closed().return_const(false);
        wrapped
            .expect_tell()
            .returning(|| Ok(HashMap::from([(p0(), 0)])));
        wrapped.expect_pause().returning(|_| Ok(()));

        let mut consumer = log.start(wrapped, &["g"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        consumer
            .subscribe(
                &[Topic::new("events")],
                Some(Box::new(move |offsets: &HashMap<Partition, u64>| {
                    sink.lock().extend(offsets.keys().cloned());
                })),
                None,
            )
            .unwrap();
        consumer.pause(&[p0()]).unwrap();
        assert!(consumer.paused().unwrap().contains(&p0()));

        let mut on_assign = captured.lock().take().unwrap();
        on_assign(&HashMap::from([(p0(), 0)]));

        assert!(!consumer.paused().unwrap().contains(&p0()));
        assert_eq!(*seen.lock(), vec![p0()]);
    }

    #[test]
    fn test_revocation_clears_explicit_pause() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        let captured: Arc<Mutex<Option<RevocationCallback>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&captured);
        wrapped
            .expect_subscribe()
            .times(1)
            .returning(move |_, _, on_revoke| {
                *slot.lock() = on_revoke;
                Ok(())
            });
        wrapped.expect_closed().return_const(false);
        wrapped
            .expect_tell()
            .returning(|| Ok(HashMap::from([(p0(), 0)])));
        wrapped.expect_pause().returning(|_| Ok(()));

        let mut consumer = log.start(wrapped, &["g"]);
        consumer.subscribe(&[Topic::new("events")], None, None).unwrap();
        consumer.pause(&[p0()]).unwrap();

        let mut on_revoke = captured.lock().take().unwrap();
        on_revoke(&[p0()]);

        assert!(consumer.paused().unwrap().is_empty());
    }

    #[test]
    fn test_worker_crash_surfaces_on_every_poll() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        nothing_paused(&mut wrapped);
        wrapped.expect_poll().returning(|_| Ok(None));

        let mut consumer = log.start(wrapped, &["g"]);
        log.broker
            .produce(&log.partition, KafkaPayload::new(None, b"garbage".to_vec()))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match consumer.poll(Some(Duration::ZERO)) {
                Ok(_) => {
                    assert!(Instant::now() < deadline, "worker did not crash");
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => break e,
            }
        };
        assert!(err.to_string().contains("commit log consumer thread crashed"));

        for _ in 0..3 {
            let err = consumer.poll(Some(Duration::ZERO)).unwrap_err();
            assert!(err.is_commit_log_failure());
        }
        assert_eq!(consumer.commit_log_worker_state(), WorkerState::Stopped);
    }

    #[test]
    fn test_close_stops_worker() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        wrapped.expect_close().times(1).return_const(());

        let mut consumer = log.start(wrapped, &["g"]);
        assert_eq!(consumer.commit_log_worker_state(), WorkerState::Running);
        consumer.close(Some(Duration::from_secs(1)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while consumer.commit_log_worker_state() != WorkerState::Stopped {
            assert!(Instant::now() < deadline, "worker did not stop");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_startup_fails_when_commit_log_topic_missing() {
        let broker: Arc<LocalBroker<KafkaPayload>> = Arc::new(LocalBroker::new());
        let result = SynchronizedConsumer::new(
            MockWrapped::new(),
            broker.consumer("synchronizer"),
            Topic::new("missing"),
            ["g"],
        );

        match result {
            Err(ConsumerError::CommitLogWorkerCrashed(cause)) => {
                assert!(matches!(*cause, ConsumerError::UnknownTopic(_)));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("startup should fail"),
        }
    }

    #[test]
    fn test_startup_fails_when_subscribe_drops_callback_and_errors() {
        let mut commit_log = MockCommitLogConsumer::new();
        commit_log
            .expect_subscribe()
            .times(1)
            .returning(|topics, on_assign, _| {
                drop(on_assign);
                Err(ConsumerError::UnknownTopic(topics[0].clone()))
            });
        commit_log.expect_close().return_const(());

        let result = SynchronizedConsumer::with_options(
            MockWrapped::new(),
            commit_log,
            Topic::new("commit-log"),
            ["g"],
            SynchronizedConsumerOptions {
                startup_timeout: Some(Duration::from_secs(5)),
                metrics: Arc::new(NoopMetrics),
            },
        );

        match result {
            Err(ConsumerError::CommitLogWorkerCrashed(cause)) => {
                assert!(matches!(*cause, ConsumerError::UnknownTopic(_)));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("startup should fail"),
        }
    }

    #[test]
    fn test_startup_times_out_when_callback_dropped_unfired() {
        let mut commit_log = MockCommitLogConsumer::new();
        commit_log
            .expect_subscribe()
            .returning(|_, on_assign, _| {
                drop(on_assign);
                Ok(())
            });
        commit_log.expect_poll().returning(|timeout| {
            thread::sleep(timeout.unwrap_or(Duration::from_millis(100)));
            Ok(None)
        });
        commit_log.expect_close().return_const(());

        let started = Instant::now();
        let result = SynchronizedConsumer::with_options(
            MockWrapped::new(),
            commit_log,
            Topic::new("commit-log"),
            ["g"],
            SynchronizedConsumerOptions {
                startup_timeout: Some(Duration::from_millis(300)),
                metrics: Arc::new(NoopMetrics),
            },
        );

        assert!(matches!(result, Err(ConsumerError::StartupTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_delegated_operations() {
        let log = CommitLog::new();
        let mut wrapped = MockWrapped::new();
        wrapped
            .expect_member_id()
            .return_const("member-1".to_string());
        wrapped
            .expect_stage_offsets()
            .times(1)
            .withf(|offsets| offsets.get(&p0()) == Some(&9))
            .returning(|_| Ok(()));
        wrapped
            .expect_commit_offsets()
            .times(1)
            .returning(|| Ok(HashMap::from([(p0(), 9)])));
        wrapped.expect_unsubscribe().times(1).returning(|| Ok(()));

        let mut consumer = log.start(wrapped, &["g"]);
        assert_eq!(consumer.member_id(), "member-1");
        consumer
            .stage_offsets(HashMap::from([(p0(), 9)]))
            .unwrap();
        assert_eq!(consumer.commit_offsets().unwrap()[&p0()], 9);
        consumer.unsubscribe().unwrap();
        assert_eq!(consumer.tracked_groups(), vec!["g".to_string()]);
    }
}
