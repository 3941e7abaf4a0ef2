//! Background thread that follows the commit log topic.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::codec::CommitCodec;
use crate::consumer::{AssignmentCallback, Consumer};
use crate::error::{ConsumerError, ConsumerResult};
use crate::metrics::{MetricsSink, COMMIT_LOG_LATENCY, COMMIT_LOG_MSG_LATENCY};
use crate::remote_offsets::RemoteOffsets;
use crate::synchronized::Synchronized;
use crate::types::{KafkaPayload, Partition, Topic};

/// Fixed poll timeout of the commit log consumer. Bounds shutdown latency.
pub const COMMIT_LOG_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle of the commit log worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    NotSubscribed = 0,
    Subscribed = 1,
    Running = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::NotSubscribed,
            1 => WorkerState::Subscribed,
            2 => WorkerState::Running,
            _ => WorkerState::Stopped,
        }
    }
}

/// How the worker thread ended, kept so every later check reports it again
#[derive(Debug, Clone)]
enum WorkerFailure {
    Crashed(Arc<ConsumerError>),
    Panicked(String),
    Exited,
    Stopped,
}

impl WorkerFailure {
    fn to_error(&self) -> ConsumerError {
        match self {
            WorkerFailure::Crashed(cause) => ConsumerError::CommitLogWorkerCrashed(Arc::clone(cause)),
            WorkerFailure::Panicked(message) => {
                ConsumerError::CommitLogWorkerPanicked(message.clone())
            }
            WorkerFailure::Exited => ConsumerError::CommitLogWorkerExited,
            WorkerFailure::Stopped => ConsumerError::Closed,
        }
    }
}

/// Handle to the commit log worker thread
pub(crate) struct CommitLogWorker {
    handle: Option<JoinHandle<ConsumerResult<()>>>,
    stop_requested: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    failure: Option<WorkerFailure>,
}

struct WorkerContext {
    topic: Topic,
    groups: HashSet<String>,
    remote_offsets: Arc<Synchronized<RemoteOffsets>>,
    metrics: Arc<dyn MetricsSink>,
    stop_requested: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl CommitLogWorker {
    /// Spawn the worker. The receiver yields once the commit log consumer
    /// receives its first assignment; it disconnects if the thread ends.
    pub(crate) fn start<L>(
        consumer: L,
        topic: Topic,
        remote_offsets: Arc<Synchronized<RemoteOffsets>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> ConsumerResult<(Self, Receiver<()>)>
    where
        L: Consumer<Payload = KafkaPayload> + 'static,
    {
        let groups = remote_offsets.get().groups().map(str::to_string).collect();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(WorkerState::NotSubscribed as u8));
        let (assigned_tx, assigned_rx) = mpsc::sync_channel(1);

        let context = WorkerContext {
            topic,
            groups,
            remote_offsets,
            metrics,
            stop_requested: Arc::clone(&stop_requested),
            state: Arc::clone(&state),
        };

        let handle = thread::Builder::new()
            .name("commit-log-consumer".to_string())
            .spawn(move || context.run(consumer, assigned_tx))?;

        Ok((
            Self {
                handle: Some(handle),
                stop_requested,
                state,
                failure: None,
            },
            assigned_rx,
        ))
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Ask the worker to stop; it exits within one poll interval
    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(&self.handle, Some(handle) if !handle.is_finished())
    }

    /// Fail if the worker thread has ended. Once it has, every call returns
    /// the same failure.
    pub(crate) fn check(&mut self) -> ConsumerResult<()> {
        if let Some(failure) = &self.failure {
            return Err(failure.to_error());
        }
        if self.is_running() {
            return Ok(());
        }

        let failure = match self.handle.take().map(JoinHandle::join) {
            Some(Ok(Ok(()))) | None if self.stop_requested.load(Ordering::SeqCst) => {
                WorkerFailure::Stopped
            }
            Some(Ok(Ok(()))) | None => WorkerFailure::Exited,
            Some(Ok(Err(e))) => WorkerFailure::Crashed(Arc::new(e)),
            Some(Err(panic)) => WorkerFailure::Panicked(panic_message(panic)),
        };

        let err = failure.to_error();
        self.failure = Some(failure);
        Err(err)
    }
}

impl WorkerContext {
    fn run<L>(self, mut consumer: L, assigned_tx: SyncSender<()>) -> ConsumerResult<()>
    where
        L: Consumer<Payload = KafkaPayload>,
    {
        let result = self.subscribe_and_consume(&mut consumer, assigned_tx);
        consumer.close(None);
        self.set_state(WorkerState::Stopped);

        match &result {
            Ok(()) => info!(topic = %self.topic, "Commit log consumer stopped"),
            Err(e) => error!(topic = %self.topic, error = %e, "Commit log consumer failed"),
        }
        result
    }

    fn subscribe_and_consume<L>(
        &self,
        consumer: &mut L,
        assigned_tx: SyncSender<()>,
    ) -> ConsumerResult<()>
    where
        L: Consumer<Payload = KafkaPayload>,
    {
        let mut assigned_tx = Some(assigned_tx);
        let state = Arc::clone(&self.state);
        let on_assign: AssignmentCallback = Box::new(move |offsets: &HashMap<Partition, u64>| {
            for (partition, offset) in offsets {
                debug!(%partition, offset, "Commit log consumer received assignment");
            }
            if let Some(tx) = assigned_tx.take() {
                state.store(WorkerState::Running as u8, Ordering::SeqCst);
                let _ = tx.try_send(());
            }
        });

        consumer.subscribe(std::slice::from_ref(&self.topic), Some(on_assign), None)?;
        // The assignment may already have fired inside subscribe
        let _ = self.state.compare_exchange(
            WorkerState::NotSubscribed as u8,
            WorkerState::Subscribed as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        while !self.stop_requested.load(Ordering::SeqCst) {
            let message = match consumer.poll(Some(COMMIT_LOG_POLL_TIMEOUT)) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(ConsumerError::EndOfPartition { .. }) => continue,
                Err(e) => return Err(e),
            };

            let commit = CommitCodec.decode(&message.payload)?;
            if !self.groups.contains(&commit.group) {
                continue;
            }

            let now = Utc::now();
            self.remote_offsets.update(|offsets| offsets.record(&commit));

            let tags = [
                ("partition", commit.partition.index.to_string()),
                ("group", commit.group.clone()),
            ];
            if let Some(orig_ts) = commit.orig_message_ts {
                self.metrics.distribution(
                    COMMIT_LOG_MSG_LATENCY,
                    (now - orig_ts).num_milliseconds() as f64,
                    &tags,
                );
            }
            self.metrics.distribution(
                COMMIT_LOG_LATENCY,
                (now - message.timestamp).num_milliseconds() as f64,
                &tags,
            );
        }

        Ok(())
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
