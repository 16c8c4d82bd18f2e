//! Consumer delivery contract
//!
//! A fixed pool of workers polls the partitions of the subscribed topics.
//! Each partition belongs to exactly one worker, so records of a partition
//! are processed strictly in offset order. Every record ends in one of two
//! states:
//!
//! - `Delivered → Processing → Acknowledged`: the handler succeeded and the
//!   offset was committed
//! - `Delivered → Processing → Failed → DeadLettered`: decoding or the
//!   handler failed, the record went to the dead-letter sink, then the offset
//!   was committed
//!
//! If the dead-letter write fails the offset stays uncommitted and the record
//! is delivered again on the next poll.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use event_contracts::{EventEnvelope, ValidationError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ConsumerConfig;
use crate::dlq::{BusDeadLetterSink, DeadLetterRecord, DeadLetterSink, FailureKind};
use crate::retry::retry_with_backoff_if;
use crate::{BusError, BusResult, ConsumedRecord, MessageBus, PollRequest};

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Per-record lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    Processing,
    Acknowledged,
    /// Processing failed and the record could not be dead-lettered; it will
    /// be redelivered
    Failed,
    DeadLettered,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid event: {0}")]
    Invalid(#[from] ValidationError),
}

/// A record after decoding; malformed payloads become a placeholder
#[derive(Debug, Clone)]
pub enum DecodedRecord {
    Event(EventEnvelope),
    Malformed(DecodeError),
}

impl DecodedRecord {
    pub fn decode(payload: &[u8]) -> Self {
        match EventEnvelope::from_wire(payload) {
            Ok(envelope) => match envelope.validate() {
                Ok(()) => DecodedRecord::Event(envelope),
                Err(e) => DecodedRecord::Malformed(e.into()),
            },
            Err(e) => DecodedRecord::Malformed(DecodeError::Malformed(e.to_string())),
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            DecodedRecord::Event(envelope) => envelope.event_id(),
            DecodedRecord::Malformed(_) => None,
        }
    }
}

/// Failure reported by a [`RecordHandler`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// May succeed if tried again (e.g. a downstream timeout)
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Business logic run for every decoded event
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        record: &ConsumedRecord,
    ) -> Result<(), HandlerError>;
}

/// Final state of one record, as seen by the worker loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub event_id: Option<String>,
    pub state: DeliveryState,
    /// Handler invocations made for this delivery
    pub attempts: u32,
    pub error: Option<String>,
}

impl RecordOutcome {
    fn new(
        record: &ConsumedRecord,
        event_id: Option<&str>,
        state: DeliveryState,
        attempts: u32,
    ) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            event_id: event_id.map(str::to_string),
            state,
            attempts,
            error: None,
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

struct WorkerContext {
    bus: Arc<dyn MessageBus>,
    config: ConsumerConfig,
    handler: Arc<dyn RecordHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    outcomes: broadcast::Sender<RecordOutcome>,
}

/// Consumer group member driving a [`RecordHandler`] over a set of topics
pub struct EventConsumer {
    bus: Arc<dyn MessageBus>,
    config: ConsumerConfig,
    topics: Vec<String>,
    handler: Arc<dyn RecordHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    outcomes: broadcast::Sender<RecordOutcome>,
}

impl EventConsumer {
    /// Dead letters go to the platform dead-letter topic on the same bus
    pub fn new(
        bus: Arc<dyn MessageBus>,
        config: ConsumerConfig,
        topics: Vec<String>,
        handler: Arc<dyn RecordHandler>,
    ) -> Self {
        let dead_letters = Arc::new(BusDeadLetterSink::new(bus.clone()));
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            bus,
            config,
            topics,
            handler,
            dead_letters,
            outcomes,
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Outcome of every record processed after this call
    pub fn outcomes(&self) -> broadcast::Receiver<RecordOutcome> {
        self.outcomes.subscribe()
    }

    /// Partition assignments for each worker: the i-th (topic, partition)
    /// pair goes to worker `i % concurrency`
    pub fn assign(partitions: &[(String, u32)], concurrency: usize) -> Vec<Vec<(String, u32)>> {
        let concurrency = concurrency.max(1);
        let mut workers = vec![Vec::new(); concurrency];
        for (index, assignment) in partitions.iter().enumerate() {
            workers[index % concurrency].push(assignment.clone());
        }
        workers
    }

    /// Resolve partitions and spawn the worker pool
    ///
    /// Fails if any subscribed topic does not exist.
    pub async fn start(self) -> BusResult<ConsumerHandle> {
        let mut partitions = Vec::new();
        for topic in &self.topics {
            let description = self
                .bus
                .describe_topic(topic)
                .await?
                .ok_or_else(|| BusError::UnknownTopic(topic.clone()))?;
            partitions.extend((0..description.partitions).map(|p| (topic.clone(), p)));
        }

        let assignments = Self::assign(&partitions, self.config.concurrency);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(WorkerContext {
            bus: self.bus,
            config: self.config,
            handler: self.handler,
            dead_letters: self.dead_letters,
            outcomes: self.outcomes.clone(),
        });

        info!(
            group_id = %ctx.config.group_id,
            topics = ?self.topics,
            partitions = partitions.len(),
            concurrency = ctx.config.concurrency,
            "Starting consumer"
        );

        let workers = assignments
            .iter()
            .enumerate()
            .filter(|(_, assigned)| !assigned.is_empty())
            .map(|(worker, assigned)| {
                tokio::spawn(run_worker(
                    ctx.clone(),
                    worker,
                    assigned.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        Ok(ConsumerHandle {
            group_id: ctx.config.group_id.clone(),
            assignments,
            shutdown,
            workers,
            outcomes: self.outcomes,
        })
    }
}

/// Running consumer
///
/// Dropping the handle detaches the workers: they keep consuming until the
/// runtime shuts down. Call [`ConsumerHandle::shutdown`] to stop them.
pub struct ConsumerHandle {
    group_id: String,
    assignments: Vec<Vec<(String, u32)>>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    outcomes: broadcast::Sender<RecordOutcome>,
}

impl ConsumerHandle {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// (topic, partition) pairs owned by each worker
    pub fn assignments(&self) -> &[Vec<(String, u32)>] {
        &self.assignments
    }

    pub fn outcomes(&self) -> broadcast::Receiver<RecordOutcome> {
        self.outcomes.subscribe()
    }

    /// Stop polling and wait for in-progress records to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Consumer worker terminated abnormally");
            }
        }
        info!(group_id = %self.group_id, "Consumer stopped");
    }
}

async fn run_worker(
    ctx: Arc<WorkerContext>,
    worker: usize,
    assigned: Vec<(String, u32)>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        group_id = %ctx.config.group_id,
        worker = worker,
        partitions = ?assigned,
        "Consumer worker started"
    );

    let max_wait = ctx.config.poll_timeout / assigned.len().max(1) as u32;

    'polling: loop {
        for (topic, partition) in &assigned {
            if *shutdown.borrow() {
                break 'polling;
            }

            let request = PollRequest {
                group_id: ctx.config.group_id.clone(),
                topic: topic.clone(),
                partition: *partition,
                max_records: ctx.config.max_poll_records,
                max_wait,
                offset_reset: ctx.config.auto_offset_reset,
                session_timeout: ctx.config.session_timeout,
                heartbeat_interval: ctx.config.heartbeat_interval,
            };

            // A dropped handle closes the channel; only an explicit signal stops us
            let polled = tokio::select! {
                Ok(()) = shutdown.changed() => break 'polling,
                polled = ctx.bus.poll(&request) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    warn!(topic = %topic, partition = partition, error = %e, "Poll failed");
                    tokio::time::sleep(ctx.config.poll_timeout).await;
                    continue;
                }
            };

            for record in records {
                let outcome = process_record(&ctx, &record).await;
                log_outcome(&outcome);
                let redeliver = outcome.state == DeliveryState::Failed;
                // No observers is fine
                let _ = ctx.outcomes.send(outcome);

                if redeliver {
                    // The failed record and everything after it come back in order
                    if let Err(e) = ctx.bus.release(&ctx.config.group_id, &record).await {
                        warn!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            error = %e,
                            "Release failed, records return after the session timeout"
                        );
                    }
                    tokio::time::sleep(ctx.config.poll_timeout).await;
                    break;
                }
            }
        }
    }

    info!(group_id = %ctx.config.group_id, worker = worker, "Consumer worker stopped");
}

async fn process_record(ctx: &WorkerContext, record: &ConsumedRecord) -> RecordOutcome {
    let decoded = DecodedRecord::decode(&record.payload);
    let event_type = match &decoded {
        DecodedRecord::Event(envelope) => envelope.event_type(),
        DecodedRecord::Malformed(_) => "unknown",
    };

    let span = info_span!(
        "process_record",
        group_id = %ctx.config.group_id,
        topic = %record.topic,
        partition = record.partition,
        offset = record.offset,
        event_id = %decoded.event_id().unwrap_or("unknown"),
        event_type = %event_type,
    );

    async {
        debug!(state = ?DeliveryState::Delivered, "Record received");

        if !ctx.config.manual_commit {
            if let Err(e) = ctx.bus.commit(&ctx.config.group_id, record).await {
                warn!(error = %e, "Commit on delivery failed");
            }
        }

        let (kind, failure, attempts) = match &decoded {
            DecodedRecord::Malformed(e) => (FailureKind::Deserialization, e.to_string(), 0),
            DecodedRecord::Event(envelope) => {
                debug!(state = ?DeliveryState::Processing, "Handling record");
                let attempts = AtomicU32::new(0);

                let result = retry_with_backoff_if(
                    || {
                        attempts.fetch_add(1, Ordering::Relaxed);
                        ctx.handler.handle(envelope, record)
                    },
                    &ctx.config.handler_retry,
                    "handle_record",
                    HandlerError::is_transient,
                )
                .await;
                let attempts = attempts.load(Ordering::Relaxed);

                match result {
                    Ok(()) => return acknowledge(ctx, record, envelope.event_id(), attempts).await,
                    Err(e) => (FailureKind::Processing, e.to_string(), attempts),
                }
            }
        };

        error!(
            state = ?DeliveryState::Failed,
            key = %record.key.as_deref().unwrap_or("none"),
            payload = %String::from_utf8_lossy(&record.payload),
            error_kind = ?kind,
            error = %failure,
            attempts = attempts,
            "Record processing failed"
        );

        let dead_letter = DeadLetterRecord::new(
            record,
            &ctx.config.group_id,
            kind,
            failure.clone(),
            attempts,
        );
        let event_id = dead_letter.event_id.clone();

        if let Err(e) = ctx.dead_letters.dead_letter(dead_letter).await {
            error!(
                error = %e,
                "Dead-letter write failed, leaving offset uncommitted for redelivery"
            );
            return RecordOutcome::new(record, event_id.as_deref(), DeliveryState::Failed, attempts)
                .with_error(format!("{}; dead-letter write failed: {}", failure, e));
        }

        if ctx.config.manual_commit {
            if let Err(e) = ctx.bus.commit(&ctx.config.group_id, record).await {
                // Redelivery dead-letters the record again under the same idempotence key
                error!(error = %e, "Commit after dead-lettering failed");
                return RecordOutcome::new(
                    record,
                    event_id.as_deref(),
                    DeliveryState::Failed,
                    attempts,
                )
                .with_error(e.to_string());
            }
        }

        RecordOutcome::new(record, event_id.as_deref(), DeliveryState::DeadLettered, attempts)
            .with_error(failure)
    }
    .instrument(span)
    .await
}

async fn acknowledge(
    ctx: &WorkerContext,
    record: &ConsumedRecord,
    event_id: Option<&str>,
    attempts: u32,
) -> RecordOutcome {
    if ctx.config.manual_commit {
        if let Err(e) = ctx.bus.commit(&ctx.config.group_id, record).await {
            error!(error = %e, "Commit after processing failed, record will be redelivered");
            return RecordOutcome::new(record, event_id, DeliveryState::Failed, attempts)
                .with_error(e.to_string());
        }
    }
    RecordOutcome::new(record, event_id, DeliveryState::Acknowledged, attempts)
}

fn log_outcome(outcome: &RecordOutcome) {
    match outcome.state {
        DeliveryState::Acknowledged => debug!(
            topic = %outcome.topic,
            partition = outcome.partition,
            offset = outcome.offset,
            "Record acknowledged"
        ),
        DeliveryState::DeadLettered => warn!(
            topic = %outcome.topic,
            partition = outcome.partition,
            offset = outcome.offset,
            error = %outcome.error.as_deref().unwrap_or(""),
            "Record dead-lettered"
        ),
        _ => error!(
            topic = %outcome.topic,
            partition = outcome.partition,
            offset = outcome.offset,
            state = ?outcome.state,
            error = %outcome.error.as_deref().unwrap_or(""),
            "Record not settled"
        ),
    }
}
