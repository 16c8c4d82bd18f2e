//! NATS JetStream implementation of the MessageBus trait
//!
//! Mapping:
//! - topic `hr.employee.created` → stream `HR_EMPLOYEE_CREATED` bound to
//!   subjects `hr.employee.created.*`
//! - partition `p` → subject `hr.employee.created.<p>`; the partition count
//!   lives in the stream metadata
//! - offset → JetStream stream sequence (monotonic per partition, not
//!   contiguous)
//! - idempotence key → `Nats-Msg-Id` header, deduplicated by the stream's
//!   duplicate window
//! - consumer group → one durable pull consumer per (group, topic, partition)
//!   with explicit acks; a commit acks exactly the committed message and a
//!   release naks the released message and everything delivered after it
//! - session timeout → the consumer's ack wait; heartbeat interval → the idle
//!   heartbeat of each fetch

use crate::partitioner::Partitioner;
use crate::provisioning::CompressionType;
use crate::{
    Acks, BusError, BusResult, ConsumedRecord, MessageBus, OffsetReset, OutboundRecord,
    PollRequest, RecordMetadata, TopicDescription, TopicDescriptor, DUPLICATE_WINDOW,
};
use async_nats::jetstream::{self, consumer, stream, AckKind, Context};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const PARTITIONS_METADATA_KEY: &str = "partitions";

type ConsumerKey = (String, String, u32);

/// MessageBus implementation using NATS JetStream
///
/// This is the production implementation that connects to a NATS server.
/// It wraps an `async_nats::Client` and implements the `MessageBus` trait.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{MessageBus, NatsBus, OutboundRecord};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
///
/// bus.send(OutboundRecord::new("billing.invoice.created", None, b"{}".to_vec()))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct NatsBus {
    client: Client,
    jetstream: Context,
    partitioner: Partitioner,
    partition_counts: RwLock<HashMap<String, u32>>,
    consumers: Mutex<HashMap<ConsumerKey, consumer::Consumer<consumer::pull::Config>>>,
    in_flight: Mutex<InFlight<jetstream::Message>>,
}

/// Delivered but not yet settled messages per consumer, in stream order
struct InFlight<M> {
    pending: HashMap<ConsumerKey, Vec<(u64, M)>>,
}

impl<M> Default for InFlight<M> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<M> InFlight<M> {
    fn track(&mut self, key: ConsumerKey, delivered: Vec<(u64, M)>) {
        if !delivered.is_empty() {
            self.pending.entry(key).or_default().extend(delivered);
        }
    }

    /// Remove the message at `sequence` only
    fn take(&mut self, key: &ConsumerKey, sequence: u64) -> Option<M> {
        let pending = self.pending.get_mut(key)?;
        let index = pending.iter().position(|(seq, _)| *seq == sequence)?;
        Some(pending.remove(index).1)
    }

    /// Remove the message at `sequence` and every message delivered after it
    fn take_from(&mut self, key: &ConsumerKey, sequence: u64) -> Vec<(u64, M)> {
        let Some(pending) = self.pending.get_mut(key) else {
            return Vec::new();
        };
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(pending)
            .into_iter()
            .partition(|(seq, _)| *seq >= sequence);
        *pending = kept;
        released
    }
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    ///
    /// # Arguments
    /// * `client` - An already-connected `async_nats::Client`
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            partitioner: Partitioner::new(),
            partition_counts: RwLock::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Stream name for a topic: upper-cased, separators replaced by `_`
    pub fn stream_name(topic: &str) -> String {
        sanitize(topic).to_uppercase()
    }

    fn partition_subject(topic: &str, partition: u32) -> String {
        format!("{}.{}", topic, partition)
    }

    async fn partition_count(&self, topic: &str) -> BusResult<u32> {
        if let Some(count) = self.partition_counts.read().await.get(topic) {
            return Ok(*count);
        }

        let description = self
            .describe_topic(topic)
            .await?
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        self.partition_counts
            .write()
            .await
            .insert(topic.to_string(), description.partitions);
        Ok(description.partitions)
    }

    async fn consumer_for(
        &self,
        request: &PollRequest,
    ) -> BusResult<consumer::Consumer<consumer::pull::Config>> {
        let key = (
            request.group_id.clone(),
            request.topic.clone(),
            request.partition,
        );
        let mut consumers = self.consumers.lock().await;
        if let Some(existing) = consumers.get(&key) {
            return Ok(existing.clone());
        }

        let stream = self
            .jetstream
            .get_stream(Self::stream_name(&request.topic))
            .await
            .map_err(|e| BusError::PollError(e.to_string()))?;

        let durable = sanitize(&format!(
            "{}-{}-{}",
            request.group_id, request.topic, request.partition
        ));
        let created = stream
            .get_or_create_consumer(&durable, pull_config(&durable, request))
            .await
            .map_err(|e| BusError::PollError(e.to_string()))?;
        consumers.insert(key, created.clone());
        Ok(created)
    }
}

fn pull_config(durable: &str, request: &PollRequest) -> consumer::pull::Config {
    consumer::pull::Config {
        durable_name: Some(durable.to_string()),
        filter_subject: NatsBus::partition_subject(&request.topic, request.partition),
        ack_policy: consumer::AckPolicy::Explicit,
        ack_wait: request.session_timeout,
        deliver_policy: match request.offset_reset {
            OffsetReset::Earliest => consumer::DeliverPolicy::All,
            OffsetReset::Latest => consumer::DeliverPolicy::New,
        },
        ..Default::default()
    }
}

/// Idle heartbeat for a fetch, if the wait is long enough to carry one
fn fetch_heartbeat(request: &PollRequest) -> Option<Duration> {
    let heartbeat = request.heartbeat_interval;
    // The server refuses heartbeats longer than half the fetch expiry
    (!heartbeat.is_zero() && heartbeat.saturating_mul(2) <= request.max_wait).then_some(heartbeat)
}

fn consumer_key(group_id: &str, record: &ConsumedRecord) -> ConsumerKey {
    (group_id.to_string(), record.topic.clone(), record.partition)
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn headers_to_map(headers: Option<&HeaderMap>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(headers) = headers {
        for (key, values) in headers.iter() {
            // Take the first value for each header
            if let Some(value) = values.first() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }
    map
}

fn stream_config(descriptor: &TopicDescriptor) -> stream::Config {
    let mut metadata = HashMap::new();
    metadata.insert(
        PARTITIONS_METADATA_KEY.to_string(),
        descriptor.partitions.to_string(),
    );
    metadata.insert("topic".to_string(), descriptor.name.clone());

    stream::Config {
        name: NatsBus::stream_name(&descriptor.name),
        subjects: vec![format!("{}.*", descriptor.name)],
        max_age: descriptor.retention,
        num_replicas: descriptor.replication_factor.max(1) as usize,
        duplicate_window: DUPLICATE_WINDOW,
        compression: match descriptor.compression {
            CompressionType::None => None,
            // S2 is the only codec JetStream offers
            _ => Some(stream::Compression::S2),
        },
        description: Some(format!("Topic {}", descriptor.name)),
        metadata,
        ..Default::default()
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn send(&self, record: OutboundRecord) -> BusResult<RecordMetadata> {
        let partitions = self.partition_count(&record.topic).await?;
        let partition = self.partitioner.partition(record.key.as_deref(), partitions);

        let mut headers = HeaderMap::new();
        for (name, value) in &record.headers {
            headers.insert(name.as_str(), value.as_str());
        }
        if let Some(key) = &record.key {
            headers.insert("partition-key", key.as_str());
        }
        if let Some(id) = &record.idempotence_key {
            headers.insert(async_nats::header::NATS_MESSAGE_ID, id.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(
                Self::partition_subject(&record.topic, partition),
                headers,
                record.payload.into(),
            )
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        if record.acks == Acks::None {
            // Sequence unknown without the ack
            return Ok(RecordMetadata {
                topic: record.topic,
                partition,
                offset: 0,
            });
        }

        let ack = ack.await.map_err(|e| BusError::Timeout(e.to_string()))?;
        if ack.duplicate {
            debug!(
                topic = %record.topic,
                sequence = ack.sequence,
                "Duplicate publish dropped by stream"
            );
        }

        Ok(RecordMetadata {
            topic: record.topic,
            partition,
            offset: ack.sequence,
        })
    }

    async fn describe_topic(&self, topic: &str) -> BusResult<Option<TopicDescription>> {
        match self.jetstream.get_stream(Self::stream_name(topic)).await {
            Ok(stream) => {
                let partitions = stream
                    .cached_info()
                    .config
                    .metadata
                    .get(PARTITIONS_METADATA_KEY)
                    .and_then(|raw| raw.parse::<u32>().ok())
                    .unwrap_or(1);
                Ok(Some(TopicDescription {
                    name: topic.to_string(),
                    partitions,
                }))
            }
            Err(e) => match e.kind() {
                jetstream::context::GetStreamErrorKind::JetStream(js)
                    if js.error_code() == jetstream::ErrorCode::STREAM_NOT_FOUND =>
                {
                    Ok(None)
                }
                _ => Err(BusError::ConnectionError(e.to_string())),
            },
        }
    }

    async fn create_topic(&self, descriptor: &TopicDescriptor) -> BusResult<()> {
        self.jetstream
            .create_stream(stream_config(descriptor))
            .await
            .map_err(|e| BusError::AdminError(e.to_string()))?;

        self.partition_counts
            .write()
            .await
            .insert(descriptor.name.clone(), descriptor.partitions);
        Ok(())
    }

    async fn poll(&self, request: &PollRequest) -> BusResult<Vec<ConsumedRecord>> {
        let consumer = self.consumer_for(request).await?;

        let mut fetch = consumer
            .fetch()
            .max_messages(request.max_records.max(1))
            .expires(request.max_wait);
        if let Some(heartbeat) = fetch_heartbeat(request) {
            fetch = fetch.heartbeat(heartbeat);
        }
        let mut batch = fetch
            .messages()
            .await
            .map_err(|e| BusError::PollError(e.to_string()))?;

        let mut records = Vec::new();
        let mut delivered = Vec::new();
        while let Some(message) = batch.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!(topic = %request.topic, error = %e, "Failed to receive message");
                    continue;
                }
            };
            let sequence = match message.info() {
                Ok(info) => info.stream_sequence,
                Err(e) => {
                    warn!(topic = %request.topic, error = %e, "Message without delivery info");
                    continue;
                }
            };

            records.push(ConsumedRecord {
                topic: request.topic.clone(),
                partition: request.partition,
                offset: sequence,
                key: message
                    .headers
                    .as_ref()
                    .and_then(|h| h.get("partition-key"))
                    .map(|v| v.to_string()),
                payload: message.payload.to_vec(),
                headers: headers_to_map(message.headers.as_ref()),
            });
            delivered.push((sequence, message));
        }

        self.in_flight.lock().await.track(
            (
                request.group_id.clone(),
                request.topic.clone(),
                request.partition,
            ),
            delivered,
        );

        Ok(records)
    }

    async fn commit(&self, group_id: &str, record: &ConsumedRecord) -> BusResult<()> {
        let message = self
            .in_flight
            .lock()
            .await
            .take(&consumer_key(group_id, record), record.offset);
        let Some(message) = message else {
            return Ok(());
        };

        message.ack().await.map_err(|e| {
            BusError::CommitError(format!(
                "ack failed for {}:{}:{}: {}",
                record.topic, record.partition, record.offset, e
            ))
        })
    }

    async fn release(&self, group_id: &str, record: &ConsumedRecord) -> BusResult<()> {
        let released = self
            .in_flight
            .lock()
            .await
            .take_from(&consumer_key(group_id, record), record.offset);

        debug!(
            topic = %record.topic,
            partition = record.partition,
            from_offset = record.offset,
            count = released.len(),
            "Releasing delivered messages for redelivery"
        );

        for (sequence, message) in released {
            message.ack_with(AckKind::Nak(None)).await.map_err(|e| {
                BusError::CommitError(format!(
                    "nak failed for {}:{}:{}: {}",
                    record.topic, record.partition, sequence, e
                ))
            })?;
        }
        Ok(())
    }
}
