//! Dead Letter Queue (DLQ) handling
//!
//! Records a consumer cannot process are wrapped with their original
//! coordinates and the failure, then written to the dead-letter topic so an
//! operator can inspect and replay them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::retry::{retry_with_backoff_if, RetryConfig};
use crate::{BusError, BusResult, ConsumedRecord, MessageBus, OutboundRecord, RecordMetadata};

/// Platform-wide dead-letter topic
pub const DEAD_LETTER_TOPIC: &str = "acme.dead-letter";

/// Stage at which the record failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The payload could not be decoded into an event
    Deserialization,
    /// The handler rejected a decoded event
    Processing,
}

/// Dead-letter payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_topic: String,
    pub original_partition: u32,
    pub original_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_key: Option<String>,
    #[serde(default)]
    pub original_headers: HashMap<String, String>,
    /// Original value; JSON when it parses, the raw text otherwise
    pub payload: Value,
    pub error_kind: FailureKind,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub consumer_group: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(
        record: &ConsumedRecord,
        consumer_group: &str,
        error_kind: FailureKind,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let payload = serde_json::from_slice::<Value>(&record.payload).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&record.payload).into_owned())
        });
        let event_id = payload
            .get("eventId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Self {
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
            original_key: record.key.clone(),
            original_headers: record.headers.clone(),
            payload,
            error_kind,
            error: error.into(),
            event_id,
            consumer_group: consumer_group.to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Bus record for the dead-letter topic
    ///
    /// Keyed by the original topic so one topic's failures stay in order.
    /// The idempotence key is the original coordinates, so a redelivered
    /// record that fails again is only dead-lettered once.
    pub fn to_outbound(&self, topic: &str) -> BusResult<OutboundRecord> {
        let payload =
            serde_json::to_vec(self).map_err(|e| BusError::SerializationError(e.to_string()))?;

        Ok(OutboundRecord::new(topic, Some(self.original_topic.clone()), payload)
            .with_header("original-topic", self.original_topic.clone())
            .with_header("failure-kind", format!("{:?}", self.error_kind))
            .with_idempotence_key(Some(format!(
                "{}/{}/{}/{}",
                self.consumer_group,
                self.original_topic,
                self.original_partition,
                self.original_offset
            ))))
    }
}

/// Destination for records that could not be processed
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, record: DeadLetterRecord) -> BusResult<RecordMetadata>;
}

/// Writes dead letters to a topic on the bus
pub struct BusDeadLetterSink {
    bus: Arc<dyn MessageBus>,
    topic: String,
    retry: RetryConfig,
}

impl BusDeadLetterSink {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self::with_topic(bus, DEAD_LETTER_TOPIC)
    }

    pub fn with_topic(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl DeadLetterSink for BusDeadLetterSink {
    async fn dead_letter(&self, record: DeadLetterRecord) -> BusResult<RecordMetadata> {
        let outbound = record.to_outbound(&self.topic)?;

        let metadata = retry_with_backoff_if(
            || self.bus.send(outbound.clone()),
            &self.retry,
            "dead_letter",
            BusError::is_transient,
        )
        .await?;

        tracing::error!(
            original_topic = %record.original_topic,
            original_partition = record.original_partition,
            original_offset = record.original_offset,
            event_id = %record.event_id.as_deref().unwrap_or("unknown"),
            consumer_group = %record.consumer_group,
            error_kind = ?record.error_kind,
            error = %record.error,
            attempts = record.attempts,
            dlq_offset = metadata.offset,
            "Record moved to DLQ"
        );

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBus, TopicDescriptor};
    use std::time::Duration;

    fn consumed(payload: &[u8]) -> ConsumedRecord {
        ConsumedRecord {
            topic: "hr.employee.created".to_string(),
            partition: 1,
            offset: 7,
            key: Some("hr-svc".to_string()),
            payload: payload.to_vec(),
            headers: HashMap::from([("event-type".to_string(), "hr.employee.created".to_string())]),
        }
    }

    #[test]
    fn test_json_payload_is_kept_structured() {
        let record = DeadLetterRecord::new(
            &consumed(br#"{"eventId":"evt-9","source":"hr-svc"}"#),
            "payroll-consumer",
            FailureKind::Processing,
            "boom",
            1,
        );

        assert_eq!(record.event_id.as_deref(), Some("evt-9"));
        assert_eq!(record.payload["source"], "hr-svc");

        let wire: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(wire["originalTopic"], "hr.employee.created");
        assert_eq!(wire["originalOffset"], 7);
        assert_eq!(wire["errorKind"], "processing");
        assert_eq!(wire["consumerGroup"], "payroll-consumer");
    }

    #[test]
    fn test_raw_payload_is_kept_as_text() {
        let record = DeadLetterRecord::new(
            &consumed(b"not json"),
            "payroll-consumer",
            FailureKind::Deserialization,
            "expected value",
            1,
        );

        assert_eq!(record.payload, Value::String("not json".to_string()));
        assert_eq!(record.event_id, None);
    }

    #[tokio::test]
    async fn test_sink_writes_to_dead_letter_topic() {
        let bus = Arc::new(InMemoryBus::new());
        bus.create_topic(&TopicDescriptor::new(DEAD_LETTER_TOPIC, 1, Duration::from_secs(60)))
            .await
            .unwrap();
        let sink = BusDeadLetterSink::new(bus.clone());

        let record =
            DeadLetterRecord::new(&consumed(b"{}"), "g", FailureKind::Processing, "boom", 2);
        sink.dead_letter(record.clone()).await.unwrap();
        // Redelivered failure of the same record
        sink.dead_letter(record).await.unwrap();

        let stored = bus.records(DEAD_LETTER_TOPIC);
        assert_eq!(stored.len(), 1);
        let decoded: DeadLetterRecord = serde_json::from_slice(&stored[0].payload).unwrap();
        assert_eq!(decoded.original_partition, 1);
        assert_eq!(decoded.attempts, 2);
        assert_eq!(stored[0].key.as_deref(), Some("hr.employee.created"));
    }

    #[tokio::test]
    async fn test_sink_fails_when_topic_missing() {
        let bus = Arc::new(InMemoryBus::new());
        let sink = BusDeadLetterSink::new(bus);

        let record =
            DeadLetterRecord::new(&consumed(b"{}"), "g", FailureKind::Processing, "boom", 1);
        assert!(matches!(
            sink.dead_letter(record).await,
            Err(BusError::UnknownTopic(_))
        ));
    }
}
