//! Audit consumer: logs every event it sees

use async_trait::async_trait;
use event_bus::{ConsumedRecord, HandlerError, RecordHandler};
use event_contracts::EventEnvelope;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AuditLogHandler {
    handled: AtomicU64,
}

impl AuditLogHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordHandler for AuditLogHandler {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        record: &ConsumedRecord,
    ) -> Result<(), HandlerError> {
        tracing::info!(
            event_id = %envelope.event_id().unwrap_or("unknown"),
            event_type = %envelope.event_type(),
            source = %envelope.source(),
            correlation_id = %envelope.correlation_id().unwrap_or("none"),
            entity_id = %envelope.payload().entity_id(),
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Event observed"
        );
        self.handled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
