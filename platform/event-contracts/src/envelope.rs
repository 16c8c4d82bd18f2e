//! # Event Envelope
//!
//! Platform-wide envelope for every event exchanged over the bus.
//!
//! ## Design Principles
//!
//! 1. **Composition over inheritance**: shared metadata lives on the envelope,
//!    event-specific data lives in a tagged [`EventPayload`] variant
//! 2. **Explicit enrichment**: identity and timestamp are filled by
//!    [`EventEnvelope::enrich`], which returns a new value
//! 3. **Read-only after enrichment**: no mutators exist for `eventId`,
//!    `timestamp`, `eventType` or `source`
//! 4. **Flat wire form**: metadata and payload fields share one JSON object
//!
//! ## Envelope Fields
//!
//! - `eventId`: globally unique identifier, generated at enrichment if absent
//! - `eventType`: dot-namespaced kind, fixed by the payload variant
//! - `timestamp`: UTC creation instant, generated at enrichment if absent
//! - `source`: producing service, fixed by the payload variant
//! - `correlationId`: optional cross-service tracing token, never generated
//! - `version`: schema version, defaults to `"1.0"`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::EventPayload;
use crate::timestamp;
use crate::validation::{require_non_blank, ValidationError};

/// Schema version stamped on envelopes that do not declare one.
pub const DEFAULT_SCHEMA_VERSION: &str = "1.0";

fn default_version() -> String {
    DEFAULT_SCHEMA_VERSION.to_string()
}

/// Standard event envelope following the platform event contract
///
/// # Examples
///
/// ```rust
/// use chrono::NaiveDate;
/// use event_contracts::{EventEnvelope, InvoiceCreated};
/// use rust_decimal::Decimal;
///
/// let envelope = EventEnvelope::new(InvoiceCreated::new(
///     "INV-1",
///     "EMP-7",
///     "Initech",
///     Decimal::new(10000, 2),
///     NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
///     None,
/// ))
/// .with_correlation_id(Some("corr-42".to_string()))
/// .enrich();
///
/// assert_eq!(envelope.event_type(), "billing.invoice.created");
/// assert_eq!(envelope.source(), "billing-svc");
/// assert!(envelope.is_enriched());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::timestamp::option"
    )]
    timestamp: Option<DateTime<Utc>>,

    source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,

    #[serde(default = "default_version")]
    version: String,

    /// Event-specific payload; contributes `eventType` and its own fields
    #[serde(flatten)]
    payload: EventPayload,
}

impl EventEnvelope {
    /// Create an un-enriched envelope for a payload
    ///
    /// `eventType` and `source` are taken from the payload variant. Call
    /// [`enrich`](Self::enrich) (or let the publisher do it) before sending.
    pub fn new(payload: impl Into<EventPayload>) -> Self {
        let payload = payload.into();
        Self {
            event_id: None,
            timestamp: None,
            source: payload.source().to_string(),
            correlation_id: None,
            version: default_version(),
            payload,
        }
    }

    /// Preset the event id, e.g. when re-emitting a known event
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Preset the creation instant
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp::to_wire_precision(timestamp));
        self
    }

    /// Propagate a correlation id from an upstream request or event
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the schema version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Fill in the generated metadata
    ///
    /// Assigns a fresh UUID when `eventId` is absent and the current UTC
    /// instant (millisecond precision) when `timestamp` is absent. Fields that
    /// are already set are left alone, so enriching twice is a no-op.
    pub fn enrich(mut self) -> Self {
        if self.event_id.is_none() {
            let event_id = Uuid::new_v4().to_string();
            tracing::trace!(
                event_id = %event_id,
                event_type = %self.event_type(),
                "Assigned event id"
            );
            self.event_id = Some(event_id);
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(timestamp::to_wire_precision(Utc::now()));
        }
        self
    }

    /// Whether both generated fields are present
    pub fn is_enriched(&self) -> bool {
        self.event_id.is_some() && self.timestamp.is_some()
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn into_payload(self) -> EventPayload {
        self.payload
    }

    /// Validate the envelope ahead of transmission
    ///
    /// # Validation Rules
    ///
    /// - `eventId`, `timestamp`: must be present (enriched) and `eventId` non-blank
    /// - `source`: non-blank and equal to the payload's producing service
    /// - `version`: non-blank
    /// - `correlationId`: optional, but non-blank when present
    /// - payload: its own field constraints
    pub fn validate(&self) -> Result<(), ValidationError> {
        let event_id = self
            .event_id
            .as_deref()
            .ok_or(ValidationError::NotEnriched("eventId"))?;
        require_non_blank("eventId", event_id)?;

        if self.timestamp.is_none() {
            return Err(ValidationError::NotEnriched("timestamp"));
        }

        require_non_blank("source", &self.source)?;
        if self.source != self.payload.source() {
            return Err(ValidationError::SourceMismatch {
                event_type: self.event_type(),
                expected: self.payload.source(),
                found: self.source.clone(),
            });
        }

        require_non_blank("version", &self.version)?;

        if let Some(correlation_id) = self.correlation_id.as_deref() {
            require_non_blank("correlationId", correlation_id)?;
        }

        self.payload.validate()
    }

    /// Serialize to the wire form
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the wire form
    pub fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{InvoiceCreated, InvoiceStatus};
    use crate::hr::EmployeeCreated;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use serde_json::json;

    fn invoice() -> InvoiceCreated {
        InvoiceCreated::new(
            "INV-1",
            "EMP-7",
            "Initech",
            Decimal::new(10000, 2),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            Some("January retainer".to_string()),
        )
    }

    #[test]
    fn test_envelope_creation() {
        let envelope = EventEnvelope::new(invoice());

        assert_eq!(envelope.event_type(), "billing.invoice.created");
        assert_eq!(envelope.source(), "billing-svc");
        assert_eq!(envelope.version(), "1.0");
        assert!(envelope.event_id().is_none());
        assert!(envelope.timestamp().is_none());
        assert!(envelope.correlation_id().is_none());
        assert!(!envelope.is_enriched());
    }

    #[test]
    fn test_enrich_fills_missing_fields() {
        let envelope = EventEnvelope::new(invoice()).enrich();

        assert!(envelope.is_enriched());
        assert!(Uuid::parse_str(envelope.event_id().unwrap()).is_ok());
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn test_enrich_is_idempotent() {
        let once = EventEnvelope::new(invoice()).enrich();
        let twice = once.clone().enrich();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_enrich_keeps_preset_fields() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let envelope = EventEnvelope::new(invoice())
            .with_event_id("evt-fixed")
            .with_timestamp(ts)
            .enrich();

        assert_eq!(envelope.event_id(), Some("evt-fixed"));
        assert_eq!(envelope.timestamp(), Some(ts));
    }

    #[test]
    fn test_envelope_with_builder() {
        let envelope = EventEnvelope::new(invoice())
            .with_version("1.1")
            .with_correlation_id(Some("corr-456".to_string()));

        assert_eq!(envelope.version(), "1.1");
        assert_eq!(envelope.correlation_id(), Some("corr-456"));
    }

    #[test]
    fn test_validate_requires_enrichment() {
        assert_eq!(
            EventEnvelope::new(invoice()).validate(),
            Err(ValidationError::NotEnriched("eventId"))
        );
        assert_eq!(
            EventEnvelope::new(invoice()).with_event_id("e-1").validate(),
            Err(ValidationError::NotEnriched("timestamp"))
        );
    }

    #[test]
    fn test_validate_rejects_blank_correlation_id() {
        let envelope = EventEnvelope::new(invoice())
            .with_correlation_id(Some(String::new()))
            .enrich();
        assert_eq!(
            envelope.validate(),
            Err(ValidationError::BlankField("correlationId"))
        );
    }

    #[test]
    fn test_validate_delegates_to_payload() {
        let mut bad = invoice();
        bad.amount = Decimal::new(-1, 0);
        let envelope = EventEnvelope::new(bad).enrich();
        assert!(matches!(
            envelope.validate(),
            Err(ValidationError::NotPositive { field: "amount", .. })
        ));
    }

    #[test]
    fn test_wire_form_is_flat_camel_case() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let envelope = EventEnvelope::new(invoice())
            .with_event_id("evt-1")
            .with_timestamp(ts)
            .with_correlation_id(Some("corr-1".to_string()));

        let wire: serde_json::Value = serde_json::from_slice(&envelope.to_wire().unwrap()).unwrap();

        assert_eq!(
            wire,
            json!({
                "eventId": "evt-1",
                "eventType": "billing.invoice.created",
                "timestamp": "2025-01-01T08:00:00.000Z",
                "source": "billing-svc",
                "correlationId": "corr-1",
                "version": "1.0",
                "invoiceId": "INV-1",
                "employeeId": "EMP-7",
                "clientName": "Initech",
                "amount": "100.00",
                "dueDate": "2025-01-01",
                "status": "PENDING",
                "description": "January retainer"
            })
        );
    }

    #[test]
    fn test_decode_foreign_record_with_defaults() {
        let wire = json!({
            "eventId": "6f1c1f0e-0000-4000-8000-000000000001",
            "eventType": "billing.invoice.created",
            "timestamp": "2025-01-01T08:00:00.000Z",
            "source": "billing-svc",
            "invoiceId": "INV-9",
            "employeeId": "EMP-2",
            "clientName": "Globex",
            "amount": "42.50",
            "dueDate": "2025-02-01"
        });

        let envelope = EventEnvelope::from_wire(&serde_json::to_vec(&wire).unwrap()).unwrap();

        assert_eq!(envelope.version(), "1.0");
        match envelope.payload() {
            EventPayload::InvoiceCreated(inv) => {
                assert_eq!(inv.status, InvoiceStatus::Pending);
                assert_eq!(inv.amount, Decimal::new(4250, 2));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_event_type_fails() {
        let wire = br#"{"eventId":"e","eventType":"hr.unknown","source":"hr-svc","version":"1.0"}"#;
        assert!(EventEnvelope::from_wire(wire).is_err());
    }

    #[test]
    fn test_validate_rejects_source_mismatch() {
        let wire = json!({
            "eventId": "e-1",
            "eventType": "hr.employee.created",
            "timestamp": "2025-01-01T08:00:00.000Z",
            "source": "billing-svc",
            "employeeId": "EMP-1",
            "fullName": "Grace Hopper",
            "email": "grace@acme.io",
            "department": "Engineering",
            "position": "Admiral",
            "salary": "1.00"
        });
        let envelope = EventEnvelope::from_wire(&serde_json::to_vec(&wire).unwrap()).unwrap();

        assert!(matches!(
            envelope.validate(),
            Err(ValidationError::SourceMismatch { expected: "hr-svc", .. })
        ));
        assert!(matches!(
            envelope.payload(),
            EventPayload::EmployeeCreated(EmployeeCreated {
                is_active: true,
                ..
            })
        ));
    }
}
