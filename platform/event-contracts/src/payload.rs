//! Payload variants carried by [`EventEnvelope`](crate::EventEnvelope).
//!
//! Every concrete event is a variant of [`EventPayload`], tagged on the wire
//! by its `eventType`. The tag and the producing service are constants of the
//! payload type, so an envelope can never carry a payload under the wrong
//! type or source.

use serde::{Deserialize, Serialize};

use crate::billing::InvoiceCreated;
use crate::hr::{EmployeeCreated, EmployeeUpdated};
use crate::validation::ValidationError;

/// Static identity of a concrete event type.
pub trait EventKind {
    /// Dot-namespaced semantic kind, e.g. `hr.employee.created`.
    const EVENT_TYPE: &'static str;

    /// Producing service.
    const SOURCE: &'static str;

    /// Validate the payload's own field constraints.
    fn validate(&self) -> Result<(), ValidationError>;

    /// Identifier of the business entity the event is about.
    fn entity_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum EventPayload {
    #[serde(rename = "hr.employee.created")]
    EmployeeCreated(EmployeeCreated),

    #[serde(rename = "hr.employee.updated")]
    EmployeeUpdated(EmployeeUpdated),

    #[serde(rename = "billing.invoice.created")]
    InvoiceCreated(InvoiceCreated),
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::EmployeeCreated(_) => EmployeeCreated::EVENT_TYPE,
            EventPayload::EmployeeUpdated(_) => EmployeeUpdated::EVENT_TYPE,
            EventPayload::InvoiceCreated(_) => InvoiceCreated::EVENT_TYPE,
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            EventPayload::EmployeeCreated(_) => EmployeeCreated::SOURCE,
            EventPayload::EmployeeUpdated(_) => EmployeeUpdated::SOURCE,
            EventPayload::InvoiceCreated(_) => InvoiceCreated::SOURCE,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            EventPayload::EmployeeCreated(p) => p.validate(),
            EventPayload::EmployeeUpdated(p) => p.validate(),
            EventPayload::InvoiceCreated(p) => p.validate(),
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            EventPayload::EmployeeCreated(p) => p.entity_id(),
            EventPayload::EmployeeUpdated(p) => p.entity_id(),
            EventPayload::InvoiceCreated(p) => p.entity_id(),
        }
    }
}

impl From<EmployeeCreated> for EventPayload {
    fn from(payload: EmployeeCreated) -> Self {
        EventPayload::EmployeeCreated(payload)
    }
}

impl From<EmployeeUpdated> for EventPayload {
    fn from(payload: EmployeeUpdated) -> Self {
        EventPayload::EmployeeUpdated(payload)
    }
}

impl From<InvoiceCreated> for EventPayload {
    fn from(payload: InvoiceCreated) -> Self {
        EventPayload::InvoiceCreated(payload)
    }
}
