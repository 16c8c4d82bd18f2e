//! # Event Contracts
//!
//! The data-integrity half of the event platform: what every event on the bus
//! looks like, how missing metadata is filled in, and how an event chooses
//! its partition.
//!
//! ## Contents
//!
//! - [`EventEnvelope`]: shared metadata + a tagged [`EventPayload`]
//! - [`EventEnvelope::enrich`]: idempotent fill-in of `eventId`/`timestamp`
//! - [`PartitionKeyStrategy`]: pure envelope → key mapping, keyed by `source`
//!   by default
//! - Concrete events: [`EmployeeCreated`], [`EmployeeUpdated`], [`InvoiceCreated`]
//!
//! ## Usage
//!
//! ```rust
//! use event_contracts::{resolve_key, EmployeeCreated, EventEnvelope, SourceKeyStrategy};
//! use rust_decimal::Decimal;
//!
//! let envelope = EventEnvelope::new(EmployeeCreated::new(
//!     "EMP-7",
//!     "Ada Lovelace",
//!     "ada@acme.io",
//!     "Engineering",
//!     "Staff Engineer",
//!     Decimal::new(12_500_000, 2),
//!     None,
//! ))
//! .enrich();
//!
//! envelope.validate().expect("valid envelope");
//! let key = resolve_key(None, &SourceKeyStrategy, &envelope);
//! assert_eq!(key.as_deref(), Some("hr-svc"));
//!
//! let wire = envelope.to_wire().unwrap();
//! assert_eq!(EventEnvelope::from_wire(&wire).unwrap(), envelope);
//! ```

pub mod billing;
mod envelope;
pub mod hr;
mod partition_key;
mod payload;
pub mod timestamp;
mod validation;

pub use billing::{InvoiceCreated, InvoiceStatus};
pub use envelope::{EventEnvelope, DEFAULT_SCHEMA_VERSION};
pub use hr::{EmployeeCreated, EmployeeUpdated};
pub use partition_key::{
    resolve_key, EntityKeyStrategy, PartitionKeyStrategy, RoundRobinStrategy, SourceKeyStrategy,
};
pub use payload::{EventKind, EventPayload};
pub use validation::ValidationError;
