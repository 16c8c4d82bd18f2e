//! Partition key derivation.
//!
//! The key decides which ordered partition of a topic an envelope lands on.
//! Keying by `source` keeps every event from one producing service in send
//! order. Call sites that need per-entity ordering pick
//! [`EntityKeyStrategy`] or pass an explicit key. A missing or empty key
//! leaves partition choice to the bus (round-robin).

use crate::envelope::EventEnvelope;

/// Maps an envelope to a partition-routing key. Must be pure.
pub trait PartitionKeyStrategy: Send + Sync {
    fn derive_key(&self, envelope: &EventEnvelope) -> Option<String>;
}

/// Key by producing service. This is the platform default.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceKeyStrategy;

impl PartitionKeyStrategy for SourceKeyStrategy {
    fn derive_key(&self, envelope: &EventEnvelope) -> Option<String> {
        Some(envelope.source().to_string())
    }
}

/// Key by the business entity the event is about (employee, invoice, ...).
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityKeyStrategy;

impl PartitionKeyStrategy for EntityKeyStrategy {
    fn derive_key(&self, envelope: &EventEnvelope) -> Option<String> {
        Some(envelope.payload().entity_id().to_string())
    }
}

/// No key; the bus spreads records round-robin.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinStrategy;

impl PartitionKeyStrategy for RoundRobinStrategy {
    fn derive_key(&self, _envelope: &EventEnvelope) -> Option<String> {
        None
    }
}

/// Pick the key for a publish call.
///
/// An explicit key takes precedence over the strategy. Whatever is chosen,
/// an empty key is normalized to `None`.
pub fn resolve_key(
    explicit: Option<&str>,
    strategy: &dyn PartitionKeyStrategy,
    envelope: &EventEnvelope,
) -> Option<String> {
    let key = match explicit {
        Some(key) => Some(key.to_string()),
        None => strategy.derive_key(envelope),
    };
    key.filter(|k| !k.is_empty())
}
