//! Topic provisioning
//!
//! Reconciles a static catalog of topic descriptors against the live bus at
//! startup. Missing topics are created; existing topics are left untouched,
//! even when their shape differs from the catalog. Any error aborts the run.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{BusError, MessageBus};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Compression codec requested for a topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
    #[default]
    Snappy,
    Lz4,
    Zstd,
}

/// How long records are kept, by the kind of data a topic carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionClass {
    /// Day-to-day domain events
    Operational,
    /// Records that feed audits and identity history
    Audit,
    /// Financial records with statutory retention
    Legal,
    /// Records that could not be processed
    DeadLetter,
}

impl RetentionClass {
    pub fn retention(self) -> Duration {
        match self {
            RetentionClass::Operational => DAY * 7,
            RetentionClass::Audit => DAY * 30,
            RetentionClass::Legal => DAY * 365,
            RetentionClass::DeadLetter => DAY * 30,
        }
    }
}

fn default_replication_factor() -> u16 {
    1
}

/// Catalog entry for one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDescriptor {
    pub name: String,
    pub partitions: u32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u16,
    #[serde(rename = "retentionMs", with = "retention_ms")]
    pub retention: Duration,
    #[serde(default, rename = "compressionType")]
    pub compression: CompressionType,
}

impl TopicDescriptor {
    /// Single replica, snappy compression
    pub fn new(name: impl Into<String>, partitions: u32, retention: Duration) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor: 1,
            retention,
            compression: CompressionType::default(),
        }
    }

    pub fn with_retention_class(
        name: impl Into<String>,
        partitions: u32,
        class: RetentionClass,
    ) -> Self {
        Self::new(name, partitions, class.retention())
    }

    pub fn with_replication_factor(mut self, replication_factor: u16) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn validate(&self) -> Result<(), ProvisioningError> {
        let invalid = |reason: &str| ProvisioningError::InvalidDescriptor {
            topic: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is blank"));
        }
        if self.partitions == 0 {
            return Err(invalid("partitions must be at least 1"));
        }
        if self.replication_factor == 0 {
            return Err(invalid("replication factor must be at least 1"));
        }
        Ok(())
    }
}

mod retention_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Ordered list of topics a deployment expects to exist
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicCatalog {
    topics: Vec<TopicDescriptor>,
}

impl TopicCatalog {
    pub fn new(topics: Vec<TopicDescriptor>) -> Self {
        Self { topics }
    }

    /// Parse a JSON array of descriptors
    pub fn from_json(raw: &str) -> Result<Self, ProvisioningError> {
        let catalog: Self =
            serde_json::from_str(raw).map_err(|e| ProvisioningError::Catalog(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), ProvisioningError> {
        let mut seen = HashSet::new();
        for descriptor in &self.topics {
            descriptor.validate()?;
            if !seen.insert(descriptor.name.as_str()) {
                return Err(ProvisioningError::DuplicateTopic(descriptor.name.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TopicDescriptor> {
        self.topics.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicDescriptor> {
        self.topics.iter()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// What a provisioning run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    /// Existing topics whose partition count differs from the catalog
    pub mismatched: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisioningError {
    #[error("invalid topic descriptor '{topic}': {reason}")]
    InvalidDescriptor { topic: String, reason: String },

    #[error("topic '{0}' appears more than once in the catalog")]
    DuplicateTopic(String),

    #[error("failed to read topic catalog: {0}")]
    Catalog(String),

    #[error("failed to describe topic '{topic}': {source}")]
    Describe { topic: String, source: BusError },

    #[error("failed to create topic '{topic}': {source}")]
    Create { topic: String, source: BusError },
}

/// Create every catalog topic the bus does not have yet
///
/// Safe to run on every startup: a second run against the same bus makes no
/// creation calls.
pub async fn provision_topics(
    bus: &dyn MessageBus,
    catalog: &TopicCatalog,
) -> Result<ProvisioningReport, ProvisioningError> {
    catalog.validate()?;

    let mut report = ProvisioningReport::default();

    for descriptor in catalog.iter() {
        let existing = bus
            .describe_topic(&descriptor.name)
            .await
            .map_err(|source| ProvisioningError::Describe {
                topic: descriptor.name.clone(),
                source,
            })?;

        match existing {
            Some(live) => {
                if live.partitions != descriptor.partitions {
                    warn!(
                        topic = %descriptor.name,
                        expected_partitions = descriptor.partitions,
                        actual_partitions = live.partitions,
                        "Topic exists with a different partition count, leaving it unchanged"
                    );
                    report.mismatched.push(descriptor.name.clone());
                }
                report.existing.push(descriptor.name.clone());
            }
            None => {
                bus.create_topic(descriptor)
                    .await
                    .map_err(|source| ProvisioningError::Create {
                        topic: descriptor.name.clone(),
                        source,
                    })?;
                info!(
                    topic = %descriptor.name,
                    partitions = descriptor.partitions,
                    replication_factor = descriptor.replication_factor,
                    retention_ms = descriptor.retention.as_millis() as u64,
                    compression = ?descriptor.compression,
                    "Topic created"
                );
                report.created.push(descriptor.name.clone());
            }
        }
    }

    info!(
        created = report.created.len(),
        existing = report.existing.len(),
        "Topic provisioning complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBus;

    fn catalog() -> TopicCatalog {
        TopicCatalog::new(vec![
            TopicDescriptor::with_retention_class(
                "hr.employee.created",
                3,
                RetentionClass::Operational,
            ),
            TopicDescriptor::with_retention_class(
                "acme.dead-letter",
                1,
                RetentionClass::DeadLetter,
            ),
        ])
    }

    #[test]
    fn test_descriptor_json_shape() {
        let raw = concat!(
            r#"[{"name":"billing.invoice.created","partitions":3,"replicationFactor":1,"#,
            r#""retentionMs":31536000000,"compressionType":"snappy"}]"#
        );
        let catalog = TopicCatalog::from_json(raw).unwrap();
        let topic = catalog.get("billing.invoice.created").unwrap();

        assert_eq!(topic.retention, RetentionClass::Legal.retention());
        assert_eq!(topic.compression, CompressionType::Snappy);

        let back = serde_json::to_value(topic).unwrap();
        assert_eq!(back["retentionMs"], 31_536_000_000u64);
        assert_eq!(back["replicationFactor"], 1);
    }

    #[test]
    fn test_catalog_defaults_optional_fields() {
        let raw = r#"[{"name":"t","partitions":2,"retentionMs":1000}]"#;
        let catalog = TopicCatalog::from_json(raw).unwrap();
        let topic = catalog.get("t").unwrap();
        assert_eq!(topic.replication_factor, 1);
        assert_eq!(topic.compression, CompressionType::Snappy);
    }

    #[test]
    fn test_catalog_rejects_duplicates_and_zero_partitions() {
        let dup = TopicCatalog::new(vec![
            TopicDescriptor::new("t", 1, DAY),
            TopicDescriptor::new("t", 2, DAY),
        ]);
        assert!(matches!(dup.validate(), Err(ProvisioningError::DuplicateTopic(_))));

        let zero = TopicCatalog::new(vec![TopicDescriptor::new("t", 0, DAY)]);
        assert!(matches!(
            zero.validate(),
            Err(ProvisioningError::InvalidDescriptor { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_run_creates_nothing() {
        let bus = InMemoryBus::new();

        let first = provision_topics(&bus, &catalog()).await.unwrap();
        assert_eq!(first.created.len(), 2);
        assert_eq!(bus.topic_creation_calls(), 2);

        let second = provision_topics(&bus, &catalog()).await.unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.existing.len(), 2);
        assert_eq!(bus.topic_creation_calls(), 2);
    }

    #[tokio::test]
    async fn test_partition_mismatch_is_reported_not_changed() {
        let bus = InMemoryBus::new();
        bus.create_topic(&TopicDescriptor::new("hr.employee.created", 1, DAY))
            .await
            .unwrap();

        let report = provision_topics(&bus, &catalog()).await.unwrap();

        assert_eq!(report.mismatched, vec!["hr.employee.created".to_string()]);
        assert_eq!(
            bus.describe_topic("hr.employee.created").await.unwrap().unwrap().partitions,
            1
        );
    }

    #[tokio::test]
    async fn test_creation_failure_is_an_error() {
        let bus = InMemoryBus::new();
        bus.fail_topic_creation(true);

        let err = provision_topics(&bus, &catalog()).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::Create { ref topic, .. } if topic == "hr.employee.created"
        ));
    }
}
