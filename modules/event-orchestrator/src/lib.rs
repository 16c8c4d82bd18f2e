//! Event platform bootstrap
//!
//! Brings the event platform up in a fixed order: connect to the bus,
//! provision the topic catalog (fatal on any error), start the publisher
//! with its delivery logger, then the optional audit consumer.

pub mod audit;
pub mod catalog;
pub mod config;

use std::sync::Arc;

use event_bus::{
    provision_topics, spawn_delivery_logger, BusError, ConsumerHandle, EventConsumer,
    EventPublisher, InMemoryBus, MessageBus, NatsBus, ProvisioningError, ProvisioningReport,
    RecordOutcome,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::audit::AuditLogHandler;
use crate::catalog::load_catalog;
use crate::config::{BusType, Config};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to connect to the message bus: {0}")]
    Connect(String),

    #[error("topic provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("failed to start consumer: {0}")]
    Consumer(#[from] BusError),
}

/// Create the bus selected by `BUS_TYPE`
pub async fn connect_bus(config: &Config) -> Result<Arc<dyn MessageBus>, StartupError> {
    match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus");
            Ok(Arc::new(InMemoryBus::new()))
        }
        BusType::Nats => {
            let url = config
                .nats_url
                .as_deref()
                .unwrap_or("nats://localhost:4222");
            tracing::info!("Connecting to NATS at {}", url);
            let client = async_nats::connect(url)
                .await
                .map_err(|e| StartupError::Connect(e.to_string()))?;
            Ok(Arc::new(NatsBus::new(client)))
        }
    }
}

/// Running platform services
pub struct Platform {
    pub bus: Arc<dyn MessageBus>,
    pub publisher: Arc<EventPublisher>,
    pub provisioning: ProvisioningReport,
    delivery_logger: JoinHandle<()>,
    audit: Option<ConsumerHandle>,
}

impl Platform {
    pub async fn start(config: &Config, bus: Arc<dyn MessageBus>) -> Result<Self, StartupError> {
        let catalog = load_catalog(config.topic_catalog_path.as_deref())?;
        tracing::info!(topics = catalog.len(), "Provisioning topics");
        let provisioning = provision_topics(bus.as_ref(), &catalog).await?;

        let publisher = Arc::new(EventPublisher::new(bus.clone(), config.producer.clone()));
        let delivery_logger = spawn_delivery_logger(&publisher);

        let audit = if config.audit_topics.is_empty() {
            None
        } else {
            let consumer = EventConsumer::new(
                bus.clone(),
                config.consumer.clone(),
                config.audit_topics.clone(),
                Arc::new(AuditLogHandler::new()),
            );
            Some(consumer.start().await?)
        };

        tracing::info!(
            app = %config.app_name,
            created = provisioning.created.len(),
            existing = provisioning.existing.len(),
            audit_consumer = audit.is_some(),
            "Event platform started"
        );

        Ok(Self {
            bus,
            publisher,
            provisioning,
            delivery_logger,
            audit,
        })
    }

    /// Records settled by the audit consumer, if it is running
    pub fn audit_outcomes(&self) -> Option<broadcast::Receiver<RecordOutcome>> {
        self.audit.as_ref().map(ConsumerHandle::outcomes)
    }

    /// Drain the publisher, stop the consumer, and wait for the delivery log
    pub async fn shutdown(self) {
        self.publisher.close().await;
        if let Some(audit) = self.audit {
            audit.shutdown().await;
        }
        if let Err(e) = self.delivery_logger.await {
            tracing::error!(error = %e, "Delivery logger terminated abnormally");
        }
        tracing::info!("Event platform stopped");
    }
}
