use event_bus::{DeliveryState, InMemoryBus, MessageBus, ProvisioningError};
use event_contracts::{EmployeeCreated, EventEnvelope};
use event_orchestrator::catalog::{platform_catalog, HR_EMPLOYEE_CREATED};
use event_orchestrator::config::Config;
use event_orchestrator::{Platform, StartupError};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn config(vars: &[(&str, &str)]) -> Config {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|name| vars.get(name).cloned()).unwrap()
}

fn employee(id: &str) -> EventEnvelope {
    EventEnvelope::new(EmployeeCreated::new(
        id,
        "Ada Lovelace",
        "ada@acme.test",
        "Engineering",
        "Staff Engineer",
        Decimal::new(185_000_00, 2),
        None,
    ))
}

#[tokio::test]
async fn test_startup_provisions_catalog_once() {
    let bus = Arc::new(InMemoryBus::new());
    let config = config(&[]);

    let first = Platform::start(&config, bus.clone()).await.unwrap();
    assert_eq!(first.provisioning.created.len(), platform_catalog().len());
    assert!(first.provisioning.existing.is_empty());
    first.shutdown().await;

    let second = Platform::start(&config, bus.clone()).await.unwrap();
    assert!(second.provisioning.created.is_empty());
    assert_eq!(second.provisioning.existing.len(), platform_catalog().len());
    assert!(second.provisioning.mismatched.is_empty());
    second.shutdown().await;

    assert_eq!(bus.topic_creation_calls(), platform_catalog().len());
    let described = bus.describe_topic(HR_EMPLOYEE_CREATED).await.unwrap().unwrap();
    assert_eq!(described.partitions, 3);
}

#[tokio::test]
async fn test_provisioning_failure_aborts_startup() {
    let bus = Arc::new(InMemoryBus::new());
    bus.fail_topic_creation(true);

    let err = Platform::start(&config(&[]), bus.clone()).await.err().unwrap();
    assert!(matches!(
        err,
        StartupError::Provisioning(ProvisioningError::Create { .. })
    ));
}

#[tokio::test]
async fn test_unreadable_catalog_aborts_startup() {
    let bus = Arc::new(InMemoryBus::new());
    let config = config(&[("TOPIC_CATALOG_PATH", "/nonexistent/topics.json")]);

    let err = Platform::start(&config, bus.clone()).await.err().unwrap();
    assert!(matches!(
        err,
        StartupError::Provisioning(ProvisioningError::Catalog(_))
    ));
    assert_eq!(bus.topic_creation_calls(), 0);
}

#[tokio::test]
async fn test_audit_consumer_sees_published_events() {
    let bus = Arc::new(InMemoryBus::new());
    let config = config(&[
        ("APP_NAME", "hr-svc"),
        ("AUDIT_TOPICS", HR_EMPLOYEE_CREATED),
        ("CONSUMER_POLL_TIMEOUT_MS", "20"),
    ]);

    let platform = Platform::start(&config, bus.clone()).await.unwrap();
    let mut outcomes = platform.audit_outcomes().unwrap();

    let mut published = Vec::new();
    for id in ["emp-1", "emp-2", "emp-3"] {
        let receipt = platform
            .publisher
            .publish(HR_EMPLOYEE_CREATED, None, employee(id))
            .await
            .unwrap();
        published.push(receipt.event_id);
    }

    let mut acknowledged = Vec::new();
    while acknowledged.len() < published.len() {
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .expect("audit consumer stalled")
            .unwrap();
        assert_eq!(outcome.state, DeliveryState::Acknowledged);
        acknowledged.push(outcome.event_id.unwrap());
    }

    acknowledged.sort();
    published.sort();
    assert_eq!(acknowledged, published);

    platform.shutdown().await;
}

#[tokio::test]
async fn test_no_audit_topics_means_no_consumer() {
    let bus = Arc::new(InMemoryBus::new());
    let platform = Platform::start(&config(&[]), bus).await.unwrap();
    assert!(platform.audit_outcomes().is_none());
    platform.shutdown().await;
}
