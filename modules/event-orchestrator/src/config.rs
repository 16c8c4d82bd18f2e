use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use event_bus::retry::RetryConfig;
use event_bus::{ConsumerConfig, ProducerConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl FromStr for BusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nats" => Ok(BusType::Nats),
            "inmemory" => Ok(BusType::InMemory),
            other => Err(format!(
                "Invalid BUS_TYPE: {}. Must be 'inmemory' or 'nats'",
                other
            )),
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub bus_type: BusType,
    pub nats_url: Option<String>,
    /// JSON topic catalog; the built-in platform catalog when unset
    pub topic_catalog_path: Option<PathBuf>,
    /// Topics the audit consumer follows; empty disables it
    pub audit_topics: Vec<String>,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; `lookup` returns `None` for unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_name = lookup("APP_NAME").unwrap_or_else(|| "event-orchestrator".to_string());

        let bus_type: BusType = lookup("BUS_TYPE")
            .unwrap_or_else(|| "inmemory".to_string())
            .parse()?;

        let nats_url = match bus_type {
            BusType::Nats => Some(
                lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()),
            ),
            BusType::InMemory => None,
        };

        let topic_catalog_path = lookup("TOPIC_CATALOG_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let audit_topics = lookup("AUDIT_TOPICS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let defaults = ProducerConfig::default();
        let producer = ProducerConfig {
            acks: parse_or(&lookup, "PRODUCER_ACKS", defaults.acks)?,
            retries: parse_or(&lookup, "PRODUCER_RETRIES", defaults.retries)?,
            retry_backoff: millis_or(&lookup, "PRODUCER_RETRY_BACKOFF_MS", defaults.retry_backoff)?,
            delivery_timeout: millis_or(
                &lookup,
                "PRODUCER_DELIVERY_TIMEOUT_MS",
                defaults.delivery_timeout,
            )?,
            batch_size: parse_or(&lookup, "PRODUCER_BATCH_SIZE", defaults.batch_size)?,
            linger: millis_or(&lookup, "PRODUCER_LINGER_MS", defaults.linger)?,
            enable_idempotence: parse_or(
                &lookup,
                "PRODUCER_ENABLE_IDEMPOTENCE",
                defaults.enable_idempotence,
            )?,
            buffer_capacity: parse_or(
                &lookup,
                "PRODUCER_BUFFER_CAPACITY",
                defaults.buffer_capacity,
            )?,
        };

        let group_id =
            lookup("CONSUMER_GROUP_ID").unwrap_or_else(|| format!("{}-consumer", app_name));
        let defaults = ConsumerConfig::new(group_id);
        let handler_attempts: u32 = parse_or(
            &lookup,
            "CONSUMER_HANDLER_ATTEMPTS",
            defaults.handler_retry.max_attempts,
        )?;
        let consumer = ConsumerConfig {
            auto_offset_reset: parse_or(
                &lookup,
                "CONSUMER_AUTO_OFFSET_RESET",
                defaults.auto_offset_reset,
            )?,
            manual_commit: parse_or(&lookup, "CONSUMER_MANUAL_COMMIT", defaults.manual_commit)?,
            session_timeout: millis_or(
                &lookup,
                "CONSUMER_SESSION_TIMEOUT_MS",
                defaults.session_timeout,
            )?,
            heartbeat_interval: millis_or(
                &lookup,
                "CONSUMER_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
            max_poll_records: parse_or(
                &lookup,
                "CONSUMER_MAX_POLL_RECORDS",
                defaults.max_poll_records,
            )?,
            poll_timeout: millis_or(&lookup, "CONSUMER_POLL_TIMEOUT_MS", defaults.poll_timeout)?,
            concurrency: parse_or(&lookup, "CONSUMER_CONCURRENCY", defaults.concurrency)?,
            handler_retry: RetryConfig {
                max_attempts: handler_attempts.max(1),
                ..RetryConfig::default()
            },
            ..defaults
        };

        if consumer.concurrency == 0 {
            return Err("CONSUMER_CONCURRENCY must be at least 1".to_string());
        }

        Ok(Config {
            app_name,
            bus_type,
            nats_url,
            topic_catalog_path,
            audit_topics,
            producer,
            consumer,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, String>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} has an invalid value: '{}'", name, raw)),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration, String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| format!("{} must be a whole number of milliseconds", name)),
        None => Ok(default),
    }
}
