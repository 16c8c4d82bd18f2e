//! Producer and consumer tunables.
//!
//! Defaults carry the platform's delivery policy. Services override them from
//! their environment at startup.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Replica acknowledgment required before a send counts as successful
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Acks {
    /// Fire and forget
    None,
    /// Leader has stored the record
    Leader,
    /// All in-sync replicas have stored the record
    #[default]
    All,
}

impl FromStr for Acks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "none" => Ok(Acks::None),
            "1" | "leader" => Ok(Acks::Leader),
            "all" | "-1" => Ok(Acks::All),
            other => Err(format!("unknown acks mode '{}'", other)),
        }
    }
}

impl fmt::Display for Acks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acks::None => write!(f, "none"),
            Acks::Leader => write!(f, "leader"),
            Acks::All => write!(f, "all"),
        }
    }
}

/// Producer-side delivery policy
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub acks: Acks,
    /// Extra attempts after the first failed send
    pub retries: u32,
    /// Fixed wait between attempts
    pub retry_backoff: Duration,
    /// Budget for a record from `publish` to final outcome, retries included
    pub delivery_timeout: Duration,
    /// Upper bound on the payload bytes collected into one batch
    pub batch_size: usize,
    /// How long the dispatcher waits for more records before sending a batch
    pub linger: Duration,
    /// Attach an idempotence key so the bus drops retried duplicates
    pub enable_idempotence: bool,
    /// Records that may be queued ahead of the dispatcher
    pub buffer_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: Acks::All,
            retries: 3,
            retry_backoff: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(30),
            batch_size: 16 * 1024,
            linger: Duration::from_millis(10),
            enable_idempotence: true,
            buffer_capacity: 10_000,
        }
    }
}

impl ProducerConfig {
    /// Retry schedule for a single record: fixed backoff, `retries + 1` attempts
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::fixed(self.retries.saturating_add(1), self.retry_backoff)
    }
}

/// Where a consumer group starts reading when it has no committed offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(format!("unknown offset reset policy '{}'", other)),
        }
    }
}

/// Consumer-side delivery policy
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub auto_offset_reset: OffsetReset,
    /// Offsets are only committed by the worker after processing. Turning
    /// this off commits on delivery instead (at-most-once).
    pub manual_commit: bool,
    /// Delivered records not acknowledged within this long go back to the
    /// group (JetStream ack wait; the in-memory bus redelivers on every poll)
    pub session_timeout: Duration,
    /// Idle heartbeat requested on long polls (JetStream only)
    pub heartbeat_interval: Duration,
    pub max_poll_records: usize,
    /// Longest a single poll may wait for records
    pub poll_timeout: Duration,
    /// Parallel partition workers per group
    pub concurrency: usize,
    /// In-place retries for transient handler failures before dead-lettering
    pub handler_retry: RetryConfig,
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            auto_offset_reset: OffsetReset::Earliest,
            manual_commit: true,
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            max_poll_records: 500,
            poll_timeout: Duration::from_millis(500),
            concurrency: 3,
            handler_retry: RetryConfig::no_retry(),
        }
    }

    /// Group id convention: `<application>-consumer`
    pub fn for_application(application: &str) -> Self {
        Self::new(format!("{}-consumer", application))
    }
}
