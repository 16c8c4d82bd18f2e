//! In-memory implementation of the MessageBus trait for testing and development

use crate::partitioner::Partitioner;
use crate::retry::deadline_after;
use crate::{
    BusError, BusResult, ConsumedRecord, MessageBus, OffsetReset, OutboundRecord, PollRequest,
    RecordMetadata, TopicDescription, TopicDescriptor, DUPLICATE_WINDOW,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// MessageBus implementation backed by in-process partition logs
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated message buses
///
/// Every topic is a set of append-only partition logs. Offsets start at 0 and
/// are contiguous per partition. Consumer groups track their committed
/// position per partition, and a record carrying an idempotence key is
/// stored at most once per topic within the duplicate window.
///
/// Fault injection hooks let tests exercise the retry and dead-letter paths.
///
/// # Example
/// ```rust
/// use event_bus::{InMemoryBus, MessageBus, OutboundRecord, TopicDescriptor};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// bus.create_topic(&TopicDescriptor::new("test.events", 3, Duration::from_secs(60)))
///     .await?;
///
/// let meta = bus
///     .send(OutboundRecord::new("test.events", Some("k".into()), b"hello".to_vec()))
///     .await?;
/// assert_eq!(meta.offset, 0);
/// assert_eq!(bus.records("test.events").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    appended: Notify,
    partitioner: Partitioner,
    duplicate_window: Duration,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::with_duplicate_window(DUPLICATE_WINDOW)
    }
}

struct Remembered {
    metadata: RecordMetadata,
    stored_at: Instant,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<ConsumedRecord>>>,
    /// (group, topic, partition) → next offset to deliver
    committed: HashMap<(String, String, u32), u64>,
    /// (topic, idempotence key) → where the first copy was stored
    dedupe: HashMap<(String, String), Remembered>,
    topic_creation_calls: usize,
    release_calls: usize,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    failing_sends: u32,
    lost_acks: u32,
    fail_topic_creation: bool,
    failing_commits: u32,
}

impl InMemoryBus {
    /// Create an empty bus with no topics
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that forgets idempotence keys after `window`
    pub fn with_duplicate_window(window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                appended: Notify::new(),
                partitioner: Partitioner::new(),
                duplicate_window: window,
            }),
        }
    }

    fn state(&self) -> BusResult<MutexGuard<'_, State>> {
        self.inner
            .state
            .lock()
            .map_err(|_| BusError::InternalError("in-memory bus state poisoned".to_string()))
    }

    fn state_for_inspection(&self) -> MutexGuard<'_, State> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every record stored on `topic`, partition by partition
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        self.state_for_inspection()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Records stored on one partition, in offset order
    pub fn partition_records(&self, topic: &str, partition: u32) -> Vec<ConsumedRecord> {
        self.state_for_inspection()
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Next offset the group will receive, if it has committed anything
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: u32) -> Option<u64> {
        self.state_for_inspection()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Number of `create_topic` calls made so far, failed ones included
    pub fn topic_creation_calls(&self) -> usize {
        self.state_for_inspection().topic_creation_calls
    }

    /// Number of idempotence keys remembered across all topics
    pub fn dedupe_entries(&self) -> usize {
        self.state_for_inspection().dedupe.len()
    }

    /// Number of `release` calls made so far
    pub fn release_calls(&self) -> usize {
        self.state_for_inspection().release_calls
    }

    /// Make the next `n` sends fail with a transient error without storing anything
    pub fn fail_next_sends(&self, n: u32) {
        self.state_for_inspection().faults.failing_sends = n;
    }

    /// Store the next `n` records but report a timeout to the sender,
    /// as if the acknowledgment was lost on the way back
    pub fn lose_next_acks(&self, n: u32) {
        self.state_for_inspection().faults.lost_acks = n;
    }

    /// Make every `create_topic` call fail until switched off
    pub fn fail_topic_creation(&self, fail: bool) {
        self.state_for_inspection().faults.fail_topic_creation = fail;
    }

    /// Make the next `n` commits fail
    pub fn fail_next_commits(&self, n: u32) {
        self.state_for_inspection().faults.failing_commits = n;
    }

    fn append(&self, record: OutboundRecord) -> BusResult<RecordMetadata> {
        let mut state = self.state()?;

        if state.faults.failing_sends > 0 {
            state.faults.failing_sends -= 1;
            return Err(BusError::PublishError(format!(
                "injected send failure on '{}'",
                record.topic
            )));
        }

        let now = Instant::now();
        let window = self.inner.duplicate_window;
        state
            .dedupe
            .retain(|_, remembered| now.saturating_duration_since(remembered.stored_at) < window);

        let dedupe_key = record
            .idempotence_key
            .as_ref()
            .map(|key| (record.topic.clone(), key.clone()));
        if let Some(existing) = dedupe_key.as_ref().and_then(|k| state.dedupe.get(k)) {
            return Ok(existing.metadata.clone());
        }

        let partition_count = state
            .topics
            .get(&record.topic)
            .map(|partitions| partitions.len() as u32)
            .ok_or_else(|| BusError::UnknownTopic(record.topic.clone()))?;
        let partition = self
            .inner
            .partitioner
            .partition(record.key.as_deref(), partition_count);

        let log = state
            .topics
            .get_mut(&record.topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .ok_or_else(|| BusError::InternalError("partition disappeared".to_string()))?;
        let offset = log.len() as u64;
        log.push(ConsumedRecord {
            topic: record.topic.clone(),
            partition,
            offset,
            key: record.key,
            payload: record.payload,
            headers: record.headers,
        });

        let metadata = RecordMetadata {
            topic: record.topic,
            partition,
            offset,
        };
        if let Some(key) = dedupe_key {
            state.dedupe.insert(
                key,
                Remembered {
                    metadata: metadata.clone(),
                    stored_at: now,
                },
            );
        }

        if state.faults.lost_acks > 0 {
            state.faults.lost_acks -= 1;
            drop(state);
            self.inner.appended.notify_waiters();
            return Err(BusError::Timeout(format!(
                "injected lost acknowledgment for {}:{}",
                metadata.partition, metadata.offset
            )));
        }

        drop(state);
        self.inner.appended.notify_waiters();
        Ok(metadata)
    }

    fn read_available(&self, request: &PollRequest) -> BusResult<Vec<ConsumedRecord>> {
        let mut state = self.state()?;

        let log_len = state
            .topics
            .get(&request.topic)
            .ok_or_else(|| BusError::UnknownTopic(request.topic.clone()))?
            .get(request.partition as usize)
            .map(|log| log.len() as u64)
            .ok_or_else(|| {
                BusError::PollError(format!(
                    "partition {} does not exist on '{}'",
                    request.partition, request.topic
                ))
            })?;

        let position_key = (
            request.group_id.clone(),
            request.topic.clone(),
            request.partition,
        );
        let position = *state
            .committed
            .entry(position_key)
            .or_insert(match request.offset_reset {
                OffsetReset::Earliest => 0,
                OffsetReset::Latest => log_len,
            });

        let records = state
            .topics
            .get(&request.topic)
            .and_then(|partitions| partitions.get(request.partition as usize))
            .map(|log| {
                log.iter()
                    .skip(position as usize)
                    .take(request.max_records.max(1))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(records)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn send(&self, record: OutboundRecord) -> BusResult<RecordMetadata> {
        self.append(record)
    }

    async fn describe_topic(&self, topic: &str) -> BusResult<Option<TopicDescription>> {
        let state = self.state()?;
        Ok(state.topics.get(topic).map(|partitions| TopicDescription {
            name: topic.to_string(),
            partitions: partitions.len() as u32,
        }))
    }

    async fn create_topic(&self, descriptor: &TopicDescriptor) -> BusResult<()> {
        let mut state = self.state()?;
        state.topic_creation_calls += 1;

        if state.faults.fail_topic_creation {
            return Err(BusError::AdminError(format!(
                "injected failure creating '{}'",
                descriptor.name
            )));
        }
        if descriptor.partitions == 0 {
            return Err(BusError::InvalidTopic(format!(
                "'{}' needs at least one partition",
                descriptor.name
            )));
        }
        if state.topics.contains_key(&descriptor.name) {
            return Err(BusError::AdminError(format!(
                "topic '{}' already exists",
                descriptor.name
            )));
        }

        state.topics.insert(
            descriptor.name.clone(),
            vec![Vec::new(); descriptor.partitions as usize],
        );
        Ok(())
    }

    async fn poll(&self, request: &PollRequest) -> BusResult<Vec<ConsumedRecord>> {
        let deadline = deadline_after(Instant::now(), request.max_wait);

        loop {
            // Registered before the read so an append in between still wakes us
            let appended = self.inner.appended.notified();

            let records = self.read_available(request)?;
            if !records.is_empty() {
                return Ok(records);
            }

            if timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self, group_id: &str, record: &ConsumedRecord) -> BusResult<()> {
        let mut state = self.state()?;

        if state.faults.failing_commits > 0 {
            state.faults.failing_commits -= 1;
            return Err(BusError::CommitError(format!(
                "injected commit failure at {}:{}:{}",
                record.topic, record.partition, record.offset
            )));
        }

        state.committed.insert(
            (group_id.to_string(), record.topic.clone(), record.partition),
            record.offset + 1,
        );
        Ok(())
    }

    async fn release(&self, _group_id: &str, _record: &ConsumedRecord) -> BusResult<()> {
        // Polls restart from the committed position, so nothing is held back
        self.state()?.release_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bus_with(topic: &str, partitions: u32) -> InMemoryBus {
        let bus = InMemoryBus::new();
        bus.create_topic(&TopicDescriptor::new(topic, partitions, Duration::from_secs(60)))
            .await
            .unwrap();
        bus
    }

    fn poll_request(topic: &str, partition: u32) -> PollRequest {
        PollRequest {
            group_id: "g".to_string(),
            topic: topic.to_string(),
            partition,
            max_records: 10,
            max_wait: Duration::from_millis(20),
            offset_reset: OffsetReset::Earliest,
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_offsets_are_contiguous_per_partition() {
        let bus = bus_with("t", 1).await;

        for i in 0..3u64 {
            let meta = bus
                .send(OutboundRecord::new("t", None, vec![i as u8]))
                .await
                .unwrap();
            assert_eq!(meta.offset, i);
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_topic_fails() {
        let bus = InMemoryBus::new();
        let err = bus
            .send(OutboundRecord::new("missing", None, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownTopic(_)));
    }

    #[tokio::test]
    async fn test_duplicate_idempotence_key_returns_first_position() {
        let bus = bus_with("t", 3).await;
        let record = OutboundRecord::new("t", Some("k".into()), b"v".to_vec())
            .with_idempotence_key(Some("evt-1".into()));

        let first = bus.send(record.clone()).await.unwrap();
        let second = bus.send(record).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(bus.records("t").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotence_keys_expire_after_window() {
        let bus = InMemoryBus::with_duplicate_window(Duration::from_secs(120));
        bus.create_topic(&TopicDescriptor::new("t", 1, Duration::from_secs(600)))
            .await
            .unwrap();
        let record = OutboundRecord::new("t", None, b"v".to_vec())
            .with_idempotence_key(Some("evt-1".into()));

        let first = bus.send(record.clone()).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bus.send(record.clone()).await.unwrap(), first);

        tokio::time::advance(Duration::from_secs(61)).await;
        let late = bus.send(record).await.unwrap();
        assert_eq!(late.offset, 1);
        assert_eq!(bus.dedupe_entries(), 1);

        for i in 0..5u8 {
            bus.send(
                OutboundRecord::new("t", None, vec![i])
                    .with_idempotence_key(Some(format!("evt-{}", i + 10))),
            )
            .await
            .unwrap();
        }
        tokio::time::advance(Duration::from_secs(121)).await;
        bus.send(OutboundRecord::new("t", None, vec![])).await.unwrap();
        assert_eq!(bus.dedupe_entries(), 0);
    }

    #[tokio::test]
    async fn test_injected_send_failures_are_transient() {
        let bus = bus_with("t", 1).await;
        bus.fail_next_sends(1);

        let err = bus.send(OutboundRecord::new("t", None, vec![])).await.unwrap_err();
        assert!(err.is_transient());
        assert!(bus.records("t").is_empty());

        assert!(bus.send(OutboundRecord::new("t", None, vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn test_poll_resumes_after_commit() {
        let bus = bus_with("t", 1).await;
        for i in 0..3u8 {
            bus.send(OutboundRecord::new("t", None, vec![i])).await.unwrap();
        }

        let request = poll_request("t", 0);
        let first = bus.poll(&request).await.unwrap();
        assert_eq!(first.len(), 3);

        // Uncommitted records are delivered again
        assert_eq!(bus.poll(&request).await.unwrap().len(), 3);

        bus.commit("g", &first[1]).await.unwrap();
        let rest = bus.poll(&request).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].offset, 2);
        assert_eq!(bus.committed_offset("g", "t", 0), Some(2));
    }

    #[tokio::test]
    async fn test_latest_reset_skips_existing_records() {
        let bus = bus_with("t", 1).await;
        bus.send(OutboundRecord::new("t", None, vec![0])).await.unwrap();

        let request = PollRequest {
            offset_reset: OffsetReset::Latest,
            ..poll_request("t", 0)
        };
        assert!(bus.poll(&request).await.unwrap().is_empty());

        bus.send(OutboundRecord::new("t", None, vec![1])).await.unwrap();
        let records = bus.poll(&request).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, vec![1]);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let bus = bus_with("t", 1).await;
        let request = PollRequest {
            max_wait: Duration::from_secs(5),
            ..poll_request("t", 0)
        };

        let poller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.poll(&request).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.send(OutboundRecord::new("t", None, b"late".to_vec()))
            .await
            .unwrap();

        let records = poller.await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_topic_creation_is_counted() {
        let bus = InMemoryBus::new();
        let descriptor = TopicDescriptor::new("t", 2, Duration::from_secs(60));

        bus.create_topic(&descriptor).await.unwrap();
        assert!(bus.create_topic(&descriptor).await.is_err());
        assert_eq!(bus.topic_creation_calls(), 2);
        assert_eq!(
            bus.describe_topic("t").await.unwrap(),
            Some(TopicDescription {
                name: "t".to_string(),
                partitions: 2
            })
        );
        assert_eq!(bus.describe_topic("other").await.unwrap(), None);
    }
}
