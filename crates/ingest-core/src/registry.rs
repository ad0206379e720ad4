//! Process-lifetime in-memory registry state.
//!
//! These types are owned by the engine binary and handed out to pipelines as
//! shared, lock-protected handles — never rebuilt per-batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::{EngineConfig, TopicSpec};

/// Read-only lookup from logical topic name (and from source Kafka topic
/// name) to its `TopicSpec`, built once at startup.
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    by_logical_name: HashMap<String, TopicSpec>,
    by_source_topic: HashMap<String, String>,
}

impl TopicRegistry {
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut by_source_topic = HashMap::new();
        for (logical_name, spec) in &config.topics {
            by_source_topic.insert(spec.source_topic.clone(), logical_name.clone());
        }
        TopicRegistry { by_logical_name: config.topics.clone(), by_source_topic }
    }

    pub fn get(&self, logical_name: &str) -> Option<&TopicSpec> {
        self.by_logical_name.get(logical_name)
    }

    pub fn get_by_source_topic(&self, source_topic: &str) -> Option<(&str, &TopicSpec)> {
        let logical_name = self.by_source_topic.get(source_topic)?;
        self.by_logical_name
            .get(logical_name.as_str())
            .map(|spec| (logical_name.as_str(), spec))
    }

    pub fn logical_names(&self) -> impl Iterator<Item = &str> {
        self.by_logical_name.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TopicSpec)> {
        self.by_logical_name.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Bounded cache of recently-committed batch fingerprints per topic, used by
/// the writer to short-circuit replays without reopening the commit log for
/// every flush (idempotence contract). This is an
/// optimization, not the source of truth: the commit log itself is always
/// consulted on a cache miss.
#[derive(Debug, Default)]
pub struct CommitCache {
    inner: RwLock<HashMap<String, lru_set::LruSet>>,
}

impl CommitCache {
    pub fn new() -> Self {
        CommitCache { inner: RwLock::new(HashMap::new()) }
    }

    pub async fn contains(&self, topic: &str, fingerprint: &str) -> bool {
        let guard = self.inner.read().await;
        guard.get(topic).map(|set| set.contains(fingerprint)).unwrap_or(false)
    }

    pub async fn insert(&self, topic: &str, fingerprint: String) {
        let mut guard = self.inner.write().await;
        guard.entry(topic.to_string()).or_insert_with(|| lru_set::LruSet::new(4096)).insert(fingerprint);
    }
}

mod lru_set {
    use std::collections::{HashSet, VecDeque};

    /// Insertion-ordered bounded set. Not a general LRU (no access-order
    /// promotion) — the commit cache only ever inserts, so FIFO eviction of
    /// the oldest fingerprint is exactly what "recently committed" needs.
    #[derive(Debug)]
    pub struct LruSet {
        capacity: usize,
        order: VecDeque<String>,
        set: HashSet<String>,
    }

    impl LruSet {
        pub fn new(capacity: usize) -> Self {
            LruSet { capacity, order: VecDeque::new(), set: HashSet::new() }
        }

        pub fn contains(&self, value: &str) -> bool {
            self.set.contains(value)
        }

        pub fn insert(&mut self, value: String) {
            if self.set.contains(&value) {
                return;
            }
            if self.order.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.set.remove(&oldest);
                }
            }
            self.order.push_back(value.clone());
            self.set.insert(value);
        }
    }
}

/// Circuit breaker state: CLOSED → OPEN → HALF_OPEN → CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-topic circuit breaker. One instance is constructed per configured
/// topic and guards every stage of that topic's pipeline, so a run of
/// systemic failures on one topic routes its records to the DLR without
/// affecting other topics' pipelines.
pub struct CircuitStatus {
    state: RwLock<CircuitInner>,
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl CircuitStatus {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_timeout: Duration) -> Arc<Self> {
        Arc::new(CircuitStatus {
            state: RwLock::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
            failure_threshold,
            success_threshold,
            open_timeout,
        })
    }

    /// Whether a call should be allowed through right now. `OPEN` calls are
    /// rejected until the open timeout elapses, at which point exactly the
    /// state transitions to `HALF_OPEN` and the call is allowed as a probe.
    pub async fn allow_call(&self) -> bool {
        let mut guard = self.state.write().await;
        match guard.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = guard.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.open_timeout {
                    guard.state = CircuitState::HalfOpen;
                    guard.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut guard = self.state.write().await;
        guard.consecutive_failures = 0;
        match guard.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                guard.consecutive_successes += 1;
                if guard.consecutive_successes >= self.success_threshold {
                    guard.state = CircuitState::Closed;
                    guard.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut guard = self.state.write().await;
        match guard.state {
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
                guard.consecutive_failures = 0;
            }
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }
}

/// Process-wide accounting of how many bytes each topic's accumulator is
/// currently holding open, used to enforce `global.memoryBudgetBytes`: once
/// the total batched bytes across every topic reaches the budget, the
/// oldest-first batches are flushed until the total is back under it. Each
/// `TopicPipeline` reports its own accumulator's size and oldest-open-arrival
/// after every loop turn; when the sum crosses the budget, exactly the topic currently
/// holding the globally-oldest batch is told to shed, one batch at a time,
/// until the total is back under budget. This keeps the "single-threaded
/// scheduler per topic" discipline intact — no topic ever reaches into
/// another topic's `BatchAccumulator` directly.
#[derive(Debug, Default)]
pub struct GlobalMemoryTracker {
    usage: RwLock<HashMap<String, TopicUsage>>,
}

#[derive(Debug, Clone, Copy)]
struct TopicUsage {
    bytes: usize,
    oldest_arrival: Option<Instant>,
}

impl GlobalMemoryTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(GlobalMemoryTracker { usage: RwLock::new(HashMap::new()) })
    }

    /// Called once per scheduler turn by each topic's pipeline to publish its
    /// current accumulator size and the arrival instant of its oldest open
    /// batch (`None` if the accumulator holds nothing).
    pub async fn report(&self, topic: &str, bytes: usize, oldest_arrival: Option<Instant>) {
        let mut guard = self.usage.write().await;
        if bytes == 0 {
            guard.remove(topic);
        } else {
            guard.insert(topic.to_string(), TopicUsage { bytes, oldest_arrival });
        }
    }

    async fn total_bytes(&self) -> usize {
        self.usage.read().await.values().map(|u| u.bytes).sum()
    }

    /// Topic holding the oldest open batch among every topic currently
    /// reporting non-zero usage, used to pick who sheds next under an
    /// oldest-first shedding policy.
    async fn oldest_topic(&self) -> Option<String> {
        self.usage
            .read()
            .await
            .iter()
            .filter_map(|(topic, usage)| usage.oldest_arrival.map(|a| (topic.clone(), a)))
            .min_by_key(|(_, a)| *a)
            .map(|(topic, _)| topic)
    }

    /// Whether `topic` should flush its oldest open batch right now: the
    /// process-wide total is over `budget_bytes` and `topic` is the one
    /// holding the globally-oldest batch. Returns `false` once the budget is
    /// no longer exceeded, so a caller can loop "shed, re-check, shed again"
    /// without any cross-topic coordination beyond this tracker.
    pub async fn should_shed(&self, topic: &str, budget_bytes: usize) -> bool {
        if self.total_bytes().await < budget_bytes {
            return false;
        }
        self.oldest_topic().await.as_deref() == Some(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn global_memory_tracker_picks_oldest_topic_to_shed() {
        let tracker = GlobalMemoryTracker::new();
        let older = Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = Instant::now();
        tracker.report("a", 100, Some(newer)).await;
        tracker.report("b", 100, Some(older)).await;
        assert!(tracker.should_shed("b", 150).await);
        assert!(!tracker.should_shed("a", 150).await);
    }

    #[tokio::test]
    async fn global_memory_tracker_under_budget_never_sheds() {
        let tracker = GlobalMemoryTracker::new();
        tracker.report("a", 10, Some(Instant::now())).await;
        assert!(!tracker.should_shed("a", 1_000).await);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let circuit = CircuitStatus::new(3, 2, Duration::from_millis(50));
        for _ in 0..3 {
            circuit.record_failure().await;
        }
        assert_eq!(circuit.state().await, CircuitState::Open);
        assert!(!circuit.allow_call().await);
    }

    #[tokio::test]
    async fn circuit_half_opens_after_timeout_then_closes() {
        let circuit = CircuitStatus::new(1, 1, Duration::from_millis(10));
        circuit.record_failure().await;
        assert_eq!(circuit.state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(circuit.allow_call().await);
        assert_eq!(circuit.state().await, CircuitState::HalfOpen);
        circuit.record_success().await;
        assert_eq!(circuit.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let circuit = CircuitStatus::new(1, 1, Duration::from_millis(10));
        circuit.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(circuit.allow_call().await);
        circuit.record_failure().await;
        assert_eq!(circuit.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn commit_cache_evicts_oldest_beyond_capacity() {
        let cache = CommitCache::new();
        for i in 0..4096 {
            cache.insert("t", format!("fp-{i}")).await;
        }
        assert!(cache.contains("t", "fp-0").await, "capacity not yet exceeded");
        cache.insert("t", "fp-4096".into()).await;
        assert!(!cache.contains("t", "fp-0").await, "oldest fingerprint should have been evicted");
        assert!(cache.contains("t", "fp-4096").await);
    }
}
