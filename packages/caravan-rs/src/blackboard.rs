//! Namespaced key/value blackboard: the canonical working memory for
//! all sagas.
//!
//! # Guarantees
//!
//! - Writes install the new entry atomically; readers see the pre-write
//!   or post-write state, never a torn value.
//! - An entry past `expires_at` is never observable: reads and queries
//!   check defensively, a per-write deferred timer deletes it at its
//!   deadline, and a periodic sweeper catches anything the timer missed.
//!   Whichever path removes the entry emits the single
//!   `state-changed {operation: delete}` event (removal is one atomic
//!   compare-and-remove).
//! - Strong namespaces (`selections`, `itinerary`) publish a
//!   `state-strong-write` notification synchronously before `write`
//!   returns; eventual namespaces notify asynchronously.
//!
//! There is no transactional API: `read -> write` cycles use
//! write-wins semantics or caller-supplied version numbers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::config::BlackboardConfig;
use crate::envelope::{CorrelationId, Envelope};
use crate::events::{topics, StateChanged, StateInvalidate, StateOperation, StrongWrite};
use crate::namespace::{Consistency, Namespace};
use crate::pattern::wildcard_match;

/// Length of the hex-truncated ETag fingerprint.
const ETAG_LEN: usize = 16;

/// Deterministic fingerprint of a payload: SHA-256 over the serialized
/// JSON, truncated. Callers only need equality comparison.
pub fn etag_of(data: &Value) -> String {
    let encoded = serde_json::to_vec(data).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut out = format!("{digest:x}");
    out.truncate(ETAG_LEN);
    out
}

#[derive(Debug, Clone)]
struct Entry {
    data: Value,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    version: u64,
    etag: String,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Read-only view of an entry with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryView {
    pub namespace: Namespace,
    pub key: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub etag: String,
    pub consistency: Consistency,
}

/// Options for a write: explicit TTL beats the configured rule; a
/// caller-supplied version overrides the automatic increment.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub ttl: Option<Duration>,
    pub version: Option<u64>,
}

impl WriteOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            version: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

/// Filter for [`Blackboard::query`]. All present filters must match
/// (AND semantics).
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub key_pattern: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl QueryFilter {
    pub fn key_pattern(pattern: impl Into<String>) -> Self {
        Self {
            key_pattern: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn with_created_after(mut self, t: DateTime<Utc>) -> Self {
        self.created_after = Some(t);
        self
    }

    pub fn with_created_before(mut self, t: DateTime<Utc>) -> Self {
        self.created_before = Some(t);
        self
    }

    fn matches(&self, key: &str, entry: &Entry) -> bool {
        if let Some(pattern) = &self.key_pattern {
            if !wildcard_match(pattern, key) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if entry.created_at <= after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if entry.created_at >= before {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    deletes: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

/// Snapshot of blackboard access metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlackboardMetrics {
    pub reads: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub deletes: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

struct TimerSlot {
    version: u64,
    handle: AbortHandle,
}

struct BlackboardInner {
    /// One shelf per declared namespace; built once, never resized.
    shelves: HashMap<Namespace, DashMap<String, Entry>>,
    config: BlackboardConfig,
    bus: EventBus,
    timers: DashMap<(Namespace, String), TimerSlot>,
    counters: Counters,
}

/// The blackboard store. Clones share the same underlying state.
#[derive(Clone)]
pub struct Blackboard {
    inner: Arc<BlackboardInner>,
}

impl Blackboard {
    pub fn new(bus: EventBus, config: BlackboardConfig) -> Self {
        let shelves = Namespace::ALL
            .into_iter()
            .map(|ns| (ns, DashMap::new()))
            .collect();
        Self {
            inner: Arc::new(BlackboardInner {
                shelves,
                config,
                bus,
                timers: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Read a payload. Returns `None` when the key is absent or its
    /// entry has expired (the expired entry is removed and reported as
    /// deleted). Updates `last_accessed`.
    pub fn read(&self, namespace: Namespace, key: &str) -> Option<Value> {
        self.inner.counters.reads.fetch_add(1, Ordering::Relaxed);
        let shelf = self.inner.shelf(namespace);
        let now = Utc::now();

        let expired_version = match shelf.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(now) {
                    Some(entry.version)
                } else {
                    entry.last_accessed = now;
                    let data = entry.data.clone();
                    drop(entry);
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(data);
                }
            }
            None => None,
        };

        if let Some(version) = expired_version {
            self.inner.expire_if(namespace, key, version);
        }
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Metadata view of an entry, expiry-checked, without touching
    /// `last_accessed`.
    pub fn entry(&self, namespace: Namespace, key: &str) -> Option<EntryView> {
        let shelf = self.inner.shelf(namespace);
        let now = Utc::now();
        let entry = shelf.get(key)?;
        if entry.is_expired(now) {
            let version = entry.version;
            drop(entry);
            self.inner.expire_if(namespace, key, version);
            return None;
        }
        Some(view(namespace, key, &entry))
    }

    /// Write a payload, returning its ETag.
    ///
    /// Effective TTL: explicit option, else the configured
    /// namespace/key-pattern rule, else no expiry. Strong namespaces
    /// emit their consistency notification synchronously before this
    /// returns.
    pub async fn write(
        &self,
        namespace: Namespace,
        key: impl Into<String>,
        data: Value,
        options: WriteOptions,
    ) -> String {
        let key = key.into();
        let now = Utc::now();
        let ttl = options
            .ttl
            .or_else(|| self.inner.config.default_ttl(namespace, &key));
        let expires_at = ttl.and_then(|d| {
            chrono::Duration::from_std(d)
                .ok()
                .map(|delta| now + delta)
        });
        let etag = etag_of(&data);

        let shelf = self.inner.shelf(namespace);
        let version = match shelf.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let version = options.version.unwrap_or(entry.version + 1);
                if entry.is_expired(now) {
                    // A write over an expired corpse is a fresh entry.
                    entry.created_at = now;
                }
                entry.data = data;
                entry.last_modified = now;
                entry.last_accessed = now;
                entry.expires_at = expires_at;
                entry.version = version;
                entry.etag = etag.clone();
                version
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let version = options.version.unwrap_or(1);
                vacant.insert(Entry {
                    data,
                    created_at: now,
                    last_modified: now,
                    last_accessed: now,
                    expires_at,
                    version,
                    etag: etag.clone(),
                });
                version
            }
        };

        self.inner.arm_timer(namespace, key.clone(), expires_at, version);
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);

        if namespace.consistency() == Consistency::Strong {
            let payload = Envelope::payload_of(&StrongWrite {
                namespace,
                key: key.clone(),
                etag: etag.clone(),
            })
            .unwrap_or(Value::Null);
            self.inner
                .bus
                .publish_sync(topics::STATE_STRONG_WRITE, namespace.as_str(), payload, CorrelationId::NONE)
                .await;
        }

        self.inner
            .publish_state_changed(namespace, &key, StateOperation::Write, Some(etag.clone()));
        etag
    }

    /// Delete an entry. Cancels any pending TTL timer. Returns whether
    /// an entry was removed.
    pub fn delete(&self, namespace: Namespace, key: &str) -> bool {
        let removed = self.inner.shelf(namespace).remove(key).is_some();
        self.inner.disarm_timer(namespace, key);
        if removed {
            self.inner.counters.deletes.fetch_add(1, Ordering::Relaxed);
            self.inner
                .publish_state_changed(namespace, key, StateOperation::Delete, None);
        }
        removed
    }

    /// Delete every key matching a `*`-wildcard pattern. Returns the
    /// number of entries removed.
    pub fn invalidate(&self, namespace: Namespace, pattern: &str) -> usize {
        let shelf = self.inner.shelf(namespace);
        let matching: Vec<String> = shelf
            .iter()
            .filter(|entry| wildcard_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in matching {
            if self.delete(namespace, &key) {
                removed += 1;
            }
        }
        if removed > 0 {
            self.inner
                .counters
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(namespace = %namespace, pattern, removed, "invalidated entries");
        }
        removed
    }

    /// List entries with metadata. All present filters must match;
    /// expired entries are excluded and removed in-line.
    pub fn query(&self, namespace: Namespace, filter: QueryFilter) -> Vec<EntryView> {
        let shelf = self.inner.shelf(namespace);
        let now = Utc::now();

        let mut hits = Vec::new();
        let mut expired = Vec::new();
        for entry in shelf.iter() {
            if entry.is_expired(now) {
                expired.push((entry.key().clone(), entry.version));
            } else if filter.matches(entry.key(), &entry) {
                hits.push(view(namespace, entry.key(), &entry));
            }
        }
        for (key, version) in expired {
            self.inner.expire_if(namespace, &key, version);
        }

        hits.sort_by(|a, b| a.key.cmp(&b.key));
        hits
    }

    /// Number of live entries in a namespace (expiry-unchecked).
    pub fn len(&self, namespace: Namespace) -> usize {
        self.inner.shelf(namespace).len()
    }

    pub fn is_empty(&self, namespace: Namespace) -> bool {
        self.len(namespace) == 0
    }

    /// Snapshot of access metrics.
    pub fn metrics(&self) -> BlackboardMetrics {
        let c = &self.inner.counters;
        BlackboardMetrics {
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Subscribe the store to `state-invalidate` events on its bus.
    ///
    /// Each event's reason is matched against the configured rules;
    /// matching rules delete their targets, unmatched reasons are no-ops.
    pub fn wire_invalidations(&self) {
        let store = self.clone();
        self.inner
            .bus
            .subscribe_fn(topics::STATE_INVALIDATE, move |envelope| {
                let store = store.clone();
                async move {
                    let event: StateInvalidate = envelope.read()?;
                    let rules: Vec<_> = store
                        .inner
                        .config
                        .invalidation_rules
                        .iter()
                        .filter(|rule| rule.matches_reason(&event.reason))
                        .cloned()
                        .collect();
                    if rules.is_empty() {
                        debug!(reason = %event.reason, "invalidation reason matched no rules");
                        return Ok(());
                    }
                    for rule in rules {
                        let removed = store.invalidate(rule.namespace, &rule.key_pattern);
                        info!(
                            reason = %event.reason,
                            namespace = %rule.namespace,
                            pattern = %rule.key_pattern,
                            removed,
                            "invalidation rule applied"
                        );
                    }
                    Ok(())
                }
            });
    }

    /// Spawn the periodic expiry sweeper. It backs up the per-write
    /// timers; reads stay defensive regardless.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let interval = inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = inner.sweep();
                        if swept > 0 {
                            debug!(swept, "expiry sweep removed entries");
                        }
                    }
                }
            }
            debug!("blackboard sweeper stopped");
        })
    }
}

impl std::fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total: usize = self.inner.shelves.values().map(|s| s.len()).sum();
        f.debug_struct("Blackboard").field("entries", &total).finish()
    }
}

impl BlackboardInner {
    fn shelf(&self, namespace: Namespace) -> &DashMap<String, Entry> {
        // Shelves are built for every declared namespace at
        // construction; the enum makes other values unrepresentable.
        self.shelves
            .get(&namespace)
            .unwrap_or_else(|| unreachable!("shelf missing for {namespace}"))
    }

    /// Remove an entry iff it is still the expected version and its
    /// deadline has passed. The single removal point for expiry, so the
    /// delete event fires exactly once per expired entry.
    fn expire_if(self: &Arc<Self>, namespace: Namespace, key: &str, version: u64) -> bool {
        let now = Utc::now();
        let removed = self
            .shelf(namespace)
            .remove_if(key, |_, entry| entry.version == version && entry.is_expired(now))
            .is_some();
        if removed {
            self.disarm_timer(namespace, key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.publish_state_changed(namespace, key, StateOperation::Delete, None);
            debug!(namespace = %namespace, key, "entry expired");
        }
        removed
    }

    fn sweep(self: &Arc<Self>) -> usize {
        let now = Utc::now();
        let mut swept = 0;
        for (&namespace, shelf) in &self.shelves {
            let expired: Vec<(String, u64)> = shelf
                .iter()
                .filter(|entry| entry.is_expired(now))
                .map(|entry| (entry.key().clone(), entry.version))
                .collect();
            for (key, version) in expired {
                if self.expire_if(namespace, &key, version) {
                    swept += 1;
                }
            }
        }
        swept
    }

    /// Install (or clear) the deferred deletion timer for a key. The
    /// timer holds only a weak reference so pending timers never keep a
    /// dropped blackboard alive.
    fn arm_timer(
        self: &Arc<Self>,
        namespace: Namespace,
        key: String,
        expires_at: Option<DateTime<Utc>>,
        version: u64,
    ) {
        self.disarm_timer(namespace, &key);
        let Some(deadline) = expires_at else {
            return;
        };

        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let weak = Arc::downgrade(self);
        let timer_key = (namespace, key.clone());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_if(namespace, &key, version);
            }
        })
        .abort_handle();
        self.timers.insert(timer_key, TimerSlot { version, handle });
    }

    fn disarm_timer(&self, namespace: Namespace, key: &str) {
        if let Some((_, slot)) = self.timers.remove(&(namespace, key.to_string())) {
            slot.handle.abort();
        }
    }

    fn publish_state_changed(
        &self,
        namespace: Namespace,
        key: &str,
        operation: StateOperation,
        etag: Option<String>,
    ) {
        let payload = Envelope::payload_of(&StateChanged {
            namespace,
            key: key.to_string(),
            operation,
            etag,
        })
        .unwrap_or(Value::Null);
        self.bus
            .publish(topics::STATE_CHANGED, namespace.as_str(), payload, CorrelationId::NONE);
    }
}

impl Drop for BlackboardInner {
    fn drop(&mut self) {
        for slot in self.timers.iter() {
            slot.handle.abort();
        }
    }
}

fn view(namespace: Namespace, key: &str, entry: &Entry) -> EntryView {
    EntryView {
        namespace,
        key: key.to_string(),
        data: entry.data.clone(),
        created_at: entry.created_at,
        last_modified: entry.last_modified,
        last_accessed: entry.last_accessed,
        expires_at: entry.expires_at,
        version: entry.version,
        etag: entry.etag.clone(),
        consistency: namespace.consistency(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InvalidationRule;
    use serde_json::json;
    use std::sync::Mutex;

    fn board() -> Blackboard {
        Blackboard::new(EventBus::new(), BlackboardConfig::bare())
    }

    fn recorder(bus: &EventBus, topic: &str) -> Arc<Mutex<Vec<Envelope>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_fn(topic, move |env| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(env);
                Ok(())
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let board = board();
        let etag = board
            .write(Namespace::Prefs, "style", json!({"pace": "slow"}), WriteOptions::default())
            .await;
        assert_eq!(etag.len(), ETAG_LEN);
        assert_eq!(
            board.read(Namespace::Prefs, "style"),
            Some(json!({"pace": "slow"}))
        );
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let board = board();
        assert_eq!(board.read(Namespace::Cache, "nope"), None);
        let metrics = board.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 0);
    }

    #[tokio::test]
    async fn test_etag_changes_iff_data_changes() {
        let board = board();
        let a = board
            .write(Namespace::Cache, "k", json!([1, 2]), WriteOptions::default())
            .await;
        let b = board
            .write(Namespace::Cache, "k", json!([1, 2]), WriteOptions::default())
            .await;
        let c = board
            .write(Namespace::Cache, "k", json!([1, 2, 3]), WriteOptions::default())
            .await;
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_version_increments_and_caller_override() {
        let board = board();
        board
            .write(Namespace::Cache, "k", json!(1), WriteOptions::default())
            .await;
        board
            .write(Namespace::Cache, "k", json!(2), WriteOptions::default())
            .await;
        assert_eq!(board.entry(Namespace::Cache, "k").unwrap().version, 2);

        board
            .write(Namespace::Cache, "k", json!(3), WriteOptions::default().with_version(42))
            .await;
        assert_eq!(board.entry(Namespace::Cache, "k").unwrap().version, 42);
    }

    #[tokio::test]
    async fn test_ttl_timer_expires_entry() {
        let board = board();
        board
            .write(
                Namespace::Candidates,
                "hotels:nyc",
                json!(["a"]),
                WriteOptions::ttl(Duration::from_millis(50)),
            )
            .await;
        assert!(board.read(Namespace::Candidates, "hotels:nyc").is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(board.read(Namespace::Candidates, "hotels:nyc"), None);
        assert_eq!(board.metrics().expirations, 1);
    }

    #[tokio::test]
    async fn test_read_is_defensive_without_timer() {
        // Even if the timer has not fired yet, a read past the deadline
        // reports not-found and removes the entry.
        let board = board();
        board
            .write(
                Namespace::Cache,
                "k",
                json!(1),
                WriteOptions::ttl(Duration::from_millis(10)),
            )
            .await;
        // Don't yield long enough for the timer; busy-wait the clock.
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert_eq!(board.read(Namespace::Cache, "k"), None);
        assert!(board.entry(Namespace::Cache, "k").is_none());
    }

    #[tokio::test]
    async fn test_expiry_emits_delete_exactly_once() {
        let bus = EventBus::new();
        let seen = recorder(&bus, topics::STATE_CHANGED);
        let board = Blackboard::new(
            bus.clone(),
            BlackboardConfig::bare().with_sweep_interval(Duration::from_millis(30)),
        );
        let shutdown = CancellationToken::new();
        let sweeper = board.spawn_sweeper(shutdown.clone());

        board
            .write(
                Namespace::Candidates,
                "flights:x",
                json!(1),
                WriteOptions::ttl(Duration::from_millis(40)),
            )
            .await;

        // Let timer, sweeper, and a defensive read all race.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(board.read(Namespace::Candidates, "flights:x"), None);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let deletes = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|env| {
                let event: StateChanged = env.read().unwrap();
                event.operation == StateOperation::Delete && event.key == "flights:x"
            })
            .count();
        assert_eq!(deletes, 1);

        shutdown.cancel();
        let _ = sweeper.await;
    }

    #[tokio::test]
    async fn test_overwrite_cancels_stale_timer() {
        let board = board();
        board
            .write(
                Namespace::Cache,
                "k",
                json!("short"),
                WriteOptions::ttl(Duration::from_millis(40)),
            )
            .await;
        // Overwrite with a long TTL before the first timer fires.
        board
            .write(
                Namespace::Cache,
                "k",
                json!("long"),
                WriteOptions::ttl(Duration::from_secs(60)),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(board.read(Namespace::Cache, "k"), Some(json!("long")));
        assert_eq!(board.metrics().expirations, 0);
    }

    #[tokio::test]
    async fn test_strong_write_notifies_before_returning() {
        let bus = EventBus::new();
        let seen = recorder(&bus, topics::STATE_STRONG_WRITE);
        let board = Blackboard::new(bus, BlackboardConfig::bare());

        let etag = board
            .write(Namespace::Selections, "final", json!({"hotel": "h1"}), WriteOptions::default())
            .await;

        // No settling sleep: the notification must already be there.
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let event: StrongWrite = seen[0].read().unwrap();
        assert_eq!(event.etag, etag);
        assert_eq!(event.namespace, Namespace::Selections);
    }

    #[tokio::test]
    async fn test_eventual_write_does_not_strong_notify() {
        let bus = EventBus::new();
        let seen = recorder(&bus, topics::STATE_STRONG_WRITE);
        let board = Blackboard::new(bus, BlackboardConfig::bare());

        board
            .write(Namespace::Media, "img", json!("url"), WriteOptions::default())
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_returns_whether_removed() {
        let board = board();
        board
            .write(Namespace::Cache, "k", json!(1), WriteOptions::default())
            .await;
        assert!(board.delete(Namespace::Cache, "k"));
        assert!(!board.delete(Namespace::Cache, "k"));
    }

    #[tokio::test]
    async fn test_invalidate_wildcard_counts() {
        let board = board();
        for key in ["hotels:nyc", "hotels:sfo", "flights:jfk"] {
            board
                .write(Namespace::Candidates, key, json!(1), WriteOptions::default())
                .await;
        }
        assert_eq!(board.invalidate(Namespace::Candidates, "hotels*"), 2);
        assert_eq!(board.len(Namespace::Candidates), 1);

        // invalidate("*") empties the namespace.
        assert_eq!(board.invalidate(Namespace::Candidates, "*"), 1);
        assert!(board.query(Namespace::Candidates, QueryFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_query_filters_are_anded() {
        let board = board();
        board
            .write(Namespace::Evals, "scores:a", json!(1), WriteOptions::default())
            .await;
        let midpoint = Utc::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        board
            .write(Namespace::Evals, "scores:b", json!(2), WriteOptions::default())
            .await;
        board
            .write(Namespace::Evals, "other", json!(3), WriteOptions::default())
            .await;

        let hits = board.query(
            Namespace::Evals,
            QueryFilter::key_pattern("scores*").with_created_after(midpoint),
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "scores:b");
    }

    #[tokio::test]
    async fn test_query_excludes_expired() {
        let board = board();
        board
            .write(
                Namespace::Evals,
                "gone",
                json!(1),
                WriteOptions::ttl(Duration::from_millis(5)),
            )
            .await;
        board
            .write(Namespace::Evals, "kept", json!(2), WriteOptions::default())
            .await;
        std::thread::sleep(std::time::Duration::from_millis(10));

        let hits = board.query(Namespace::Evals, QueryFilter::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "kept");
    }

    #[tokio::test]
    async fn test_config_rule_supplies_default_ttl() {
        let board = Blackboard::new(EventBus::new(), BlackboardConfig::default());
        board
            .write(Namespace::Candidates, "flights:lhr", json!(1), WriteOptions::default())
            .await;
        let entry = board.entry(Namespace::Candidates, "flights:lhr").unwrap();
        assert!(entry.expires_at.is_some());

        board
            .write(Namespace::Audit, "log", json!(1), WriteOptions::default())
            .await;
        let entry = board.entry(Namespace::Audit, "log").unwrap();
        assert!(entry.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_invalidation_rules_match_reason() {
        let bus = EventBus::new();
        let config = BlackboardConfig::bare()
            .with_invalidation_rule(InvalidationRule::new(
                "price drift*",
                Namespace::Candidates,
                "hotels*",
            ));
        let board = Blackboard::new(bus.clone(), config);
        board.wire_invalidations();

        board
            .write(Namespace::Candidates, "hotels:nyc", json!(1), WriteOptions::default())
            .await;
        board
            .write(Namespace::Candidates, "flights:jfk", json!(2), WriteOptions::default())
            .await;

        // Unmatched reason: no-op.
        bus.publish(
            topics::STATE_INVALIDATE,
            "-",
            Envelope::payload_of(&StateInvalidate { reason: "reverify>10m".into() }).unwrap(),
            CorrelationId::NONE,
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(board.len(Namespace::Candidates), 2);

        // Matched reason deletes only the rule's targets.
        bus.publish(
            topics::STATE_INVALIDATE,
            "-",
            Envelope::payload_of(&StateInvalidate { reason: "price drift>12%".into() }).unwrap(),
            CorrelationId::NONE,
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(board.len(Namespace::Candidates), 1);
        assert!(board.read(Namespace::Candidates, "flights:jfk").is_some());
    }

    #[test]
    fn test_etag_is_deterministic() {
        assert_eq!(etag_of(&json!({"a": 1})), etag_of(&json!({"a": 1})));
        assert_ne!(etag_of(&json!({"a": 1})), etag_of(&json!({"a": 2})));
        assert_eq!(etag_of(&json!(null)).len(), ETAG_LEN);
    }
}
