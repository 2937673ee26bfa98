//! Response cache keyed by aggregation key.
//!
//! The cache holds one entry per [`AggregationKey`]: the last response seen
//! from the origin, the watches registered on it, and whether an upstream
//! subscription is open. Every operation only touches memory; entry access goes
//! through `DashMap` shard locks which are never held across an await point.
//!
//! An entry whose last watch goes away is evicted after a grace period. A
//! watch arriving during the grace period cancels the eviction and reuses the
//! entry, its cached response and its upstream subscription.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::mapper::AggregationKey;
use crate::stats::CacheStats;
use crate::upstream::SubscriptionId;
use crate::versioned::{VersionedRequest, VersionedResponse};
use crate::watch::{Delivery, Watch, WatchId, WatchSlot};

/// Default grace period before an entry without watches is evicted.
const DEFAULT_EVICTION_GRACE: Duration = Duration::from_secs(30);

/// Configuration for the cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an entry without watches survives. Zero evicts immediately.
    pub eviction_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            eviction_grace: DEFAULT_EVICTION_GRACE,
        }
    }
}

/// Called when an entry that owned an upstream subscription is evicted.
pub type EvictionListener = Arc<dyn Fn(&AggregationKey, SubscriptionId) + Send + Sync>;

/// Outcome of [`Cache::get_or_create_watch`].
#[derive(Debug)]
pub struct WatchRegistration {
    /// The registered watch.
    pub watch: Watch,
    /// Set when the caller became responsible for opening the upstream
    /// subscription of this key.
    pub upstream_claim: Option<SubscriptionId>,
}

/// Read-only view of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// The entry key.
    pub key: AggregationKey,
    /// Version of the cached response.
    pub version: Option<String>,
    /// Number of registered watches.
    pub watchers: usize,
    /// Whether an upstream subscription is open.
    pub upstream_open: bool,
    /// How long the entry has been without watches.
    pub idle_for: Option<Duration>,
}

#[derive(Debug)]
struct CacheEntry {
    last_response: Option<VersionedResponse>,
    watchers: HashMap<WatchId, WatchSlot>,
    upstream: Option<SubscriptionId>,
    /// Bumped whenever the idle state changes; a timer only evicts the epoch it was armed for.
    idle_epoch: u64,
    idle_since: Option<Instant>,
    eviction_timer: Option<AbortHandle>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            last_response: None,
            watchers: HashMap::new(),
            upstream: None,
            idle_epoch: 0,
            idle_since: None,
            eviction_timer: None,
        }
    }

    fn mark_busy(&mut self) {
        if let Some(timer) = self.eviction_timer.take() {
            timer.abort();
        }
        if self.idle_since.take().is_some() {
            self.idle_epoch += 1;
        }
    }

    fn mark_idle(&mut self) -> u64 {
        self.idle_epoch += 1;
        self.idle_since = Some(Instant::now());
        self.idle_epoch
    }

    fn is_evictable(&self, epoch: u64) -> bool {
        self.watchers.is_empty() && self.idle_since.is_some() && self.idle_epoch == epoch
    }
}

/// The response cache.
///
/// Cloning this handle creates a new reference to the same cache.
#[derive(Clone, Debug)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

pub(crate) struct CacheInner {
    entries: DashMap<AggregationKey, CacheEntry>,
    config: CacheConfig,
    on_evict: Option<EvictionListener>,
    stats: CacheStats,
    this: Weak<CacheInner>,
}

impl std::fmt::Debug for CacheInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInner")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .field("on_evict", &self.on_evict.as_ref().map(|_| "<listener>"))
            .finish()
    }
}

impl Cache {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Create an empty cache that reports evictions of subscribed entries.
    pub fn with_eviction_listener(config: CacheConfig, listener: EvictionListener) -> Self {
        Self::build(config, Some(listener))
    }

    fn build(config: CacheConfig, on_evict: Option<EvictionListener>) -> Self {
        let inner = Arc::new_cyclic(|this| CacheInner {
            entries: DashMap::new(),
            config,
            on_evict,
            stats: CacheStats::new(),
            this: this.clone(),
        });
        Self { inner }
    }

    /// Register a new watch on `key`, creating the entry if needed.
    ///
    /// A cached response whose version differs from the request's version is
    /// delivered to the new watch right away. The returned registration carries
    /// an upstream claim when no subscription is open for `key`; the caller must
    /// then subscribe upstream or give the claim back with
    /// [`release_upstream`](Self::release_upstream).
    pub fn get_or_create_watch(
        &self,
        key: AggregationKey,
        request: VersionedRequest,
    ) -> WatchRegistration {
        let inner = &self.inner;
        let mut entry = inner.entries.entry(key.clone()).or_insert_with(|| {
            inner.stats.record_entry_created();
            debug!(key = %key, "created cache entry");
            CacheEntry::new()
        });
        entry.mark_busy();

        let (id, mut slot, watch) =
            WatchSlot::new(key.clone(), request.clone(), Arc::downgrade(inner));

        // The slot starts out having seen the request's version, so a
        // watcher already holding the cached version is not sent it again.
        if let Some(cached) = &entry.last_response {
            if slot.deliver(cached) == Delivery::Delivered {
                inner.stats.record_delivery();
                trace!(key = %key, watch = %id, version = cached.version_info(), "served cached response");
            }
        }
        entry.watchers.insert(id, slot);
        inner.stats.record_watch_opened();

        let upstream_claim = match entry.upstream {
            Some(_) => None,
            None => {
                let subscription = SubscriptionId::next();
                entry.upstream = Some(subscription);
                Some(subscription)
            }
        };

        debug!(
            key = %key,
            watch = %id,
            watchers = entry.watchers.len(),
            claim = upstream_claim.is_some(),
            "registered watch"
        );

        WatchRegistration {
            watch,
            upstream_claim,
        }
    }

    /// Remove `watch` from its entry. Never blocks; idempotent.
    pub fn cancel_watch(&self, watch: &Watch) {
        self.inner.cancel(watch.key(), watch.id());
    }

    /// Apply a response from the origin to the entry for `key` and fan it out.
    ///
    /// A response with the same version as the cached one is ignored.
    pub fn on_upstream_response(&self, key: &AggregationKey, response: VersionedResponse) {
        let inner = &self.inner;
        let Some(mut entry) = inner.entries.get_mut(key) else {
            debug!(key = %key, "dropping response for unknown key");
            return;
        };

        let unchanged = entry
            .last_response
            .as_ref()
            .is_some_and(|cached| cached.version_info() == response.version_info());
        if unchanged {
            inner.stats.record_response_suppressed();
            trace!(key = %key, version = response.version_info(), "response version unchanged");
            return;
        }

        let mut closed = Vec::new();
        let mut delivered = 0u64;
        for (id, slot) in entry.watchers.iter_mut() {
            match slot.deliver(&response) {
                Delivery::Delivered => delivered += 1,
                Delivery::Skipped => {}
                Delivery::Closed => closed.push(*id),
            }
        }
        for id in &closed {
            entry.watchers.remove(id);
        }
        inner.stats.record_deliveries(delivered);
        inner.stats.record_response_applied();

        debug!(
            key = %key,
            version = response.version_info(),
            delivered,
            pruned = closed.len(),
            "applied upstream response"
        );
        entry.last_response = Some(response);

        if !closed.is_empty() && entry.watchers.is_empty() {
            inner.become_idle(key, entry);
        }
    }

    /// Give back an upstream claim that could not be used.
    pub fn release_upstream(&self, key: &AggregationKey, subscription: SubscriptionId) {
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            if entry.upstream == Some(subscription) {
                entry.upstream = None;
            }
        }
    }

    /// All keys currently cached, sorted.
    pub fn keys(&self) -> Vec<AggregationKey> {
        let mut keys: Vec<_> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Keys matching `pattern`, sorted. A trailing `*` matches any suffix.
    pub fn keys_matching(&self, pattern: &str) -> Vec<AggregationKey> {
        let matches = |key: &AggregationKey| match pattern.strip_suffix('*') {
            Some(prefix) => key.as_str().starts_with(prefix),
            None => key.as_str() == pattern,
        };
        self.keys().into_iter().filter(matches).collect()
    }

    /// Describe the entry for `key`.
    pub fn entry_info(&self, key: &AggregationKey) -> Option<EntryInfo> {
        self.inner.entries.get(key).map(|entry| EntryInfo {
            key: key.clone(),
            version: entry
                .last_response
                .as_ref()
                .map(|r| r.version_info().to_owned()),
            watchers: entry.watchers.len(),
            upstream_open: entry.upstream.is_some(),
            idle_for: entry.idle_since.map(|since| since.elapsed()),
        })
    }

    /// The cached response for `key`.
    pub fn last_response(&self, key: &AggregationKey) -> Option<VersionedResponse> {
        self.inner
            .entries
            .get(key)
            .and_then(|entry| entry.last_response.clone())
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Cache counters.
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }
}

impl CacheInner {
    pub(crate) fn cancel(&self, key: &AggregationKey, id: WatchId) {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.watchers.remove(&id).is_none() {
            return;
        }
        self.stats.record_watch_cancelled();
        debug!(key = %key, watch = %id, watchers = entry.watchers.len(), "cancelled watch");

        if entry.watchers.is_empty() {
            self.become_idle(key, entry);
        }
    }

    /// Arm eviction for an entry that just lost its last watch.
    fn become_idle(&self, key: &AggregationKey, mut entry: RefMut<'_, AggregationKey, CacheEntry>) {
        let epoch = entry.mark_idle();
        let grace = self.config.eviction_grace;

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !grace.is_zero() => handle,
            Ok(_) => {
                drop(entry);
                self.evict_if_idle(key, epoch);
                return;
            }
            Err(_) => {
                warn!(key = %key, "no runtime to arm eviction timer; evicting now");
                drop(entry);
                self.evict_if_idle(key, epoch);
                return;
            }
        };

        let cache = self.this.clone();
        let timer_key = key.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(cache) = cache.upgrade() {
                cache.evict_if_idle(&timer_key, epoch);
            }
        });
        entry.eviction_timer = Some(task.abort_handle());
        trace!(key = %key, ?grace, "armed eviction timer");
    }

    fn evict_if_idle(&self, key: &AggregationKey, epoch: u64) {
        let Some((key, entry)) = self.entries.remove_if(key, |_, e| e.is_evictable(epoch)) else {
            return;
        };
        self.stats.record_entry_evicted();
        debug!(key = %key, "evicted cache entry");

        if let (Some(subscription), Some(on_evict)) = (entry.upstream, &self.on_evict) {
            on_evict(&key, subscription);
        }
    }
}
