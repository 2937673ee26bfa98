//! Downstream watch handles.
//!
//! A [`Watch`] is the downstream side of a registration on a cache entry. Its
//! mailbox holds a single response: a newer delivery replaces one the consumer
//! has not read yet, so a slow consumer only ever observes the latest version.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use tokio::sync::watch;

use crate::cache::CacheInner;
use crate::mapper::AggregationKey;
use crate::versioned::{VersionedRequest, VersionedResponse};

/// Global counter for generating unique watch IDs.
static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
    fn next() -> Self {
        Self(NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// A live downstream subscription on one aggregation key.
///
/// Dropping the watch removes it from its cache entry.
pub struct Watch {
    id: WatchId,
    key: AggregationKey,
    request: VersionedRequest,
    mailbox: watch::Receiver<Option<VersionedResponse>>,
    cache: Weak<CacheInner>,
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("type_url", &self.request.type_url())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Watch {
    /// The unique identifier of this watch.
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// The aggregation key this watch is registered on.
    pub fn key(&self) -> &AggregationKey {
        &self.key
    }

    /// The downstream request that created this watch.
    pub fn request(&self) -> &VersionedRequest {
        &self.request
    }

    /// Wait for the next response.
    ///
    /// Returns `None` once the watch has been cancelled or its entry evicted.
    pub async fn recv(&mut self) -> Option<VersionedResponse> {
        loop {
            self.mailbox.changed().await.ok()?;
            if let Some(response) = self.mailbox.borrow_and_update().clone() {
                return Some(response);
            }
        }
    }

    /// Take the pending response, if any, without waiting.
    ///
    /// A response delivered before the cache side went away is still returned.
    pub fn try_recv(&mut self) -> Option<VersionedResponse> {
        let pending = self.mailbox.borrow_and_update();
        if pending.has_changed() {
            pending.clone()
        } else {
            None
        }
    }

    /// Returns false once the cache side of this watch is gone.
    pub fn is_alive(&self) -> bool {
        self.mailbox.has_changed().is_ok()
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.cancel(&self.key, self.id);
        }
    }
}

/// Result of handing a response to a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// The watch already saw this version.
    Skipped,
    /// The downstream side is gone.
    Closed,
}

/// Cache-side half of a watch.
#[derive(Debug)]
pub(crate) struct WatchSlot {
    mailbox: watch::Sender<Option<VersionedResponse>>,
    request: VersionedRequest,
    /// Last version handed to (or already held by) the watcher.
    seen_version: Option<String>,
}

impl WatchSlot {
    /// Create a linked slot and watch.
    pub(crate) fn new(
        key: AggregationKey,
        request: VersionedRequest,
        cache: Weak<CacheInner>,
    ) -> (WatchId, Self, Watch) {
        let id = WatchId::next();
        let (tx, rx) = watch::channel(None);
        let held = request.version_info();
        let slot = Self {
            mailbox: tx,
            seen_version: (!held.is_empty()).then(|| held.to_owned()),
            request: request.clone(),
        };
        let watch = Watch {
            id,
            key,
            request,
            mailbox: rx,
            cache,
        };
        (id, slot, watch)
    }

    /// Hand `response` to the watcher, replacing any unread one.
    pub(crate) fn deliver(&mut self, response: &VersionedResponse) -> Delivery {
        if self.mailbox.is_closed() {
            return Delivery::Closed;
        }
        if self.seen_version.as_deref() == Some(response.version_info()) {
            return Delivery::Skipped;
        }
        self.seen_version = Some(response.version_info().to_owned());
        self.mailbox
            .send_replace(Some(response.with_request(self.request.clone())));
        Delivery::Delivered
    }
}
