//! Watches owned by one downstream connection.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::Result;
use crate::orchestrator::{OpenWatchError, Orchestrator};
use crate::versioned::VersionedRequest;
use crate::watch::Watch;

/// The watches of a single downstream connection, one per type URL.
///
/// Every request from the connection replaces the watch for its type URL: an
/// ACK or NACK re-registers the watch with the version the client now holds,
/// so it is only sent responses it has not seen. Dropping the session cancels
/// every watch.
#[derive(Debug)]
pub struct DownstreamSession {
    id: String,
    orchestrator: Orchestrator,
    watches: HashMap<String, Watch>,
}

impl DownstreamSession {
    /// Create an empty session. `id` only labels log events.
    pub fn new(id: impl Into<String>, orchestrator: Orchestrator) -> Self {
        Self {
            id: id.into(),
            orchestrator,
            watches: HashMap::new(),
        }
    }

    /// Handle a request from the downstream client.
    ///
    /// The new watch is opened before the previous watch for the request's
    /// type URL is cancelled, so the entry never goes idle in between. If the
    /// upstream subscription fails, the watch is still installed and the error
    /// is returned.
    pub fn handle_request(&mut self, request: VersionedRequest) -> Result<()> {
        let type_url = request.type_url().to_owned();
        if let Some(detail) = request.error_detail() {
            warn!(
                session = %self.id,
                type_url = %type_url,
                version = request.version_info(),
                nonce = request.nonce(),
                code = detail.code,
                message = %detail.message,
                "downstream rejected response"
            );
        }

        let (watch, result) = match self.orchestrator.open_watch(request) {
            Ok(watch) => {
                debug!(session = %self.id, type_url = %type_url, key = %watch.key(), "opened watch");
                (Some(watch), Ok(()))
            }
            Err(OpenWatchError::Subscribe { watch, source }) => (Some(watch), Err(source)),
            Err(OpenWatchError::Key(err)) => (None, Err(err)),
        };

        let previous = match watch {
            Some(watch) => self.watches.insert(type_url, watch),
            None => self.watches.remove(&type_url),
        };
        if let Some(previous) = previous {
            self.orchestrator.close_watch(&previous);
        }
        result
    }

    /// The watch for `type_url`, used to receive its responses.
    pub fn watch_mut(&mut self, type_url: &str) -> Option<&mut Watch> {
        self.watches.get_mut(type_url)
    }

    /// Type URLs with an open watch.
    pub fn type_urls(&self) -> impl Iterator<Item = &str> {
        self.watches.keys().map(String::as_str)
    }

    /// Cancel every watch.
    pub fn close(&mut self) {
        if self.watches.is_empty() {
            return;
        }
        for (_, watch) in self.watches.drain() {
            self.orchestrator.close_watch(&watch);
        }
        debug!(session = %self.id, "closed session");
    }
}

impl Drop for DownstreamSession {
    fn drop(&mut self) {
        self.close();
    }
}
