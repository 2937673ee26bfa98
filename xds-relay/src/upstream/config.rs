//! Configuration for the upstream client.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::upstream::retry::RetryPolicy;

/// Default capacity of a stream's outbound request queue.
const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 64;

/// Default time a closing stream gets to flush queued requests.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Configuration for the upstream client.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Retry policy for reconnecting streams.
    pub retry_policy: RetryPolicy,

    /// Capacity of each stream's outbound request queue.
    ///
    /// A request that finds the queue full tears the stream down and the
    /// worker reconnects with the current subscription state.
    pub outbound_queue_size: usize,

    /// How long a stream closed on shutdown may take to flush queued requests.
    pub shutdown_deadline: Duration,
}

impl UpstreamConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_relay::{RetryPolicy, UpstreamConfig};
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default()
    ///     .with_initial_backoff(Duration::from_millis(500)).unwrap()
    ///     .with_max_backoff(Duration::from_secs(60)).unwrap();
    ///
    /// let config = UpstreamConfig::new().with_retry_policy(policy);
    /// ```
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the outbound queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero.
    pub fn with_outbound_queue_size(mut self, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Validation(
                "outbound_queue_size must be greater than zero".into(),
            ));
        }
        self.outbound_queue_size = size;
        Ok(self)
    }

    /// Set the shutdown flush deadline.
    pub fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
        }
    }
}
