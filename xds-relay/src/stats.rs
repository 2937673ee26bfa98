//! Relay counters.
//!
//! All counters are atomic and can be read from any thread while the relay runs.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    (
        $(#[$meta:meta])*
        $name:ident / $snapshot:ident {
            $($(#[$field_meta:meta])* $field:ident => $record:ident),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $($field: AtomicU64,)*
        }

        impl $name {
            /// Create zeroed counters.
            pub fn new() -> Self {
                Self::default()
            }

            $(
                $(#[$field_meta])*
                #[inline]
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Read every counter.
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }

        /// Point-in-time copy of the counters.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        #[allow(missing_docs)]
        pub struct $snapshot {
            $(pub $field: u64,)*
        }
    };
}

counters! {
    /// Counters for the response cache.
    CacheStats / CacheStatsSnapshot {
        /// Record a new cache entry.
        entries_created => record_entry_created,
        /// Record an evicted cache entry.
        entries_evicted => record_entry_evicted,
        /// Record a registered watch.
        watches_opened => record_watch_opened,
        /// Record a cancelled watch.
        watches_cancelled => record_watch_cancelled,
        /// Record an upstream response that replaced the cached one.
        responses_applied => record_response_applied,
        /// Record an upstream response with an unchanged version.
        responses_suppressed => record_response_suppressed,
        /// Record a response handed to a watch.
        deliveries => record_delivery,
    }
}

impl CacheStats {
    /// Record `count` responses handed to watches by one fanout.
    #[inline]
    pub fn record_deliveries(&self, count: u64) {
        self.deliveries.fetch_add(count, Ordering::Relaxed);
    }
}

counters! {
    /// Counters for upstream streams.
    UpstreamStats / UpstreamStatsSnapshot {
        /// Record a connection attempt.
        connect_attempts => record_connect_attempt,
        /// Record a failed connection attempt.
        connect_failures => record_connect_failure,
        /// Record an established stream.
        streams_opened => record_stream_opened,
        /// Record a stream torn down by an error.
        stream_failures => record_stream_failure,
        /// Record a response from the origin.
        responses_received => record_response_received,
        /// Record a response no subscription claimed.
        responses_unmatched => record_response_unmatched,
        /// Record a response that could not be used.
        responses_malformed => record_response_malformed,
        /// Record a request queued for the origin.
        requests_sent => record_request_sent,
        /// Record an outbound queue overflow.
        queue_overflows => record_queue_overflow,
    }
}
