//! A caching and aggregating [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol) relay.
//!
//! The relay sits between many downstream xDS clients and one origin
//! management server. Downstream requests that would receive the same response
//! are collapsed onto one aggregation key. Each key is subscribed upstream once,
//! and the latest response for it is cached and fanned out to every watch.
//!
//! The crate is layered:
//! - [`mapper`] turns a request into its [`AggregationKey`] using configurable rules
//! - [`cache`] keeps one entry per key with its watches and last response
//! - [`upstream`] keeps one stream per type URL to the origin, with reconnects
//! - [`Orchestrator`] wires the three together for the downstream-facing layer
//!
//! It does NOT contain a downstream gRPC server. The embedding service accepts
//! connections and drives one [`DownstreamSession`] per connection.
//!
//! # Example
//!
//! ```ignore
//! use xds_relay::{DownstreamSession, Orchestrator, RelayConfig, VersionedRequest};
//!
//! let config = RelayConfig::from_path("relay.json")?;
//! let orchestrator = Orchestrator::from_config(&config)?;
//!
//! // For each downstream connection:
//! let mut session = DownstreamSession::new("conn-1", orchestrator.clone());
//! session.handle_request(VersionedRequest::from_v3(request))?;
//! let watch = session.watch_mut(type_url).unwrap();
//! while let Some(response) = watch.recv().await {
//!     // Send `response.as_v3()` to the downstream client.
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the `tonic` transport to the origin. Enabled by default.
//! - `tonic-tls-ring`, `tonic-tls-aws-lc`: TLS for the `tonic` transport.
//! - `test-util`: Exposes the in-memory [`transport::mock`] origin for tests.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod orchestrator;
pub mod session;
pub mod stats;
pub mod transport;
pub mod upstream;
pub mod versioned;
pub mod watch;

pub use cache::{Cache, CacheConfig, EntryInfo, EvictionListener, WatchRegistration};
pub use codec::XdsCodec;
pub use codec::prost::ProstCodec;
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use logging::LogLevel;
pub use mapper::{AggregationKey, AggregationRules, KeyMapper};
pub use orchestrator::{OpenWatchError, Orchestrator};
pub use session::DownstreamSession;
pub use stats::{CacheStats, UpstreamStats};
pub use transport::{StreamReceiver, StreamSender, Transport};
pub use upstream::config::UpstreamConfig;
pub use upstream::retry::{Backoff, RetryPolicy};
pub use upstream::{
    ConnectionState, ResponseCallback, SubscriptionId, UpstreamClient, UpstreamClientBuilder,
    WeakUpstreamClient,
};
pub use versioned::{ErrorDetail, ProtocolRevision, VersionedRequest, VersionedResponse};
pub use watch::{Watch, WatchId};

// Tonic transport
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::TonicTransport;
