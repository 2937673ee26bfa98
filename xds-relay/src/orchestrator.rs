//! Entry point for the downstream-facing layer.
//!
//! The [`Orchestrator`] ties the mapper, the cache and the upstream client
//! together: it maps each downstream request to its aggregation key, registers
//! a watch on the cache entry and, the first time a key is watched, subscribes
//! the key upstream with a callback feeding responses back into the cache.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{Cache, CacheConfig};
use crate::error::Error;
use crate::mapper::{AggregationKey, KeyMapper};
use crate::upstream::{ResponseCallback, SubscriptionId, UpstreamClient};
use crate::versioned::VersionedRequest;
use crate::watch::Watch;

/// Failure of [`Orchestrator::open_watch`].
#[derive(Debug, Error)]
pub enum OpenWatchError {
    /// The request could not be mapped to an aggregation key.
    #[error("cannot map request: {0}")]
    Key(#[source] Error),

    /// The upstream subscription could not be started.
    ///
    /// The watch stays registered; the next watch on the same key retries the
    /// subscription.
    #[error("upstream subscription failed: {source}")]
    Subscribe {
        /// The registered watch.
        watch: Watch,
        /// Why the subscription failed.
        source: Error,
    },
}

impl OpenWatchError {
    /// The watch that was registered despite the error, if any.
    pub fn into_watch(self) -> Option<Watch> {
        match self {
            Self::Key(_) => None,
            Self::Subscribe { watch, .. } => Some(watch),
        }
    }
}

/// Routes downstream requests to cached, aggregated upstream subscriptions.
///
/// Cloning this handle creates a new reference to the same relay.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    mapper: Arc<KeyMapper>,
    cache: Cache,
    upstream: UpstreamClient,
}

impl Orchestrator {
    /// Create an orchestrator over `upstream`.
    ///
    /// Evicted cache entries unsubscribe their key from `upstream`.
    pub fn new(mapper: KeyMapper, cache_config: CacheConfig, upstream: UpstreamClient) -> Self {
        let weak = upstream.downgrade();
        let cache = Cache::with_eviction_listener(
            cache_config,
            Arc::new(move |key: &AggregationKey, subscription: SubscriptionId| {
                if let Some(upstream) = weak.upgrade() {
                    upstream.unsubscribe(key, subscription);
                }
            }),
        );
        Self {
            mapper: Arc::new(mapper),
            cache,
            upstream,
        }
    }

    /// Build a relay to the origin named in `config`.
    ///
    /// The channel connects lazily, so this succeeds while the origin is
    /// unreachable. Must be called within a tokio runtime.
    #[cfg(feature = "transport-tonic")]
    pub fn from_config(config: &crate::config::RelayConfig) -> crate::Result<Self> {
        config.validate()?;
        let transport = crate::transport::tonic::TonicTransport::connect_lazy(
            config.origin.address.clone(),
        )?
        .aggregated(config.origin.aggregated);
        let upstream = UpstreamClient::builder(
            config.upstream_config()?,
            transport,
            crate::codec::prost::ProstCodec,
        )
        .build();
        Ok(Self::new(config.key_mapper()?, config.cache_config(), upstream))
    }

    /// Register a watch for `request`.
    ///
    /// Never blocks. If the watched key has no upstream subscription yet, one
    /// is started; concurrent calls for the same key start exactly one.
    pub fn open_watch(&self, request: VersionedRequest) -> Result<Watch, OpenWatchError> {
        let key = self
            .mapper
            .compute_key(&request)
            .map_err(OpenWatchError::Key)?;
        let registration = self.cache.get_or_create_watch(key.clone(), request.clone());

        let Some(subscription) = registration.upstream_claim else {
            return Ok(registration.watch);
        };

        let cache = self.cache.clone();
        let response_key = key.clone();
        let on_response: ResponseCallback =
            Arc::new(move |response| cache.on_upstream_response(&response_key, response));

        match self
            .upstream
            .subscribe(key.clone(), subscription, request, on_response)
        {
            Ok(()) => {
                debug!(key = %key, subscription = %subscription, "subscribed upstream");
                Ok(registration.watch)
            }
            Err(source) => {
                self.cache.release_upstream(&key, subscription);
                warn!(key = %key, error = %source, "upstream subscription failed");
                Err(OpenWatchError::Subscribe {
                    watch: registration.watch,
                    source,
                })
            }
        }
    }

    /// Cancel `watch`. Idempotent; dropping the watch has the same effect.
    pub fn close_watch(&self, watch: &Watch) {
        self.cache.cancel_watch(watch);
    }

    /// The response cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The upstream client.
    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// The key mapper.
    pub fn mapper(&self) -> &KeyMapper {
        &self.mapper
    }

    /// Stop the upstream client. Open watches stop receiving updates.
    pub async fn shutdown(&self) {
        self.upstream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::prost::ProstCodec;
    use crate::mapper::AggregationRules;
    use crate::transport::mock::mock_transport;
    use crate::upstream::config::UpstreamConfig;
    use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
    use std::time::Duration;

    const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

    fn request(names: &[&str]) -> VersionedRequest {
        VersionedRequest::from_v3(DiscoveryRequest {
            type_url: CLUSTER_TYPE.to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_watches_share_one_subscription() {
        let (transport, mut origin) = mock_transport();
        let upstream = UpstreamClient::builder(UpstreamConfig::new(), transport, ProstCodec).build();
        let orchestrator = Orchestrator::new(KeyMapper::default_only(), CacheConfig::default(), upstream);

        let mut first = orchestrator.open_watch(request(&["a"])).unwrap();
        let mut second = orchestrator.open_watch(request(&["a"])).unwrap();
        assert_eq!(first.key(), second.key());

        let mut stream = origin.next_stream().await.unwrap();
        stream.next_request().await.unwrap();
        stream.send_response(DiscoveryResponse {
            version_info: "1".to_string(),
            type_url: CLUSTER_TYPE.to_string(),
            nonce: "n1".to_string(),
            ..Default::default()
        });

        assert_eq!(first.recv().await.unwrap().version_info(), "1");
        assert_eq!(second.recv().await.unwrap().version_info(), "1");
        assert_eq!(orchestrator.cache().stats().snapshot().entries_created, 1);
        assert!(origin.try_next_stream().is_none());
    }

    #[tokio::test]
    async fn test_unmapped_request_is_rejected() {
        let (transport, _origin) = mock_transport();
        let upstream = UpstreamClient::builder(UpstreamConfig::new(), transport, ProstCodec).build();
        let rules: AggregationRules = serde_json::from_value(serde_json::json!({
            "rules": [],
            "require_match": true
        }))
        .unwrap();
        let orchestrator =
            Orchestrator::new(KeyMapper::new(&rules).unwrap(), CacheConfig::default(), upstream);

        let err = orchestrator.open_watch(request(&["a"])).unwrap_err();
        assert!(matches!(err, OpenWatchError::Key(Error::NoMatchingRule { .. })));
        assert!(orchestrator.cache().is_empty());
    }

    #[tokio::test]
    async fn test_failed_subscribe_keeps_watch_and_retries() {
        let (transport, mut origin) = mock_transport();
        let upstream = UpstreamClient::builder(UpstreamConfig::new(), transport, ProstCodec).build();
        let orchestrator = Orchestrator::new(
            KeyMapper::default_only(),
            CacheConfig::default(),
            upstream.clone(),
        );

        let err = orchestrator
            .open_watch(VersionedRequest::from_v3(DiscoveryRequest::default()))
            .unwrap_err();
        let watch = err.into_watch().unwrap();
        let key = watch.key().clone();
        let info = orchestrator.cache().entry_info(&key).unwrap();
        assert_eq!(info.watchers, 1);
        assert!(!info.upstream_open);

        upstream.shutdown().await;
        let err = orchestrator.open_watch(request(&["a"])).unwrap_err();
        assert!(matches!(err, OpenWatchError::Subscribe { source: Error::Shutdown, .. }));
        assert!(origin.try_next_stream().is_none());
    }

    #[cfg(feature = "transport-tonic")]
    #[tokio::test]
    async fn test_from_config_with_unreachable_origin() {
        let config = crate::config::RelayConfig::from_json(
            r#"{ "origin": { "address": "http://127.0.0.1:1" }, "cache": { "eviction_grace_ms": 0 } }"#,
        )
        .unwrap();
        let orchestrator = Orchestrator::from_config(&config).unwrap();

        let watch = orchestrator.open_watch(request(&["a"])).unwrap();
        assert!(orchestrator.cache().entry_info(watch.key()).unwrap().upstream_open);
        orchestrator.shutdown().await;

        let bad = crate::config::RelayConfig::from_json(r#"{ "origin": { "address": "" } }"#).unwrap();
        assert!(Orchestrator::from_config(&bad).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_unsubscribes_upstream() {
        let (transport, mut origin) = mock_transport();
        let upstream = UpstreamClient::builder(UpstreamConfig::new(), transport, ProstCodec).build();
        let orchestrator = Orchestrator::new(
            KeyMapper::default_only(),
            CacheConfig {
                eviction_grace: Duration::from_secs(5),
            },
            upstream,
        );

        let watch = orchestrator.open_watch(request(&["a"])).unwrap();
        let key: AggregationKey = watch.key().clone();
        let mut stream = origin.next_stream().await.unwrap();
        stream.next_request().await.unwrap();

        orchestrator.close_watch(&watch);
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(orchestrator.cache().entry_info(&key).is_none());
        assert!(stream.next_request().await.is_none());
    }
}
