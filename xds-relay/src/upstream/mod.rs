//! Client for the origin management server.
//!
//! The [`UpstreamClient`] keeps one stream per type URL. Each stream is owned
//! by a background worker that follows the [`ConnectionState`] machine:
//!
//! ```text
//! Disconnected --subscribe--> Connecting --ok--> Streaming
//!      ^                          |                  |
//!      +-------- backoff ---------+---- failure -----+
//! ```
//!
//! Subscriptions are identified by their aggregation key. The worker asks the
//! origin for the union of the resource names of every subscription of its
//! type and routes each response back to the subscriptions it matches.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::mapper::AggregationKey;
use crate::stats::UpstreamStats;
use crate::transport::Transport;
use crate::versioned::{VersionedRequest, VersionedResponse};

pub mod config;
pub mod retry;
mod worker;

use config::UpstreamConfig;
use worker::{Worker, WorkerCommand, WorkerContext};

/// Global counter for generating unique subscription IDs.
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Generation of an upstream subscription.
///
/// A key that is evicted and later subscribed again gets a new ID, so a late
/// unsubscribe for the old generation cannot remove the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// State of the stream for one type URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No stream is open.
    #[default]
    Disconnected,
    /// A stream is being opened.
    Connecting,
    /// The stream is open.
    Streaming,
}

/// Receives every response routed to a subscription.
///
/// Invoked on the worker task; must not block.
pub type ResponseCallback = Arc<dyn Fn(VersionedResponse) + Send + Sync>;

type SpawnWorker = Box<dyn Fn(WorkerContext) -> JoinHandle<()> + Send + Sync>;

/// Builder for [`UpstreamClient`].
#[derive(Debug)]
pub struct UpstreamClientBuilder<T, C> {
    config: UpstreamConfig,
    transport: T,
    codec: C,
}

impl<T, C> UpstreamClientBuilder<T, C>
where
    T: Transport,
    C: XdsCodec,
{
    /// Create a new builder with the given configuration, transport and codec.
    pub fn new(config: UpstreamConfig, transport: T, codec: C) -> Self {
        Self {
            config,
            transport,
            codec,
        }
    }

    /// Build the client.
    ///
    /// Workers are spawned lazily on the current tokio runtime, one per type
    /// URL, when the first subscription for that type arrives.
    pub fn build(self) -> UpstreamClient {
        let transport = Arc::new(self.transport);
        let codec = Arc::new(self.codec);
        let config = self.config;
        let shutdown_deadline = config.shutdown_deadline;

        let spawn: SpawnWorker = Box::new(move |context| {
            let worker = Worker::new(transport.clone(), codec.clone(), config.clone(), context);
            tokio::spawn(worker.run())
        });

        UpstreamClient {
            inner: Arc::new(ClientInner {
                workers: DashMap::new(),
                routes: DashMap::new(),
                spawn,
                shutdown: CancellationToken::new(),
                stats: Arc::new(UpstreamStats::new()),
                shutdown_deadline,
            }),
        }
    }
}

struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

struct ClientInner {
    workers: DashMap<String, WorkerHandle>,
    /// Type URL of every live subscription.
    routes: DashMap<SubscriptionId, String>,
    spawn: SpawnWorker,
    shutdown: CancellationToken,
    stats: Arc<UpstreamStats>,
    shutdown_deadline: std::time::Duration,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Client for the origin management server.
///
/// Cloning this handle creates a new reference to the same client. When all
/// handles are dropped the workers shut down.
#[derive(Clone)]
pub struct UpstreamClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("streams", &self.inner.workers.len())
            .field("subscriptions", &self.inner.routes.len())
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl UpstreamClient {
    /// Create a new builder with the given configuration, transport and codec.
    pub fn builder<T, C>(
        config: UpstreamConfig,
        transport: T,
        codec: C,
    ) -> UpstreamClientBuilder<T, C>
    where
        T: Transport,
        C: XdsCodec,
    {
        UpstreamClientBuilder::new(config, transport, codec)
    }

    /// Subscribe `key` to the origin with `request`.
    ///
    /// Never blocks: the subscription is handed to the worker for the
    /// request's type URL, which connects if needed. Every response routed to
    /// the key is passed to `on_response`. Subscribing a key again replaces
    /// its previous subscription.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe(
        &self,
        key: AggregationKey,
        id: SubscriptionId,
        request: VersionedRequest,
        on_response: ResponseCallback,
    ) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let type_url = request.type_url().to_owned();
        if type_url.is_empty() {
            return Err(Error::Validation("request has no type URL".into()));
        }

        let worker = self
            .inner
            .workers
            .entry(type_url.clone())
            .or_insert_with(|| self.inner.spawn_worker(&type_url));

        worker
            .commands
            .send(WorkerCommand::Subscribe {
                key,
                id,
                request,
                on_response,
            })
            .map_err(|_| Error::Shutdown)?;
        self.inner.routes.insert(id, type_url);
        Ok(())
    }

    /// Drop the subscription of `key` if it is still generation `id`.
    pub fn unsubscribe(&self, key: &AggregationKey, id: SubscriptionId) {
        let Some((_, type_url)) = self.inner.routes.remove(&id) else {
            return;
        };
        if let Some(worker) = self.inner.workers.get(&type_url) {
            let _ = worker.commands.send(WorkerCommand::Unsubscribe {
                key: key.clone(),
                id,
            });
        }
    }

    /// Current state of the stream for `type_url`.
    pub fn connection_state(&self, type_url: &str) -> ConnectionState {
        self.inner
            .workers
            .get(type_url)
            .map(|worker| *worker.state.borrow())
            .unwrap_or_default()
    }

    /// Wait until the stream for `type_url` reaches `state`.
    pub async fn wait_for_state(&self, type_url: &str, state: ConnectionState) -> Result<()> {
        let mut receiver = match self.inner.workers.get(type_url) {
            Some(worker) => worker.state.clone(),
            None if state == ConnectionState::Disconnected => return Ok(()),
            None => return Err(Error::StreamClosed),
        };
        receiver
            .wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| Error::Shutdown)
    }

    /// Upstream counters.
    pub fn stats(&self) -> &UpstreamStats {
        &self.inner.stats
    }

    /// A handle that does not keep the client alive.
    pub fn downgrade(&self) -> WeakUpstreamClient {
        WeakUpstreamClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stop every worker.
    ///
    /// Open streams get the configured deadline to flush queued requests.
    /// Later subscriptions fail with [`Error::Shutdown`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self
            .inner
            .workers
            .iter_mut()
            .filter_map(|mut worker| worker.task.take())
            .collect();
        info!(workers = tasks.len(), "shutting down upstream client");

        let deadline = self.inner.shutdown_deadline;
        for mut task in tasks {
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                warn!(?deadline, "upstream worker did not stop in time");
                task.abort();
            }
        }
    }
}

/// Weak reference to an [`UpstreamClient`].
#[derive(Clone, Debug)]
pub struct WeakUpstreamClient {
    inner: Weak<ClientInner>,
}

impl WeakUpstreamClient {
    /// The client, if it is still alive.
    pub fn upgrade(&self) -> Option<UpstreamClient> {
        self.inner.upgrade().map(|inner| UpstreamClient { inner })
    }
}

impl ClientInner {
    fn spawn_worker(&self, type_url: &str) -> WorkerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let task = (self.spawn)(WorkerContext {
            type_url: type_url.to_owned(),
            commands: commands_rx,
            state: state_tx,
            shutdown: self.shutdown.child_token(),
            stats: Arc::clone(&self.stats),
        });
        debug!(type_url, "spawned upstream worker");
        WorkerHandle {
            commands: commands_tx,
            state: state_rx,
            task: Some(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::prost::ProstCodec;
    use crate::transport::mock::{MockOrigin, mock_transport};
    use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
    use std::sync::Mutex;
    use std::time::Duration;

    const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

    fn request(type_url: &str, names: &[&str]) -> VersionedRequest {
        VersionedRequest::from_v3(DiscoveryRequest {
            type_url: type_url.to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        })
    }

    fn client() -> (UpstreamClient, MockOrigin) {
        let (transport, origin) = mock_transport();
        let policy = retry::RetryPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            2.0,
        )
        .unwrap()
        .with_jitter(0.0)
        .unwrap();
        let config = UpstreamConfig::new().with_retry_policy(policy);
        (
            UpstreamClient::builder(config, transport, ProstCodec).build(),
            origin,
        )
    }

    fn recorder() -> (ResponseCallback, Arc<Mutex<Vec<VersionedResponse>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ResponseCallback =
            Arc::new(move |response: VersionedResponse| sink.lock().unwrap().push(response));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_union_of_names_is_requested() {
        let (client, mut origin) = client();
        let (callback, _) = recorder();

        client
            .subscribe(
                "a".into(),
                SubscriptionId::next(),
                request(CLUSTER_TYPE, &["c1", "c2"]),
                callback.clone(),
            )
            .unwrap();
        let mut stream = origin.next_stream().await.unwrap();
        assert_eq!(stream.type_url(), CLUSTER_TYPE);
        assert_eq!(
            stream.next_request().await.unwrap().resource_names,
            vec!["c1", "c2"]
        );

        client
            .subscribe(
                "b".into(),
                SubscriptionId::next(),
                request(CLUSTER_TYPE, &["c3", "c1"]),
                callback,
            )
            .unwrap();
        assert_eq!(
            stream.next_request().await.unwrap().resource_names,
            vec!["c1", "c2", "c3"]
        );
        assert_eq!(
            client.connection_state(CLUSTER_TYPE),
            ConnectionState::Streaming
        );
        assert_eq!(
            client.connection_state(LISTENER_TYPE),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_response_is_acked_and_routed() {
        let (client, mut origin) = client();
        let (callback, seen) = recorder();
        client
            .subscribe(
                "a".into(),
                SubscriptionId::next(),
                request(CLUSTER_TYPE, &[]),
                callback,
            )
            .unwrap();

        let mut stream = origin.next_stream().await.unwrap();
        stream.next_request().await.unwrap();
        stream.send_response(DiscoveryResponse {
            version_info: "7".to_string(),
            type_url: CLUSTER_TYPE.to_string(),
            nonce: "n7".to_string(),
            ..Default::default()
        });

        let ack = stream.next_request().await.unwrap();
        assert_eq!(ack.version_info, "7");
        assert_eq!(ack.response_nonce, "n7");
        assert!(ack.error_detail.is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].version_info(), "7");
        assert_eq!(client.stats().snapshot().responses_received, 1);
    }

    #[tokio::test]
    async fn test_mismatched_type_is_nacked() {
        let (client, mut origin) = client();
        let (callback, seen) = recorder();
        client
            .subscribe(
                "a".into(),
                SubscriptionId::next(),
                request(CLUSTER_TYPE, &[]),
                callback,
            )
            .unwrap();

        let mut stream = origin.next_stream().await.unwrap();
        stream.next_request().await.unwrap();
        stream.send_response(DiscoveryResponse {
            version_info: "1".to_string(),
            type_url: LISTENER_TYPE.to_string(),
            nonce: "n1".to_string(),
            ..Default::default()
        });

        let nack = stream.next_request().await.unwrap();
        assert_eq!(nack.version_info, "");
        assert_eq!(nack.response_nonce, "n1");
        assert_eq!(nack.error_detail.unwrap().code, 3);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(client.stats().snapshot().responses_malformed, 1);
    }

    #[tokio::test]
    async fn test_garbage_response_keeps_stream() {
        let (client, mut origin) = client();
        let (callback, seen) = recorder();
        client
            .subscribe(
                "a".into(),
                SubscriptionId::next(),
                request(CLUSTER_TYPE, &[]),
                callback,
            )
            .unwrap();

        let mut stream = origin.next_stream().await.unwrap();
        stream.next_request().await.unwrap();
        stream.send_raw(bytes::Bytes::from_static(&[0xff, 0xff, 0xff]));
        stream.send_response(DiscoveryResponse {
            version_info: "2".to_string(),
            type_url: CLUSTER_TYPE.to_string(),
            nonce: "n2".to_string(),
            ..Default::default()
        });

        assert_eq!(stream.next_request().await.unwrap().version_info, "2");
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(client.stats().snapshot().responses_malformed, 1);
        assert_eq!(client.stats().snapshot().streams_opened, 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_failure_with_state() {
        let (client, mut origin) = client();
        let (callback, _) = recorder();
        client
            .subscribe(
                "a".into(),
                SubscriptionId::next(),
                request(CLUSTER_TYPE, &["c1"]),
                callback,
            )
            .unwrap();

        let mut stream = origin.next_stream().await.unwrap();
        stream.next_request().await.unwrap();
        stream.send_response(DiscoveryResponse {
            version_info: "3".to_string(),
            type_url: CLUSTER_TYPE.to_string(),
            nonce: "n3".to_string(),
            ..Default::default()
        });
        stream.next_request().await.unwrap();

        origin.fail_next_connects(2);
        stream.fail("origin restarted");

        let mut stream = origin.next_stream().await.unwrap();
        let resumed = stream.next_request().await.unwrap();
        assert_eq!(resumed.resource_names, vec!["c1"]);
        assert_eq!(resumed.version_info, "3");
        assert_eq!(resumed.response_nonce, "");

        let stats = client.stats().snapshot();
        assert_eq!(stats.connect_failures, 2);
        assert_eq!(stats.stream_failures, 1);
        assert_eq!(origin.connect_attempts(), 4);
    }

    #[tokio::test]
    async fn test_stale_unsubscribe_is_ignored() {
        let (client, mut origin) = client();
        let (callback, _) = recorder();
        let old = SubscriptionId::next();
        let new = SubscriptionId::next();

        client
            .subscribe("a".into(), old, request(CLUSTER_TYPE, &["c1"]), callback.clone())
            .unwrap();
        client
            .subscribe("a".into(), new, request(CLUSTER_TYPE, &["c2"]), callback)
            .unwrap();
        client.unsubscribe(&"a".into(), old);

        let mut stream = origin.next_stream().await.unwrap();
        let mut last = stream.next_request().await.unwrap();
        while let Some(request) = stream.try_next_request() {
            last = request;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Some(request) = stream.try_next_request() {
            last = request;
        }
        assert_eq!(last.resource_names, vec!["c2"]);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_closes_stream() {
        let (client, mut origin) = client();
        let (callback, _) = recorder();
        let id = SubscriptionId::next();
        client
            .subscribe("a".into(), id, request(CLUSTER_TYPE, &["c1"]), callback)
            .unwrap();

        let mut stream = origin.next_stream().await.unwrap();
        stream.next_request().await.unwrap();
        client
            .wait_for_state(CLUSTER_TYPE, ConnectionState::Streaming)
            .await
            .unwrap();

        client.unsubscribe(&"a".into(), id);
        assert!(stream.next_request().await.is_none());
        client
            .wait_for_state(CLUSTER_TYPE, ConnectionState::Disconnected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_outbound_queue_forces_reconnect() {
        let (transport, mut origin) = mock_transport();
        let config = UpstreamConfig::new()
            .with_outbound_queue_size(1)
            .unwrap()
            .with_retry_policy(
                retry::RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(5), 1.0)
                    .unwrap(),
            );
        let client = UpstreamClient::builder(config, transport, ProstCodec).build();
        let (callback, _) = recorder();
        client
            .subscribe(
                "a".into(),
                SubscriptionId::next(),
                request(CLUSTER_TYPE, &[]),
                callback,
            )
            .unwrap();

        let mut stream = origin.next_stream().await.unwrap();
        stream.next_request().await.unwrap();
        origin.hold_requests(true);
        for version in 0..4 {
            stream.send_response(DiscoveryResponse {
                version_info: version.to_string(),
                type_url: CLUSTER_TYPE.to_string(),
                nonce: format!("n{version}"),
                ..Default::default()
            });
        }

        let resumed = origin.next_stream().await.unwrap();
        assert_eq!(resumed.type_url(), CLUSTER_TYPE);
        assert!(client.stats().snapshot().queue_overflows >= 1);
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_fails() {
        let (client, mut origin) = client();
        let (callback, _) = recorder();
        client
            .subscribe(
                "a".into(),
                SubscriptionId::next(),
                request(CLUSTER_TYPE, &[]),
                callback.clone(),
            )
            .unwrap();
        let mut stream = origin.next_stream().await.unwrap();
        stream.next_request().await.unwrap();

        client.shutdown().await;

        assert!(stream.next_request().await.is_none());
        assert!(matches!(
            client.subscribe("b".into(), SubscriptionId::next(), request(CLUSTER_TYPE, &[]), callback),
            Err(Error::Shutdown)
        ));
    }
}
