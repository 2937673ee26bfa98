//! `tonic` based transport implementation.
//!
//! This transport uses tonic's low-level `Grpc` client with a `BytesCodec`
//! to send and receive raw bytes, leaving serialization to the upstream
//! worker. Each type URL is streamed over its dedicated discovery service
//! unless the origin is configured as aggregated, in which case every type
//! shares the ADS method.

use crate::error::{Error, Result};
use crate::transport::{StreamReceiver, StreamSender, Transport};
use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::Channel;
use tonic::{Status, Streaming};

/// The gRPC path for the ADS StreamAggregatedResources RPC.
const ADS_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// Per-type discovery services, keyed by resource type URL.
const TYPE_PATHS: &[(&str, &str)] = &[
    (
        "type.googleapis.com/envoy.config.listener.v3.Listener",
        "/envoy.service.listener.v3.ListenerDiscoveryService/StreamListeners",
    ),
    (
        "type.googleapis.com/envoy.config.route.v3.RouteConfiguration",
        "/envoy.service.route.v3.RouteDiscoveryService/StreamRoutes",
    ),
    (
        "type.googleapis.com/envoy.config.cluster.v3.Cluster",
        "/envoy.service.cluster.v3.ClusterDiscoveryService/StreamClusters",
    ),
    (
        "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment",
        "/envoy.service.endpoint.v3.EndpointDiscoveryService/StreamEndpoints",
    ),
    (
        "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret",
        "/envoy.service.secret.v3.SecretDiscoveryService/StreamSecrets",
    ),
    (
        "type.googleapis.com/envoy.service.runtime.v3.Runtime",
        "/envoy.service.runtime.v3.RuntimeDiscoveryService/StreamRuntime",
    ),
];

/// Buffer between a stream's writer and the HTTP/2 body.
const STREAM_CHANNEL_BUFFER_SIZE: usize = 16;

/// A codec that passes bytes through without serialization.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Opens discovery streams to the origin using tonic.
#[derive(Clone, Debug)]
pub struct TonicTransport {
    channel: Channel,
    aggregated: bool,
}

impl TonicTransport {
    /// Create a transport from an existing tonic [`Channel`].
    ///
    /// Use this when you need custom channel configuration (e.g., TLS, timeouts).
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tonic::transport::{Certificate, Channel, ClientTlsConfig};
    ///
    /// let tls = ClientTlsConfig::new()
    ///     .ca_certificate(Certificate::from_pem(ca_cert))
    ///     .domain_name("xds.example.com");
    ///
    /// let channel = Channel::from_static("https://xds.example.com:443")
    ///     .tls_config(tls)?
    ///     .connect_lazy();
    ///
    /// let transport = TonicTransport::from_channel(channel);
    /// ```
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            channel,
            aggregated: false,
        }
    }

    /// Connect to an origin with default settings.
    ///
    /// For custom configuration (TLS, timeouts, etc.), use [`from_channel`](Self::from_channel).
    pub async fn connect(uri: impl Into<String>) -> Result<Self> {
        let uri: String = uri.into();
        let channel = Channel::from_shared(uri)
            .map_err(|e| Error::Connection(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self::from_channel(channel))
    }

    /// Create a transport that connects on first use.
    ///
    /// Connection failures then surface from [`Transport::new_stream`], where
    /// the upstream client retries them with backoff. Must be called within a
    /// tokio runtime.
    pub fn connect_lazy(uri: impl Into<String>) -> Result<Self> {
        let uri: String = uri.into();
        let channel = Channel::from_shared(uri)
            .map_err(|e| Error::Connection(e.to_string()))?
            .connect_lazy();
        Ok(Self::from_channel(channel))
    }

    /// Stream every type over the aggregated discovery service.
    pub fn aggregated(mut self, aggregated: bool) -> Self {
        self.aggregated = aggregated;
        self
    }

    fn path_for(&self, type_url: &str) -> &'static str {
        if self.aggregated {
            return ADS_PATH;
        }
        TYPE_PATHS
            .iter()
            .find(|(url, _)| *url == type_url)
            .map_or(ADS_PATH, |(_, path)| *path)
    }
}

impl Transport for TonicTransport {
    type Sender = TonicStreamSender;
    type Receiver = TonicStreamReceiver;

    async fn new_stream(
        &self,
        type_url: &str,
        initial_requests: Vec<Bytes>,
    ) -> Result<(Self::Sender, Self::Receiver)> {
        let mut grpc = Grpc::new(self.channel.clone());

        grpc.ready()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_BUFFER_SIZE);

        // Initial requests go first so servers that wait for a message before
        // sending response headers do not stall the call.
        let initial_stream = tokio_stream::iter(initial_requests);
        let channel_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let request_stream = initial_stream.chain(channel_stream);

        let path = PathAndQuery::from_static(self.path_for(type_url));

        let response = grpc
            .streaming(tonic::Request::new(request_stream), path, BytesCodec)
            .await?;

        Ok((
            TonicStreamSender { sender: tx },
            TonicStreamReceiver {
                receiver: response.into_inner(),
            },
        ))
    }
}

/// Outbound half of a tonic discovery stream.
#[derive(Debug)]
pub struct TonicStreamSender {
    sender: mpsc::Sender<Bytes>,
}

impl StreamSender for TonicStreamSender {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::StreamClosed)
    }
}

/// Inbound half of a tonic discovery stream.
#[derive(Debug)]
pub struct TonicStreamReceiver {
    receiver: Streaming<Bytes>,
}

impl StreamReceiver for TonicStreamReceiver {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        Ok(self.receiver.message().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
        ClusterDiscoveryService, ClusterDiscoveryServiceServer,
    };
    use envoy_types::pb::envoy::service::discovery::v3::{
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
    };
    use prost::Message;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use tokio::net::TcpListener;
    use tokio_stream::{Stream, StreamExt as _};
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::{Request, Response, Status};

    const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

    type ResponseStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;

    /// Answer every request on `inbound` with an incrementing version.
    ///
    /// Nonces carry `service` so a test can tell which RPC served the stream.
    fn answer(
        mut inbound: tonic::Streaming<DiscoveryRequest>,
        service: &'static str,
    ) -> ResponseStream {
        let outbound = async_stream::try_stream! {
            let mut version = 0;
            while let Some(req) = inbound.next().await {
                let req = req?;
                version += 1;
                yield DiscoveryResponse {
                    version_info: version.to_string(),
                    type_url: req.type_url.clone(),
                    nonce: format!("{service}-{version}"),
                    ..Default::default()
                };
            }
        };
        Box::pin(outbound)
    }

    /// Mock origin serving the aggregated discovery service.
    struct MockAdsServer;

    #[tonic::async_trait]
    impl AggregatedDiscoveryService for MockAdsServer {
        type StreamAggregatedResourcesStream = ResponseStream;

        async fn stream_aggregated_resources(
            &self,
            request: Request<tonic::Streaming<DiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
            Ok(Response::new(answer(request.into_inner(), "ads")))
        }

        type DeltaAggregatedResourcesStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

        async fn delta_aggregated_resources(
            &self,
            _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
            Err(Status::unimplemented("delta not supported in mock"))
        }
    }

    /// Mock origin serving the cluster discovery service.
    struct MockCdsServer;

    #[tonic::async_trait]
    impl ClusterDiscoveryService for MockCdsServer {
        type StreamClustersStream = ResponseStream;

        async fn stream_clusters(
            &self,
            request: Request<tonic::Streaming<DiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::StreamClustersStream>, Status> {
            Ok(Response::new(answer(request.into_inner(), "cds")))
        }

        type DeltaClustersStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

        async fn delta_clusters(
            &self,
            _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::DeltaClustersStream>, Status> {
            Err(Status::unimplemented("delta not supported in mock"))
        }

        async fn fetch_clusters(
            &self,
            _request: Request<DiscoveryRequest>,
        ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
            Err(Status::unimplemented("fetch not supported in mock"))
        }
    }

    async fn start_mock_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(AggregatedDiscoveryServiceServer::new(MockAdsServer))
                .add_service(ClusterDiscoveryServiceServer::new(MockCdsServer))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_aggregated_stream_round_trip() {
        let addr = start_mock_server().await;
        let transport = TonicTransport::connect(format!("http://{addr}"))
            .await
            .unwrap()
            .aggregated(true);

        let request = DiscoveryRequest {
            type_url: CLUSTER_TYPE.to_string(),
            resource_names: vec!["cluster-1".to_string()],
            ..Default::default()
        };
        let request_bytes: Bytes = request.encode_to_vec().into();

        let (mut sender, mut receiver) = transport
            .new_stream(CLUSTER_TYPE, vec![request_bytes.clone()])
            .await
            .unwrap();

        let first = DiscoveryResponse::decode(receiver.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.version_info, "1");
        assert_eq!(first.type_url, CLUSTER_TYPE);

        sender.send(request_bytes).await.unwrap();
        let second = DiscoveryResponse::decode(receiver.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.nonce, "ads-2");

        drop(sender);
        assert!(receiver.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_per_type_stream_round_trip() {
        let addr = start_mock_server().await;
        let transport = TonicTransport::connect(format!("http://{addr}")).await.unwrap();

        let request: Bytes = DiscoveryRequest {
            type_url: CLUSTER_TYPE.to_string(),
            resource_names: vec!["cluster-1".to_string()],
            ..Default::default()
        }
        .encode_to_vec()
        .into();

        let (mut sender, mut receiver) = transport
            .new_stream(CLUSTER_TYPE, vec![request.clone()])
            .await
            .unwrap();

        let first = DiscoveryResponse::decode(receiver.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.type_url, CLUSTER_TYPE);
        assert_eq!(first.nonce, "cds-1");

        sender.send(request).await.unwrap();
        let second = DiscoveryResponse::decode(receiver.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.nonce, "cds-2");

        // Types without a dedicated service fall back to ADS.
        let custom = "type.googleapis.com/custom.Type";
        let request: Bytes = DiscoveryRequest {
            type_url: custom.to_string(),
            ..Default::default()
        }
        .encode_to_vec()
        .into();
        let (_sender, mut receiver) = transport.new_stream(custom, vec![request]).await.unwrap();
        let response = DiscoveryResponse::decode(receiver.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(response.nonce, "ads-1");
    }

    #[tokio::test]
    async fn test_lazy_transport_reports_unreachable_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TonicTransport::connect_lazy(format!("http://{addr}")).unwrap();
        let result = transport.new_stream(CLUSTER_TYPE, Vec::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_path_selection() {
        let transport = TonicTransport::connect_lazy("http://127.0.0.1:1").unwrap();
        assert_eq!(
            transport.path_for(CLUSTER_TYPE),
            "/envoy.service.cluster.v3.ClusterDiscoveryService/StreamClusters"
        );
        assert_eq!(transport.path_for("type.googleapis.com/custom.Type"), ADS_PATH);

        let transport = transport.aggregated(true);
        assert_eq!(transport.path_for(CLUSTER_TYPE), ADS_PATH);
    }
}
