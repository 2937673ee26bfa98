//! Protocol-revision-agnostic envelopes for discovery messages.
//!
//! The cache, orchestrator and upstream client only ever look at discovery
//! messages through [`VersionedRequest`] and [`VersionedResponse`]. Each
//! supported protocol revision is one variant; adding a revision means adding
//! a variant and its accessors here, nothing else.

use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3 as discovery_v3;
use envoy_types::pb::google::protobuf::Any;
use envoy_types::pb::google::rpc::Status;
use prost::Message;

/// Type URL of the `Resource` wrapper that origins may use instead of bare resources.
const RESOURCE_WRAPPER_TYPE_URL: &str = "type.googleapis.com/envoy.service.discovery.v3.Resource";

/// The discovery protocol revisions understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolRevision {
    /// `envoy.service.discovery.v3`.
    V3,
}

/// Error details carried by a NACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}

/// Locality fields of the requesting node. Empty strings when unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeLocality<'a> {
    /// Region the node is in.
    pub region: &'a str,
    /// Zone within the region.
    pub zone: &'a str,
    /// Sub-zone within the zone.
    pub sub_zone: &'a str,
}

/// A discovery request in one of the supported protocol revisions.
///
/// Cloning is cheap; the payload is shared.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedRequest {
    /// A v3 `DiscoveryRequest`.
    V3(Arc<discovery_v3::DiscoveryRequest>),
}

impl VersionedRequest {
    /// Wrap a v3 request.
    pub fn from_v3(request: discovery_v3::DiscoveryRequest) -> Self {
        Self::V3(Arc::new(request))
    }

    /// The protocol revision of this request.
    pub fn revision(&self) -> ProtocolRevision {
        match self {
            Self::V3(_) => ProtocolRevision::V3,
        }
    }

    /// Type URL of the requested resources.
    pub fn type_url(&self) -> &str {
        match self {
            Self::V3(r) => &r.type_url,
        }
    }

    /// Version the requester last accepted; empty on the first request.
    pub fn version_info(&self) -> &str {
        match self {
            Self::V3(r) => &r.version_info,
        }
    }

    /// Nonce of the response this request acknowledges.
    pub fn nonce(&self) -> &str {
        match self {
            Self::V3(r) => &r.response_nonce,
        }
    }

    /// Requested resource names. Empty means "all resources of this type".
    pub fn resource_names(&self) -> &[String] {
        match self {
            Self::V3(r) => &r.resource_names,
        }
    }

    /// Returns true for a wildcard subscription.
    pub fn is_wildcard(&self) -> bool {
        self.resource_names().is_empty()
    }

    /// Node identifier, or empty when no node was sent.
    pub fn node_id(&self) -> &str {
        match self {
            Self::V3(r) => r.node.as_ref().map_or("", |n| n.id.as_str()),
        }
    }

    /// Node cluster, or empty when no node was sent.
    pub fn node_cluster(&self) -> &str {
        match self {
            Self::V3(r) => r.node.as_ref().map_or("", |n| n.cluster.as_str()),
        }
    }

    /// Node locality; all fields empty when unset.
    pub fn node_locality(&self) -> NodeLocality<'_> {
        match self {
            Self::V3(r) => r
                .node
                .as_ref()
                .and_then(|n| n.locality.as_ref())
                .map(|l| NodeLocality {
                    region: &l.region,
                    zone: &l.zone,
                    sub_zone: &l.sub_zone,
                })
                .unwrap_or_default(),
        }
    }

    /// Error detail of a NACK.
    pub fn error_detail(&self) -> Option<ErrorDetail> {
        match self {
            Self::V3(r) => r.error_detail.as_ref().map(|s| ErrorDetail {
                code: s.code,
                message: s.message.clone(),
            }),
        }
    }

    /// Returns true if this request rejects the previous response.
    pub fn is_nack(&self) -> bool {
        self.error_detail().is_some()
    }

    /// The wrapped v3 payload.
    pub fn as_v3(&self) -> &discovery_v3::DiscoveryRequest {
        match self {
            Self::V3(r) => r,
        }
    }

    /// Build a request for the origin in the same revision, keeping the node
    /// and type URL of `self` and replacing the subscription state.
    pub fn for_upstream(
        &self,
        resource_names: Vec<String>,
        version_info: &str,
        response_nonce: &str,
        error_detail: Option<ErrorDetail>,
    ) -> Self {
        match self {
            Self::V3(r) => Self::V3(Arc::new(discovery_v3::DiscoveryRequest {
                version_info: version_info.to_owned(),
                node: r.node.clone(),
                resource_names,
                type_url: r.type_url.clone(),
                response_nonce: response_nonce.to_owned(),
                error_detail: error_detail.map(|e| Status {
                    code: e.code,
                    message: e.message,
                    details: vec![],
                }),
                ..Default::default()
            })),
        }
    }
}

impl From<discovery_v3::DiscoveryRequest> for VersionedRequest {
    fn from(request: discovery_v3::DiscoveryRequest) -> Self {
        Self::from_v3(request)
    }
}

/// A discovery response together with the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedResponse {
    /// A v3 `DiscoveryResponse`.
    V3 {
        /// The response payload.
        response: Arc<discovery_v3::DiscoveryResponse>,
        /// The request this response is delivered for.
        request: VersionedRequest,
    },
}

impl VersionedResponse {
    /// Wrap a v3 response.
    pub fn from_v3(response: discovery_v3::DiscoveryResponse, request: VersionedRequest) -> Self {
        Self::V3 {
            response: Arc::new(response),
            request,
        }
    }

    /// The protocol revision of this response.
    pub fn revision(&self) -> ProtocolRevision {
        match self {
            Self::V3 { .. } => ProtocolRevision::V3,
        }
    }

    /// Type URL of the carried resources.
    pub fn type_url(&self) -> &str {
        match self {
            Self::V3 { response, .. } => &response.type_url,
        }
    }

    /// Version of the response data.
    pub fn version_info(&self) -> &str {
        match self {
            Self::V3 { response, .. } => &response.version_info,
        }
    }

    /// Nonce to echo back in the next request.
    pub fn nonce(&self) -> &str {
        match self {
            Self::V3 { response, .. } => &response.nonce,
        }
    }

    /// The opaque resources, in origin order.
    pub fn raw_resources(&self) -> &[Any] {
        match self {
            Self::V3 { response, .. } => &response.resources,
        }
    }

    /// The request this response is delivered for.
    pub fn request(&self) -> &VersionedRequest {
        match self {
            Self::V3 { request, .. } => request,
        }
    }

    /// The wrapped v3 payload.
    pub fn as_v3(&self) -> &discovery_v3::DiscoveryResponse {
        match self {
            Self::V3 { response, .. } => response,
        }
    }

    /// Name of every resource, `None` where it cannot be extracted.
    pub fn resource_names(&self) -> Vec<Option<String>> {
        self.raw_resources().iter().map(resource_name).collect()
    }

    /// The same response delivered for a different request.
    pub fn with_request(&self, request: VersionedRequest) -> Self {
        match self {
            Self::V3 { response, .. } => Self::V3 {
                response: Arc::clone(response),
                request,
            },
        }
    }

    /// A copy keeping only the resources for which `keep` returns true.
    pub fn retain<F>(&self, request: VersionedRequest, mut keep: F) -> Self
    where
        F: FnMut(Option<&str>) -> bool,
    {
        match self {
            Self::V3 { response, .. } => {
                let resources = response
                    .resources
                    .iter()
                    .filter(|any| keep(resource_name(any).as_deref()))
                    .cloned()
                    .collect();
                Self::V3 {
                    response: Arc::new(discovery_v3::DiscoveryResponse {
                        resources,
                        ..(**response).clone()
                    }),
                    request,
                }
            }
        }
    }
}

/// Every xDS resource type keeps its name in field 1.
#[derive(Clone, PartialEq, Message)]
struct NamedResource {
    #[prost(string, tag = "1")]
    name: String,
}

fn resource_name(any: &Any) -> Option<String> {
    if any.type_url == RESOURCE_WRAPPER_TYPE_URL {
        let wrapper = discovery_v3::Resource::decode(any.value.as_slice()).ok()?;
        if !wrapper.name.is_empty() {
            return Some(wrapper.name);
        }
        return wrapper.resource.as_ref().and_then(resource_name);
    }
    let named = NamedResource::decode(any.value.as_slice()).ok()?;
    (!named.name.is_empty()).then_some(named.name)
}
