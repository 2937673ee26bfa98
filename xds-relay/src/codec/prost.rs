//! Prost-based codec using envoy-types.

use crate::codec::XdsCodec;
use crate::error::Result;
use crate::versioned::{VersionedRequest, VersionedResponse};
use bytes::Bytes;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use prost::Message;

/// A codec that uses prost/envoy-types for serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

impl XdsCodec for ProstCodec {
    fn encode_request(&self, request: &VersionedRequest) -> Result<Bytes> {
        match request {
            VersionedRequest::V3(request) => Ok(request.encode_to_vec().into()),
        }
    }

    fn decode_response(
        &self,
        bytes: Bytes,
        request: &VersionedRequest,
    ) -> Result<VersionedResponse> {
        match request {
            VersionedRequest::V3(_) => {
                let response = discovery::DiscoveryResponse::decode(bytes)?;
                Ok(VersionedResponse::from_v3(response, request.clone()))
            }
        }
    }
}
