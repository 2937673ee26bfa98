//! Codec for encoding/decoding xDS messages.
//!
//! The codec layer converts between the versioned envelopes
//! ([`VersionedRequest`], [`VersionedResponse`]) and serialized bytes, so that
//! the upstream client stays independent of the protobuf implementation.

use crate::error::Result;
use crate::versioned::{VersionedRequest, VersionedResponse};
use bytes::Bytes;

pub mod prost;

/// Trait for encoding/decoding xDS discovery messages.
pub trait XdsCodec: Send + Sync + 'static {
    /// Encode a request in its own protocol revision.
    fn encode_request(&self, request: &VersionedRequest) -> Result<Bytes>;

    /// Decode a response in the revision of the `request` it answers.
    fn decode_response(&self, bytes: Bytes, request: &VersionedRequest)
    -> Result<VersionedResponse>;
}
