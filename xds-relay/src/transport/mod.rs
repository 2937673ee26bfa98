//! Provides abstraction for transport layers.

use crate::error::Result;
use bytes::Bytes;
use std::future::Future;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;
#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// Factory for upstream discovery streams.
///
/// This abstraction allows for different transport implementations:
/// - Tonic-based gRPC transport
/// - In-memory mock transport for testing
pub trait Transport: Send + Sync + 'static {
    /// Outbound half of a stream.
    type Sender: StreamSender;
    /// Inbound half of a stream.
    type Receiver: StreamReceiver;

    /// Opens a bidirectional stream carrying resources of `type_url`.
    ///
    /// `initial_requests` are sent before anything queued on the returned
    /// sender. This may be called multiple times for reconnection.
    fn new_stream(
        &self,
        type_url: &str,
        initial_requests: Vec<Bytes>,
    ) -> impl Future<Output = Result<(Self::Sender, Self::Receiver)>> + Send;
}

/// Outbound half of an upstream stream.
///
/// Dropping the sender half-closes the stream.
pub trait StreamSender: Send + 'static {
    /// Send serialized DiscoveryRequest bytes to the origin.
    fn send(&mut self, request: Bytes) -> impl Future<Output = Result<()>> + Send;
}

/// Inbound half of an upstream stream.
pub trait StreamReceiver: Send + 'static {
    /// Receive serialized DiscoveryResponse bytes from the origin.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Received a response.
    /// - `Ok(None)` - Stream closed normally.
    /// - `Err(_)` - Stream error (connection dropped, etc.)
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}
