//! In-memory transport for tests.
//!
//! [`mock_transport`] returns a [`MockTransport`] to hand to the upstream
//! client and a [`MockOrigin`] that plays the management server: it observes
//! every stream the client opens, reads the requests sent on it, and pushes
//! responses or failures back.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use prost::Message;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::transport::{StreamReceiver, StreamSender, Transport};

#[derive(Debug)]
struct Shared {
    pending_failures: AtomicUsize,
    connect_attempts: AtomicUsize,
    hold_requests: watch::Sender<bool>,
}

/// Create a connected transport and origin pair.
pub fn mock_transport() -> (MockTransport, MockOrigin) {
    let shared = Arc::new(Shared {
        pending_failures: AtomicUsize::new(0),
        connect_attempts: AtomicUsize::new(0),
        hold_requests: watch::Sender::new(false),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockTransport {
            shared: shared.clone(),
            streams: tx,
        },
        MockOrigin {
            shared,
            streams: rx,
        },
    )
}

/// Client side of the mock.
#[derive(Clone, Debug)]
pub struct MockTransport {
    shared: Arc<Shared>,
    streams: mpsc::UnboundedSender<MockStream>,
}

impl Transport for MockTransport {
    type Sender = MockStreamSender;
    type Receiver = MockStreamReceiver;

    async fn new_stream(
        &self,
        type_url: &str,
        initial_requests: Vec<Bytes>,
    ) -> Result<(Self::Sender, Self::Receiver)> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .shared
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::Connection("mock origin refused connection".into()));
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        for request in initial_requests {
            let _ = request_tx.send(request);
        }

        self.streams
            .send(MockStream {
                type_url: type_url.to_owned(),
                requests: request_rx,
                responses: response_tx,
            })
            .map_err(|_| Error::Connection("mock origin is gone".into()))?;

        Ok((
            MockStreamSender {
                requests: request_tx,
                hold: self.shared.hold_requests.subscribe(),
            },
            MockStreamReceiver {
                responses: response_rx,
            },
        ))
    }
}

/// Outbound half of a mock stream.
#[derive(Debug)]
pub struct MockStreamSender {
    requests: mpsc::UnboundedSender<Bytes>,
    hold: watch::Receiver<bool>,
}

impl StreamSender for MockStreamSender {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.hold
            .wait_for(|held| !held)
            .await
            .map_err(|_| Error::StreamClosed)?;
        self.requests.send(request).map_err(|_| Error::StreamClosed)
    }
}

/// Inbound half of a mock stream.
#[derive(Debug)]
pub struct MockStreamReceiver {
    responses: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl StreamReceiver for MockStreamReceiver {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        self.responses.recv().await.transpose()
    }
}

/// Origin side of the mock.
#[derive(Debug)]
pub struct MockOrigin {
    shared: Arc<Shared>,
    streams: mpsc::UnboundedReceiver<MockStream>,
}

impl MockOrigin {
    /// Wait for the client to open a stream.
    pub async fn next_stream(&mut self) -> Option<MockStream> {
        self.streams.recv().await
    }

    /// Take an already opened stream, if any.
    pub fn try_next_stream(&mut self) -> Option<MockStream> {
        self.streams.try_recv().ok()
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Number of streams the client tried to open, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Stop accepting requests on every stream until released.
    pub fn hold_requests(&self, hold: bool) {
        self.shared.hold_requests.send_replace(hold);
    }
}

/// One stream as seen by the origin.
#[derive(Debug)]
pub struct MockStream {
    type_url: String,
    requests: mpsc::UnboundedReceiver<Bytes>,
    responses: mpsc::UnboundedSender<Result<Bytes>>,
}

impl MockStream {
    /// Type URL the stream was opened for.
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Wait for the next request. Returns `None` once the client closed its side.
    pub async fn next_request(&mut self) -> Option<DiscoveryRequest> {
        let bytes = self.requests.recv().await?;
        DiscoveryRequest::decode(bytes).ok()
    }

    /// Take an already sent request, if any.
    pub fn try_next_request(&mut self) -> Option<DiscoveryRequest> {
        let bytes = self.requests.try_recv().ok()?;
        DiscoveryRequest::decode(bytes).ok()
    }

    /// Send a response. Returns false if the client is gone.
    pub fn send_response(&self, response: DiscoveryResponse) -> bool {
        self.send_raw(response.encode_to_vec().into())
    }

    /// Send arbitrary bytes as a response payload.
    pub fn send_raw(&self, payload: Bytes) -> bool {
        self.responses.send(Ok(payload)).is_ok()
    }

    /// Tear the stream down with an error.
    pub fn fail(self, message: &str) {
        let _ = self.responses.send(Err(Error::Stream(message.to_owned())));
    }

    /// Close the stream cleanly.
    pub fn close(self) {}
}
