//! Per-type worker that owns one upstream stream.
//!
//! The worker runs as a background task, managing:
//! - The stream lifecycle (connection, reconnection with backoff)
//! - The union of resource names requested by every subscription
//! - Routing responses to the subscriptions they belong to
//! - Version/nonce tracking and ACK/NACK
//!
//! All requests for a stream go through a bounded queue drained by a single
//! writer task. A request that finds the queue full tears the stream down;
//! the reconnect then carries the whole subscription state again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::mapper::AggregationKey;
use crate::stats::UpstreamStats;
use crate::transport::{StreamReceiver, StreamSender, Transport};
use crate::upstream::config::UpstreamConfig;
use crate::upstream::retry::Backoff;
use crate::upstream::{ConnectionState, ResponseCallback, SubscriptionId};
use crate::versioned::{ErrorDetail, VersionedRequest, VersionedResponse};

/// gRPC `INVALID_ARGUMENT`, reported when NACKing a response.
const INVALID_ARGUMENT: i32 = 3;

/// Types whose every response carries the complete set of resources, so a
/// resource missing from a response has been removed.
const FULL_STATE_TYPES: &[&str] = &[
    "type.googleapis.com/envoy.config.listener.v3.Listener",
    "type.googleapis.com/envoy.config.cluster.v3.Cluster",
];

fn is_full_state(type_url: &str) -> bool {
    FULL_STATE_TYPES.contains(&type_url)
}

/// Commands sent from the `UpstreamClient` to a worker.
pub(crate) enum WorkerCommand {
    /// Add or replace the subscription for a key.
    Subscribe {
        key: AggregationKey,
        id: SubscriptionId,
        request: VersionedRequest,
        on_response: ResponseCallback,
    },
    /// Remove the subscription for a key if it is still generation `id`.
    Unsubscribe {
        key: AggregationKey,
        id: SubscriptionId,
    },
}

/// Everything a worker needs from the client that spawns it.
pub(crate) struct WorkerContext {
    pub(crate) type_url: String,
    pub(crate) commands: mpsc::UnboundedReceiver<WorkerCommand>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) stats: Arc<UpstreamStats>,
}

struct Subscription {
    id: SubscriptionId,
    request: VersionedRequest,
    on_response: ResponseCallback,
    /// Whether a response has been routed to this subscription.
    answered: bool,
}

/// Why a stream ended.
#[derive(Debug)]
enum StreamExit {
    Shutdown,
    /// The last subscription went away.
    Idle,
    Failed(Error),
}

pub(crate) struct Worker<T, C> {
    type_url: String,
    transport: Arc<T>,
    codec: Arc<C>,
    config: UpstreamConfig,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    stats: Arc<UpstreamStats>,
    backoff: Backoff,
    subscriptions: BTreeMap<AggregationKey, Subscription>,
    /// Version of the last accepted response; survives reconnects.
    version_info: String,
    /// Nonce of the last response on the current stream.
    nonce: String,
    /// Resource names the current stream was last asked for.
    requested: Vec<String>,
    last_response: Option<VersionedResponse>,
    /// Resource names `last_response` was an answer to. Empty means wildcard.
    answered: Vec<String>,
}

impl<T, C> Worker<T, C>
where
    T: Transport,
    C: XdsCodec,
{
    pub(crate) fn new(
        transport: Arc<T>,
        codec: Arc<C>,
        config: UpstreamConfig,
        context: WorkerContext,
    ) -> Self {
        Self {
            type_url: context.type_url,
            transport,
            codec,
            backoff: Backoff::new(config.retry_policy.clone()),
            config,
            commands: context.commands,
            state: context.state,
            shutdown: context.shutdown,
            stats: context.stats,
            subscriptions: BTreeMap::new(),
            version_info: String::new(),
            nonce: String::new(),
            requested: Vec::new(),
            last_response: None,
            answered: Vec::new(),
        }
    }

    /// Run the worker until shutdown.
    pub(crate) async fn run(mut self) {
        debug!(type_url = %self.type_url, "upstream worker started");
        loop {
            // Nothing to ask for until someone subscribes.
            if !self.wait_for_subscriptions().await {
                break;
            }

            match self.connect_and_stream().await {
                StreamExit::Shutdown => break,
                StreamExit::Idle => {
                    self.set_state(ConnectionState::Disconnected);
                    self.version_info.clear();
                    self.last_response = None;
                    self.answered.clear();
                    debug!(type_url = %self.type_url, "closed idle upstream stream");
                }
                StreamExit::Failed(err) => {
                    self.set_state(ConnectionState::Disconnected);
                    if !self.back_off(&err).await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        debug!(type_url = %self.type_url, "upstream worker stopped");
    }

    /// Returns false if the worker should stop instead.
    async fn wait_for_subscriptions(&mut self) -> bool {
        while self.subscriptions.is_empty() {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => return false,
                },
            }
        }
        true
    }

    async fn connect_and_stream(&mut self) -> StreamExit {
        self.set_state(ConnectionState::Connecting);
        self.nonce.clear();
        self.stats.record_connect_attempt();

        let names = self.union_names();
        let initial = match self.encode_request(names.clone(), None) {
            Ok(initial) => initial,
            Err(err) => return StreamExit::Failed(err),
        };

        let transport = Arc::clone(&self.transport);
        let connected = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return StreamExit::Shutdown,
            result = transport.new_stream(&self.type_url, vec![initial]) => result,
        };
        let (sender, receiver) = match connected {
            Ok(halves) => halves,
            Err(err) => {
                self.stats.record_connect_failure();
                return StreamExit::Failed(err);
            }
        };

        self.stats.record_stream_opened();
        self.stats.record_request_sent();
        self.requested = names;
        self.set_state(ConnectionState::Streaming);
        info!(
            type_url = %self.type_url,
            subscriptions = self.subscriptions.len(),
            resources = self.requested.len(),
            "upstream stream established"
        );

        self.run_connected(sender, receiver).await
    }

    /// Run the event loop while streaming.
    async fn run_connected(&mut self, sender: T::Sender, mut receiver: T::Receiver) -> StreamExit {
        let (outbound, queue) = mpsc::channel(self.config.outbound_queue_size);
        let mut writer: JoinHandle<Result<()>> = tokio::spawn(write_requests(sender, queue));
        let mut writer_done = false;

        let exit = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break StreamExit::Shutdown,
                result = &mut writer => {
                    writer_done = true;
                    break StreamExit::Failed(match result {
                        Ok(Ok(())) => Error::StreamClosed,
                        Ok(Err(err)) => err,
                        Err(join) => Error::Stream(join.to_string()),
                    });
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break StreamExit::Shutdown;
                    };
                    self.apply(command);
                    // Coalesce whatever else is already queued into one request.
                    while let Ok(command) = self.commands.try_recv() {
                        self.apply(command);
                    }
                    if self.subscriptions.is_empty() {
                        break StreamExit::Idle;
                    }
                    if let Err(err) = self.resend_if_changed(&outbound) {
                        break StreamExit::Failed(err);
                    }
                }
                message = receiver.recv() => match message {
                    Ok(Some(bytes)) => {
                        if let Err(err) = self.handle_response(bytes, &outbound) {
                            break StreamExit::Failed(err);
                        }
                    }
                    Ok(None) => break StreamExit::Failed(Error::StreamClosed),
                    Err(err) => break StreamExit::Failed(err),
                },
            }
        };

        drop(outbound);
        match &exit {
            StreamExit::Failed(err) => {
                self.stats.record_stream_failure();
                warn!(type_url = %self.type_url, error = %err, "upstream stream failed");
                writer.abort();
            }
            StreamExit::Shutdown | StreamExit::Idle if !writer_done => {
                let deadline = self.config.shutdown_deadline;
                if tokio::time::timeout(deadline, &mut writer).await.is_err() {
                    warn!(type_url = %self.type_url, ?deadline, "outbound queue not flushed before deadline");
                    writer.abort();
                }
            }
            StreamExit::Shutdown | StreamExit::Idle => {}
        }
        drop(receiver);
        exit
    }

    /// Sleep before the next attempt, still applying commands.
    ///
    /// Returns false if the worker should stop instead.
    async fn back_off(&mut self, err: &Error) -> bool {
        let delay = self.backoff.next_backoff();
        let attempts = self.backoff.attempts();
        if self.backoff.past_ceiling() {
            error!(type_url = %self.type_url, attempts, ?delay, error = %err, "upstream still unreachable, retrying");
        } else {
            warn!(type_url = %self.type_url, attempts, ?delay, error = %err, "upstream disconnected, retrying");
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.apply(command);
                        if self.subscriptions.is_empty() {
                            return true;
                        }
                    }
                    None => return false,
                },
            }
        }
    }

    fn apply(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Subscribe {
                key,
                id,
                request,
                on_response,
            } => {
                let mut subscription = Subscription {
                    id,
                    request,
                    on_response,
                    answered: false,
                };
                // A key joining a live stream gets what the origin already
                // sent, but only if that response answered all of its names.
                // Otherwise it waits for the answer to the widened request.
                let replay = self
                    .last_response
                    .as_ref()
                    .filter(|_| self.covers(&subscription.request))
                    .and_then(|last| route(last, &subscription.request));
                if let Some(routed) = replay {
                    subscription.answered = true;
                    (subscription.on_response)(routed);
                }
                debug!(type_url = %self.type_url, key = %key, subscription = %id, "added upstream subscription");
                self.subscriptions.insert(key, subscription);
            }
            WorkerCommand::Unsubscribe { key, id } => {
                if self.subscriptions.get(&key).is_some_and(|s| s.id == id) {
                    self.subscriptions.remove(&key);
                    debug!(type_url = %self.type_url, key = %key, subscription = %id, "removed upstream subscription");
                } else {
                    trace!(type_url = %self.type_url, key = %key, subscription = %id, "ignoring stale unsubscribe");
                }
            }
        }
    }

    /// Whether `last_response` answered every name of `request`.
    fn covers(&self, request: &VersionedRequest) -> bool {
        if self.answered.is_empty() {
            return true;
        }
        !request.is_wildcard()
            && request
                .resource_names()
                .iter()
                .all(|name| self.answered.contains(name))
    }

    /// Resource names covering every subscription. Empty means wildcard.
    fn union_names(&self) -> Vec<String> {
        if self
            .subscriptions
            .values()
            .any(|s| s.request.is_wildcard())
        {
            return Vec::new();
        }
        let names: BTreeSet<&String> = self
            .subscriptions
            .values()
            .flat_map(|s| s.request.resource_names())
            .collect();
        names.into_iter().cloned().collect()
    }

    fn resend_if_changed(&mut self, outbound: &mpsc::Sender<Bytes>) -> Result<()> {
        let names = self.union_names();
        if names == self.requested {
            return Ok(());
        }
        let request = self.encode_request(names.clone(), None)?;
        self.enqueue(outbound, request)?;
        debug!(type_url = %self.type_url, resources = names.len(), "updated upstream resource names");
        self.requested = names;
        Ok(())
    }

    fn handle_response(&mut self, bytes: Bytes, outbound: &mpsc::Sender<Bytes>) -> Result<()> {
        self.stats.record_response_received();

        let Some(template) = self.template() else {
            return Ok(());
        };
        let response = match self.codec.decode_response(bytes, &template) {
            Ok(response) => response,
            Err(err) => {
                self.stats.record_response_malformed();
                warn!(type_url = %self.type_url, error = %err, "dropping undecodable response");
                return Ok(());
            }
        };

        // The stream is healthy once the origin answers.
        self.backoff.reset();
        self.nonce = response.nonce().to_owned();

        if !response.type_url().is_empty() && response.type_url() != self.type_url {
            self.stats.record_response_malformed();
            let message = format!(
                "expected type `{}`, got `{}`",
                self.type_url,
                response.type_url()
            );
            warn!(type_url = %self.type_url, nonce = %self.nonce, %message, "rejecting response");
            let nack = self.encode_request(
                self.requested.clone(),
                Some(ErrorDetail {
                    code: INVALID_ARGUMENT,
                    message,
                }),
            )?;
            return self.enqueue(outbound, nack);
        }

        trace!(
            type_url = %self.type_url,
            version = response.version_info(),
            nonce = %self.nonce,
            resources = response.raw_resources().len(),
            "received upstream response"
        );
        self.dispatch(&response);
        self.version_info = response.version_info().to_owned();
        self.last_response = Some(response);
        self.answered = self.requested.clone();

        let ack = self.encode_request(self.requested.clone(), None)?;
        self.enqueue(outbound, ack)
    }

    fn dispatch(&mut self, response: &VersionedResponse) {
        let full_state = is_full_state(&self.type_url);
        let mut matched = 0usize;
        for (key, subscription) in &mut self.subscriptions {
            if let Some(routed) = route(response, &subscription.request) {
                trace!(key = %key, resources = routed.raw_resources().len(), "routing response");
                (subscription.on_response)(routed);
                subscription.answered = true;
                matched += 1;
            } else if full_state && subscription.answered {
                // Everything this key had is gone.
                trace!(key = %key, version = response.version_info(), "routing removal");
                let emptied = response.retain(subscription.request.clone(), |_| false);
                (subscription.on_response)(emptied);
            }
        }
        if matched == 0 {
            self.stats.record_response_unmatched();
            debug!(
                type_url = %self.type_url,
                version = response.version_info(),
                "response matched no subscription"
            );
        }
    }

    /// Request whose node and revision are used for upstream requests.
    fn template(&self) -> Option<VersionedRequest> {
        self.subscriptions.values().next().map(|s| s.request.clone())
    }

    fn encode_request(
        &self,
        resource_names: Vec<String>,
        error_detail: Option<ErrorDetail>,
    ) -> Result<Bytes> {
        let template = self.template().ok_or_else(|| {
            Error::Validation(format!("no subscriptions for `{}`", self.type_url))
        })?;
        let request =
            template.for_upstream(resource_names, &self.version_info, &self.nonce, error_detail);
        self.codec.encode_request(&request)
    }

    fn enqueue(&self, outbound: &mpsc::Sender<Bytes>, request: Bytes) -> Result<()> {
        match outbound.try_send(request) {
            Ok(()) => {
                self.stats.record_request_sent();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.stats.record_queue_overflow();
                Err(Error::OutboundQueueFull {
                    type_url: self.type_url.clone(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(Error::StreamClosed),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(type_url = %self.type_url, ?state, "upstream connection state changed");
        }
    }
}

/// Single writer for a stream.
async fn write_requests<S: StreamSender>(
    mut sender: S,
    mut queue: mpsc::Receiver<Bytes>,
) -> Result<()> {
    while let Some(request) = queue.recv().await {
        sender.send(request).await?;
    }
    Ok(())
}

/// The part of `response` that belongs to `request`, if any.
///
/// Wildcard requests and empty responses take the response as is. Named
/// requests keep the resources whose name matches one of theirs, where a
/// trailing `*` matches any suffix.
fn route(response: &VersionedResponse, request: &VersionedRequest) -> Option<VersionedResponse> {
    if request.is_wildcard() || response.raw_resources().is_empty() {
        return Some(response.with_request(request.clone()));
    }
    let patterns = request.resource_names();
    let routed = response.retain(request.clone(), |name| {
        name.is_some_and(|name| patterns.iter().any(|p| name_matches(p, name)))
    });
    (!routed.raw_resources().is_empty()).then_some(routed)
}

fn name_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}
