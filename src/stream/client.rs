//! Low-level stream websocket client.
//!
//! The client owns the connection-state machine and a background worker that
//! drives the socket: outbound calls are correlated to their replies by
//! envelope id, push frames are routed to the subscription registry, and
//! unexpected disconnects trigger automatic reconnection with configurable
//! backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::backoff::{with_timeout, ReconnectPolicy};
use crate::endpoint::Endpoint;
use crate::envelope::{InboundFrame, RpcRequest, RpcResponse, SubscriptionId};
use crate::stream::subscriptions::SubscriptionRegistry;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SUBSCRIBE_METHOD: &'static str = "subscribe";
    pub const UNSUBSCRIBE_METHOD: &'static str = "unsubscribe";
}

/// Configuration for a [`StreamConnection`].
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Timeout applied to subscribe/unsubscribe calls issued by the client
    /// itself.
    pub call_timeout: Duration,
    /// Wire method name for "subscribe to events matching a filter".
    pub subscribe_method: String,
    /// Wire method name for cancelling a subscription.
    pub unsubscribe_method: String,
    /// Reconnect pacing after an unexpected disconnect.
    pub reconnect: ReconnectPolicy,
    /// Optional API key sent as an `x-api-key` header on the handshake.
    pub api_key: Option<SecretString>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            call_timeout: StreamDefaults::CALL_TIMEOUT,
            subscribe_method: StreamDefaults::SUBSCRIBE_METHOD.to_string(),
            unsubscribe_method: StreamDefaults::UNSUBSCRIBE_METHOD.to_string(),
            reconnect: ReconnectPolicy::default(),
            api_key: None,
        }
    }
}

/// Connection lifecycle states owned by the stream worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),

    /// An operation requiring an open stream was attempted while not
    /// connected.
    #[error("stream is not connected")]
    NotConnected,

    /// No reply arrived within the allotted window.
    #[error("call to {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The connection dropped with the call still in flight.
    #[error("connection closed with call to {method} in flight")]
    ConnectionClosed { method: String },

    /// Server-reported error envelope for one call.
    #[error("{method} failed with code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    /// Stream protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

type EventCallback = Box<dyn FnMut(Value) + Send>;

enum Command {
    Call {
        request: RpcRequest,
        timeout: Duration,
        reply: oneshot::Sender<Result<Value, StreamError>>,
    },
    Subscribe {
        request: RpcRequest,
        timeout: Duration,
        filter: Value,
        handler: EventCallback,
        reply: oneshot::Sender<Result<SubscriptionId, StreamError>>,
    },
    Close,
}

struct PendingCall {
    method: String,
    deadline: Instant,
    timeout: Duration,
    kind: PendingKind,
}

enum PendingKind {
    Call {
        reply: oneshot::Sender<Result<Value, StreamError>>,
    },
    Subscribe {
        filter: Value,
        handler: EventCallback,
        reply: oneshot::Sender<Result<SubscriptionId, StreamError>>,
    },
}

struct Shared {
    url: String,
    options: StreamOptions,
    state_tx: watch::Sender<ConnectionState>,
    registry: SubscriptionRegistry,
    next_id: AtomicU64,
    // Worker generation: bumped by connect() so a worker superseded by
    // close()+connect() cannot clobber its successor's state.
    epoch: AtomicU64,
    command_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl Shared {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, epoch: u64, state: ConnectionState) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.state_tx.send_replace(state);
        }
    }

    fn commands(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Command>>> {
        self.command_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Persistent stream connection with automatic reconnection.
///
/// Constructed not-yet-connected; [`connect`](Self::connect) starts the
/// background worker and [`close`](Self::close) tears it down, stopping the
/// reconnect loop. Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct StreamConnection {
    shared: Arc<Shared>,
}

impl StreamConnection {
    /// Creates a connection handle for a websocket URL without connecting.
    pub fn new(url: impl Into<String>, options: StreamOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::NotConnected);
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                options,
                state_tx,
                registry: SubscriptionRegistry::new(),
                next_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                command_tx: Mutex::new(None),
            }),
        }
    }

    /// Creates a connection handle for an endpoint's stream URL.
    pub fn for_endpoint(endpoint: &Endpoint, options: StreamOptions) -> Self {
        Self::new(endpoint.stream_url(), options)
    }

    /// Opens the connection and waits for the initial handshake.
    ///
    /// Idempotent: when the worker is already connecting or connected this
    /// has no effect. After the initial handshake succeeds, the worker keeps
    /// reconnecting on its own until [`close`](Self::close); an initial
    /// handshake failure is returned to the caller instead of being retried.
    pub async fn connect(&self) -> Result<(), StreamError> {
        let ready_rx = {
            let mut commands = self.shared.commands();
            if let Some(tx) = commands.as_ref() {
                if !tx.is_closed() {
                    return Ok(());
                }
            }
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            *commands = Some(command_tx);
            let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(connection_worker(
                Arc::clone(&self.shared),
                epoch,
                command_rx,
                ready_tx,
            ));
            ready_rx
        };

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Protocol(
                "stream worker stopped before initial connect".to_string(),
            )),
        }
    }

    /// Closes the connection and stops the reconnect loop.
    ///
    /// The command channel is relinquished immediately, so a subsequent
    /// [`connect`](Self::connect) always starts a fresh worker instead of
    /// observing the one still shutting down.
    pub fn close(&self) {
        if let Some(tx) = self.shared.commands().take() {
            let _ = tx.send(Command::Close);
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch channel following connection-state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Number of active subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.shared.registry.len()
    }

    /// Issues a request over the open stream and awaits its reply.
    ///
    /// Fails with [`StreamError::NotConnected`] before any network attempt
    /// when the connection is not currently connected; there is no queuing
    /// while disconnected. Fails with [`StreamError::Timeout`] when no reply
    /// arrives within `timeout`.
    pub async fn rpc_call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, StreamError> {
        if self.state() != ConnectionState::Connected {
            return Err(StreamError::NotConnected);
        }

        let request = RpcRequest::new(self.shared.allocate_id(), method, params);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Call {
            request,
            timeout,
            reply: reply_tx,
        })?;

        match with_timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StreamError::ConnectionClosed {
                method: method.to_string(),
            }),
            Err(_) => Err(StreamError::Timeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Subscribes to events matching `filter` and installs `on_event`.
    ///
    /// Fails with whatever [`rpc_call`](Self::rpc_call) fails with; in
    /// particular it fails fast, not silently, while disconnected. The
    /// handler travels to the worker with the request and is registered at
    /// the moment the subscribe reply is matched, so a push event arriving
    /// right behind the reply is already routable. The filter is retained so
    /// the worker can re-establish the subscription after a reconnect.
    pub async fn subscribe<F>(
        &self,
        filter: Value,
        on_event: F,
    ) -> Result<SubscriptionId, StreamError>
    where
        F: FnMut(Value) + Send + 'static,
    {
        if self.state() != ConnectionState::Connected {
            return Err(StreamError::NotConnected);
        }

        let method = self.shared.options.subscribe_method.clone();
        let timeout = self.shared.options.call_timeout;
        let request =
            RpcRequest::new(self.shared.allocate_id(), &method, vec![filter.clone()]);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Subscribe {
            request,
            timeout,
            filter,
            handler: Box::new(on_event),
            reply: reply_tx,
        })?;

        match with_timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StreamError::ConnectionClosed { method }),
            Err(_) => Err(StreamError::Timeout {
                method,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Removes the subscription for `id`, reporting whether one was active.
    ///
    /// Idempotent and infallible: unknown ids return `false`. When an entry
    /// was removed and the stream is connected, a best-effort unsubscribe
    /// call is issued; its failure only logs.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.shared.registry.remove(id);
        if removed {
            let method = self.shared.options.unsubscribe_method.clone();
            match self
                .rpc_call(&method, vec![json!(id)], self.shared.options.call_timeout)
                .await
            {
                Ok(_) => {}
                Err(err) => {
                    debug!(event = "unsubscribe_call_failed", subscription = id, error = %err);
                }
            }
        }
        removed
    }

    fn send_command(&self, command: Command) -> Result<(), StreamError> {
        match self.shared.commands().as_ref() {
            Some(tx) if !tx.is_closed() => {
                tx.send(command).map_err(|_| StreamError::NotConnected)
            }
            _ => Err(StreamError::NotConnected),
        }
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

enum SessionOutcome {
    Shutdown,
    Reconnect,
}

async fn connection_worker(
    shared: Arc<Shared>,
    epoch: u64,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    ready_tx: oneshot::Sender<Result<(), StreamError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut failed_attempts: u32 = 0;

    loop {
        shared.set_state(epoch, ConnectionState::Connecting);
        match run_connected_session(&shared, epoch, &mut command_rx, &mut ready_tx).await {
            Ok(SessionOutcome::Shutdown) => break,
            Ok(SessionOutcome::Reconnect) => {
                shared.set_state(epoch, ConnectionState::NotConnected);
                failed_attempts = 0;
                debug!(event = "stream_disconnected");
            }
            Err(err) => {
                shared.set_state(epoch, ConnectionState::NotConnected);
                if let Some(tx) = ready_tx.take() {
                    // Initial connect failed: report to the caller, retrying
                    // is its decision.
                    let _ = tx.send(Err(err));
                    break;
                }
                failed_attempts += 1;
                warn!(event = "stream_connect_failed", attempt = failed_attempts, error = %err);
            }
        }

        let next_attempt = failed_attempts + 1;
        if !shared.options.reconnect.allows_attempt(next_attempt) {
            warn!(event = "stream_reconnect_exhausted", attempts = failed_attempts);
            break;
        }
        let delay = shared.options.reconnect.delay_for_attempt(next_attempt);
        if !wait_before_reconnect(delay, &mut command_rx).await {
            break;
        }
    }

    shared.set_state(epoch, ConnectionState::NotConnected);
}

async fn run_connected_session(
    shared: &Shared,
    epoch: u64,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    ready_tx: &mut Option<oneshot::Sender<Result<(), StreamError>>>,
) -> Result<SessionOutcome, StreamError> {
    let mut request = shared.url.as_str().into_client_request()?;
    if let Some(api_key) = shared.options.api_key.as_ref() {
        let header = api_key.expose_secret().parse()?;
        request.headers_mut().insert("x-api-key", header);
    }

    let (mut socket, _) = connect_async(request).await?;

    shared.set_state(epoch, ConnectionState::Connected);
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Ok(()));
    }
    debug!(event = "stream_connected", url = %shared.url);

    resubscribe_all(shared, &mut socket).await?;

    let mut pending: HashMap<u64, PendingCall> = HashMap::new();

    loop {
        let sweep_at = next_deadline(&pending);

        tokio::select! {
            maybe_command = command_rx.recv() => {
                match maybe_command {
                    Some(Command::Call { request, timeout, reply }) => {
                        let kind = PendingKind::Call { reply };
                        if let Some(outcome) =
                            send_request(&mut socket, &mut pending, request, timeout, kind).await
                        {
                            return Ok(outcome);
                        }
                    }
                    Some(Command::Subscribe { request, timeout, filter, handler, reply }) => {
                        let kind = PendingKind::Subscribe { filter, handler, reply };
                        if let Some(outcome) =
                            send_request(&mut socket, &mut pending, request, timeout, kind).await
                        {
                            return Ok(outcome);
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = socket.close(None).await;
                        fail_pending(&mut pending);
                        return Ok(SessionOutcome::Shutdown);
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_text(shared, &mut pending, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            fail_pending(&mut pending);
                            return Ok(SessionOutcome::Reconnect);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        fail_pending(&mut pending);
                        return Ok(SessionOutcome::Reconnect);
                    }
                    Some(Ok(other)) => {
                        warn!(event = "stream_frame_unexpected", kind = frame_kind(&other));
                    }
                }
            }
            _ = tokio::time::sleep_until(
                sweep_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
            ), if sweep_at.is_some() => {
                sweep_expired(&mut pending, Instant::now());
            }
        }
    }
}

/// Writes one request frame and tracks it as pending.
///
/// Returns the session outcome when the socket rejected the write and the
/// session must reconnect.
async fn send_request(
    socket: &mut WsStream,
    pending: &mut HashMap<u64, PendingCall>,
    request: RpcRequest,
    timeout: Duration,
    kind: PendingKind,
) -> Option<SessionOutcome> {
    let method = request.method.clone();
    let text = match request.to_text() {
        Ok(text) => text,
        Err(err) => {
            fail_one(kind, StreamError::Json(err));
            return None;
        }
    };

    if socket.send(Message::Text(text)).await.is_err() {
        fail_one(kind, StreamError::ConnectionClosed { method });
        fail_pending(pending);
        return Some(SessionOutcome::Reconnect);
    }

    pending.insert(
        request.id,
        PendingCall {
            method,
            deadline: Instant::now() + timeout,
            timeout,
            kind,
        },
    );
    None
}

/// Classifies one inbound text frame and routes it.
///
/// Push events go to the subscription registry; replies complete their
/// pending call. For a subscribe reply the handler is registered here,
/// before any further frame is read, so the first push for the new id is
/// never dropped. Malformed frames are logged and dropped without disturbing
/// other in-flight calls.
fn handle_inbound_text(shared: &Shared, pending: &mut HashMap<u64, PendingCall>, text: &str) {
    match InboundFrame::from_text(text) {
        Ok(InboundFrame::Push(push)) => {
            shared.registry.dispatch(push.subscription, push.result);
        }
        Ok(InboundFrame::Reply(reply)) => match pending.remove(&reply.id) {
            Some(call) => complete_call(shared, call, reply),
            None => {
                // Reply for a call that already timed out or predates a drop.
                debug!(event = "stream_reply_unmatched", id = reply.id);
            }
        },
        Err(err) => {
            warn!(event = "stream_frame_malformed", error = %err);
        }
    }
}

fn complete_call(shared: &Shared, call: PendingCall, reply: RpcResponse) {
    let method = call.method;
    match call.kind {
        PendingKind::Call { reply: reply_tx } => {
            let result = reply.into_result().map_err(|error| StreamError::Rpc {
                method,
                code: error.code,
                message: error.message,
            });
            let _ = reply_tx.send(result);
        }
        PendingKind::Subscribe {
            filter,
            handler,
            reply: reply_tx,
        } => {
            let outcome = match reply.into_result() {
                Ok(value) => match value.as_u64() {
                    Some(id) => {
                        shared.registry.insert(id, filter, handler);
                        Ok(id)
                    }
                    None => Err(StreamError::Protocol(format!(
                        "subscribe reply was not a numeric subscription id: {value}"
                    ))),
                },
                Err(error) => Err(StreamError::Rpc {
                    method,
                    code: error.code,
                    message: error.message,
                }),
            };
            let _ = reply_tx.send(outcome);
        }
    }
}

/// Fails every in-flight call; calls issued before a drop never resurrect.
fn fail_pending(pending: &mut HashMap<u64, PendingCall>) {
    for (_, call) in pending.drain() {
        let method = call.method;
        fail_one(call.kind, StreamError::ConnectionClosed { method });
    }
}

fn fail_one(kind: PendingKind, error: StreamError) {
    match kind {
        PendingKind::Call { reply } => {
            let _ = reply.send(Err(error));
        }
        PendingKind::Subscribe { reply, .. } => {
            let _ = reply.send(Err(error));
        }
    }
}

fn next_deadline(pending: &HashMap<u64, PendingCall>) -> Option<Instant> {
    pending.values().map(|call| call.deadline).min()
}

/// Removes every pending call whose deadline has passed.
///
/// The caller side usually gave up already; completing the slot with a
/// timeout keeps the map from accumulating calls the server never answers,
/// and a reply arriving later is handled as unmatched.
fn sweep_expired(pending: &mut HashMap<u64, PendingCall>, now: Instant) {
    let expired: Vec<u64> = pending
        .iter()
        .filter(|(_, call)| call.deadline <= now)
        .map(|(id, _)| *id)
        .collect();

    for id in expired {
        if let Some(call) = pending.remove(&id) {
            debug!(event = "stream_call_expired", id, method = %call.method);
            let timeout_ms = call.timeout.as_millis() as u64;
            let method = call.method;
            fail_one(call.kind, StreamError::Timeout { method, timeout_ms });
        }
    }
}

/// Re-establishes every active subscription on a fresh connection.
///
/// Each stored filter is replayed through the subscribe method and the
/// existing handler is rebound to the newly issued id. A subscription the
/// peer rejects is removed and logged; its handler stops receiving events.
async fn resubscribe_all(shared: &Shared, socket: &mut WsStream) -> Result<(), StreamError> {
    for (old_id, filter) in shared.registry.snapshot() {
        let request = RpcRequest::new(
            shared.allocate_id(),
            &shared.options.subscribe_method,
            vec![filter],
        );
        let request_id = request.id;
        socket.send(Message::Text(request.to_text()?)).await?;

        match await_reply(shared, socket, request_id).await? {
            Ok(value) => match value.as_u64() {
                Some(new_id) => {
                    if shared.registry.rebind(old_id, new_id) {
                        debug!(event = "subscription_restored", old = old_id, new = new_id);
                    }
                }
                None => {
                    shared.registry.remove(old_id);
                    warn!(
                        event = "subscription_lost",
                        subscription = old_id,
                        reason = "non-numeric resubscribe reply"
                    );
                }
            },
            Err(error) => {
                shared.registry.remove(old_id);
                warn!(
                    event = "subscription_lost",
                    subscription = old_id,
                    code = error.code,
                    message = %error.message
                );
            }
        }
    }
    Ok(())
}

async fn await_reply(
    shared: &Shared,
    socket: &mut WsStream,
    id: u64,
) -> Result<Result<Value, crate::envelope::RpcErrorObject>, StreamError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => match InboundFrame::from_text(&text) {
                Ok(InboundFrame::Push(push)) => {
                    shared.registry.dispatch(push.subscription, push.result);
                }
                Ok(InboundFrame::Reply(reply)) if reply.id == id => {
                    return Ok(reply.into_result());
                }
                Ok(InboundFrame::Reply(reply)) => {
                    debug!(event = "stream_reply_unmatched", id = reply.id);
                }
                Err(err) => {
                    warn!(event = "stream_frame_malformed", error = %err);
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(StreamError::Protocol(
                    "socket closed during resubscription".to_string(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(StreamError::WebSocket(err)),
            None => {
                return Err(StreamError::Protocol(
                    "socket ended during resubscription".to_string(),
                ));
            }
        }
    }
}

async fn wait_before_reconnect(
    delay: Duration,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_command = command_rx.recv() => {
                match maybe_command {
                    Some(Command::Call { reply, .. }) => {
                        // No queuing while disconnected.
                        let _ = reply.send(Err(StreamError::NotConnected));
                    }
                    Some(Command::Subscribe { reply, .. }) => {
                        let _ = reply.send(Err(StreamError::NotConnected));
                    }
                    Some(Command::Close) | None => return false,
                }
            }
        }
    }
}

fn frame_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    use super::{
        handle_inbound_text, sweep_expired, ConnectionState, PendingCall, PendingKind,
        StreamConnection, StreamError, StreamOptions,
    };

    fn disconnected_connection() -> StreamConnection {
        StreamConnection::new("ws://127.0.0.1:1", StreamOptions::default())
    }

    fn pending_call(
        method: &str,
        deadline: Instant,
    ) -> (PendingCall, oneshot::Receiver<Result<serde_json::Value, StreamError>>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call = PendingCall {
            method: method.to_string(),
            deadline,
            timeout: Duration::from_millis(50),
            kind: PendingKind::Call { reply: reply_tx },
        };
        (call, reply_rx)
    }

    #[test]
    fn new_connection_starts_not_connected() {
        let connection = disconnected_connection();
        assert_eq!(connection.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn rpc_call_fails_fast_while_not_connected() {
        let connection = disconnected_connection();
        let result = connection
            .rpc_call("getObject", vec![json!("0x2")], Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(StreamError::NotConnected)));
    }

    #[tokio::test]
    async fn subscribe_fails_not_silently_noops_while_not_connected() {
        let connection = disconnected_connection();
        let result = connection.subscribe(json!({"kind": "all"}), |_| {}).await;
        assert!(matches!(result, Err(StreamError::NotConnected)));
        assert_eq!(connection.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_of_unknown_id_returns_false_without_error() {
        let connection = disconnected_connection();
        assert!(!connection.unsubscribe(42).await);
    }

    #[tokio::test]
    async fn initial_connect_failure_is_reported_to_the_caller() {
        let connection = disconnected_connection();
        let result = connection.connect().await;
        assert!(matches!(result, Err(StreamError::WebSocket(_))));
        assert_eq!(connection.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn push_right_behind_subscribe_reply_reaches_handler() {
        let connection = disconnected_connection();
        let shared = &connection.shared;
        let mut pending = HashMap::new();

        let (reply_tx, mut reply_rx) = oneshot::channel();
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        pending.insert(
            5,
            PendingCall {
                method: "subscribe".to_string(),
                deadline: Instant::now() + Duration::from_secs(1),
                timeout: Duration::from_secs(1),
                kind: PendingKind::Subscribe {
                    filter: json!({"kind": "all"}),
                    handler: Box::new(move |event| {
                        let _ = event_tx.send(event);
                    }),
                    reply: reply_tx,
                },
            },
        );

        // Reply and push processed back to back, with no chance for the
        // subscriber's task to run in between.
        handle_inbound_text(shared, &mut pending, r#"{"id":5,"result":777}"#);
        handle_inbound_text(
            shared,
            &mut pending,
            r#"{"method":"subscription","params":{"subscription":777,"result":{"seq":1}}}"#,
        );

        let event = event_rx
            .try_recv()
            .expect("handler must already hold the first event");
        assert_eq!(event, json!({"seq": 1}));

        let id = reply_rx
            .try_recv()
            .expect("subscribe reply delivered")
            .expect("subscribe succeeded");
        assert_eq!(id, 777);
        assert_eq!(connection.active_subscriptions(), 1);
    }

    #[test]
    fn sweep_removes_timed_out_calls_and_completes_them_with_timeout() {
        let mut pending = HashMap::new();
        let now = Instant::now();

        let (expired, mut expired_rx) = pending_call("neverAnswered", now);
        pending.insert(1, expired);
        let (live, _live_rx) = pending_call("stillWaiting", now + Duration::from_secs(60));
        pending.insert(2, live);

        sweep_expired(&mut pending, now);

        assert!(!pending.contains_key(&1));
        assert!(pending.contains_key(&2));
        let completion = expired_rx.try_recv().expect("expired call completed");
        assert!(matches!(
            completion,
            Err(StreamError::Timeout { ref method, .. }) if method == "neverAnswered"
        ));
    }

    #[test]
    fn reply_for_swept_call_is_dropped_as_unmatched() {
        let connection = disconnected_connection();
        let shared = &connection.shared;
        let mut pending = HashMap::new();

        let now = Instant::now();
        let (expired, _reply_rx) = pending_call("neverAnswered", now);
        pending.insert(9, expired);
        sweep_expired(&mut pending, now);
        assert!(pending.is_empty());

        // The late reply no longer matches anything and must not disturb the
        // dispatch path.
        handle_inbound_text(shared, &mut pending, r#"{"id":9,"result":"late"}"#);
        assert!(pending.is_empty());
    }
}
