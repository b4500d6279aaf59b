//! MCP Client Implementation
//!
//! Owns one event-stream connection to an MCP tool server:
//! - Handshake detection and session identifier tracking
//! - Tool invocation bound to the session, results routed through the
//!   correlation table
//! - Reconnection with exponential backoff after stream loss
//!
//! # Example
//!
//! ```ignore
//! let client = McpClient::new(ClientConfig::new(ServerEndpoint::new("127.0.0.1", 8080)));
//! client.connect().await?;
//! let result = client.invoke_tool("readDirectory", json!({"dirPath": "."})).await?;
//! client.disconnect();
//! ```
//!
//! Each stream open bumps a connection generation. The reader task, the
//! handshake timeout and scheduled reconnects all carry the generation they
//! were started for and do nothing once it is stale.

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::correlation::{CorrelationTable, PendingCall, PendingInfo};
use super::event::{self, SseEvent, StreamEvent};
use super::protocol::{self, InvokeToolMessage, ServerInfo, ToolInfo, ToolResult};
use super::reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
use super::server_config::ClientConfig;
use super::transport::{HttpTransport, Transport};
use super::SessionStatus;
use crate::error::{SessionError, SessionResult};

/// Status transition delivered to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub status: SessionStatus,
    pub error: Option<String>,
    pub session_id: Option<String>,
    /// Reconnect attempts used when the transition happened
    pub attempt: u32,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub endpoint: String,
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub last_error: Option<String>,
    pub pending_requests: usize,
    pub reconnect_attempts: u32,
}

type StatusObserver = Arc<dyn Fn(&StatusChange) + Send + Sync>;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// MCP session client
///
/// Cheap to clone; clones share one session. Dropping the last clone closes
/// the stream and stops any scheduled reconnect.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    table: Arc<CorrelationTable>,
    state: Mutex<SessionState>,
    observers: Mutex<Vec<StatusObserver>>,
    status_tx: broadcast::Sender<StatusChange>,
    tools_cache: Mutex<Option<Vec<ToolInfo>>>,
}

struct SessionState {
    status: SessionStatus,
    session_id: Option<String>,
    last_error: Option<String>,
    generation: u64,
    reader: Option<JoinHandle<()>>,
    handshake: Option<oneshot::Sender<SessionResult<String>>>,
    reconnect: ReconnectState,
    reconnect_task: Option<JoinHandle<()>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            session_id: None,
            last_error: None,
            generation: 0,
            reader: None,
            handshake: None,
            reconnect: ReconnectState::default(),
            reconnect_task: None,
        }
    }

    /// Apply a transition; `None` when nothing observable changed
    fn transition(&mut self, status: SessionStatus, error: Option<String>) -> Option<StatusChange> {
        let changed = self.status != status || (error.is_some() && self.last_error != error);
        self.status = status;
        match status {
            SessionStatus::Connected | SessionStatus::Disconnected => self.last_error = None,
            _ => {
                if error.is_some() {
                    self.last_error = error.clone();
                }
            }
        }

        changed.then(|| StatusChange {
            status,
            error,
            session_id: self.session_id.clone(),
            attempt: self.reconnect.attempt_count(),
        })
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.handshake = None;
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

impl McpClient {
    /// Client over HTTP with an SSE event stream
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport::new()))
    }

    /// Client over a custom transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let policy = ReconnectPolicy::from(&config.session.reconnect);

        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                transport,
                table: CorrelationTable::new(),
                state: Mutex::new(SessionState::new()),
                observers: Mutex::new(Vec::new()),
                status_tx,
                tools_cache: Mutex::new(None),
            }),
        }
    }

    /// Open the event stream and wait for the session handshake
    ///
    /// Returns immediately when already connected. A caller-initiated connect
    /// cancels any scheduled reconnect and resets the attempt count. On
    /// failure the reconnect policy has already been engaged.
    pub async fn connect(&self) -> SessionResult<SessionSnapshot> {
        {
            let mut state = self.inner.lock_state();
            if state.status == SessionStatus::Connected {
                drop(state);
                return Ok(self.snapshot());
            }
            state.cancel_reconnect();
            state.reconnect.reset();
        }

        Inner::open(&self.inner).await?;
        Ok(self.snapshot())
    }

    /// Close the stream and reject everything pending
    ///
    /// Cancels a scheduled reconnect and resets the attempt count, so nothing
    /// reconnects on its own afterwards.
    pub fn disconnect(&self) {
        let change = {
            let mut state = self.inner.lock_state();
            state.stop_reader();
            state.cancel_reconnect();
            state.reconnect.reset();
            state.generation += 1;
            state.session_id = None;
            state.transition(SessionStatus::Disconnected, None)
        };

        let rejected = self
            .inner
            .table
            .reject_all(SessionError::connection_closed("connection closed"));
        *lock(&self.inner.tools_cache) = None;

        if let Some(change) = change {
            tracing::info!(endpoint = %self.inner.config.endpoint, rejected, "disconnected");
            self.inner.emit(change);
        }
    }

    /// Invoke a tool with the configured request timeout
    pub async fn invoke_tool(&self, tool_name: &str, parameters: Value) -> SessionResult<ToolResult> {
        self.begin_invocation(tool_name, parameters, None)?.await
    }

    /// Invoke a tool with an explicit request timeout
    pub async fn invoke_tool_with_timeout(
        &self,
        tool_name: &str,
        parameters: Value,
        timeout: Duration,
    ) -> SessionResult<ToolResult> {
        self.begin_invocation(tool_name, parameters, Some(timeout))?
            .await
    }

    /// Register an invocation now and return the future that sends it
    ///
    /// Fails synchronously with `MissingSession` unless the session is
    /// connected; in that case nothing is registered or sent. The request is
    /// in the correlation table before this returns.
    pub fn begin_invocation(
        &self,
        tool_name: &str,
        parameters: Value,
        timeout: Option<Duration>,
    ) -> SessionResult<impl Future<Output = SessionResult<ToolResult>> + Send + 'static> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.session.request_timeout());
        let request_id = format!("msg-{}", Uuid::new_v4());

        let (session_id, pending) = {
            let state = self.inner.lock_state();
            let session_id = match (&state.status, &state.session_id) {
                (SessionStatus::Connected, Some(session_id)) => session_id.clone(),
                _ => {
                    tracing::warn!(tool = tool_name, status = %state.status, "invocation without session");
                    return Err(SessionError::MissingSession);
                }
            };
            // Registered under the state lock so a concurrent disconnect
            // either precedes the check or drains this entry.
            let pending =
                self.inner
                    .table
                    .register(request_id.clone(), tool_name, parameters.clone(), timeout)?;
            (session_id, pending)
        };

        let message = InvokeToolMessage::new(request_id, tool_name, parameters, session_id);
        let inner = Arc::clone(&self.inner);
        Ok(async move { inner.send_invocation(message, pending).await })
    }

    /// Tools advertised by the server, cached until disconnect or stream loss
    pub async fn list_tools(&self) -> SessionResult<Vec<ToolInfo>> {
        if let Some(tools) = lock(&self.inner.tools_cache).clone() {
            return Ok(tools);
        }
        self.refresh_tools().await
    }

    /// Fetch the tool catalogue, bypassing the cache
    pub async fn refresh_tools(&self) -> SessionResult<Vec<ToolInfo>> {
        let config = &self.inner.config;
        let value = self
            .inner
            .transport
            .fetch_json(config, &config.session.tools_path)
            .await?;
        let tools = protocol::parse_tool_list(value)?;
        tracing::debug!(count = tools.len(), "retrieved tool catalogue");

        *lock(&self.inner.tools_cache) = Some(tools.clone());
        Ok(tools)
    }

    /// Server name and version
    pub async fn server_info(&self) -> SessionResult<ServerInfo> {
        let config = &self.inner.config;
        let value = self
            .inner
            .transport
            .fetch_json(config, &config.session.info_path)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| SessionError::invalid_payload(format!("server info: {e}")))
    }

    /// Register a status observer
    pub fn on_status_change<F>(&self, observer: F)
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        lock(&self.inner.observers).push(Arc::new(observer));
    }

    /// Subscribe to status transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock_state().status
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock_state().session_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_state().reconnect.attempt_count()
    }

    pub fn pending_requests(&self) -> Vec<PendingInfo> {
        self.inner.table.snapshot()
    }

    /// Reject one pending request with `Cancelled`
    pub fn cancel(&self, request_id: &str) -> bool {
        self.inner.table.cancel(request_id)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.lock_state();
        SessionSnapshot {
            endpoint: self.inner.config.endpoint.base_url(),
            status: state.status,
            session_id: state.session_id.clone(),
            last_error: state.last_error.clone(),
            pending_requests: self.inner.table.len(),
            reconnect_attempts: state.reconnect.attempt_count(),
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    fn emit(&self, change: StatusChange) {
        let observers = lock(&self.observers).clone();
        for observer in observers {
            observer(&change);
        }
        // No subscribers is fine
        let _ = self.status_tx.send(change);
    }

    /// Start a new stream generation and wait for its handshake
    async fn open(self: &Arc<Self>) -> SessionResult<String> {
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let (generation, change) = {
            let mut state = self.lock_state();
            state.stop_reader();
            state.generation += 1;
            state.session_id = None;
            state.handshake = Some(handshake_tx);
            let change = state.transition(SessionStatus::Connecting, None);
            (state.generation, change)
        };
        if let Some(change) = change {
            self.emit(change);
        }

        tracing::info!(endpoint = %self.config.endpoint, generation, "connecting");
        let reader = tokio::spawn(read_stream(Arc::downgrade(self), generation));
        {
            let mut state = self.lock_state();
            if state.generation == generation {
                state.reader = Some(reader);
            } else {
                reader.abort();
            }
        }

        let timeout = self.config.session.handshake_timeout();
        match tokio::time::timeout(timeout, handshake_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.open_failure()),
            Err(_) => {
                {
                    // Handshake landed while the timer fired
                    let state = self.lock_state();
                    if state.generation == generation && state.status == SessionStatus::Connected {
                        if let Some(session_id) = state.session_id.clone() {
                            return Ok(session_id);
                        }
                    }
                }
                let err = SessionError::HandshakeTimeout {
                    endpoint: self.config.endpoint.base_url(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                self.handshake_timed_out(generation, &err);
                Err(err)
            }
        }
    }

    /// Error for a handshake wait abandoned without an outcome
    fn open_failure(&self) -> SessionError {
        if self.lock_state().status == SessionStatus::Disconnected {
            SessionError::connection_closed("disconnected during handshake")
        } else {
            SessionError::connection_closed("superseded by another connection attempt")
        }
    }

    fn handshake_timed_out(self: &Arc<Self>, generation: u64, err: &SessionError) {
        let change = {
            let mut state = self.lock_state();
            if state.generation != generation || state.status != SessionStatus::Connecting {
                return;
            }
            // A reader already holding the handshake must find itself stale
            state.generation += 1;
            state.stop_reader();
            state.session_id = None;
            state.transition(SessionStatus::Error, Some(err.to_string()))
        };

        tracing::warn!(%err, "handshake timed out");
        if let Some(change) = change {
            self.emit(change);
        }
        self.schedule_reconnect();
    }

    fn dispatch(&self, generation: u64, raw: &SseEvent) {
        match event::parse(raw) {
            Ok(StreamEvent::Handshake(handshake)) => {
                self.handshake_received(generation, handshake.session_id)
            }
            Ok(StreamEvent::ToolResult(result)) => match result.request_id {
                Some(request_id) => {
                    self.table.resolve(&request_id, result.payload);
                }
                None => {
                    self.table.resolve_latest(result.payload);
                }
            },
            Ok(StreamEvent::ServerError(error)) => match error.request_id {
                Some(request_id) => {
                    self.table.fail(&request_id, &error.message);
                }
                None => tracing::warn!(message = %error.message, "server reported error"),
            },
            Ok(StreamEvent::Ping) => tracing::trace!("ping"),
            Ok(StreamEvent::Unrecognized(payload)) => {
                tracing::debug!(event = %raw.event, %payload, "ignoring unrecognized event")
            }
            Err(err) => tracing::warn!(%err, data = %raw.data, "dropping malformed event"),
        }
    }

    fn handshake_received(&self, generation: u64, session_id: String) {
        let (change, waiter) = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            if !matches!(
                state.status,
                SessionStatus::Connecting | SessionStatus::Connected
            ) {
                tracing::warn!(%session_id, status = %state.status, "ignoring handshake outside a connection attempt");
                return;
            }
            if state.session_id.as_deref() == Some(session_id.as_str()) {
                tracing::trace!(%session_id, "repeated handshake");
                return;
            }
            if let Some(previous) = state.session_id.replace(session_id.clone()) {
                tracing::warn!(%previous, %session_id, "server replaced session identifier");
            }
            state.reconnect.reset();
            // Succeeded; the task that scheduled this attempt is finishing
            state.reconnect_task = None;
            let waiter = state.handshake.take();
            (state.transition(SessionStatus::Connected, None), waiter)
        };

        tracing::info!(%session_id, endpoint = %self.config.endpoint, "session established");
        if let Some(change) = change {
            self.emit(change);
        }
        // Observers see Connected before connect() returns
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(session_id));
        }
    }

    fn stream_lost(self: &Arc<Self>, generation: u64, err: SessionError) {
        let (change, waiter) = {
            let mut state = self.lock_state();
            if state.generation != generation
                || !matches!(
                    state.status,
                    SessionStatus::Connecting | SessionStatus::Connected
                )
            {
                tracing::debug!(%err, "ignoring loss of superseded stream");
                return;
            }
            // This runs on the reader task itself; detach rather than abort
            state.reader = None;
            state.session_id = None;
            let waiter = state.handshake.take();
            (state.transition(SessionStatus::Error, Some(err.to_string())), waiter)
        };

        tracing::warn!(%err, endpoint = %self.config.endpoint, "event stream lost");
        self.table
            .reject_all(SessionError::connection_closed(format!("session lost: {err}")));
        // The server may come back with a different catalogue
        *lock(&self.tools_cache) = None;
        if let Some(change) = change {
            self.emit(change);
        }
        self.schedule_reconnect();
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(err));
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let exhausted = {
            let mut state = self.lock_state();
            if state.status != SessionStatus::Error {
                return;
            }
            match state.reconnect.next(&self.policy) {
                ReconnectDecision::Exhausted { attempts } => {
                    let err = SessionError::ReconnectExhausted { attempts };
                    tracing::error!(endpoint = %self.config.endpoint, %err, "giving up on reconnect");
                    state.transition(SessionStatus::Error, Some(err.to_string()))
                }
                ReconnectDecision::Retry { attempt, delay } => {
                    let generation = state.generation;
                    tracing::info!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    let weak = Arc::downgrade(self);
                    state.cancel_reconnect();
                    state.reconnect_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let Some(inner) = weak.upgrade() else {
                            return;
                        };
                        if !inner.reconnect_wanted(generation) {
                            return;
                        }
                        if let Err(err) = Inner::open(&inner).await {
                            tracing::debug!(attempt, %err, "reconnect attempt failed");
                        }
                    }));
                    None
                }
            }
        };

        if let Some(change) = exhausted {
            self.emit(change);
        }
    }

    fn reconnect_wanted(&self, generation: u64) -> bool {
        let state = self.lock_state();
        state.generation == generation && state.status == SessionStatus::Error
    }

    async fn send_invocation(
        &self,
        message: InvokeToolMessage,
        pending: PendingCall,
    ) -> SessionResult<ToolResult> {
        let request_id = message.id.clone();
        tracing::debug!(
            %request_id,
            tool = %message.content.name,
            parameters = %message.content.parameters,
            "invoking tool"
        );

        match self.transport.send_message(&self.config, &message).await {
            Ok(ack) => {
                if let Some(reason) = protocol::acknowledgement_error(&ack) {
                    let err = SessionError::ToolFailed {
                        tool: message.content.name.clone(),
                        message: reason,
                    };
                    self.table.reject(&request_id, err.clone());
                    return Err(err);
                }
            }
            Err(err) => {
                tracing::warn!(%request_id, %err, "failed to send invocation");
                self.table.reject(&request_id, err.clone());
                return Err(err);
            }
        }

        let payload = pending.await?;
        Ok(ToolResult::new(request_id, payload))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.stop_reader();
        state.cancel_reconnect();
    }
}

/// Reader task for one stream generation
///
/// Holds only a weak reference so a dropped client is not kept alive by its
/// own stream.
async fn read_stream(weak: Weak<Inner>, generation: u64) {
    let opened = {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let transport = Arc::clone(&inner.transport);
        let config = inner.config.clone();
        drop(inner);
        transport.open_stream(&config).await
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(err) => {
            if let Some(inner) = weak.upgrade() {
                inner.stream_lost(generation, err);
            }
            return;
        }
    };

    while let Some(item) = stream.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match item {
            Ok(raw) => inner.dispatch(generation, &raw),
            Err(err) => {
                inner.stream_lost(generation, err);
                return;
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        inner.stream_lost(generation, SessionError::stream("event stream closed"));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
