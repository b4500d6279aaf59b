//! In-memory transport driven by the test
//!
//! Each `open_stream` creates a fresh channel-backed stream. The test pushes
//! events into the newest one, fails it, or closes it, and controls whether
//! the next opens are refused or stay silent.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use mcp_session::mcp::{EventStream, InvokeToolMessage, RetryConfig, SseEvent};
use mcp_session::{
    ClientConfig, McpClient, ServerEndpoint, SessionError, SessionResult, SessionSettings,
    Transport,
};

type StreamSender = mpsc::UnboundedSender<SessionResult<SseEvent>>;

#[derive(Default)]
struct Script {
    stream: Option<StreamSender>,
    refuse_opens: bool,
    silent: bool,
    stall_handshake: Option<Duration>,
    handshake_ids: VecDeque<String>,
    auto_reply: bool,
    send_error: Option<SessionError>,
    ack: Option<Value>,
    sent: Vec<InvokeToolMessage>,
    tools: Value,
    info: Value,
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
    opens: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let transport = Self::default();
        {
            let mut script = transport.script.lock().unwrap();
            script.tools = json!({"tools": [
                {"name": "readDirectory", "description": "List files in a directory"},
                {"name": "echo"}
            ]});
            script.info = json!({"name": "scripted", "version": "0.0.1"});
        }
        Arc::new(transport)
    }

    /// Number of stream opens so far
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Refuse subsequent stream opens
    pub fn refuse_opens(&self, refuse: bool) {
        self.script.lock().unwrap().refuse_opens = refuse;
    }

    /// Open streams without sending a handshake
    pub fn silent(&self, silent: bool) {
        self.script.lock().unwrap().silent = silent;
    }

    /// Deliver the next handshake only after blocking the reader's thread
    ///
    /// The reader cannot be aborted while blocked, so it still dispatches the
    /// handshake after the delay. Needs a multi-thread runtime.
    pub fn stall_next_handshake(&self, delay: Duration) {
        self.script.lock().unwrap().stall_handshake = Some(delay);
    }

    /// Session id for the next handshake; defaults to `session-<open>`
    pub fn queue_handshake(&self, session_id: &str) {
        self.script
            .lock()
            .unwrap()
            .handshake_ids
            .push_back(session_id.to_string());
    }

    /// Echo parameters back as a tool result for every posted invocation
    pub fn auto_reply(&self, enabled: bool) {
        self.script.lock().unwrap().auto_reply = enabled;
    }

    pub fn fail_sends(&self, error: SessionError) {
        self.script.lock().unwrap().send_error = Some(error);
    }

    pub fn acknowledge_with(&self, ack: Value) {
        self.script.lock().unwrap().ack = Some(ack);
    }

    pub fn sent(&self) -> Vec<InvokeToolMessage> {
        self.script.lock().unwrap().sent.clone()
    }

    /// Deliver an event on the current stream
    pub fn push(&self, event: SseEvent) -> bool {
        match &self.script.lock().unwrap().stream {
            Some(tx) => tx.send(Ok(event)).is_ok(),
            None => false,
        }
    }

    pub fn push_json(&self, value: Value) -> bool {
        self.push(SseEvent::message(value.to_string()))
    }

    /// End the current stream with a transport error
    pub fn fail_stream(&self, reason: &str) {
        if let Some(tx) = self.script.lock().unwrap().stream.take() {
            let _ = tx.send(Err(SessionError::stream(reason)));
        }
    }

    /// End the current stream cleanly
    pub fn close_stream(&self) {
        self.script.lock().unwrap().stream.take();
    }
}

pub fn text_result(request_id: &str, text: &str) -> Value {
    json!({
        "type": "tool_result",
        "id": request_id,
        "content": {"content": [{"type": "text", "text": text}]}
    })
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_stream(&self, _config: &ClientConfig) -> SessionResult<EventStream> {
        let open = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let mut script = self.script.lock().unwrap();
        if script.refuse_opens {
            return Err(SessionError::stream("connection refused"));
        }

        let handshake = (!script.silent).then(|| {
            let session_id = script
                .handshake_ids
                .pop_front()
                .unwrap_or_else(|| format!("session-{open}"));
            SseEvent::message(json!({"type": "connected", "clientId": session_id}).to_string())
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let events = UnboundedReceiverStream::new(rx);
        match (handshake, script.stall_handshake.take()) {
            (Some(handshake), Some(delay)) => {
                script.stream = Some(tx);
                let first = stream::once(async move {
                    std::thread::sleep(delay);
                    Ok(handshake)
                });
                Ok(Box::pin(first.chain(events)))
            }
            (handshake, _) => {
                if let Some(handshake) = handshake {
                    let _ = tx.send(Ok(handshake));
                }
                script.stream = Some(tx);
                Ok(Box::pin(events))
            }
        }
    }

    async fn send_message(
        &self,
        _config: &ClientConfig,
        message: &InvokeToolMessage,
    ) -> SessionResult<Value> {
        let mut script = self.script.lock().unwrap();
        script.sent.push(message.clone());
        if let Some(err) = &script.send_error {
            return Err(err.clone());
        }
        if script.auto_reply {
            if let Some(tx) = &script.stream {
                let text = message.content.parameters.to_string();
                let reply = text_result(&message.id, &text);
                let _ = tx.send(Ok(SseEvent::message(reply.to_string())));
            }
        }
        Ok(script
            .ack
            .clone()
            .unwrap_or_else(|| json!({"status": "accepted"})))
    }

    async fn fetch_json(&self, _config: &ClientConfig, path: &str) -> SessionResult<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        match path {
            "/tools" => Ok(script.tools.clone()),
            "/info" => Ok(script.info.clone()),
            other => Err(SessionError::request(format!("GET {other}: HTTP 404"))),
        }
    }
}

/// Fast settings: 500ms handshake, 2s requests, backoff 100ms doubling to 1s
pub fn test_config(max_attempts: u32) -> ClientConfig {
    ClientConfig::new(ServerEndpoint::new("127.0.0.1", 8080)).with_session(SessionSettings {
        request_timeout_ms: 2_000,
        handshake_timeout_ms: 500,
        reconnect: RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        },
        ..SessionSettings::default()
    })
}

pub fn client(transport: &Arc<ScriptedTransport>, max_attempts: u32) -> McpClient {
    McpClient::with_transport(test_config(max_attempts), transport.clone())
}

/// Let spawned tasks run without moving the clock far
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Wait until `condition` holds, polling on the (possibly paused) clock
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
