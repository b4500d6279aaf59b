//! Transport seam between the session layer and the network
//!
//! The session layer only sees a stream of raw events and two request
//! operations. `HttpTransport` provides them over HTTP with a Server-Sent-Events
//! stream; tests substitute an in-memory implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest_eventsource::{retry, Event, EventSource};
use serde_json::Value;

use super::event::SseEvent;
use super::protocol::InvokeToolMessage;
use super::server_config::ClientConfig;
use crate::error::{SessionError, SessionResult};

/// Raw events of one stream connection; an `Err` item ends the connection
pub type EventStream = BoxStream<'static, SessionResult<SseEvent>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the server event stream
    async fn open_stream(&self, config: &ClientConfig) -> SessionResult<EventStream>;

    /// Post a tool invocation and return the server acknowledgement
    async fn send_message(
        &self,
        config: &ClientConfig,
        message: &InvokeToolMessage,
    ) -> SessionResult<Value>;

    /// Fetch a JSON document from a server path
    async fn fetch_json(&self, config: &ClientConfig, path: &str) -> SessionResult<Value>;
}

/// HTTP request channel plus SSE event stream
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (proxies, TLS roots, ...)
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn with_headers(
        mut request: reqwest::RequestBuilder,
        config: &ClientConfig,
    ) -> reqwest::RequestBuilder {
        for (name, value) in &config.session.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(&self, config: &ClientConfig) -> SessionResult<EventStream> {
        let url = config.endpoint.url(&config.session.sse_path);
        let request = Self::with_headers(
            self.http.get(&url).header(ACCEPT, "text/event-stream"),
            config,
        );

        let mut source = EventSource::new(request)
            .map_err(|e| SessionError::stream(format!("cannot open {url}: {e}")))?;
        // Reconnection belongs to the session layer, not the event source
        source.set_retry_policy(Box::new(retry::Never));

        tracing::debug!(%url, "opening event stream");

        let stream = async_stream::stream! {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => tracing::debug!(%url, "event stream open"),
                    Ok(Event::Message(message)) => {
                        let id = (!message.id.is_empty()).then_some(message.id);
                        yield Ok(SseEvent {
                            event: message.event,
                            data: message.data,
                            id,
                        });
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => {
                        yield Err(SessionError::stream("event stream ended by server"));
                        break;
                    }
                    Err(err) => {
                        yield Err(SessionError::stream(err.to_string()));
                        break;
                    }
                }
            }
            source.close();
        };

        Ok(Box::pin(stream))
    }

    async fn send_message(
        &self,
        config: &ClientConfig,
        message: &InvokeToolMessage,
    ) -> SessionResult<Value> {
        let url = config.endpoint.url(&config.session.messages_path);
        let response = Self::with_headers(self.http.post(&url).json(message), config)
            .send()
            .await
            .map_err(|e| SessionError::request(format!("POST {url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SessionError::request(format!("POST {url}: {e}")))?;

        if !status.is_success() {
            return Err(SessionError::request(format!(
                "POST {url}: HTTP {status}: {}",
                body.trim()
            )));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    async fn fetch_json(&self, config: &ClientConfig, path: &str) -> SessionResult<Value> {
        let url = config.endpoint.url(path);
        let response = Self::with_headers(self.http.get(&url), config)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SessionError::request(format!("GET {url}: {e}")))?;

        response
            .json()
            .await
            .map_err(|e| SessionError::invalid_payload(format!("GET {url}: {e}")))
    }
}
