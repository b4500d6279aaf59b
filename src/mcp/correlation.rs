//! Correlation of streamed results to pending tool invocations
//!
//! Every mutation (register, resolve, timeout, reject) goes through one mutex
//! around the table. Removal is the commit point: whichever path removes an
//! entry completes it, and the others find nothing and do nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{SessionError, SessionResult};

type Responder = oneshot::Sender<SessionResult<Value>>;

struct PendingRequest {
    tool_name: String,
    parameters: Value,
    issued_at: DateTime<Utc>,
    started: Instant,
    sequence: u64,
    timeout: Duration,
    responder: Responder,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn complete(mut self, request_id: &str, outcome: SessionResult<Value>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if self.responder.send(outcome).is_err() {
            tracing::debug!(request_id, "caller stopped waiting before completion");
        }
    }
}

/// Read-only view of a pending request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingInfo {
    pub request_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub issued_at: DateTime<Utc>,
    pub timeout_ms: u64,
}

/// Handle a caller awaits for the outcome of one request
///
/// Dropping it before completion removes the request from the table.
#[derive(Debug)]
pub struct PendingCall {
    request_id: String,
    receiver: oneshot::Receiver<SessionResult<Value>>,
    table: Weak<CorrelationTable>,
}

impl PendingCall {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingCall {
    type Output = SessionResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Entry dropped without completion: the table itself went away
            Poll::Ready(Err(_)) => Poll::Ready(Err(SessionError::connection_closed(
                "request table dropped",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.abandon(&self.request_id);
        }
    }
}

/// Table of in-flight requests keyed by request id
#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
    sequence: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a request and start its timeout timer
    ///
    /// Must be called inside a Tokio runtime. Fails with `DuplicateRequest`
    /// while an entry with the same id is still live.
    pub fn register(
        self: &Arc<Self>,
        request_id: impl Into<String>,
        tool_name: impl Into<String>,
        parameters: Value,
        timeout: Duration,
    ) -> SessionResult<PendingCall> {
        let request_id = request_id.into();
        let (responder, receiver) = oneshot::channel();

        let mut entries = self.lock();
        if entries.contains_key(&request_id) {
            return Err(SessionError::DuplicateRequest(request_id));
        }

        let timer = {
            let table = Arc::downgrade(self);
            let request_id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(table) = table.upgrade() {
                    table.timeout(&request_id);
                }
            })
        };

        entries.insert(
            request_id.clone(),
            PendingRequest {
                tool_name: tool_name.into(),
                parameters,
                issued_at: Utc::now(),
                started: Instant::now(),
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                timeout,
                responder,
                timer: Some(timer),
            },
        );

        Ok(PendingCall {
            request_id,
            receiver,
            table: Arc::downgrade(self),
        })
    }

    /// Fulfil a request with its result
    ///
    /// Unknown ids (late, duplicate or already timed out) are logged and
    /// discarded; returns whether a caller was completed.
    pub fn resolve(&self, request_id: &str, payload: Value) -> bool {
        let Some(entry) = self.lock().remove(request_id) else {
            tracing::debug!(request_id, "discarding result for unknown or finished request");
            return false;
        };

        tracing::debug!(
            request_id,
            tool = %entry.tool_name,
            elapsed_ms = entry.started.elapsed().as_millis() as u64,
            "tool result received"
        );
        entry.complete(request_id, Ok(payload));
        true
    }

    /// Fulfil the most recently issued request
    ///
    /// Used for result events that carry no correlation field.
    pub fn resolve_latest(&self, payload: Value) -> bool {
        let latest = {
            let mut entries = self.lock();
            let id = entries
                .iter()
                .max_by_key(|(_, entry)| entry.sequence)
                .map(|(id, _)| id.clone());
            id.and_then(|id| entries.remove(&id).map(|entry| (id, entry)))
        };

        match latest {
            Some((request_id, entry)) => {
                tracing::debug!(%request_id, tool = %entry.tool_name, "uncorrelated result routed to latest request");
                entry.complete(&request_id, Ok(payload));
                true
            }
            None => {
                tracing::debug!("discarding uncorrelated result: nothing pending");
                false
            }
        }
    }

    /// Reject one request with the given error
    pub fn reject(&self, request_id: &str, error: SessionError) -> bool {
        let Some(entry) = self.lock().remove(request_id) else {
            return false;
        };
        entry.complete(request_id, Err(error));
        true
    }

    /// Reject one request with a server-reported failure
    pub fn fail(&self, request_id: &str, message: &str) -> bool {
        let Some(entry) = self.lock().remove(request_id) else {
            tracing::debug!(request_id, message, "server error for unknown request");
            return false;
        };
        tracing::warn!(request_id, tool = %entry.tool_name, message, "tool invocation failed");
        let error = SessionError::ToolFailed {
            tool: entry.tool_name.clone(),
            message: message.to_string(),
        };
        entry.complete(request_id, Err(error));
        true
    }

    /// Timer expiry for one request; no-op when it already completed
    pub fn timeout(&self, request_id: &str) -> bool {
        let Some(mut entry) = self.lock().remove(request_id) else {
            return false;
        };

        // Running inside the timer task itself
        entry.timer = None;
        let timeout_ms = entry.timeout.as_millis() as u64;
        tracing::warn!(request_id, tool = %entry.tool_name, timeout_ms, "tool invocation timed out");
        entry.complete(
            request_id,
            Err(SessionError::RequestTimeout {
                request_id: request_id.to_string(),
                timeout_ms,
            }),
        );
        true
    }

    /// Caller-initiated cancellation of one request
    pub fn cancel(&self, request_id: &str) -> bool {
        self.reject(request_id, SessionError::Cancelled(request_id.to_string()))
    }

    /// Remove a request nobody waits for any more
    fn abandon(&self, request_id: &str) -> bool {
        let Some(mut entry) = self.lock().remove(request_id) else {
            return false;
        };
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        tracing::debug!(request_id, tool = %entry.tool_name, "caller dropped pending request");
        true
    }

    /// Drain the table, rejecting every pending request with `reason`
    pub fn reject_all(&self, reason: SessionError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();

        for (request_id, entry) in drained {
            entry.complete(&request_id, Err(reason.clone()));
        }

        if count > 0 {
            tracing::info!(count, %reason, "rejected pending requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    /// Pending requests, oldest first
    pub fn snapshot(&self) -> Vec<PendingInfo> {
        let entries = self.lock();
        let mut pending: Vec<_> = entries
            .iter()
            .map(|(id, entry)| {
                (
                    entry.sequence,
                    PendingInfo {
                        request_id: id.clone(),
                        tool_name: entry.tool_name.clone(),
                        parameters: entry.parameters.clone(),
                        issued_at: entry.issued_at,
                        timeout_ms: entry.timeout.as_millis() as u64,
                    },
                )
            })
            .collect();
        pending.sort_by_key(|(sequence, _)| *sequence);
        pending.into_iter().map(|(_, info)| info).collect()
    }
}

impl Drop for CorrelationTable {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_resolve_completes_caller() {
        let table = CorrelationTable::new();
        let call = table.register("msg-1", "echo", json!({"msg": "hi"}), LONG).unwrap();
        assert_eq!(call.request_id(), "msg-1");
        assert!(table.contains("msg-1"));

        assert!(table.resolve("msg-1", json!({"text": "hi"})));
        assert_eq!(call.await.unwrap(), json!({"text": "hi"}));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let table = CorrelationTable::new();
        let _call = table.register("msg-1", "echo", json!({}), LONG).unwrap();
        let err = table.register("msg-1", "echo", json!({}), LONG).unwrap_err();
        assert_eq!(err, SessionError::DuplicateRequest("msg-1".into()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_result_is_discarded() {
        let table = CorrelationTable::new();
        let call = table.register("msg-1", "echo", json!({}), LONG).unwrap();

        assert!(!table.resolve("msg-404", json!({})));
        assert!(table.contains("msg-1"));

        assert!(table.resolve("msg-1", json!(1)));
        assert!(!table.resolve("msg-1", json!(2)));
        assert_eq!(call.await.unwrap(), json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_removes() {
        let table = CorrelationTable::new();
        let call = table
            .register("msg-1", "echo", json!({}), Duration::from_secs(2))
            .unwrap();

        let err = call.await.unwrap_err();
        assert_eq!(
            err,
            SessionError::RequestTimeout {
                request_id: "msg-1".into(),
                timeout_ms: 2_000
            }
        );
        assert!(table.is_empty());
        // Late result after the timer fired
        assert!(!table.resolve("msg-1", json!({})));
    }

    #[tokio::test]
    async fn test_resolve_then_timeout_is_noop() {
        let table = CorrelationTable::new();
        let call = table.register("msg-1", "echo", json!({}), LONG).unwrap();

        assert!(table.resolve("msg-1", json!("first")));
        assert!(!table.timeout("msg-1"));
        assert!(!table.reject("msg-1", SessionError::MissingSession));
        assert_eq!(call.await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_timeout_then_resolve_is_noop() {
        let table = CorrelationTable::new();
        let call = table.register("msg-1", "echo", json!({}), LONG).unwrap();

        assert!(table.timeout("msg-1"));
        assert!(!table.resolve("msg-1", json!("late")));
        assert!(matches!(
            call.await,
            Err(SessionError::RequestTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_resolve_and_timeout_single_winner() {
        for round in 0..50 {
            let table = CorrelationTable::new();
            let id = format!("msg-{round}");
            let call = table.register(id.clone(), "echo", json!({}), LONG).unwrap();

            let resolver = {
                let table = Arc::clone(&table);
                let id = id.clone();
                tokio::spawn(async move { table.resolve(&id, json!("ok")) })
            };
            let expirer = {
                let table = Arc::clone(&table);
                let id = id.clone();
                tokio::spawn(async move { table.timeout(&id) })
            };

            let resolved = resolver.await.unwrap();
            let expired = expirer.await.unwrap();
            assert!(resolved ^ expired, "exactly one path must win");

            match call.await {
                Ok(value) => assert!(resolved && value == json!("ok")),
                Err(err) => assert!(expired && matches!(err, SessionError::RequestTimeout { .. })),
            }
            assert!(table.is_empty());
        }
    }

    #[tokio::test]
    async fn test_reject_all_drains_table() {
        let table = CorrelationTable::new();
        let calls: Vec<_> = (0..3)
            .map(|i| table.register(format!("msg-{i}"), "echo", json!({}), LONG).unwrap())
            .collect();

        let reason = SessionError::connection_closed("connection closed");
        assert_eq!(table.reject_all(reason.clone()), 3);
        assert!(table.is_empty());

        for call in calls {
            assert_eq!(call.await.unwrap_err(), reason);
        }
        assert_eq!(table.reject_all(reason), 0);
    }

    #[tokio::test]
    async fn test_resolve_latest_and_fail() {
        let table = CorrelationTable::new();
        let first = table.register("msg-a", "readFile", json!({}), LONG).unwrap();
        let second = table.register("msg-b", "grep", json!({}), LONG).unwrap();

        assert!(table.resolve_latest(json!("for b")));
        assert_eq!(second.await.unwrap(), json!("for b"));

        assert!(table.fail("msg-a", "file not found"));
        assert_eq!(
            first.await.unwrap_err(),
            SessionError::ToolFailed {
                tool: "readFile".into(),
                message: "file not found".into()
            }
        );
        assert!(!table.resolve_latest(json!("nobody")));
    }

    #[tokio::test]
    async fn test_cancel_and_snapshot() {
        let table = CorrelationTable::new();
        let _first = table.register("msg-a", "readFile", json!({"filePath": "x"}), LONG).unwrap();
        let second = table.register("msg-b", "grep", json!({}), LONG).unwrap();

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].request_id, "msg-a");
        assert_eq!(snapshot[0].parameters, json!({"filePath": "x"}));
        assert_eq!(snapshot[1].timeout_ms, 60_000);

        assert!(table.cancel("msg-b"));
        assert_eq!(second.await.unwrap_err(), SessionError::Cancelled("msg-b".into()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_call_leaves_the_table() {
        let table = CorrelationTable::new();
        let first = table.register("msg-a", "readFile", json!({}), LONG).unwrap();
        let abandoned = table.register("msg-b", "grep", json!({}), LONG).unwrap();

        drop(abandoned);
        assert!(!table.contains("msg-b"));
        assert_eq!(table.len(), 1);

        // The uncorrelated result reaches the request still being awaited
        assert!(table.resolve_latest(json!("for a")));
        assert_eq!(first.await.unwrap(), json!("for a"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_table_closes_calls() {
        let table = CorrelationTable::new();
        let call = table.register("msg-1", "echo", json!({}), LONG).unwrap();
        drop(table);
        assert!(matches!(call.await, Err(SessionError::ConnectionClosed(_))));
    }
}
