//! Security events and the sinks that consume them.
//!
//! Every denial, ban, unban and collaborator fault produces a [`SecurityEvent`].
//! Events flow through a [`SecurityEventSink`], which is a
//! `tower::Service<SecurityEvent>` so sinks compose with ordinary tower tooling.
//! Emission is fire-and-forget: [`emit_best_effort`] drops the event if the sink
//! is not ready or fails.
//!
//! ```rust
//! use gatekeeper::events::{MemorySink, SecurityEvent, SecurityEventKind};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(SecurityEvent::new(SecurityEventKind::Unban, "user_42", "operator", 0))
//!     .await
//!     .unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tower::Service;

use crate::error::Collaborator;
use crate::violation::ViolationKind;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SecurityEventKind {
    /// A policy check denied the request.
    Denied(ViolationKind),
    /// An already-banned identity hit the endpoint.
    Blocked,
    /// The violation threshold was reached and a ban was written.
    AutoBanned,
    /// An operator banned an identity.
    ManualBan,
    /// An operator lifted a ban.
    Unban,
    /// A collaborator failed or timed out; the affected check failed open.
    CollaboratorUnavailable(Collaborator),
}

impl SecurityEventKind {
    /// Stable snake_case label, without the payload.
    pub fn label(&self) -> &'static str {
        match self {
            SecurityEventKind::Denied(_) => "denied",
            SecurityEventKind::Blocked => "blocked",
            SecurityEventKind::AutoBanned => "auto_banned",
            SecurityEventKind::ManualBan => "manual_ban",
            SecurityEventKind::Unban => "unban",
            SecurityEventKind::CollaboratorUnavailable(_) => "collaborator_unavailable",
        }
    }

    /// Label of the payload, if any (violation kind or collaborator name).
    pub fn detail_label(&self) -> Option<&'static str> {
        match self {
            SecurityEventKind::Denied(kind) => Some(kind.as_str()),
            SecurityEventKind::CollaboratorUnavailable(c) => Some(c.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail_label() {
            Some(detail) => write!(f, "{}({})", self.label(), detail),
            None => f.write_str(self.label()),
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    /// Identity key the event concerns, or
    /// [`MAINTENANCE_IDENTITY`](crate::maintenance::MAINTENANCE_IDENTITY) for faults
    /// raised by background maintenance.
    pub identity: String,
    /// Free-text detail (reason, error message, ...).
    pub detail: String,
    /// Epoch milliseconds.
    pub at_millis: u64,
}

impl SecurityEvent {
    pub fn new(
        kind: SecurityEventKind,
        identity: impl Into<String>,
        detail: impl Into<String>,
        at_millis: u64,
    ) -> Self {
        Self { kind, identity: identity.into(), detail: detail.into(), at_millis }
    }
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} identity={} detail={}", self.kind, self.identity, self.detail)
    }
}

/// A sink that consumes security events.
pub trait SecurityEventSink:
    tower::Service<SecurityEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: SecurityEvent)
where
    S: tower::Service<SecurityEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<SecurityEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: SecurityEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl SecurityEventSink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing`: faults and bans at WARN, the rest at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<SecurityEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        match event.kind {
            SecurityEventKind::AutoBanned | SecurityEventKind::CollaboratorUnavailable(_) => {
                tracing::warn!(
                    target: "gatekeeper::events",
                    kind = %event.kind,
                    identity = %event.identity,
                    detail = %event.detail,
                    "security_event"
                );
            }
            _ => {
                tracing::info!(
                    target: "gatekeeper::events",
                    kind = %event.kind,
                    identity = %event.identity,
                    detail = %event.detail,
                    "security_event"
                );
            }
        }
        Box::pin(async { Ok(()) })
    }
}

impl SecurityEventSink for LogSink {
    type SinkError = Infallible;
}

/// Stores events in memory, evicting the oldest past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SecurityEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the stored events, oldest first.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().expect("memory sink poisoned").clone()
    }

    /// Stored events matching `label` (see [`SecurityEventKind::label`]).
    pub fn events_labelled(&self, label: &str) -> Vec<SecurityEvent> {
        self.events().into_iter().filter(|e| e.kind.label() == label).collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("memory sink poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("memory sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<SecurityEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        let mut guard = self.events.lock().expect("memory sink poisoned");
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl SecurityEventSink for MemorySink {
    type SinkError = Infallible;
}

/// Offloads emission to a bounded channel and worker task so a slow audit backend
/// never stalls admission. Events that do not fit in the queue are dropped and
/// counted.
#[derive(Clone)]
pub struct NonBlockingSink<S> {
    tx: tokio::sync::mpsc::Sender<SecurityEvent>,
    dropped: Arc<AtomicU64>,
    _sink: Arc<tokio::sync::Mutex<S>>,
}

impl<S> NonBlockingSink<S>
where
    S: tower::Service<SecurityEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    /// Must be called from within a tokio runtime.
    pub fn with_capacity(sink: S, capacity: usize) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let sink_arc = Arc::new(tokio::sync::Mutex::new(sink));
        let sink_worker = sink_arc.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                use tower::ServiceExt;
                let mut guard = sink_worker.lock().await;
                if let Ok(ready) = guard.ready().await {
                    let _ = ready.call(event).await;
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)), _sink: sink_arc }
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<S> Service<SecurityEvent> for NonBlockingSink<S>
where
    S: tower::Service<SecurityEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl<S> SecurityEventSink for NonBlockingSink<S>
where
    S: tower::Service<SecurityEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    type SinkError = Infallible;
}

/// Error type for composed sinks.
#[derive(Debug, thiserror::Error)]
#[error("security event sink error: {0}")]
pub struct ComposedSinkError(#[source] Box<dyn std::error::Error + Send + Sync>);

/// Sends every event to both sinks concurrently.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<SecurityEvent> for MulticastSink<A, B>
where
    A: tower::Service<SecurityEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<SecurityEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let event_clone = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(sink_a.call(event), sink_b.call(event_clone));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> SecurityEventSink for MulticastSink<A, B>
where
    A: tower::Service<SecurityEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<SecurityEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
