//! Prometheus metrics sink for `gatekeeper`.
//! Bring your own `prometheus::Registry`; one counter vector is registered and
//! incremented per security event, labelled by event kind and detail.

use gatekeeper::events::{SecurityEvent, SecurityEventSink};
use prometheus::{IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Metric name of the counter vector.
pub const METRIC_NAME: &str = "gatekeeper_security_events_total";

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new(METRIC_NAME, "Admission security events"),
            &["kind", "detail"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        tracing::debug!(target: "gatekeeper_prometheus", metric = METRIC_NAME, "registered");
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current value for one label pair. Events without a detail use `"none"`.
    pub fn count(&self, kind: &str, detail: &str) -> u64 {
        self.counter.with_label_values(&[kind, detail]).get()
    }
}

impl tower_service::Service<SecurityEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        let detail = event.kind.detail_label().unwrap_or("none");
        self.counter.with_label_values(&[event.kind.label(), detail]).inc();
        ready(Ok(()))
    }
}

impl SecurityEventSink for PrometheusSink {
    type SinkError = Infallible;
}
