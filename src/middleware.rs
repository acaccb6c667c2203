//! Tower middleware that admits each call before it reaches the endpoint.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower_layer::Layer;
use tower_service::Service;

use crate::admission::AdmissionController;
use crate::error::GuardError;
use crate::events::{NullSink, SecurityEventSink};
use crate::identity::ClientIdentity;

/// Lets a request carry what the caller already knows about itself.
///
/// Both methods default to `None`, in which case the controller resolves the
/// identity through its [`IdentityResolver`](crate::identity::IdentityResolver).
pub trait RequestIdentity {
    fn client_identity(&self) -> Option<ClientIdentity> {
        None
    }

    fn user_agent(&self) -> Option<&str> {
        None
    }
}

impl RequestIdentity for String {}
impl RequestIdentity for &'static str {}

/// Wraps a service so every call is admitted against `endpoint` first.
#[derive(Debug)]
pub struct AdmissionLayer<K = NullSink> {
    controller: Arc<AdmissionController<K>>,
    endpoint: Arc<str>,
}

impl<K> Clone for AdmissionLayer<K> {
    fn clone(&self) -> Self {
        Self { controller: self.controller.clone(), endpoint: self.endpoint.clone() }
    }
}

impl<K> AdmissionLayer<K> {
    pub fn new(controller: Arc<AdmissionController<K>>, endpoint: impl Into<Arc<str>>) -> Self {
        Self { controller, endpoint: endpoint.into() }
    }
}

impl<S, K> Layer<S> for AdmissionLayer<K> {
    type Service = AdmissionService<S, K>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            controller: self.controller.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
#[derive(Debug)]
pub struct AdmissionService<S, K = NullSink> {
    inner: S,
    controller: Arc<AdmissionController<K>>,
    endpoint: Arc<str>,
}

impl<S: Clone, K> Clone for AdmissionService<S, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            controller: self.controller.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

impl<S, K, Req> Service<Req> for AdmissionService<S, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    K: SecurityEventSink + Sync,
    K::Future: Send + 'static,
    Req: RequestIdentity + Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let controller = self.controller.clone();
        let endpoint = self.endpoint.clone();
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let identity = req.client_identity();
            let user_agent = req.user_agent().map(str::to_string);
            let result = controller
                .admit_with(&endpoint, identity.as_ref(), user_agent.as_deref())
                .await;
            if !result.is_allowed() {
                return Err(GuardError::Denied(Box::new(result)));
            }
            inner.call(req).await.map_err(GuardError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::DenyReason;
    use crate::blacklist::InMemoryBlacklistStore;
    use crate::clock::ManualClock;
    use crate::ledger::InMemoryLedger;
    use crate::violation::ViolationKind;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    struct Create {
        caller: &'static str,
    }

    impl RequestIdentity for Create {
        fn client_identity(&self) -> Option<ClientIdentity> {
            Some(ClientIdentity::User(self.caller.to_string()))
        }
    }

    #[tokio::test]
    async fn denied_calls_never_reach_the_endpoint() {
        let controller = Arc::new(
            AdmissionController::builder()
                .ledger(InMemoryLedger::new())
                .blacklist_store(InMemoryBlacklistStore::new())
                .clock(ManualClock::new(0))
                .build()
                .unwrap(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let svc = ServiceBuilder::new()
            .layer(AdmissionLayer::new(controller, "/qr/create"))
            .service(service_fn(move |req: Create| {
                counted.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Infallible>(format!("created for {}", req.caller)) }
            }));

        let ok = svc.clone().oneshot(Create { caller: "9" }).await.unwrap();
        assert_eq!(ok, "created for 9");

        let err = svc.oneshot(Create { caller: "9" }).await.unwrap_err();
        assert!(err.is_denied());
        let denial = err.denial().unwrap();
        assert_eq!(denial.identity, "user_9");
        assert_eq!(denial.reason, Some(DenyReason::Policy(ViolationKind::Burst)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
