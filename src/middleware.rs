//! Tower middleware.
//!
//! [`GateLayer`] puts a shared [`RequestGate`] in front of any service whose
//! request type implements [`GateRequest`]. Denied requests never reach the
//! inner service; they fail with [`GateServiceError::Denied`] carrying the
//! [`Admission`], which a transport layer maps to 429 or 403.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;

use crate::error::GateError;
use crate::gate::{Admission, RequestGate};

/// What the gate needs to know about a request.
pub trait GateRequest {
    /// Client identifier, typically the source address.
    fn client_id(&self) -> &str;
    fn endpoint(&self) -> &str;
    /// Whether failures on this endpoint can escalate to a ban.
    fn is_critical(&self) -> bool {
        false
    }
}

/// Error returned by [`GateService`].
#[derive(thiserror::Error, Debug)]
pub enum GateServiceError<E> {
    /// The gate refused the request; map to 429 or 403.
    #[error("request denied: {}", .0.reason)]
    Denied(Admission),
    /// The request could not be evaluated (e.g. malformed client id).
    #[error(transparent)]
    Gate(GateError),
    #[error("inner service: {0}")]
    Inner(E),
}

/// A layer that runs every request through a [`RequestGate`].
#[derive(Clone, Debug)]
pub struct GateLayer {
    gate: Arc<RequestGate>,
}

impl GateLayer {
    pub fn new(gate: Arc<RequestGate>) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, service: S) -> Self::Service {
        GateService { inner: service, gate: self.gate.clone() }
    }
}

/// Middleware service that admits or denies before calling the inner service.
#[derive(Clone, Debug)]
pub struct GateService<S> {
    inner: S,
    gate: Arc<RequestGate>,
}

impl<S, Req> Service<Req> for GateService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    Req: GateRequest + Send + 'static,
{
    type Response = S::Response;
    type Error = GateServiceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateServiceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let gate = self.gate.clone();
        // The clone is not ready; swap so the readied service handles this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let admission = gate
                .admit(req.client_id(), req.endpoint(), req.is_critical())
                .await
                .map_err(GateServiceError::Gate)?;
            if !admission.allowed {
                return Err(GateServiceError::Denied(admission));
            }
            inner.call(req).await.map_err(GateServiceError::Inner)
        })
    }
}
