use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::HeaderMap;

use crate::Result;
use crate::continuation::{Continuation, continuation};
use crate::request::Request;

/// Asynchronous transform applied to an outgoing request.
pub trait RequestAdapter: Send + Sync {
    fn adapt(&self, request: Request) -> BoxFuture<'_, Result<Request>>;
}

/// Asynchronous transform applied to successful response bytes.
///
/// Adapters never observe failures; the chain passes those through.
pub trait ResponseAdapter: Send + Sync {
    fn adapt(&self, body: Bytes) -> BoxFuture<'_, Result<Bytes>>;
}

#[derive(Clone, Default)]
pub struct RequestAdapterChain {
    adapters: Vec<Arc<dyn RequestAdapter>>,
}

impl RequestAdapterChain {
    pub fn new(adapters: Vec<Arc<dyn RequestAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Runs every adapter in order, stopping at the first failure.
    pub async fn run(&self, request: Request) -> Result<Request> {
        let mut request = request;
        for adapter in &self.adapters {
            request = adapter.adapt(request).await?;
        }
        Ok(request)
    }
}

impl RequestAdapter for RequestAdapterChain {
    fn adapt(&self, request: Request) -> BoxFuture<'_, Result<Request>> {
        Box::pin(self.run(request))
    }
}

impl std::fmt::Debug for RequestAdapterChain {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestAdapterChain")
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct ResponseAdapterChain {
    adapters: Vec<Arc<dyn ResponseAdapter>>,
}

impl ResponseAdapterChain {
    pub fn new(adapters: Vec<Arc<dyn ResponseAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// A failed inbound result is returned as is without touching any adapter.
    pub async fn run(&self, outcome: Result<Bytes>) -> Result<Bytes> {
        let mut body = outcome?;
        for adapter in &self.adapters {
            body = adapter.adapt(body).await?;
        }
        Ok(body)
    }
}

impl ResponseAdapter for ResponseAdapterChain {
    fn adapt(&self, body: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.run(Ok(body)))
    }
}

impl std::fmt::Debug for ResponseAdapterChain {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseAdapterChain")
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

pub struct RequestAdapterFn<F> {
    adapt: F,
}

impl<F, Fut> RequestAdapter for RequestAdapterFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Request>> + Send + 'static,
{
    fn adapt(&self, request: Request) -> BoxFuture<'_, Result<Request>> {
        Box::pin((self.adapt)(request))
    }
}

pub fn request_adapter_fn<F, Fut>(adapt: F) -> Arc<dyn RequestAdapter>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Request>> + Send + 'static,
{
    Arc::new(RequestAdapterFn { adapt })
}

pub struct ResponseAdapterFn<F> {
    adapt: F,
}

impl<F, Fut> ResponseAdapter for ResponseAdapterFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    fn adapt(&self, body: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin((self.adapt)(body))
    }
}

pub fn response_adapter_fn<F, Fut>(adapt: F) -> Arc<dyn ResponseAdapter>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    Arc::new(ResponseAdapterFn { adapt })
}

/// Request adapter driven by a callback that resumes a [`Continuation`].
pub struct CallbackRequestAdapter<F> {
    callback: F,
}

impl<F> CallbackRequestAdapter<F>
where
    F: Fn(Request, Continuation<Request>) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> RequestAdapter for CallbackRequestAdapter<F>
where
    F: Fn(Request, Continuation<Request>) + Send + Sync,
{
    fn adapt(&self, request: Request) -> BoxFuture<'_, Result<Request>> {
        let (resume, pending) = continuation();
        (self.callback)(request, resume);
        Box::pin(pending)
    }
}

/// Response adapter driven by a callback that resumes a [`Continuation`].
pub struct CallbackResponseAdapter<F> {
    callback: F,
}

impl<F> CallbackResponseAdapter<F>
where
    F: Fn(Bytes, Continuation<Bytes>) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ResponseAdapter for CallbackResponseAdapter<F>
where
    F: Fn(Bytes, Continuation<Bytes>) + Send + Sync,
{
    fn adapt(&self, body: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        let (resume, pending) = continuation();
        (self.callback)(body, resume);
        Box::pin(pending)
    }
}

/// Writes a fixed header set over every request; same-named request headers
/// are replaced.
#[derive(Clone, Debug, Default)]
pub struct DefaultHeadersAdapter {
    headers: HeaderMap,
}

impl DefaultHeadersAdapter {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }
}

impl RequestAdapter for DefaultHeadersAdapter {
    fn adapt(&self, request: Request) -> BoxFuture<'_, Result<Request>> {
        Box::pin(async move { Ok(request.with_headers(&self.headers)) })
    }
}
