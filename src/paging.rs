//! Page streaming
//!
//! Turns a token-paginated method into one lazy stream of resources. The
//! first page is requested when the stream is first polled; every following
//! page only once the consumer has drained the previous one. Pages are never
//! prefetched, so dropping the stream early stops further calls.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{stream, Stream, TryStreamExt};
use tower::{Layer, Service, ServiceExt};
use tracing::trace;

use crate::context::CallContext;
use crate::error::{CallError, Result};

/// Boxed stream of resources produced by a page-streaming call.
pub type ResourceStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

/// Per-method pagination policy.
pub trait PageStreamingDescriptor: Send + Sync + 'static {
    type Request: Clone + Send + 'static;
    type Response: Send + 'static;
    type Token: PartialEq + Send + 'static;
    type Resource: Send + 'static;

    /// Token marking the last page.
    fn empty_token(&self) -> Self::Token;

    fn inject_token(&self, request: Self::Request, token: Self::Token) -> Self::Request;

    fn extract_next_token(&self, response: &Self::Response) -> Self::Token;

    fn extract_resources(&self, response: Self::Response) -> Vec<Self::Resource>;
}

pub struct PageStreamingLayer<D> {
    descriptor: Arc<D>,
}

impl<D> PageStreamingLayer<D> {
    pub fn new(descriptor: D) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
        }
    }

    pub fn from_shared(descriptor: Arc<D>) -> Self {
        Self { descriptor }
    }
}

impl<S, D> Layer<S> for PageStreamingLayer<D> {
    type Service = PageStreaming<S, D>;
    fn layer(&self, inner: S) -> Self::Service {
        PageStreaming {
            inner,
            descriptor: self.descriptor.clone(),
        }
    }
}

pub struct PageStreaming<S, D> {
    inner: S,
    descriptor: Arc<D>,
}

impl<S: Clone, D> Clone for PageStreaming<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}

impl<S, D> Service<CallContext<D::Request>> for PageStreaming<S, D>
where
    D: PageStreamingDescriptor,
    S: Service<CallContext<D::Request>, Response = D::Response, Error = CallError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = ResourceStream<D::Resource>;
    type Error = CallError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: CallContext<D::Request>) -> Self::Future {
        let inner = self.inner.clone();
        let descriptor = self.descriptor.clone();
        let pages = stream::try_unfold((Some(ctx), 0usize), move |(next, page)| {
            let inner = inner.clone();
            let descriptor = descriptor.clone();
            async move {
                let Some(ctx) = next else {
                    return Ok::<_, CallError>(None);
                };
                let request = ctx.request().clone();
                let response = inner.oneshot(ctx.clone()).await?;
                let token = descriptor.extract_next_token(&response);
                let resources = descriptor.extract_resources(response);
                trace!(page, resources = resources.len(), "Fetched page");

                let next = if token == descriptor.empty_token() {
                    None
                } else {
                    Some(ctx.with_request(descriptor.inject_token(request, token)))
                };
                let items = stream::iter(resources.into_iter().map(Ok::<_, CallError>));
                Ok(Some((items, (next, page + 1))))
            }
        });
        let resources: ResourceStream<D::Resource> = Box::pin(pages.try_flatten());
        Box::pin(async move { Ok(resources) })
    }
}
