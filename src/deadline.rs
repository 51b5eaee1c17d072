//! Deadline enforcement at the leaf
//!
//! The transport half of the per-attempt timeout: when the context carries a
//! deadline and the wrapped call has not finished by then, the call fails with
//! a `DEADLINE_EXCEEDED` status. The pending inner future is dropped, so a late
//! result is never observed.

use std::future::Future;
use std::pin::Pin;

use tokio::time::timeout_at;
use tower::{Layer, Service};

use crate::context::CallContext;
use crate::error::CallError;
use crate::status::Status;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineLayer;

impl DeadlineLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = Deadline<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Deadline { inner }
    }
}

#[derive(Debug, Clone)]
pub struct Deadline<S> {
    inner: S,
}

impl<S, Req> Service<CallContext<Req>> for Deadline<S>
where
    S: Service<CallContext<Req>, Error = CallError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = CallError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, ctx: CallContext<Req>) -> Self::Future {
        let deadline = ctx.deadline();
        let fut = self.inner.call(ctx);
        Box::pin(async move {
            match deadline {
                None => fut.await,
                Some(deadline) => match timeout_at(deadline, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(Status::deadline_exceeded(
                        "deadline elapsed before the call completed",
                    )
                    .into()),
                },
            }
        })
    }
}
