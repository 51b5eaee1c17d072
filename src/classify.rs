//! Failure classification
//!
//! Turns raw transport failures into [`ApiError`]s carrying a retryable flag.
//! A failure is retryable exactly when its status code is in the configured
//! set. This is the only place that decides retryability; the retry engine
//! just reads the flag.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tower::{Layer, Service};

use crate::context::CallContext;
use crate::error::{ApiError, CallError};
use crate::status::{Code, Status};

#[derive(Debug, Clone)]
pub struct RetryableOnLayer {
    codes: Arc<HashSet<Code>>,
}

impl RetryableOnLayer {
    pub fn new(codes: impl IntoIterator<Item = Code>) -> Self {
        Self {
            codes: Arc::new(codes.into_iter().collect()),
        }
    }
}

impl<S> Layer<S> for RetryableOnLayer {
    type Service = ExceptionTransforming<S>;
    fn layer(&self, inner: S) -> Self::Service {
        ExceptionTransforming {
            inner,
            codes: self.codes.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExceptionTransforming<S> {
    inner: S,
    codes: Arc<HashSet<Code>>,
}

/// Classifies one failure against a retryable code set.
pub fn classify(error: CallError, retryable_codes: &HashSet<Code>) -> CallError {
    match error {
        CallError::Transport(status) => {
            let retryable = retryable_codes.contains(&status.code());
            ApiError::new(status, retryable).into()
        }
        already @ CallError::Api(_) => already,
        other => ApiError::new(Status::unknown(other.to_string()), false).into(),
    }
}

impl<S, Req> Service<CallContext<Req>> for ExceptionTransforming<S>
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
        let codes = self.codes.clone();
        let fut = self.inner.call(ctx);
        Box::pin(async move { fut.await.map_err(|e| classify(e, &codes)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::{service_fn, ServiceExt};

    fn codes() -> HashSet<Code> {
        [Code::Unavailable, Code::DeadlineExceeded].into_iter().collect()
    }

    #[test]
    fn status_in_set_is_retryable() {
        let err = classify(Status::unavailable("down").into(), &codes());
        assert!(err.is_retryable());
        assert_eq!(err.code(), Some(Code::Unavailable));
    }

    #[test]
    fn status_outside_set_is_not_retryable() {
        let err = classify(Status::failed_precondition("nope").into(), &codes());
        assert!(matches!(err, CallError::Api(ref e) if !e.is_retryable()));
    }

    #[test]
    fn unrelated_errors_become_unknown() {
        let err = classify(CallError::Bundling("boom".into()), &codes());
        assert_eq!(err.code(), Some(Code::Unknown));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn classified_errors_pass_through() {
        let api = ApiError::new(Status::new(Code::Internal, "internal"), true);
        let err = classify(CallError::Api(api.clone()), &HashSet::new());
        assert!(matches!(err, CallError::Api(e) if e == api));
    }

    #[tokio::test]
    async fn successes_are_untouched() {
        let svc = service_fn(|ctx: CallContext<i32>| async move {
            Ok::<_, CallError>(ctx.into_request() * 2)
        });
        let out = RetryableOnLayer::new([Code::Unavailable])
            .layer(svc)
            .oneshot(CallContext::of(21))
            .await
            .unwrap();
        assert_eq!(out, 42);
    }
}
