//! # Composition root
//!
//! [`ApiCallable`] wraps a boxed callable stack and grows it one decorator at
//! a time. Every decorator method takes `&self` and returns a new value, so a
//! base callable can be shared between call sites that decorate it
//! differently.
//!
//! The conventional order is
//!
//! ```text
//! leaf -> bind -> retryable_on -> retrying -> (bundling | page_streaming)
//! ```
//!
//! `bundling` and `page_streaming` both change what a call returns, so a
//! given call site uses at most one of them.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tower::service_fn;
//! use tower_callable::{
//!     ApiCallable, CallContext, CallError, Channel, Code, RetryParams, TokioScheduler,
//! };
//!
//! # async fn example() -> Result<(), CallError> {
//! let leaf = service_fn(|ctx: CallContext<String>| async move {
//!     Ok::<_, CallError>(ctx.request().len())
//! });
//! let callable = ApiCallable::create(leaf)
//!     .bind(Channel::named("pubsub.example:443"))
//!     .retryable_on([Code::Unavailable])
//!     .retrying(RetryParams::default(), Arc::new(TokioScheduler::current()));
//!
//! let n = callable.future_call("hello".to_string()).await?;
//! assert_eq!(n, 5);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::{Builder, Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

use crate::bundling::{BundlerFactory, BundlingDescriptor, BundlingLayer};
use crate::channel::BindChannelLayer;
use crate::classify::RetryableOnLayer;
use crate::context::{CallContext, Channel};
use crate::deadline::DeadlineLayer;
use crate::error::{CallError, Result};
use crate::paging::{PageStreamingDescriptor, PageStreamingLayer, ResourceStream};
use crate::retry::{RetryParams, RetryingLayer};
use crate::scheduler::Scheduler;
use crate::status::Code;

type Inner<Req, Resp> = BoxCloneService<CallContext<Req>, Resp, CallError>;

/// Push-style receiver for [`ApiCallable::async_call`].
///
/// Gets either `on_next` followed by `on_completed`, or a single `on_error`.
pub trait CallObserver<T>: Send + 'static {
    fn on_next(&mut self, value: T);
    fn on_error(&mut self, error: CallError);
    fn on_completed(&mut self) {}
}

/// A callable stack plus a readable description of how it was built.
pub struct ApiCallable<Req, Resp> {
    inner: Inner<Req, Resp>,
    description: Arc<str>,
    /// Runtime of a scheduler-backed decorator in the stack, used to drive
    /// calls made from threads outside any runtime.
    runtime: Option<Handle>,
}

impl<Req, Resp> Clone for ApiCallable<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            description: self.description.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<Req, Resp> fmt::Display for ApiCallable<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl<Req, Resp> fmt::Debug for ApiCallable<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCallable")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> ApiCallable<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Wrap a leaf callable. The leaf fails with `DEADLINE_EXCEEDED` once the
    /// context deadline passes.
    pub fn create<S>(leaf: S) -> Self
    where
        S: Service<CallContext<Req>, Response = Resp, Error = CallError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self::wrap(DeadlineLayer::new().layer(leaf), "leaf".into(), None)
    }

    fn wrap<S>(service: S, description: Arc<str>, runtime: Option<Handle>) -> Self
    where
        S: Service<CallContext<Req>, Response = Resp, Error = CallError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: BoxCloneService::new(service),
            description,
            runtime,
        }
    }

    fn decorated(&self, name: &str) -> Arc<str> {
        format!("{name}({})", self.description).into()
    }

    /// Calls without a channel go through `channel`.
    pub fn bind(&self, channel: Channel) -> Self {
        Self::wrap(
            BindChannelLayer::new(channel).layer(self.inner.clone()),
            self.decorated("bind-channel"),
            self.runtime.clone(),
        )
    }

    /// Classify failures; codes in `codes` become retryable.
    pub fn retryable_on(&self, codes: impl IntoIterator<Item = Code>) -> Self {
        Self::wrap(
            RetryableOnLayer::new(codes).layer(self.inner.clone()),
            self.decorated("retryable-on"),
            self.runtime.clone(),
        )
    }

    /// Bundle requests through `factory`, which may be shared with other callables.
    pub fn bundling<D>(&self, factory: Arc<BundlerFactory<D>>) -> Self
    where
        D: BundlingDescriptor<Request = Req, Response = Resp>,
    {
        let runtime = factory.scheduler().runtime().or_else(|| self.runtime.clone());
        Self::wrap(
            BundlingLayer::new(factory).layer(self.inner.clone()),
            self.decorated("bundling"),
            runtime,
        )
    }

    /// Start the call and return its pending result.
    pub fn future_call(&self, ctx: impl Into<CallContext<Req>>) -> BoxFuture<'static, Result<Resp>> {
        self.inner.clone().oneshot(ctx.into()).boxed()
    }

    /// Make the call and block the current thread until it resolves.
    ///
    /// Inside a multi-threaded Tokio runtime the worker is handed over with
    /// `block_in_place`. Outside any runtime the call runs on the multi-threaded
    /// runtime of the stack's scheduler, or else on a throwaway current-thread
    /// runtime with timers enabled. A current-thread runtime cannot be blocked
    /// without stalling the call itself, so that case is rejected.
    pub fn call(&self, ctx: impl Into<CallContext<Req>>) -> Result<Resp> {
        let fut = self.future_call(ctx);
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => Err(
                CallError::Config("blocking call from a current-thread runtime".into()),
            ),
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(fut)),
            Err(_) => match self
                .runtime
                .as_ref()
                .filter(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread)
            {
                Some(handle) => handle.block_on(fut),
                None => Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| CallError::Config(format!("blocking call runtime: {e}")))?
                    .block_on(fut),
            },
        }
    }

    /// Spawn the call and report its outcome to `observer`.
    ///
    /// The task runs on the current runtime, or on the stack's scheduler
    /// runtime when called from outside one.
    pub fn async_call<O>(
        &self,
        ctx: impl Into<CallContext<Req>>,
        mut observer: O,
    ) -> Result<JoinHandle<()>>
    where
        O: CallObserver<Resp>,
    {
        let handle = Handle::try_current()
            .ok()
            .or_else(|| self.runtime.clone())
            .ok_or_else(|| CallError::Config("async call outside of a Tokio runtime".into()))?;
        let fut = self.future_call(ctx);
        Ok(handle.spawn(async move {
            match fut.await {
                Ok(value) => {
                    observer.on_next(value);
                    observer.on_completed();
                }
                Err(error) => observer.on_error(error),
            }
        }))
    }

    /// The boxed service underneath.
    pub fn into_service(self) -> BoxCloneService<CallContext<Req>, Resp, CallError> {
        self.inner
    }
}

impl<Req, Resp> ApiCallable<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    /// Retry retryable failures with backoff inside a total deadline.
    pub fn retrying(&self, params: RetryParams, scheduler: Arc<dyn Scheduler>) -> Self {
        let runtime = scheduler.runtime().or_else(|| self.runtime.clone());
        Self::wrap(
            RetryingLayer::new(params, scheduler).layer(self.inner.clone()),
            self.decorated("retrying"),
            runtime,
        )
    }

    /// Flatten successive pages into one lazy stream of resources.
    pub fn page_streaming<D>(&self, descriptor: D) -> ApiCallable<Req, ResourceStream<D::Resource>>
    where
        D: PageStreamingDescriptor<Request = Req, Response = Resp>,
    {
        ApiCallable::wrap(
            PageStreamingLayer::new(descriptor).layer(self.inner.clone()),
            self.decorated("page-streaming"),
            self.runtime.clone(),
        )
    }
}

impl<Req, Resp> Service<CallContext<Req>> for ApiCallable<Req, Resp>
where
    Req: 'static,
    Resp: 'static,
{
    type Response = Resp;
    type Error = CallError;
    type Future = Pin<Box<dyn Future<Output = Result<Resp>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, ctx: CallContext<Req>) -> Self::Future {
        self.inner.call(ctx)
    }
}
