//! # Tower Callable
//!
//! Composable client-side call orchestration for RPC methods, built on Tower.
//! A method is a leaf [`Service`] taking a [`CallContext`]; everything else is
//! a layer that produces a new callable from an old one.
//!
//! ## Core Concepts
//!
//! - **CallContext**: the request plus its channel and call options (deadline, metadata)
//! - **Channel binding**: calls without a channel get a default one
//! - **Classification**: transport failures become [`ApiError`]s flagged retryable or not
//! - **Retry**: exponential backoff with jitter, a total deadline and growing per-attempt timeouts
//! - **Bundling**: concurrent requests with the same partition key merged into one upstream call
//! - **Page streaming**: a token-paginated method flattened into one lazy stream of resources
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tower::service_fn;
//! use tower_callable::{
//!     ApiCallableBuilder, CallContext, CallError, Channel, Code, RetryParams,
//!     ServiceApiSettings, TokioScheduler,
//! };
//!
//! # async fn example() -> Result<(), CallError> {
//! let leaf = service_fn(|ctx: CallContext<u64>| async move {
//!     let _channel = ctx.channel();
//!     Ok::<_, CallError>(*ctx.request() + 1)
//! });
//!
//! let service = ServiceApiSettings::new(
//!     Channel::named("library.example:443"),
//!     Arc::new(TokioScheduler::current()),
//! );
//! let callable = ApiCallableBuilder::new(leaf)
//!     .set_retryable_codes([Code::Unavailable, Code::DeadlineExceeded])
//!     .set_retry_params(RetryParams::default())
//!     .build(&service);
//!
//! assert_eq!(callable.future_call(CallContext::of(41)).await?, 42);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod bundling;
pub mod callable;
pub mod channel;
pub mod classify;
pub mod config;
pub mod context;
pub mod deadline;
pub mod error;
pub mod paging;
pub mod retry;
pub mod scheduler;
pub mod status;

pub use builder::{
    ApiCallSettings, ApiCallableBuilder, BundlableApiCallableBuilder, BundlableApiCallableInfo,
    PageStreamingApiCallableBuilder, ServiceApiSettings,
};
pub use bundling::{
    BundlerFactory, BundlingDescriptor, BundlingLayer, BundlingSettings, RequestIssuer,
};
pub use callable::{ApiCallable, CallObserver};
pub use channel::BindChannelLayer;
pub use classify::RetryableOnLayer;
pub use config::ClientConfig;
pub use context::{CallContext, CallOptions, Channel};
pub use deadline::DeadlineLayer;
pub use error::{ApiError, CallError, Result};
pub use paging::{PageStreamingDescriptor, PageStreamingLayer, ResourceStream};
pub use retry::{BackoffParams, RetryParams, RetryingLayer};
pub use scheduler::{ScheduledTask, Scheduler, TokioScheduler};
pub use status::{Code, Status};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
