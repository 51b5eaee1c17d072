//! Builders
//!
//! Assemble a method's callable from settings instead of chaining decorators
//! by hand. `build` always applies the decorators in the same order:
//! retryable-on (when codes are set), retrying (when retry params are set),
//! then channel binding.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tower::Service;
use tracing::debug;

use crate::bundling::{BundlerFactory, BundlingDescriptor, BundlingSettings};
use crate::callable::ApiCallable;
use crate::config::ClientConfig;
use crate::context::{CallContext, Channel};
use crate::error::CallError;
use crate::paging::{PageStreamingDescriptor, ResourceStream};
use crate::retry::RetryParams;
use crate::scheduler::Scheduler;
use crate::status::Code;

/// Per-method call settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiCallSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_codes: Option<HashSet<Code>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_params: Option<RetryParams>,
}

/// What every method of one service shares.
#[derive(Clone)]
pub struct ServiceApiSettings {
    pub channel: Channel,
    pub scheduler: Arc<dyn Scheduler>,
}

impl ServiceApiSettings {
    pub fn new(channel: Channel, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { channel, scheduler }
    }
}

impl fmt::Debug for ServiceApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceApiSettings")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

pub struct ApiCallableBuilder<Req, Resp> {
    base: ApiCallable<Req, Resp>,
    settings: ApiCallSettings,
}

impl<Req, Resp> ApiCallableBuilder<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<S>(leaf: S) -> Self
    where
        S: Service<CallContext<Req>, Response = Resp, Error = CallError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self::from_callable(ApiCallable::create(leaf))
    }

    pub fn from_callable(base: ApiCallable<Req, Resp>) -> Self {
        Self {
            base,
            settings: ApiCallSettings::default(),
        }
    }

    pub fn settings(&self) -> &ApiCallSettings {
        &self.settings
    }

    pub fn with_settings(mut self, settings: ApiCallSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn set_retryable_codes(mut self, codes: impl IntoIterator<Item = Code>) -> Self {
        self.settings.retryable_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn set_retry_params(mut self, params: RetryParams) -> Self {
        self.settings.retry_params = Some(params);
        self
    }

    pub fn build(&self, service: &ServiceApiSettings) -> ApiCallable<Req, Resp> {
        let mut callable = self.base.clone();
        if let Some(codes) = &self.settings.retryable_codes {
            callable = callable.retryable_on(codes.iter().copied());
        }
        if let Some(params) = self.settings.retry_params {
            callable = callable.retrying(params, service.scheduler.clone());
        }
        let callable = callable.bind(service.channel.clone());
        debug!(callable = %callable, "Built callable");
        callable
    }
}

/// Builder for a paginated method.
pub struct PageStreamingApiCallableBuilder<D: PageStreamingDescriptor> {
    inner: ApiCallableBuilder<D::Request, D::Response>,
    descriptor: D,
}

impl<D: PageStreamingDescriptor> PageStreamingApiCallableBuilder<D> {
    pub fn new<S>(leaf: S, descriptor: D) -> Self
    where
        S: Service<CallContext<D::Request>, Response = D::Response, Error = CallError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: ApiCallableBuilder::new(leaf),
            descriptor,
        }
    }

    pub fn settings(&self) -> &ApiCallSettings {
        self.inner.settings()
    }

    pub fn with_settings(self, settings: ApiCallSettings) -> Self {
        Self {
            inner: self.inner.with_settings(settings),
            ..self
        }
    }

    pub fn set_retryable_codes(self, codes: impl IntoIterator<Item = Code>) -> Self {
        Self {
            inner: self.inner.set_retryable_codes(codes),
            ..self
        }
    }

    pub fn set_retry_params(self, params: RetryParams) -> Self {
        Self {
            inner: self.inner.set_retry_params(params),
            ..self
        }
    }

    /// The single-page callable, as `build` on a plain builder would make it.
    pub fn build(&self, service: &ServiceApiSettings) -> ApiCallable<D::Request, D::Response> {
        self.inner.build(service)
    }

    pub fn build_page_streaming(
        self,
        service: &ServiceApiSettings,
    ) -> ApiCallable<D::Request, ResourceStream<D::Resource>> {
        self.inner.build(service).page_streaming(self.descriptor)
    }
}

/// A bundling callable together with the factory holding its open bundles.
///
/// `bundler_factory` is `None` when no bundling settings were configured, in
/// which case `callable` calls straight through.
pub struct BundlableApiCallableInfo<D: BundlingDescriptor> {
    pub callable: ApiCallable<D::Request, D::Response>,
    pub bundler_factory: Option<Arc<BundlerFactory<D>>>,
}

/// Builder for a method whose requests may be bundled.
pub struct BundlableApiCallableBuilder<D: BundlingDescriptor> {
    inner: ApiCallableBuilder<D::Request, D::Response>,
    descriptor: D,
    bundling: Option<BundlingSettings>,
}

impl<D> BundlableApiCallableBuilder<D>
where
    D: BundlingDescriptor,
    D::Request: Clone,
{
    pub fn new<S>(leaf: S, descriptor: D) -> Self
    where
        S: Service<CallContext<D::Request>, Response = D::Response, Error = CallError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: ApiCallableBuilder::new(leaf),
            descriptor,
            bundling: None,
        }
    }

    pub fn settings(&self) -> &ApiCallSettings {
        self.inner.settings()
    }

    pub fn bundling_settings(&self) -> Option<&BundlingSettings> {
        self.bundling.as_ref()
    }

    pub fn with_settings(self, settings: ApiCallSettings) -> Self {
        Self {
            inner: self.inner.with_settings(settings),
            ..self
        }
    }

    pub fn set_retryable_codes(self, codes: impl IntoIterator<Item = Code>) -> Self {
        Self {
            inner: self.inner.set_retryable_codes(codes),
            ..self
        }
    }

    pub fn set_retry_params(self, params: RetryParams) -> Self {
        Self {
            inner: self.inner.set_retry_params(params),
            ..self
        }
    }

    pub fn set_bundling_settings(self, settings: BundlingSettings) -> Self {
        Self {
            bundling: Some(settings),
            ..self
        }
    }

    /// Call and bundling settings from a loaded [`ClientConfig`].
    pub fn with_config(self, config: &ClientConfig) -> Self {
        Self {
            inner: self.inner.with_settings(config.call.clone()),
            bundling: config.bundling.clone(),
            ..self
        }
    }

    pub fn build(&self, service: &ServiceApiSettings) -> ApiCallable<D::Request, D::Response> {
        self.inner.build(service)
    }

    pub fn build_bundlable(self, service: &ServiceApiSettings) -> BundlableApiCallableInfo<D> {
        let callable = self.inner.build(service);
        match self.bundling {
            None => BundlableApiCallableInfo {
                callable,
                bundler_factory: None,
            },
            Some(settings) => {
                let factory = Arc::new(BundlerFactory::new(
                    self.descriptor,
                    settings,
                    service.scheduler.clone(),
                ));
                BundlableApiCallableInfo {
                    callable: callable.bundling(factory.clone()),
                    bundler_factory: Some(factory),
                }
            }
        }
    }
}
