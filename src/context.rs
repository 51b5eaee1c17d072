//! # Call contexts
//!
//! A [`CallContext`] is the immutable envelope a single call travels in: the
//! request, an optional channel handle, and the [`CallOptions`] (deadline and
//! metadata) the transport should honor. Decorators never mutate a context in
//! place; every `with_*` method consumes the old value and returns a new one,
//! so a context captured by a scheduled retry can never be changed under it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Opaque handle to whatever transport the leaf callable talks through.
///
/// The engine never looks inside a channel. It only passes it along, so any
/// `Send + Sync` value can be wrapped; leaves recover it with
/// [`Channel::downcast_ref`].
#[derive(Clone)]
pub struct Channel {
    target: Arc<str>,
    handle: Arc<dyn Any + Send + Sync>,
}

impl Channel {
    pub fn new<T>(target: impl Into<String>, handle: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            target: Arc::from(target.into()),
            handle: Arc::new(handle),
        }
    }

    /// A channel with no payload, identified only by its target.
    pub fn named(target: impl Into<String>) -> Self {
        Self::new(target, ())
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }

    /// True when both values refer to the same underlying handle.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Transport options for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    deadline: Option<Instant>,
    metadata: Vec<(String, String)>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_deadline_after(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn without_deadline(mut self) -> Self {
        self.deadline = None;
        self
    }

    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Everything one call needs: request, channel and options.
#[derive(Debug, Clone)]
pub struct CallContext<Req> {
    request: Req,
    channel: Option<Channel>,
    options: CallOptions,
}

impl<Req> CallContext<Req> {
    /// A context with no channel and default options.
    pub fn of(request: Req) -> Self {
        Self {
            request,
            channel: None,
            options: CallOptions::default(),
        }
    }

    pub fn request(&self) -> &Req {
        &self.request
    }

    pub fn into_request(self) -> Req {
        self.request
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.options.deadline()
    }

    pub fn with_channel(self, channel: Channel) -> Self {
        Self {
            channel: Some(channel),
            ..self
        }
    }

    pub fn with_options(self, options: CallOptions) -> Self {
        Self { options, ..self }
    }

    /// Replaces the request, keeping channel and options.
    pub fn with_request<R>(self, request: R) -> CallContext<R> {
        CallContext {
            request,
            channel: self.channel,
            options: self.options,
        }
    }

    /// Copy of the channel and options with the request stripped.
    pub fn clone_without_request(&self) -> CallContext<()> {
        CallContext {
            request: (),
            channel: self.channel.clone(),
            options: self.options.clone(),
        }
    }

    /// Narrows the deadline to `now + timeout`, never extending an earlier one.
    pub fn with_deadline_within(self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        match self.options.deadline() {
            Some(existing) if existing <= candidate => self,
            _ => {
                let options = self.options.clone().with_deadline(candidate);
                self.with_options(options)
            }
        }
    }
}

impl<Req> From<Req> for CallContext<Req> {
    fn from(request: Req) -> Self {
        CallContext::of(request)
    }
}
