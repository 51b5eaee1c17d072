//! Default channel injection
//!
//! A call made without a channel gets the one bound at construction; a call
//! that already names a channel is forwarded untouched.

use tower::{Layer, Service};

use crate::context::{CallContext, Channel};

#[derive(Debug, Clone)]
pub struct BindChannelLayer {
    channel: Channel,
}

impl BindChannelLayer {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

impl<S> Layer<S> for BindChannelLayer {
    type Service = ChannelBinding<S>;
    fn layer(&self, inner: S) -> Self::Service {
        ChannelBinding {
            inner,
            channel: self.channel.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelBinding<S> {
    inner: S,
    channel: Channel,
}

impl<S, Req> Service<CallContext<Req>> for ChannelBinding<S>
where
    S: Service<CallContext<Req>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, ctx: CallContext<Req>) -> Self::Future {
        let ctx = if ctx.channel().is_none() {
            ctx.with_channel(self.channel.clone())
        } else {
            ctx
        };
        self.inner.call(ctx)
    }
}
