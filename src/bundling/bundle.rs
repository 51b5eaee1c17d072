use std::fmt;

use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tower::util::BoxCloneService;

use crate::context::CallContext;
use crate::error::{CallError, Result};
use crate::scheduler::ScheduledTask;

/// Service a bundle sends its merged request to.
pub(crate) type Upstream<Req, Resp> = BoxCloneService<CallContext<Req>, Resp, CallError>;

/// One caller's request waiting inside a bundle.
///
/// Resolved at most once; later `set_response`/`set_error` calls are ignored.
pub struct RequestIssuer<Req, Resp> {
    request: Req,
    sink: Option<oneshot::Sender<Result<Resp>>>,
}

impl<Req, Resp> RequestIssuer<Req, Resp> {
    pub(crate) fn new(request: Req) -> (Self, oneshot::Receiver<Result<Resp>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                sink: Some(tx),
            },
            rx,
        )
    }

    pub fn request(&self) -> &Req {
        &self.request
    }

    pub fn is_resolved(&self) -> bool {
        self.sink.is_none()
    }

    pub fn set_response(&mut self, response: Resp) {
        self.resolve(Ok(response));
    }

    pub fn set_error(&mut self, error: CallError) {
        self.resolve(Err(error));
    }

    fn resolve(&mut self, result: Result<Resp>) {
        if let Some(sink) = self.sink.take() {
            // Receiver gone means the caller stopped waiting.
            let _ = sink.send(result);
        }
    }
}

impl<Req: fmt::Debug, Resp> fmt::Debug for RequestIssuer<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestIssuer")
            .field("request", &self.request)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// The open batch for one partition key.
pub(crate) struct Bundle<Req, Resp> {
    pub(crate) id: u64,
    pub(crate) issuers: Vec<RequestIssuer<Req, Resp>>,
    pub(crate) element_count: u64,
    pub(crate) byte_count: u64,
    /// Channel and options of the first request; the merged call uses them.
    pub(crate) context: CallContext<()>,
    pub(crate) upstream: Upstream<Req, Resp>,
    pub(crate) timer: Option<ScheduledTask>,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl<Req, Resp> Bundle<Req, Resp> {
    pub(crate) fn open(
        id: u64,
        context: CallContext<()>,
        upstream: Upstream<Req, Resp>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            id,
            issuers: Vec::new(),
            element_count: 0,
            byte_count: 0,
            context,
            upstream,
            timer: None,
            permit,
        }
    }

    pub(crate) fn push(
        &mut self,
        request: Req,
        elements: u64,
        bytes: u64,
    ) -> oneshot::Receiver<Result<Resp>> {
        let (issuer, rx) = RequestIssuer::new(request);
        self.issuers.push(issuer);
        self.element_count = self.element_count.saturating_add(elements);
        self.byte_count = self.byte_count.saturating_add(bytes);
        rx
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
