//! Retry with exponential backoff and deadline propagation
//!
//! A retry sequence has two clocks:
//!
//! - a total deadline, fixed once when the sequence starts (`now + total_timeout`,
//!   intersected with any deadline the caller already set), after which no new
//!   attempt is issued;
//! - a per-attempt timeout that grows by its own backoff and narrows each
//!   attempt's context deadline (never past the total one).
//!
//! Between attempts the sequence waits a random duration drawn from
//! `[0, retry_delay)`, where `retry_delay` is the ceiling *before* it is grown
//! for the next round. Each wait is a one-shot task on the [`Scheduler`] that
//! re-enters the sequence with a fresh [`RetryState`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::config::millis;
use crate::context::CallContext;
use crate::error::{ApiError, CallError, Result};
use crate::scheduler::Scheduler;

/// Growth policy for a delay: start at `initial_delay`, multiply by
/// `delay_multiplier` after every failure, never exceed `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffParams {
    #[serde(rename = "initial_delay_millis", with = "millis")]
    pub initial_delay: Duration,
    pub delay_multiplier: f64,
    #[serde(rename = "max_delay_millis", with = "millis")]
    pub max_delay: Duration,
}

impl BackoffParams {
    pub fn new(initial_delay: Duration, delay_multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            delay_multiplier,
            max_delay,
        }
    }

    pub fn builder() -> BackoffParamsBuilder {
        BackoffParamsBuilder::default()
    }

    /// The value following `current`: `min(current * multiplier, max_delay)`.
    pub fn grow(&self, current: Duration) -> Duration {
        let scaled = Duration::try_from_secs_f64(current.as_secs_f64() * self.delay_multiplier)
            .unwrap_or(Duration::MAX);
        scaled.min(self.max_delay)
    }

    /// Ceiling in effect for the `n`th wait (1-based).
    pub fn ceiling(&self, n: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..n {
            delay = self.grow(delay);
        }
        delay
    }

    pub fn validate(&self) -> Result<()> {
        if !self.delay_multiplier.is_finite() || self.delay_multiplier < 1.0 {
            return Err(CallError::Config(format!(
                "delay multiplier must be a finite value >= 1.0, got {}",
                self.delay_multiplier
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(CallError::Config(format!(
                "max delay {:?} is below initial delay {:?}",
                self.max_delay, self.initial_delay
            )));
        }
        Ok(())
    }
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            delay_multiplier: 1.3,
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
pub struct BackoffParamsBuilder {
    params: BackoffParams,
}

impl BackoffParamsBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.params.initial_delay = delay;
        self
    }

    pub fn delay_multiplier(mut self, multiplier: f64) -> Self {
        self.params.delay_multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.params.max_delay = delay;
        self
    }

    pub fn build(self) -> Result<BackoffParams> {
        self.params.validate()?;
        Ok(self.params)
    }
}

/// Retry policy: how the inter-attempt delay grows, how the per-attempt
/// timeout grows, and the budget for the whole sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryParams {
    pub retry_backoff: BackoffParams,
    pub timeout_backoff: BackoffParams,
    #[serde(rename = "total_timeout_millis", with = "millis")]
    pub total_timeout: Duration,
}

impl RetryParams {
    pub fn builder() -> RetryParamsBuilder {
        RetryParamsBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        self.retry_backoff.validate()?;
        self.timeout_backoff.validate()
    }
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            retry_backoff: BackoffParams::default(),
            timeout_backoff: BackoffParams::new(
                Duration::from_secs(20),
                1.0,
                Duration::from_secs(20),
            ),
            total_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default)]
pub struct RetryParamsBuilder {
    params: RetryParams,
}

impl RetryParamsBuilder {
    pub fn retry_backoff(mut self, backoff: BackoffParams) -> Self {
        self.params.retry_backoff = backoff;
        self
    }

    pub fn timeout_backoff(mut self, backoff: BackoffParams) -> Self {
        self.params.timeout_backoff = backoff;
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.params.total_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RetryParams> {
        self.params.validate()?;
        Ok(self.params)
    }
}

/// Uniform random wait in `[0, ceiling)`; zero when the ceiling is zero.
pub fn jittered(ceiling: Duration) -> Duration {
    let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

/// Progress of one retry sequence.
///
/// Never updated in place: a failed attempt produces the next state via
/// [`RetryState::after_failure`].
#[derive(Debug, Clone)]
pub struct RetryState<Req> {
    context: CallContext<Req>,
    retry_delay: Duration,
    attempt_timeout: Duration,
    last_error: Option<ApiError>,
    attempts: u32,
}

impl<Req> RetryState<Req> {
    /// Initial state; fixes the total deadline on the context.
    pub fn start(context: CallContext<Req>, params: &RetryParams) -> Self {
        Self {
            context: context.with_deadline_within(params.total_timeout),
            retry_delay: params.retry_backoff.initial_delay,
            attempt_timeout: params.timeout_backoff.initial_delay,
            last_error: None,
            attempts: 0,
        }
    }

    pub fn context(&self) -> &CallContext<Req> {
        &self.context
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn last_error(&self) -> Option<&ApiError> {
        self.last_error.as_ref()
    }

    /// Attempts issued so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Deadline of the whole sequence.
    pub fn total_deadline(&self) -> Option<Instant> {
        self.context.deadline()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.total_deadline().is_some_and(|deadline| now >= deadline)
    }

    /// State for the next attempt after a retryable failure.
    pub fn after_failure(self, params: &RetryParams, error: ApiError) -> Self {
        Self {
            context: self.context,
            retry_delay: params.retry_backoff.grow(self.retry_delay),
            attempt_timeout: params.timeout_backoff.grow(self.attempt_timeout),
            last_error: Some(error),
            attempts: self.attempts,
        }
    }
}

impl<Req> RetryState<Req> {
    fn issued(self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self
        }
    }
}

impl<Req: Clone> RetryState<Req> {
    /// Context for the next attempt, deadline narrowed to the attempt timeout.
    fn attempt_context(&self) -> CallContext<Req> {
        self.context.clone().with_deadline_within(self.attempt_timeout)
    }
}

pub struct RetryingLayer {
    params: Arc<RetryParams>,
    scheduler: Arc<dyn Scheduler>,
}

impl RetryingLayer {
    pub fn new(params: RetryParams, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            params: Arc::new(params),
            scheduler,
        }
    }
}

impl<S> Layer<S> for RetryingLayer {
    type Service = Retrying<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retrying {
            inner,
            params: self.params.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Retrying<S> {
    inner: S,
    params: Arc<RetryParams>,
    scheduler: Arc<dyn Scheduler>,
}

/// Drives one sequence; moved into each scheduled re-attempt.
struct Retryer<S, Resp> {
    inner: S,
    params: Arc<RetryParams>,
    scheduler: Arc<dyn Scheduler>,
    sink: oneshot::Sender<Result<Resp>>,
}

impl<S, Resp> Retryer<S, Resp>
where
    Resp: Send + 'static,
{
    fn run<Req>(self, state: RetryState<Req>) -> BoxFuture<'static, ()>
    where
        Req: Clone + Send + 'static,
        S: Service<CallContext<Req>, Response = Resp, Error = CallError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        async move {
            if self.sink.is_closed() {
                debug!(attempts = state.attempts, "Caller went away, abandoning retries");
                return;
            }
            if state.is_expired(Instant::now()) {
                warn!(attempts = state.attempts, "Total deadline exceeded");
                let _ = self.sink.send(Err(CallError::DeadlineExceeded {
                    last: state.last_error,
                }));
                return;
            }

            let state = state.issued();
            let result = self.inner.clone().oneshot(state.attempt_context()).await;

            match result {
                Ok(response) => {
                    if state.attempts > 1 {
                        debug!("Call succeeded after {} attempts", state.attempts);
                    }
                    let _ = self.sink.send(Ok(response));
                }
                Err(CallError::Api(error)) if error.is_retryable() => {
                    let wait = jittered(state.retry_delay);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        state.attempts, error, wait
                    );
                    let next = state.after_failure(&self.params, error);
                    let scheduler = self.scheduler.clone();
                    scheduler.schedule(wait, self.run(next));
                }
                Err(error) => {
                    debug!("Non-retryable error: {}", error);
                    let _ = self.sink.send(Err(error));
                }
            }
        }
        .boxed()
    }
}

impl<S, Req> Service<CallContext<Req>> for Retrying<S>
where
    Req: Clone + Send + 'static,
    S: Service<CallContext<Req>, Error = CallError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = CallError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: CallContext<Req>) -> Self::Future {
        let (sink, result) = oneshot::channel();
        let state = RetryState::start(ctx, &self.params);
        let retryer = Retryer {
            inner: self.inner.clone(),
            params: self.params.clone(),
            scheduler: self.scheduler.clone(),
            sink,
        };
        Box::pin(async move {
            retryer.run(state).await;
            result.await.unwrap_or(Err(CallError::Cancelled))
        })
    }
}
