//! Request bundling
//!
//! What this module provides
//! - A layer that folds concurrent requests sharing a partition key into one
//!   upstream call and hands each caller its own slice of the response
//!
//! Exports
//! - Models
//!   - `BundlingSettings { delay_threshold, element_count_threshold, byte_threshold, blocking_call_count_threshold }`
//!   - `RequestIssuer` (one caller's pending slot inside a bundle)
//! - Traits
//!   - `BundlingDescriptor` (per-method partition/merge/split/count policy)
//! - Services
//!   - `BundlerFactory<D>` owning the open bundles, shared by every callable of a method
//!   - `BundlingLayer<D>` / `Bundling<S, D>`
//!
//! Flush triggers
//! - Delay: a timer armed when a bundle opens
//! - Element count / byte count: checked after every enqueue
//! - Close: `BundlerFactory::close` flushes everything still open
//!
//! Exactly one bundle is open per partition key. A flush removes it from its
//! partition first, so later requests start a fresh bundle, then issues one
//! upstream call and resolves every issuer exactly once. Partitions are
//! guarded by their own lock; the registry lock is only held to find a
//! partition or to drop one that emptied. A dropped partition is marked
//! retired so a request that raced the removal looks its key up again.

mod bundle;
mod settings;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};
use tracing::debug;

pub use bundle::RequestIssuer;
pub use settings::{BundlingSettings, BundlingSettingsBuilder};

use bundle::{Bundle, Upstream};

use crate::context::CallContext;
use crate::error::{CallError, Result};
use crate::scheduler::Scheduler;

/// Per-method bundling policy.
pub trait BundlingDescriptor: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;
    type Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;

    /// Requests with equal keys may be merged together.
    fn partition_key(&self, request: &Self::Request) -> Self::Key;

    /// Merge requests, given in enqueue order, into one.
    fn merge_requests(&self, requests: &[&Self::Request]) -> Self::Request;

    /// Resolve each issuer with its slice of `response`, in issuer order.
    fn split_response(
        &self,
        response: Self::Response,
        issuers: &mut [RequestIssuer<Self::Request, Self::Response>],
    );

    /// Resolve each issuer with `error`.
    fn split_error(
        &self,
        error: &CallError,
        issuers: &mut [RequestIssuer<Self::Request, Self::Response>],
    ) {
        for issuer in issuers {
            issuer.set_error(error.clone());
        }
    }

    fn count_elements(&self, request: &Self::Request) -> u64;

    fn count_bytes(&self, request: &Self::Request) -> u64;
}

struct Slot<D: BundlingDescriptor> {
    bundle: Option<Bundle<D::Request, D::Response>>,
    /// Removed from the registry; must not take new bundles.
    retired: bool,
}

struct Partition<D: BundlingDescriptor> {
    open: Mutex<Slot<D>>,
}

impl<D: BundlingDescriptor> Partition<D> {
    fn lock(&self) -> MutexGuard<'_, Slot<D>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Enqueued<Resp, Req> {
    Pending(oneshot::Receiver<Result<Resp>>),
    /// No capacity for another bundle; retry with a permit.
    Blocked(CallContext<Req>),
}

/// Owns the open bundles of one method.
///
/// Shared (behind an `Arc`) by every callable that bundles through it.
pub struct BundlerFactory<D: BundlingDescriptor> {
    descriptor: Arc<D>,
    settings: BundlingSettings,
    scheduler: Arc<dyn Scheduler>,
    partitions: Mutex<HashMap<D::Key, Arc<Partition<D>>>>,
    capacity: Option<Arc<Semaphore>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<D: BundlingDescriptor> BundlerFactory<D> {
    pub fn new(descriptor: D, settings: BundlingSettings, scheduler: Arc<dyn Scheduler>) -> Self {
        let capacity = settings
            .max_outstanding_bundles()
            .map(|n| Arc::new(Semaphore::new(n)));
        Self {
            descriptor: Arc::new(descriptor),
            settings,
            scheduler,
            partitions: Mutex::new(HashMap::new()),
            capacity,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &D {
        &self.descriptor
    }

    pub fn settings(&self) -> &BundlingSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of partitions that currently hold an unflushed bundle.
    pub fn open_bundles(&self) -> usize {
        self.registry()
            .values()
            .filter(|partition| partition.lock().bundle.is_some())
            .count()
    }

    /// Flush every open bundle now and reject further requests.
    pub fn close(self: &Arc<Self>) {
        self.closed.store(true, Ordering::Release);
        let bundles: Vec<_> = {
            let mut registry = self.registry();
            registry
                .drain()
                .filter_map(|(_, partition)| {
                    let mut slot = partition.lock();
                    slot.retired = true;
                    slot.bundle.take()
                })
                .collect()
        };
        for bundle in bundles {
            self.flush(bundle, "close");
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<D::Key, Arc<Partition<D>>>> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn partition(&self, key: &D::Key) -> Arc<Partition<D>> {
        self.registry()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Partition {
                    open: Mutex::new(Slot {
                        bundle: None,
                        retired: false,
                    }),
                })
            })
            .clone()
    }

    /// Drop `partition` from the registry if it is still the one registered
    /// for `key` and holds no open bundle.
    fn prune(&self, key: &D::Key, partition: &Arc<Partition<D>>) {
        let mut registry = self.registry();
        if !registry
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, partition))
        {
            return;
        }
        let mut slot = partition.lock();
        if slot.bundle.is_none() {
            slot.retired = true;
            drop(slot);
            registry.remove(key);
        }
    }

    fn reached_threshold(&self, bundle: &Bundle<D::Request, D::Response>) -> bool {
        self.settings
            .element_count_threshold
            .is_some_and(|n| bundle.element_count >= n)
            || self
                .settings
                .byte_threshold
                .is_some_and(|n| bundle.byte_count >= n)
    }

    fn enqueue(
        self: &Arc<Self>,
        ctx: CallContext<D::Request>,
        upstream: impl FnOnce() -> Upstream<D::Request, D::Response>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Enqueued<D::Response, D::Request>> {
        if self.is_closed() {
            return Err(CallError::BundlerClosed);
        }
        let key = self.descriptor.partition_key(ctx.request());
        let partition = self.partition(&key);
        let mut slot = partition.lock();
        if slot.retired {
            // Pruned between lookup and lock.
            drop(slot);
            return self.enqueue(ctx, upstream, permit);
        }
        // `close` retires partitions under this lock, so the flag is final here.
        if self.is_closed() {
            return Err(CallError::BundlerClosed);
        }

        if slot.bundle.is_none() {
            let permit = match (&self.capacity, permit) {
                (None, _) => None,
                (Some(_), Some(permit)) => Some(permit),
                (Some(capacity), None) => match capacity.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => return Ok(Enqueued::Blocked(ctx)),
                },
            };
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let template = ctx.clone_without_request();
            let mut bundle = Bundle::open(id, template, upstream(), permit);
            if !self.settings.delay_threshold.is_zero() {
                let factory = Arc::clone(self);
                let target = Arc::clone(&partition);
                let target_key = key.clone();
                bundle.timer = Some(self.scheduler.schedule(
                    self.settings.delay_threshold,
                    async move { factory.flush_if_open(&target_key, &target, id) }.boxed(),
                ));
            }
            debug!(?key, bundle = id, "Opened bundle");
            slot.bundle = Some(bundle);
        }

        let request = ctx.into_request();
        let elements = self.descriptor.count_elements(&request);
        let bytes = self.descriptor.count_bytes(&request);
        let Some(bundle) = slot.bundle.as_mut() else {
            return Err(CallError::Bundling("partition has no open bundle".into()));
        };
        let rx = bundle.push(request, elements, bytes);

        let full = if self.reached_threshold(bundle) {
            slot.bundle.take()
        } else {
            None
        };
        drop(slot);
        if let Some(full) = full {
            self.prune(&key, &partition);
            self.flush(full, "threshold");
        }
        Ok(Enqueued::Pending(rx))
    }

    fn flush_if_open(&self, key: &D::Key, partition: &Arc<Partition<D>>, id: u64) {
        let bundle = {
            let mut slot = partition.lock();
            match slot.bundle.as_ref() {
                Some(bundle) if bundle.id == id => slot.bundle.take(),
                _ => None,
            }
        };
        if let Some(mut bundle) = bundle {
            // Running inside the timer task itself.
            bundle.timer = None;
            self.prune(key, partition);
            self.flush(bundle, "delay");
        }
    }

    fn flush(&self, mut bundle: Bundle<D::Request, D::Response>, trigger: &'static str) {
        bundle.cancel_timer();
        let descriptor = Arc::clone(&self.descriptor);
        debug!(
            bundle = bundle.id,
            requests = bundle.issuers.len(),
            elements = bundle.element_count,
            bytes = bundle.byte_count,
            trigger,
            "Flushing bundle"
        );
        self.scheduler.spawn(
            async move {
                let Bundle {
                    id,
                    mut issuers,
                    context,
                    upstream,
                    permit,
                    ..
                } = bundle;
                let merged = {
                    let requests: Vec<_> = issuers.iter().map(|issuer| issuer.request()).collect();
                    descriptor.merge_requests(&requests)
                };
                match upstream.oneshot(context.with_request(merged)).await {
                    Ok(response) => descriptor.split_response(response, &mut issuers),
                    Err(error) => {
                        debug!(bundle = id, %error, "Bundle call failed");
                        descriptor.split_error(&error, &mut issuers);
                    }
                }
                for issuer in issuers.iter_mut().filter(|issuer| !issuer.is_resolved()) {
                    issuer.set_error(CallError::Bundling(format!(
                        "bundle {id} left a request unresolved"
                    )));
                }
                drop(permit);
            }
            .boxed(),
        );
    }
}

impl<D: BundlingDescriptor> fmt::Debug for BundlerFactory<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundlerFactory")
            .field("settings", &self.settings)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

pub struct BundlingLayer<D: BundlingDescriptor> {
    factory: Arc<BundlerFactory<D>>,
}

impl<D: BundlingDescriptor> BundlingLayer<D> {
    pub fn new(factory: Arc<BundlerFactory<D>>) -> Self {
        Self { factory }
    }
}

impl<S, D: BundlingDescriptor> Layer<S> for BundlingLayer<D> {
    type Service = Bundling<S, D>;
    fn layer(&self, inner: S) -> Self::Service {
        Bundling {
            inner,
            factory: self.factory.clone(),
        }
    }
}

pub struct Bundling<S, D: BundlingDescriptor> {
    inner: S,
    factory: Arc<BundlerFactory<D>>,
}

impl<S: Clone, D: BundlingDescriptor> Clone for Bundling<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            factory: self.factory.clone(),
        }
    }
}

fn await_issuer<Resp>(rx: oneshot::Receiver<Result<Resp>>) -> impl Future<Output = Result<Resp>> {
    rx.map(|received| received.unwrap_or(Err(CallError::Cancelled)))
}

impl<S, D> Service<CallContext<D::Request>> for Bundling<S, D>
where
    D: BundlingDescriptor,
    S: Service<CallContext<D::Request>, Response = D::Response, Error = CallError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = D::Response;
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
        let upstream = move || BoxCloneService::new(inner);
        match self.factory.enqueue(ctx, upstream.clone(), None) {
            Err(error) => Box::pin(async move { Err(error) }),
            Ok(Enqueued::Pending(rx)) => Box::pin(await_issuer(rx)),
            Ok(Enqueued::Blocked(ctx)) => {
                let factory = self.factory.clone();
                let capacity = factory.capacity.clone();
                Box::pin(async move {
                    let Some(capacity) = capacity else {
                        return Err(CallError::Bundling("bundler reported no capacity".into()));
                    };
                    debug!("Waiting for bundle capacity");
                    let permit = capacity
                        .acquire_owned()
                        .await
                        .map_err(|_| CallError::BundlerClosed)?;
                    match factory.enqueue(ctx, upstream, Some(permit))? {
                        Enqueued::Pending(rx) => await_issuer(rx).await,
                        Enqueued::Blocked(_) => {
                            Err(CallError::Bundling("bundle capacity lost".into()))
                        }
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use crate::status::Status;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};
    use tower::service_fn;

    #[derive(Debug, Clone, PartialEq)]
    struct LabeledIntList {
        label: String,
        ints: Vec<i64>,
    }

    fn labeled(label: &str, ints: &[i64]) -> CallContext<LabeledIntList> {
        CallContext::of(LabeledIntList {
            label: label.to_string(),
            ints: ints.to_vec(),
        })
    }

    struct SquarerDescriptor;

    impl BundlingDescriptor for SquarerDescriptor {
        type Request = LabeledIntList;
        type Response = Vec<i64>;
        type Key = String;

        fn partition_key(&self, request: &LabeledIntList) -> String {
            request.label.clone()
        }

        fn merge_requests(&self, requests: &[&LabeledIntList]) -> LabeledIntList {
            LabeledIntList {
                label: requests[0].label.clone(),
                ints: requests.iter().flat_map(|r| r.ints.iter().copied()).collect(),
            }
        }

        fn split_response(
            &self,
            response: Vec<i64>,
            issuers: &mut [RequestIssuer<LabeledIntList, Vec<i64>>],
        ) {
            let mut rest = response.into_iter();
            for issuer in issuers {
                let n = issuer.request().ints.len();
                let slice: Vec<i64> = rest.by_ref().take(n).collect();
                issuer.set_response(slice);
            }
        }

        fn count_elements(&self, request: &LabeledIntList) -> u64 {
            request.ints.len() as u64
        }

        fn count_bytes(&self, request: &LabeledIntList) -> u64 {
            (request.ints.len() * std::mem::size_of::<i64>()) as u64
        }
    }

    /// Squares every element and records the merged requests it saw.
    fn squarer(
        calls: Arc<Mutex<Vec<LabeledIntList>>>,
    ) -> BoxCloneService<CallContext<LabeledIntList>, Vec<i64>, CallError> {
        BoxCloneService::new(service_fn(move |ctx: CallContext<LabeledIntList>| {
            calls.lock().unwrap().push(ctx.request().clone());
            let out = ctx.request().ints.iter().map(|i| i * i).collect();
            async move { Ok::<_, CallError>(out) }
        }))
    }

    fn factory(settings: BundlingSettings) -> Arc<BundlerFactory<SquarerDescriptor>> {
        Arc::new(BundlerFactory::new(
            SquarerDescriptor,
            settings,
            Arc::new(TokioScheduler::current()),
        ))
    }

    #[tokio::test]
    async fn element_threshold_flushes_merged_bundle() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = factory(
            BundlingSettings::builder()
                .delay_threshold(Duration::from_secs(10))
                .element_count_threshold(4)
                .build()
                .unwrap(),
        );
        let svc = BundlingLayer::new(factory.clone()).layer(squarer(calls.clone()));

        let f1 = svc.clone().oneshot(labeled("one", &[1, 2]));
        let f2 = svc.clone().oneshot(labeled("one", &[3, 4]));
        let (r1, r2) = timeout(Duration::from_secs(1), async { tokio::join!(f1, f2) })
            .await
            .expect("threshold flush should not wait for the delay");
        assert_eq!(r1.unwrap(), vec![1, 4]);
        assert_eq!(r2.unwrap(), vec![9, 16]);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].ints, vec![1, 2, 3, 4]);
        assert_eq!(factory.open_bundles(), 0);
    }

    #[tokio::test]
    async fn byte_threshold_flushes() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = factory(
            BundlingSettings::builder()
                .delay_threshold(Duration::from_secs(10))
                .byte_threshold(16)
                .build()
                .unwrap(),
        );
        let svc = BundlingLayer::new(factory).layer(squarer(calls.clone()));
        let out = timeout(
            Duration::from_secs(1),
            svc.oneshot(labeled("bytes", &[5, 6])),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(out, vec![25, 36]);
    }

    #[tokio::test]
    async fn delay_threshold_flushes_partial_bundle() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = factory(
            BundlingSettings::builder()
                .delay_threshold(Duration::from_millis(30))
                .element_count_threshold(100)
                .build()
                .unwrap(),
        );
        let mut svc = BundlingLayer::new(factory.clone()).layer(squarer(calls.clone()));
        let started = Instant::now();
        let f1 = svc.call(labeled("slow", &[2]));
        let f2 = svc.call(labeled("slow", &[3]));
        assert_eq!(factory.open_bundles(), 1);
        let (r1, r2) = tokio::join!(f1, f2);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(r1.unwrap(), vec![4]);
        assert_eq!(r2.unwrap(), vec![9]);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partitions_flush_independently() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = factory(
            BundlingSettings::builder()
                .delay_threshold(Duration::from_millis(20))
                .element_count_threshold(2)
                .build()
                .unwrap(),
        );
        let svc = BundlingLayer::new(factory).layer(squarer(calls.clone()));
        let a = svc.clone().oneshot(labeled("a", &[1]));
        let b = svc.clone().oneshot(labeled("b", &[2]));
        let a2 = svc.clone().oneshot(labeled("a", &[3]));
        let (a, b, a2) = tokio::join!(a, b, a2);
        assert_eq!(a.unwrap(), vec![1]);
        assert_eq!(b.unwrap(), vec![4]);
        assert_eq!(a2.unwrap(), vec![9]);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let merged_a = calls.iter().find(|c| c.label == "a").unwrap();
        assert_eq!(merged_a.ints, vec![1, 3]);
    }

    #[tokio::test]
    async fn upstream_error_reaches_every_caller() {
        let failing = BoxCloneService::new(service_fn(|_ctx: CallContext<LabeledIntList>| async {
            Err::<Vec<i64>, _>(CallError::from(Status::unavailable("I FAIL!!")))
        }));
        let factory = factory(
            BundlingSettings::builder()
                .delay_threshold(Duration::from_secs(1))
                .element_count_threshold(4)
                .build()
                .unwrap(),
        );
        let svc = BundlingLayer::new(factory).layer(failing);
        let (r1, r2) = tokio::join!(
            svc.clone().oneshot(labeled("one", &[1, 2])),
            svc.clone().oneshot(labeled("one", &[3, 4])),
        );
        for result in [r1, r2] {
            let err = result.unwrap_err();
            assert!(err.to_string().contains("I FAIL!!"));
        }
    }

    struct LazyDescriptor;

    impl BundlingDescriptor for LazyDescriptor {
        type Request = u32;
        type Response = u32;
        type Key = ();

        fn partition_key(&self, _request: &u32) {}

        fn merge_requests(&self, requests: &[&u32]) -> u32 {
            requests.iter().copied().sum()
        }

        fn split_response(&self, response: u32, issuers: &mut [RequestIssuer<u32, u32>]) {
            // Only answers the first caller.
            if let Some(first) = issuers.first_mut() {
                first.set_response(response);
            }
        }

        fn count_elements(&self, _request: &u32) -> u64 {
            1
        }

        fn count_bytes(&self, _request: &u32) -> u64 {
            4
        }
    }

    #[tokio::test]
    async fn unresolved_issuers_get_an_error() {
        let factory = Arc::new(BundlerFactory::new(
            LazyDescriptor,
            BundlingSettings::builder()
                .element_count_threshold(2)
                .build()
                .unwrap(),
            Arc::new(TokioScheduler::current()),
        ));
        let echo = service_fn(|ctx: CallContext<u32>| async move {
            Ok::<_, CallError>(ctx.into_request())
        });
        let svc = BundlingLayer::new(factory).layer(echo);
        let (r1, r2) = tokio::join!(
            svc.clone().oneshot(CallContext::of(1)),
            svc.clone().oneshot(CallContext::of(2)),
        );
        assert_eq!(r1.unwrap(), 3);
        assert!(matches!(r2, Err(CallError::Bundling(_))));
    }

    #[tokio::test]
    async fn blocking_threshold_bounds_outstanding_bundles() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (i, p) = (in_flight.clone(), peak.clone());
        let slow = service_fn(move |ctx: CallContext<LabeledIntList>| {
            let (i, p) = (i.clone(), p.clone());
            async move {
                let now = i.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                i.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, CallError>(ctx.request().ints.clone())
            }
        });
        let factory = factory(
            BundlingSettings::builder()
                .delay_threshold(Duration::from_millis(5))
                .blocking_call_count_threshold(1)
                .build()
                .unwrap(),
        );
        let svc = BundlingLayer::new(factory).layer(slow);
        let (a, b, c) = tokio::join!(
            svc.clone().oneshot(labeled("a", &[1])),
            svc.clone().oneshot(labeled("b", &[2])),
            svc.clone().oneshot(labeled("c", &[3])),
        );
        assert_eq!(a.unwrap(), vec![1]);
        assert_eq!(b.unwrap(), vec![2]);
        assert_eq!(c.unwrap(), vec![3]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_flushes_and_rejects() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = factory(
            BundlingSettings::builder()
                .delay_threshold(Duration::from_secs(60))
                .build()
                .unwrap(),
        );
        let mut svc = BundlingLayer::new(factory.clone()).layer(squarer(calls.clone()));
        let pending = svc.call(labeled("one", &[7]));
        assert_eq!(factory.open_bundles(), 1);
        factory.close();
        assert_eq!(
            timeout(Duration::from_secs(1), pending).await.unwrap().unwrap(),
            vec![49]
        );
        let err = svc.oneshot(labeled("one", &[1])).await.unwrap_err();
        assert!(matches!(err, CallError::BundlerClosed));
    }

    #[tokio::test]
    async fn flushed_partitions_leave_the_registry() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = factory(
            BundlingSettings::builder()
                .delay_threshold(Duration::from_secs(10))
                .element_count_threshold(1)
                .build()
                .unwrap(),
        );
        let svc = BundlingLayer::new(factory.clone()).layer(squarer(calls.clone()));
        let results = futures::future::join_all(
            (0..500i64).map(|i| svc.clone().oneshot(labeled(&format!("tenant-{i}"), &[i]))),
        )
        .await;
        for (i, result) in (0..500i64).zip(results) {
            assert_eq!(result.unwrap(), vec![i * i]);
        }
        assert_eq!(calls.lock().unwrap().len(), 500);
        assert_eq!(factory.open_bundles(), 0);
        assert!(factory.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_flush_cancels_delay_timer() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = factory(
            BundlingSettings::builder()
                .delay_threshold(Duration::from_millis(100))
                .element_count_threshold(2)
                .build()
                .unwrap(),
        );
        let mut svc = BundlingLayer::new(factory.clone()).layer(squarer(calls.clone()));
        let first = svc.call(labeled("k", &[1]));
        let second = svc.call(labeled("k", &[2]));
        let (r1, r2) = tokio::join!(first, second);
        assert_eq!(r1.unwrap(), vec![1]);
        assert_eq!(r2.unwrap(), vec![4]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let opened = Instant::now();
        let third = svc.call(labeled("k", &[3]));

        // Past the moment the first bundle's timer was due.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(factory.open_bundles(), 1);
        assert_eq!(calls.lock().unwrap().len(), 1);

        assert_eq!(third.await.unwrap(), vec![9]);
        assert!(opened.elapsed() >= Duration::from_millis(100));
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert!(factory.registry().is_empty());
    }

    #[test]
    fn close_while_waiting_for_partition_rejects() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let factory = Arc::new(BundlerFactory::new(
            SquarerDescriptor,
            BundlingSettings::builder()
                .delay_threshold(Duration::from_secs(10))
                .build()
                .unwrap(),
            Arc::new(TokioScheduler::new(rt.handle().clone())),
        ));
        let svc = BundlingLayer::new(factory.clone()).layer(squarer(Arc::default()));

        // Hold the partition so the caller stalls after its first closed check.
        let partition = factory.partition(&"late".to_string());
        let guard = partition.lock();
        std::thread::scope(|scope| {
            let caller = scope.spawn(move || {
                let mut svc = svc;
                svc.call(labeled("late", &[1]))
            });
            std::thread::sleep(Duration::from_millis(50));
            factory.closed.store(true, Ordering::Release);
            drop(guard);

            let pending = caller.join().unwrap();
            let err = futures::executor::block_on(pending).unwrap_err();
            assert!(matches!(err, CallError::BundlerClosed));
        });
        assert_eq!(factory.open_bundles(), 0);
    }
}
