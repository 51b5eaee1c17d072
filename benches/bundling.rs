use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use futures::future::join_all;
use tokio::runtime::Runtime;
use tower::service_fn;
use tower_callable::{
    ApiCallable, BundlerFactory, BundlingDescriptor, BundlingSettings, CallContext, CallError,
    RequestIssuer, TokioScheduler,
};

// Merges per-tenant id lists; the upstream echoes them back doubled.
struct Doubler;

impl BundlingDescriptor for Doubler {
    type Request = (u8, Vec<u64>);
    type Response = Vec<u64>;
    type Key = u8;

    fn partition_key(&self, request: &(u8, Vec<u64>)) -> u8 {
        request.0
    }

    fn merge_requests(&self, requests: &[&(u8, Vec<u64>)]) -> (u8, Vec<u64>) {
        let ids = requests.iter().flat_map(|r| r.1.iter().copied()).collect();
        (requests[0].0, ids)
    }

    fn split_response(
        &self,
        response: Vec<u64>,
        issuers: &mut [RequestIssuer<(u8, Vec<u64>), Vec<u64>>],
    ) {
        let mut rest = response.into_iter();
        for issuer in issuers {
            let n = issuer.request().1.len();
            issuer.set_response(rest.by_ref().take(n).collect());
        }
    }

    fn count_elements(&self, request: &(u8, Vec<u64>)) -> u64 {
        request.1.len() as u64
    }

    fn count_bytes(&self, request: &(u8, Vec<u64>)) -> u64 {
        (request.1.len() * 8) as u64
    }
}

fn callable(rt: &Runtime, element_count: u64) -> ApiCallable<(u8, Vec<u64>), Vec<u64>> {
    let leaf = service_fn(|ctx: CallContext<(u8, Vec<u64>)>| async move {
        Ok::<_, CallError>(ctx.request().1.iter().map(|i| i * 2).collect::<Vec<u64>>())
    });
    let settings = BundlingSettings::builder()
        .delay_threshold(Duration::from_millis(1))
        .element_count_threshold(element_count)
        .build()
        .unwrap();
    let factory = Arc::new(BundlerFactory::new(
        Doubler,
        settings,
        Arc::new(TokioScheduler::new(rt.handle().clone())),
    ));
    ApiCallable::create(leaf).bundling(factory)
}

fn bench_bundling(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    for batch in [1u64, 16, 64] {
        let callable = callable(&rt, batch);
        c.bench_function(&format!("bundle_64_requests_threshold_{batch}"), |b| {
            b.to_async(&rt).iter_batched(
                || callable.clone(),
                |callable| async move {
                    let calls = (0..64u64).map(|i| {
                        callable.future_call(CallContext::of(((i % 4) as u8, vec![i])))
                    });
                    for result in join_all(calls).await {
                        result.unwrap();
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, bench_bundling);
criterion_main!(benches);
