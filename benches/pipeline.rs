use std::collections::BTreeSet;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use authpipe::prelude::{
    AuthEndpoint, AuthProvider, Pipeline, Request, Response, RetryPolicy, Transport,
    TransportError,
};
use authpipe::BoxFuture;
use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use http::header::AUTHORIZATION;
use http::{HeaderMap, StatusCode};
use tokio::runtime::Runtime;

const BASE_URL: &str = "http://bench.test";

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// `/auth` mints a token; data paths accept each minted token exactly once
/// when `one_shot_tokens` is set, forcing a refresh on every call.
struct BenchBackend {
    one_shot_tokens: bool,
    minted: AtomicU64,
    live: Mutex<BTreeSet<String>>,
}

impl BenchBackend {
    fn new(one_shot_tokens: bool) -> Arc<Self> {
        Arc::new(Self {
            one_shot_tokens,
            minted: AtomicU64::new(0),
            live: Mutex::new(BTreeSet::new()),
        })
    }

    fn respond(&self, request: &Request) -> Response {
        if request.uri().path() == "/auth" {
            let minted = self.minted.fetch_add(1, Ordering::Relaxed) + 1;
            let token = format!("bench-{minted}");
            lock_unpoisoned(&self.live).insert(format!("Bearer {token}"));
            return response(200, format!(r#"{{"access_token":"{token}"}}"#));
        }

        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let mut live = lock_unpoisoned(&self.live);
        let accepted = if self.one_shot_tokens {
            live.remove(presented)
        } else {
            live.contains(presented)
        };
        if accepted {
            response(200, r#"{"ok":true}"#)
        } else {
            response(401, "invalid token")
        }
    }
}

fn response(status: u16, body: impl Into<Bytes>) -> Response {
    Response::new(
        StatusCode::from_u16(status).expect("valid benchmark status"),
        HeaderMap::new(),
        body.into(),
    )
}

struct BenchTransport(Arc<BenchBackend>);

impl Transport for BenchTransport {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin(async move { Ok(self.0.respond(&request)) })
    }
}

fn benchmark_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build benchmark runtime")
}

fn benchmark_pipeline(backend: &Arc<BenchBackend>) -> Pipeline {
    let endpoint =
        AuthEndpoint::try_post(&format!("{BASE_URL}/auth")).expect("valid benchmark endpoint");
    let provider = AuthProvider::new(BenchTransport(Arc::clone(backend)), endpoint);
    Pipeline::builder(BASE_URL)
        .retry_policy(RetryPolicy::disabled())
        .refresh_retry_policy(RetryPolicy::disabled())
        .auth_provider(provider)
        .transport(BenchTransport(Arc::clone(backend)))
        .build()
        .expect("build benchmark pipeline")
}

fn bench_authorized_get(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let backend = BenchBackend::new(false);
    let pipeline = benchmark_pipeline(&backend);
    runtime.block_on(async {
        pipeline
            .get("/v1/ping")
            .send()
            .await
            .expect("warm-up call should mint a credential");
    });

    let mut group = c.benchmark_group("authorized_get");
    group.sample_size(80);
    group.bench_function("get_200_json", |b| {
        b.to_async(&runtime).iter(|| async {
            let response = pipeline
                .get("/v1/ping")
                .send()
                .await
                .expect("authorized get should succeed");
            black_box(response.status());
        });
    });
    group.finish();
}

fn bench_refresh_cycle(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let backend = BenchBackend::new(true);
    let pipeline = benchmark_pipeline(&backend);

    let mut group = c.benchmark_group("refresh_cycle");
    group.sample_size(60);
    group.bench_function("401_refresh_resend", |b| {
        b.to_async(&runtime).iter(|| async {
            let response = pipeline
                .get("/v1/ping")
                .send()
                .await
                .expect("refreshed get should succeed");
            black_box(response.status());
        });
    });
    group.finish();
}

fn bench_concurrent_calls(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let backend = BenchBackend::new(false);
    let pipeline = benchmark_pipeline(&backend);
    runtime.block_on(async {
        pipeline
            .get("/v1/ping")
            .send()
            .await
            .expect("warm-up call should mint a credential");
    });

    let mut group = c.benchmark_group("concurrent_calls");
    group.sample_size(40);

    for concurrency in [8_usize, 32, 64] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&runtime).iter(|| {
                    let pipeline = pipeline.clone();
                    async move {
                        let handles: Vec<_> = (0..concurrency)
                            .map(|_| {
                                let pipeline = pipeline.clone();
                                tokio::spawn(async move { pipeline.get("/v1/ping").send().await })
                            })
                            .collect();
                        for handle in handles {
                            let response = handle
                                .await
                                .expect("benchmark task should join")
                                .expect("concurrent get should succeed");
                            black_box(response.status());
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(8));
    targets = bench_authorized_get, bench_refresh_cycle, bench_concurrent_calls
);
criterion_main!(benches);
