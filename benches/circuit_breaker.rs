use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hookrelay::filter::{should_deliver, Subscription};
use hookrelay::{
    BoxTransport, CircuitBreaker, CircuitBreakerConfig, Dispatcher, Event, EventData, EventKind,
    Metrics, RateLimitConfig, RateLimiter, TransportError, WebhookRequest, WebhookResponse,
};

use std::sync::Arc;
use std::time::Duration;
use tower::service_fn;

// Answers 200 without touching the network.
fn echo_transport() -> BoxTransport {
    BoxTransport::new(service_fn(|_req: WebhookRequest| {
        futures::future::ready(Ok::<_, TransportError>(WebhookResponse {
            status: 200,
            body: String::new(),
        }))
    }))
}

fn circuit_breaker_closed_path(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
    c.bench_function("circuit_breaker_closed_can_execute_and_record", |b| {
        b.iter(|| {
            let url = black_box("https://example.com/hook");
            if breaker.can_execute(url) {
                breaker.record_success(url);
            }
        });
    });
}

fn circuit_breaker_open_path(c: &mut Criterion) {
    let config = CircuitBreakerConfig::new(1, Duration::from_secs(3600), 1).unwrap();
    let breaker = CircuitBreaker::new(config);
    breaker.record_failure("https://down.example.com/hook");

    c.bench_function("circuit_breaker_open_rejects", |b| {
        b.iter(|| black_box(breaker.allows(black_box("https://down.example.com/hook"))));
    });
}

fn rate_limiter_many_tenants(c: &mut Criterion) {
    let limiter = RateLimiter::new(RateLimitConfig::new(1_000_000, 1_000_000).unwrap());
    let tenants: Vec<String> = (0..1_024).map(|i| format!("tenant-{i}")).collect();
    let mut next = 0usize;

    c.bench_function("rate_limiter_allow_1024_tenants", |b| {
        b.iter(|| {
            next = (next + 1) % tenants.len();
            black_box(limiter.allow(&tenants[next]))
        });
    });
}

fn subscription_filter(c: &mut Criterion) {
    let sub = Subscription::new(
        "tenant-1",
        "https://example.com/hook",
        Subscription::parse_events("connection, pairing, call*, messages"),
    );
    c.bench_function("filter_group_match", |b| {
        b.iter(|| black_box(should_deliver(&sub, black_box("receipt"))));
    });
}

fn dispatcher_send(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = Dispatcher::new(
        echo_transport(),
        CircuitBreaker::new(CircuitBreakerConfig::default()),
        Arc::new(Metrics::new()),
        Duration::from_secs(5),
        "hookrelay-bench",
    )
    .unwrap();
    let event =
        Event::new("tenant-1", "https://example.com/hook", EventKind::Message, EventData::new())
            .unwrap();

    c.bench_function("dispatcher_send_in_memory", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(dispatcher.send(black_box(&event)).await);
        });
    });
}

criterion_group!(
    benches,
    circuit_breaker_closed_path,
    circuit_breaker_open_path,
    rate_limiter_many_tenants,
    subscription_filter,
    dispatcher_send
);
criterion_main!(benches);
