use std::sync::Arc;
use std::time::Duration;

use hookrelay::{CircuitBreaker, CircuitBreakerConfig, Metrics};
use hookrelay_prometheus::MetricsCollector;
use prometheus::{Registry, TextEncoder};

fn scrape(registry: &Registry) -> String {
    TextEncoder::new().encode_to_string(&registry.gather()).expect("encode metrics")
}

#[test]
fn counters_are_exported_by_outcome() {
    let metrics = Arc::new(Metrics::new());
    let registry = Registry::new();
    MetricsCollector::new(metrics.clone())
        .expect("Failed to create collector")
        .register(&registry)
        .expect("Failed to register collector");

    metrics.record_attempt();
    metrics.record_attempt();
    metrics.record_success();
    metrics.record_rate_limited();

    let text = scrape(&registry);
    assert!(text.contains(r#"hookrelay_events{outcome="attempt"} 2"#), "{text}");
    assert!(text.contains(r#"hookrelay_events{outcome="success"} 1"#), "{text}");
    assert!(text.contains(r#"hookrelay_events{outcome="rate_limited"} 1"#), "{text}");
    assert!(text.contains(r#"hookrelay_events{outcome="failed"} 0"#), "{text}");
}

#[test]
fn values_follow_reset() {
    let metrics = Arc::new(Metrics::new());
    let registry = Registry::new();
    MetricsCollector::new(metrics.clone()).unwrap().register(&registry).unwrap();

    metrics.record_queued();
    assert!(scrape(&registry).contains(r#"hookrelay_events{outcome="queued"} 1"#));

    metrics.reset();
    assert!(scrape(&registry).contains(r#"hookrelay_events{outcome="queued"} 0"#));
}

#[test]
fn latency_statistics_are_exported() {
    let metrics = Arc::new(Metrics::new());
    let registry = Registry::new();
    MetricsCollector::new(metrics.clone()).unwrap().register(&registry).unwrap();

    metrics.record_latency(Duration::from_millis(10));
    metrics.record_latency(Duration::from_millis(30));

    let text = scrape(&registry);
    assert!(text.contains(r#"hookrelay_delivery_latency_milliseconds{stat="count"} 2"#), "{text}");
    assert!(text.contains(r#"hookrelay_delivery_latency_milliseconds{stat="min"} 10"#), "{text}");
    assert!(text.contains(r#"hookrelay_delivery_latency_milliseconds{stat="mean"} 20"#), "{text}");
}

#[test]
fn circuit_states_are_exported_when_attached() {
    let metrics = Arc::new(Metrics::new());
    let breaker =
        CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_secs(60), 1).unwrap());
    let registry = Registry::new();
    MetricsCollector::new(metrics)
        .unwrap()
        .with_circuit_breaker(breaker.clone())
        .register(&registry)
        .unwrap();

    breaker.record_failure("https://down.test/hook");
    breaker.record_success("https://up.test/hook");

    let text = scrape(&registry);
    assert!(
        text.contains(r#"hookrelay_circuit_state{destination="https://down.test/hook"} 1"#),
        "{text}"
    );
    assert!(
        text.contains(r#"hookrelay_circuit_state{destination="https://up.test/hook"} 0"#),
        "{text}"
    );
}

#[test]
fn circuit_family_is_absent_without_breaker() {
    let registry = Registry::new();
    MetricsCollector::new(Arc::new(Metrics::new())).unwrap().register(&registry).unwrap();
    assert!(!scrape(&registry).contains("hookrelay_circuit_state"));
}

#[test]
fn double_registration_is_an_error() {
    let registry = Registry::new();
    let collector = MetricsCollector::new(Arc::new(Metrics::new())).unwrap();
    collector.register(&registry).unwrap();
    assert!(collector.register(&registry).is_err());
}
