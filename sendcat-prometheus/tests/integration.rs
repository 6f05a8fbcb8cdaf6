use sendcat_core::{BulkheadEvent, CircuitBreakerEvent, PolicyEvent, RequestOutcome};
use sendcat_prometheus::PrometheusSink;
use prometheus::Registry;
use tower_service::Service;

fn get_counter_value(registry: &Registry, policy: &str, event_type: &str) -> Option<f64> {
    let metric_families = registry.gather();
    let events_metric =
        metric_families.iter().find(|mf| mf.get_name() == "sendcat_gateway_events_total")?;

    events_metric
        .get_metric()
        .iter()
        .find(|m| {
            let labels = m.get_label();
            labels.iter().any(|l| l.get_name() == "policy" && l.get_value() == policy)
                && labels.iter().any(|l| l.get_name() == "event" && l.get_value() == event_type)
        })
        .map(|m| m.get_counter().value())
}

#[tokio::test]
async fn circuit_breaker_variants_increment_by_label() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("register sink");

    let cases = [
        (
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
                provider: "chat_primary".into(),
                failure_count: 5,
                cooldown_ms: 30_000,
            }),
            "opened",
        ),
        (
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen { provider: "chat_primary".into() }),
            "half_open",
        ),
        (
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed { provider: "chat_primary".into() }),
            "closed",
        ),
    ];

    for (event, label) in cases {
        sink.call(event).await.expect("sink call");
        let val = get_counter_value(&registry, "circuit_breaker", label).expect("metric missing");
        assert_eq!(val, 1.0);
    }
}

#[tokio::test]
async fn bulkhead_variants_increment_by_label() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("register sink");

    let cases = [
        (
            PolicyEvent::Bulkhead(BulkheadEvent::Acquired { provider: "chat_primary".into(), active: 1, max_concurrency: 4 }),
            "acquired",
        ),
        (
            PolicyEvent::Bulkhead(BulkheadEvent::Rejected { provider: "chat_primary".into(), active: 4, max_concurrency: 4 }),
            "rejected",
        ),
    ];

    for (event, label) in cases {
        sink.call(event).await.expect("sink call");
        let val = get_counter_value(&registry, "bulkhead", label).expect("metric missing");
        assert_eq!(val, 1.0);
    }
}

#[tokio::test]
async fn request_outcome_increments_twice() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("register sink");
    let event = PolicyEvent::Request(RequestOutcome::Success { duration: std::time::Duration::from_millis(100) });

    assert_eq!(get_counter_value(&registry, "request", "success"), None);
    sink.call(event.clone()).await.expect("sink call");
    sink.call(event).await.expect("sink call");
    assert_eq!(get_counter_value(&registry, "request", "success"), Some(2.0));
}
