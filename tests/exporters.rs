//! Metrics exporters end to end.

use std::time::Duration;

use platform_service_framework::observability::exporters::{ExporterKind, INTROSPECT_PATH, SCRAPE_PATH};
use platform_service_framework::{
    start, Labels, LifecycleError, LifecycleState, ListenerRole, RegistryError, ServiceDefinition, TransportKind,
};

mod common;

fn exporters(kinds: &[&str]) -> toml::Value {
    toml::Value::Array(kinds.iter().map(|k| toml::Value::from(*k)).collect())
}

#[tokio::test]
async fn hybrid_scrape_round_trip() {
    let overrides = common::local_overrides().set("metrics.exporters", exporters(&["scrape", "jmx"]));
    let service = start(ServiceDefinition::new("orders", TransportKind::Hybrid), overrides)
        .await
        .unwrap();
    let grpc = service.local_addr(ListenerRole::Grpc).unwrap();
    let http = service.local_addr(ListenerRole::Http).unwrap();
    let client = common::client();
    let scrape_url = format!("http://{http}{SCRAPE_PATH}");

    let before = client.get(&scrape_url).send().await.unwrap();
    assert_eq!(before.status(), 200);
    let before = before.text().await.unwrap();
    assert!(common::sample_lines(&before).is_empty(), "unexpected samples: {before}");

    let registry = service.registry();
    let created = registry.register_counter("orders_created_total", &Labels::new()).unwrap();
    registry.record(&created, 1.0);

    let after = client.get(&scrape_url).send().await.unwrap().text().await.unwrap();
    assert_eq!(common::sample_value(&after, "orders_created_total"), Some(1.0));
    assert!(after.contains(r#"app="orders""#));

    let introspect: serde_json::Value = client
        .get(format!("http://{http}{INTROSPECT_PATH}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(introspect[0]["name"], "orders_created_total");
    assert_eq!(introspect[0]["kind"], "counter");

    let report = service.stop(Duration::from_secs(5)).await;
    assert!(report.is_clean(), "report: {report:?}");
    assert_eq!(service.state(), LifecycleState::Stopped);
    assert!(!service.handlers().contains(SCRAPE_PATH));
    assert!(!service.handlers().contains(INTROSPECT_PATH));

    let late = registry.register_counter("orders_late_total", &Labels::new()).unwrap_err();
    assert!(matches!(late, RegistryError::Lifecycle(LifecycleError::RegistryReleased)));

    assert!(std::net::TcpListener::bind(grpc).is_ok());
    assert!(std::net::TcpListener::bind(http).is_ok());
}

#[tokio::test]
async fn push_exporter_flushes_on_stop() {
    let (gateway, pushes) = common::start_mock_gateway().await;
    let overrides = common::local_overrides()
        .set("metrics.exporters", exporters(&["push"]))
        .set("metrics.push.endpoint", format!("http://{gateway}"))
        .set("metrics.push.intervalSeconds", 3600);
    let service = start(ServiceDefinition::new("orders", TransportKind::Http), overrides)
        .await
        .unwrap();

    let registry = service.registry();
    let jobs = registry.register_counter("jobs_total", &Labels::new()).unwrap();
    registry.record(&jobs, 2.0);

    let report = service.stop(Duration::from_secs(5)).await;
    assert!(report.exporter_failures.is_empty(), "report: {report:?}");

    let pushes = pushes.lock().unwrap();
    let (path, body) = pushes.last().unwrap();
    assert_eq!(path, "/metrics/job/orders");
    assert_eq!(common::sample_value(body, "jobs_total"), Some(2.0));
}

#[tokio::test]
async fn unreachable_gateway_is_reported_not_fatal() {
    let port = common::free_port();
    let overrides = common::local_overrides()
        .set("metrics.exporters", exporters(&["scrape", "push"]))
        .set("metrics.push.endpoint", format!("http://127.0.0.1:{port}"))
        .set("metrics.push.intervalSeconds", 3600);
    let service = start(ServiceDefinition::new("orders", TransportKind::Http), overrides)
        .await
        .unwrap();
    assert!(service.handlers().contains(SCRAPE_PATH));

    let report = service.stop(Duration::from_secs(1)).await;
    assert_eq!(report.final_state, LifecycleState::Stopped);
    assert_eq!(report.exporter_failures.len(), 1);
    assert_eq!(report.exporter_failures[0].exporter, ExporterKind::Push);
    assert!(!report.is_clean());
}
