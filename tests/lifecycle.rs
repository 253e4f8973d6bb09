//! Lifecycle behaviour: stop idempotence, health, hooks, stop during startup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use platform_service_framework::config::{ConfigResolver, OverrideSource};
use platform_service_framework::lifecycle::StartupPlan;
use platform_service_framework::transport::ServiceRoutes;
use platform_service_framework::{
    start, LifecycleError, LifecycleOrchestrator, LifecycleState, ListenerRole, ServiceDefinition, StartupError,
    TransportKind,
};
use tokio::sync::oneshot;

mod common;

#[tokio::test]
async fn concurrent_and_repeated_stops_share_one_report() {
    let service = start(ServiceDefinition::new("orders", TransportKind::Http), common::local_overrides())
        .await
        .unwrap();

    let stops: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.stop(Duration::from_secs(2)).await })
        })
        .collect();

    let mut reports = Vec::new();
    for stop in stops {
        reports.push(stop.await.unwrap());
    }
    let later = service.stop(Duration::from_secs(2)).await;

    for report in &reports {
        assert!(Arc::ptr_eq(report, &later));
    }
    assert_eq!(later.final_state, LifecycleState::Stopped);
    assert_eq!(service.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn health_reflects_state_and_service_check() {
    let healthy = Arc::new(AtomicBool::new(true));
    let check = healthy.clone();
    let definition =
        ServiceDefinition::new("orders", TransportKind::Http).with_health_check(move || check.load(Ordering::SeqCst));
    let service = start(definition, common::local_overrides()).await.unwrap();
    let url = format!("http://{}/health", service.local_addr(ListenerRole::Http).unwrap());
    let client = common::client();

    let ok = client.get(&url).send().await.unwrap();
    assert_eq!(ok.status(), 200);
    assert_eq!(ok.text().await.unwrap(), "OK");

    healthy.store(false, Ordering::SeqCst);
    let unavailable = client.get(&url).send().await.unwrap();
    assert_eq!(unavailable.status(), 503);
    assert_eq!(unavailable.text().await.unwrap(), "UNAVAILABLE");

    service.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn unknown_admin_path_is_not_found_and_threads_lists_workers() {
    let service = start(ServiceDefinition::new("orders", TransportKind::Http), common::local_overrides())
        .await
        .unwrap();
    let base = format!("http://{}", service.local_addr(ListenerRole::Http).unwrap());
    let client = common::client();

    let missing = client.get(format!("{base}/nothing-here")).send().await.unwrap();
    assert_eq!(missing.status(), 404);

    let dump: serde_json::Value = client
        .get(format!("{base}/threads"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workers = dump["workers"].as_array().unwrap();
    assert!(workers.iter().any(|w| w["role"] == "accept"));

    service.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn hook_trigger_stops_the_service() {
    let service = start(ServiceDefinition::new("orders", TransportKind::Http), common::local_overrides())
        .await
        .unwrap();
    let (fire, fired) = oneshot::channel::<()>();
    service
        .install_shutdown_hook_with(async move {
            let _ = fired.await;
        })
        .unwrap();
    assert_eq!(
        service.install_shutdown_hook_with(std::future::pending()),
        Err(LifecycleError::HookAlreadyInstalled)
    );

    fire.send(()).unwrap();
    let report = service.wait().await;
    assert_eq!(report.final_state, LifecycleState::Stopped);
    assert!(service.registry().is_released());
}

/// Binds `port` on loopback, retrying for far longer than any test runs.
fn retrying_plan(port: u16) -> StartupPlan {
    StartupPlan {
        resolver: ConfigResolver::new(TransportKind::Http).with_environment(HashMap::<String, String>::new()),
        overrides: vec![OverrideSource::Inline(vec![
            ("transport.host".to_string(), toml::Value::from("127.0.0.1")),
            ("transport.port".to_string(), toml::Value::from(i64::from(port))),
            ("transport.bind.retry.maxAttempts".to_string(), toml::Value::from(1000)),
            ("transport.bind.retry.baseDelayMillis".to_string(), toml::Value::from(20)),
            ("transport.bind.retry.maxDelayMillis".to_string(), toml::Value::from(50)),
        ])],
        routes: ServiceRoutes::default(),
        health: Arc::new(|| true),
        install_logging: false,
        shutdown_hook: None,
    }
}

#[tokio::test]
async fn stop_during_bind_retries_cancels_startup() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let orchestrator = LifecycleOrchestrator::new("orders", TransportKind::Http);
    let plan = retrying_plan(port);

    let starting = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.start(plan).await })
    };
    orchestrator
        .observer()
        .wait_for(|state| state == LifecycleState::Starting)
        .await;

    let report = orchestrator.stop(Duration::from_secs(1)).await;
    assert_eq!(report.final_state, LifecycleState::Stopped);

    match starting.await.unwrap() {
        Err(StartupError::Cancelled { report: cancelled }) => assert!(Arc::ptr_eq(&cancelled, &report)),
        other => panic!("expected cancelled startup, got {other:?}"),
    }
    assert!(orchestrator.registry().unwrap().is_released());
    drop(occupied);
}

#[tokio::test]
async fn hook_armed_at_startup_cancels_bind_retries() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let (fire, fired) = oneshot::channel::<()>();

    let orchestrator = LifecycleOrchestrator::new("orders", TransportKind::Http);
    let mut plan = retrying_plan(port);
    plan.shutdown_hook = Some(Box::pin(async move {
        let _ = fired.await;
    }));

    let starting = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.start(plan).await })
    };
    orchestrator
        .observer()
        .wait_for(|state| state == LifecycleState::Starting)
        .await;
    assert_eq!(
        orchestrator.install_shutdown_hook_with(std::future::pending()),
        Err(LifecycleError::HookAlreadyInstalled)
    );

    fire.send(()).unwrap();
    match starting.await.unwrap() {
        Err(StartupError::Cancelled { report }) => {
            assert_eq!(report.final_state, LifecycleState::Stopped);
            assert!(report.listeners.is_empty());
            assert!(Arc::ptr_eq(&report, &orchestrator.wait_report().await));
        }
        other => panic!("expected cancelled startup, got {other:?}"),
    }
    assert!(orchestrator.registry().unwrap().is_released());
    drop(occupied);
}

#[tokio::test]
async fn definition_trigger_during_startup_cancels_start() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let definition = ServiceDefinition::new("orders", TransportKind::Http)
        .with_shutdown_trigger(tokio::time::sleep(Duration::from_millis(200)));
    let overrides = common::local_overrides()
        .set("transport.port", i64::from(port))
        .set("transport.bind.retry.maxAttempts", 1000)
        .set("transport.bind.retry.baseDelayMillis", 20)
        .set("transport.bind.retry.maxDelayMillis", 50);

    let err = start(definition, overrides).await.unwrap_err();
    match &err {
        StartupError::Cancelled { report } => assert_eq!(report.final_state, LifecycleState::Stopped),
        other => panic!("expected cancelled startup, got {other:?}"),
    }
    drop(occupied);
}

#[tokio::test]
async fn stop_before_start_then_start_is_rejected() {
    let orchestrator = LifecycleOrchestrator::new("orders", TransportKind::Http);
    let report = orchestrator.stop(Duration::from_secs(1)).await;
    assert_eq!(report.final_state, LifecycleState::Stopped);
    assert!(report.listeners.is_empty());

    let plan = StartupPlan {
        resolver: ConfigResolver::new(TransportKind::Http),
        overrides: Vec::new(),
        routes: ServiceRoutes::default(),
        health: Arc::new(|| true),
        install_logging: false,
        shutdown_hook: None,
    };
    let err = orchestrator.start(plan).await.unwrap_err();
    assert!(matches!(err, StartupError::Lifecycle(LifecycleError::InvalidTransition { .. })));
}
