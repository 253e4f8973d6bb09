//! Configuration layering against real files on disk.

use std::collections::HashMap;

use platform_service_framework::config::{ConfigError, ConfigResolver, OverrideSource, ServiceConfig};
use platform_service_framework::{start, ConfigOverrides, LifecycleState, ServiceDefinition, StartupError, TransportKind};

mod common;

fn environment(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn layered_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    common::write_config(
        dir.path(),
        "common/application.toml",
        "[transport]\nport = 1000\nbacklog = 10\n\n[metrics.defaultTags]\nteam = \"platform\"\n",
    );
    common::write_config(dir.path(), "common/east/application.toml", "[transport]\nport = 1001\n");
    common::write_config(dir.path(), "orders/application.toml", "[transport]\nport = 1002\n");
    common::write_config(dir.path(), "orders/east/application.toml", "[transport]\nbacklog = 20\n");
    // Another service's files must not leak in.
    common::write_config(dir.path(), "billing/application.toml", "[transport]\nport = 4000\n");
    dir
}

#[test]
fn file_layers_apply_in_precedence_order() {
    let dir = layered_dir();
    let snapshot = ConfigResolver::new(TransportKind::Http)
        .with_config_dir(dir.path())
        .with_environment(environment(&[("CLUSTER_NAME", "east")]))
        .resolve("orders", &[])
        .unwrap();

    assert_eq!(snapshot.get_i64("transport.port"), Some(1002));
    assert_eq!(snapshot.get_i64("transport.backlog"), Some(20));
    assert_eq!(snapshot.get_str("metrics.defaultTags.team"), Some("platform"));
    assert_eq!(snapshot.get_str("service.name"), Some("orders"));
}

#[test]
fn cluster_files_are_skipped_without_a_cluster() {
    let dir = layered_dir();
    let snapshot = ConfigResolver::new(TransportKind::Http)
        .with_config_dir(dir.path())
        .with_environment(environment(&[]))
        .resolve("orders", &[])
        .unwrap();

    assert_eq!(snapshot.get_i64("transport.port"), Some(1002));
    assert_eq!(snapshot.get_i64("transport.backlog"), Some(10));
}

#[test]
fn pod_and_container_layers_nest_below_the_cluster() {
    let dir = layered_dir();
    common::write_config(
        dir.path(),
        "common/east/orders-0/application.toml",
        "[transport]\nport = 1010\nbacklog = 30\n",
    );
    common::write_config(dir.path(), "orders/east/orders-0/application.toml", "[transport]\nport = 1011\n");
    common::write_config(
        dir.path(),
        "orders/east/orders-0/app/application.toml",
        "[metrics.defaultTags]\nteam = \"orders\"\n",
    );

    let placed = ConfigResolver::new(TransportKind::Http)
        .with_config_dir(dir.path())
        .with_environment(environment(&[
            ("CLUSTER_NAME", "east"),
            ("POD_NAME", "orders-0"),
            ("CONTAINER_NAME", "app"),
        ]))
        .resolve("orders", &[])
        .unwrap();
    assert_eq!(placed.get_i64("transport.port"), Some(1011));
    // Service files outrank common files at every depth.
    assert_eq!(placed.get_i64("transport.backlog"), Some(20));
    assert_eq!(placed.get_str("metrics.defaultTags.team"), Some("orders"));

    // A container without a pod is not a level of its own.
    let unplaced = ConfigResolver::new(TransportKind::Http)
        .with_config_dir(dir.path())
        .with_environment(environment(&[("CLUSTER_NAME", "east"), ("CONTAINER_NAME", "app")]))
        .resolve("orders", &[])
        .unwrap();
    assert_eq!(unplaced.get_i64("transport.port"), Some(1002));
    assert_eq!(unplaced.get_str("metrics.defaultTags.team"), Some("platform"));
}

#[test]
fn cluster_name_may_come_from_the_common_file() {
    let dir = tempfile::tempdir().unwrap();
    common::write_config(dir.path(), "common/application.toml", "[cluster]\nname = \"east\"\n");
    common::write_config(dir.path(), "orders/east/application.toml", "[transport]\nport = 1001\n");

    let snapshot = ConfigResolver::new(TransportKind::Http)
        .with_config_dir(dir.path())
        .with_environment(environment(&[]))
        .resolve("orders", &[])
        .unwrap();
    assert_eq!(snapshot.get_str("cluster.name"), Some("east"));
    assert_eq!(snapshot.get_i64("transport.port"), Some(1001));

    let config = ServiceConfig::from_snapshot(&snapshot).unwrap();
    assert_eq!(config.cluster.map(|c| c.name).as_deref(), Some("east"));
}

#[test]
fn overrides_then_environment_win_over_files() {
    let dir = layered_dir();
    let override_file = dir.path().join("override.toml");
    std::fs::write(&override_file, "[transport]\nport = 1003\nhost = \"127.0.0.1\"\n").unwrap();

    let resolver = ConfigResolver::new(TransportKind::Http)
        .with_config_dir(dir.path())
        .with_environment(environment(&[("CLUSTER_NAME", "east"), ("TRANSPORT_PORT", "1005")]));
    let overrides = vec![
        OverrideSource::Path(override_file),
        OverrideSource::Inline(vec![("transport.port".to_string(), toml::Value::Integer(1004))]),
    ];

    let snapshot = resolver.resolve("orders", &overrides).unwrap();
    assert_eq!(snapshot.get_i64("transport.port"), Some(1005));
    assert_eq!(snapshot.get_str("transport.host"), Some("127.0.0.1"));

    let config = ServiceConfig::from_snapshot(&snapshot).unwrap();
    assert_eq!(config.transport.port, 1005);
    assert_eq!(config.transport.backlog, 20);
}

#[test]
fn conflicting_type_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    common::write_config(dir.path(), "orders/application.toml", "[transport]\nport = \"eighty\"\n");

    let err = ConfigResolver::new(TransportKind::Http)
        .with_config_dir(dir.path())
        .with_environment(environment(&[]))
        .resolve("orders", &[])
        .unwrap_err();

    match err {
        ConfigError::TypeConflict { key, layer, .. } => {
            assert_eq!(key, "transport.port");
            assert!(layer.contains("orders"), "layer was {layer}");
        }
        other => panic!("expected type conflict, got {other:?}"),
    }
}

#[test]
fn missing_override_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");

    let err = ConfigResolver::new(TransportKind::Http)
        .with_environment(environment(&[]))
        .resolve("orders", &[OverrideSource::Path(missing.clone())])
        .unwrap_err();

    assert!(matches!(err, ConfigError::MissingOverride(path) if path == missing));
}

#[tokio::test]
async fn missing_required_key_fails_startup_cleanly() {
    let definition = ServiceDefinition::new("orders", TransportKind::Http).require_key("database.url");

    let err = start(definition, common::local_overrides()).await.unwrap_err();
    match &err {
        StartupError::Config {
            source: ConfigError::MissingKey(key),
            report,
        } => {
            assert_eq!(key, "database.url");
            assert_eq!(report.final_state, LifecycleState::Failed);
            assert!(report.listeners.is_empty());
        }
        other => panic!("expected missing key, got {other:?}"),
    }
}

#[tokio::test]
async fn required_key_from_environment_satisfies_startup() {
    let definition = ServiceDefinition::new("orders", TransportKind::Http).require_key("database.url");
    let overrides = common::local_overrides().with_environment(environment(&[("DATABASE_URL", "postgres://db/orders")]));

    let service = start(definition, overrides).await.unwrap();
    assert_eq!(service.snapshot().get_str("database.url"), Some("postgres://db/orders"));
    service.stop(std::time::Duration::from_secs(1)).await;
}
