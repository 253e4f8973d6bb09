//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::{body::Bytes, http::Uri, Router};
use platform_service_framework::ConfigOverrides;
use tokio::net::TcpListener;

/// Overrides that keep a service on loopback with OS-assigned ports and an
/// empty environment.
pub fn local_overrides() -> ConfigOverrides {
    ConfigOverrides::new()
        .with_environment(HashMap::new())
        .set("transport.host", "127.0.0.1")
        .set("transport.port", 0)
        .set("transport.http.port", 0)
        .set("service.admin.port", 0)
}

/// HTTP client without pooling or proxies, so every request opens a fresh
/// connection to the address given.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Write `contents` to `dir/relative`, creating parent directories.
pub fn write_config(dir: &Path, relative: &str, contents: &str) {
    let path = dir.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// A free loopback port. Racy by nature; good enough for tests.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Lines of a Prometheus exposition that carry samples.
pub fn sample_lines(exposition: &str) -> Vec<&str> {
    exposition
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

/// Value of the first sample named `name`.
pub fn sample_value(exposition: &str, name: &str) -> Option<f64> {
    sample_lines(exposition)
        .into_iter()
        .find(|line| {
            line.strip_prefix(name)
                .is_some_and(|rest| rest.starts_with('{') || rest.starts_with(' '))
        })
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

/// Requests received by the mock push gateway: (path, body).
pub type Pushes = Arc<Mutex<Vec<(String, String)>>>;

/// Start a push gateway stand-in that records every request and answers 200.
pub async fn start_mock_gateway() -> (SocketAddr, Pushes) {
    let pushes: Pushes = Arc::new(Mutex::new(Vec::new()));
    let recorded = pushes.clone();
    let app = Router::new().fallback(move |uri: Uri, body: Bytes| {
        let recorded = recorded.clone();
        async move {
            let body = String::from_utf8_lossy(&body).into_owned();
            recorded.lock().unwrap().push((uri.path().to_string(), body));
            "ok"
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, pushes)
}
