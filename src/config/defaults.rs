//! Built-in configuration layers.
//!
//! These are the two lowest layers of every resolution: the framework-wide
//! defaults, then the defaults of the service's transport kind.

use crate::transport::TransportKind;

/// Layer 1. Kept in step with the `Default` impls in `schema.rs`.
pub const FRAMEWORK_DEFAULTS: &str = r#"
[service.admin]
port = 0

[transport]
kind = "http"
host = "0.0.0.0"
port = 8080
backlog = 1024

[transport.bind.retry]
maxAttempts = 0
baseDelayMillis = 100
maxDelayMillis = 2000

[metrics]
exporters = ["scrape"]
prefix = ""
stopTimeoutSeconds = 5

[metrics.histogram]
buckets = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]

[metrics.push]
intervalSeconds = 30

[metrics.console]
intervalSeconds = 30

[shutdown]
gracePeriodSeconds = 30

[logging]
level = "info"
format = "compact"
"#;

const GRPC_DEFAULTS: &str = r#"
[transport]
kind = "grpc"
port = 50051
"#;

const HTTP_DEFAULTS: &str = r#"
[transport]
kind = "http"
port = 8080
"#;

const HYBRID_DEFAULTS: &str = r#"
[transport]
kind = "hybrid"
port = 50051

[transport.http]
port = 8080
"#;

/// Layer 2 text for a transport kind. `service.name` is seeded separately.
pub fn service_type_defaults(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::Grpc => GRPC_DEFAULTS,
        TransportKind::Http => HTTP_DEFAULTS,
        TransportKind::Hybrid => HYBRID_DEFAULTS,
    }
}
