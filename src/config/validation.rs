//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check value ranges (intervals > 0, buckets ascending)
//! - Check cross-field requirements (push needs an endpoint, hybrid ports differ)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before the typed view is handed to the orchestrator

use std::fmt;

use crate::config::schema::ServiceConfig;
use crate::observability::metrics::is_valid_metric_name;
use crate::transport::TransportKind;

/// One semantic problem, tied to the dotted key that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub key: String,
    pub message: String,
}

impl ValidationError {
    fn new(key: &str, message: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Validate a deserialized configuration.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.service.name.trim().is_empty() {
        errors.push(ValidationError::new("service.name", "must not be empty"));
    }

    if config.transport.host.trim().is_empty() {
        errors.push(ValidationError::new("transport.host", "must not be empty"));
    }

    if config.transport.backlog == 0 {
        errors.push(ValidationError::new("transport.backlog", "must be greater than 0"));
    }

    let retry = &config.transport.bind.retry;
    if retry.max_attempts > 0 && retry.base_delay_millis > retry.max_delay_millis {
        errors.push(ValidationError::new(
            "transport.bind.retry.baseDelayMillis",
            "must not exceed maxDelayMillis",
        ));
    }

    if config.transport.kind == TransportKind::Hybrid {
        match &config.transport.http {
            None => errors.push(ValidationError::new(
                "transport.http.port",
                "is required for hybrid services",
            )),
            Some(http) if http.port != 0 && http.port == config.transport.port => {
                errors.push(ValidationError::new(
                    "transport.http.port",
                    "must differ from transport.port",
                ))
            }
            Some(_) => {}
        }
    }

    let buckets = &config.metrics.histogram.buckets;
    if buckets.is_empty() {
        errors.push(ValidationError::new("metrics.histogram.buckets", "must not be empty"));
    } else if buckets.iter().any(|b| !b.is_finite())
        || buckets.windows(2).any(|pair| pair[0] >= pair[1])
    {
        errors.push(ValidationError::new(
            "metrics.histogram.buckets",
            "must be finite and strictly ascending",
        ));
    }

    let prefix = &config.metrics.prefix;
    if !prefix.is_empty() && !is_valid_metric_name(prefix) {
        errors.push(ValidationError::new(
            "metrics.prefix",
            "must start with a letter, `_` or `:` and contain only [a-zA-Z0-9_:]",
        ));
    }

    let exporters = &config.metrics.exporters;
    if exporters.iter().any(|e| e.eq_ignore_ascii_case("push")) {
        match config.metrics.push.endpoint.as_deref() {
            None | Some("") => errors.push(ValidationError::new(
                "metrics.push.endpoint",
                "is required when the push exporter is enabled",
            )),
            Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                errors.push(ValidationError::new(
                    "metrics.push.endpoint",
                    "must be an http(s) URL",
                ))
            }
            Some(_) => {}
        }
        if config.metrics.push.interval_seconds == 0 {
            errors.push(ValidationError::new(
                "metrics.push.intervalSeconds",
                "must be greater than 0",
            ));
        }
    }

    if exporters.iter().any(|e| e.eq_ignore_ascii_case("console"))
        && config.metrics.console.interval_seconds == 0
    {
        errors.push(ValidationError::new(
            "metrics.console.intervalSeconds",
            "must be greater than 0",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
