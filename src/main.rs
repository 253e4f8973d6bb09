//! platformd
//!
//! Runs a service with only the framework surface: admin endpoints, metrics
//! exporters, and the listener layout of the chosen transport kind. Useful for
//! checking a configuration directory and for smoke-testing deployments.
//!
//! ```text
//! platformd --service orders --kind hybrid --config-dir ./config \
//!           --set transport.port=50051 --set metrics.exporters='["scrape","jmx"]'
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use platform_service_framework::{start, ConfigOverrides, LifecycleState, ServiceDefinition, TransportKind};

#[derive(Parser)]
#[command(name = "platformd")]
#[command(about = "Run a service on the platform framework", long_about = None)]
struct Cli {
    /// Service name; selects `<config-dir>/<service>/application.toml`
    #[arg(short, long)]
    service: String,

    /// Transport kind: grpc, http or hybrid
    #[arg(short, long, default_value = "http")]
    kind: TransportKind,

    /// Directory holding `common/` and per-service configuration
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Extra TOML file applied after the directory layers
    #[arg(long = "override")]
    overrides: Vec<PathBuf>,

    /// Dotted key assignment, e.g. `transport.port=9000`
    #[arg(long = "set", value_parser = parse_assignment)]
    assignments: Vec<(String, toml::Value)>,
}

/// `key=value`; the value is read as TOML and falls back to a plain string.
fn parse_assignment(raw: &str) -> Result<(String, toml::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    let value = value.trim();
    let parsed = toml::from_str::<toml::Table>(&format!("v = {value}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut overrides = ConfigOverrides::new();
    if let Some(dir) = cli.config_dir {
        overrides = overrides.config_dir(dir);
    }
    for path in cli.overrides {
        overrides = overrides.override_path(path);
    }
    for (key, value) in cli.assignments {
        overrides = overrides.set(key, value);
    }

    let definition = ServiceDefinition::new(cli.service, cli.kind)
        .with_logging()
        .with_shutdown_hook();
    let service = match start(definition, overrides).await {
        Ok(service) => service,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let report = service.wait().await;
    match serde_json::to_string(&*report) {
        Ok(json) => tracing::info!(report = %json, "Shutdown report"),
        Err(err) => tracing::warn!(error = %err, "Shutdown report not serializable"),
    }

    if report.final_state == LifecycleState::Stopped {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_parse_as_toml_with_string_fallback() {
        assert_eq!(
            parse_assignment("transport.port=9000").unwrap(),
            ("transport.port".to_string(), toml::Value::Integer(9000))
        );
        assert_eq!(
            parse_assignment("service.name = orders").unwrap().1,
            toml::Value::String("orders".to_string())
        );
        let (_, list) = parse_assignment(r#"metrics.exporters=["scrape","jmx"]"#).unwrap();
        assert_eq!(list.as_array().map(Vec::len), Some(2));
        assert!(parse_assignment("no-equals").is_err());
    }

    #[test]
    fn cli_parses_kind() {
        let cli = Cli::parse_from(["platformd", "--service", "orders", "--kind", "hybrid", "--set", "a=1"]);
        assert_eq!(cli.kind, TransportKind::Hybrid);
        assert_eq!(cli.assignments.len(), 1);
    }
}
