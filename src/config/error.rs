//! Configuration errors. All of them are fatal and surface before startup.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::snapshot::ValueKind;
use crate::config::validation::ValidationError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {layer}: {source}")]
    Parse {
        layer: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("override file {0} does not exist")]
    MissingOverride(PathBuf),

    #[error("required key `{0}` is not set by any configuration layer")]
    MissingKey(String),

    #[error("{layer} sets `{key}` to a {incoming} but an earlier layer holds a {existing}")]
    TypeConflict {
        key: String,
        layer: String,
        existing: ValueKind,
        incoming: ValueKind,
    },

    #[error("environment variable {variable} cannot be read as a {expected}: {value:?}")]
    Environment {
        variable: String,
        expected: ValueKind,
        value: String,
    },

    #[error("unknown metrics exporter `{0}`")]
    UnknownExporter(String),

    #[error("configuration does not match the expected shape: {0}")]
    Deserialize(#[source] toml::de::Error),

    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
