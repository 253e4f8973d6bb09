//! Layered configuration resolution.
//!
//! # Layer order (lowest precedence first)
//! ```text
//! 1. framework defaults            (built in)
//! 2. service-type defaults         (built in, per transport kind, seeds service.name)
//! 3. <dir>/common/application.toml, then common/<cluster>/, common/<cluster>/<pod>/,
//!    common/<cluster>/<pod>/<container>/
//! 4. <dir>/<service>/application.toml, then the same nesting under <service>/
//! 5. explicit overrides            (files and inline values, in order)
//! 6. environment                   (TRANSPORT_PORT for transport.port, ...)
//! ```
//!
//! Cluster, pod and container names come from `CLUSTER_NAME`, `POD_NAME` and
//! `CONTAINER_NAME`, falling back to `cluster.name`, `pod.name` and
//! `container.name` in the service's base file, then the common base file.
//! A pod needs a cluster and a container needs a pod.
//!
//! Layers are merged into a private map that is frozen into a
//! [`ConfigSnapshot`] only once every layer has been applied.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use toml::{Table, Value};

use crate::config::defaults::{service_type_defaults, FRAMEWORK_DEFAULTS};
use crate::config::error::ConfigError;
use crate::config::snapshot::{flatten_into, flatten_value, ConfigSnapshot, ValueKind};
use crate::transport::TransportKind;

/// Keys every service must end up with.
pub const REQUIRED_KEYS: &[&str] = &[
    "service.name",
    "transport.kind",
    "shutdown.gracePeriodSeconds",
    "metrics.exporters",
];

const APPLICATION_FILE: &str = "application.toml";

/// Source of environment variables. Injectable so tests never touch the
/// process environment.
pub trait Environment: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// One explicit override, applied in the order given.
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideSource {
    /// A TOML file that must exist.
    Path(PathBuf),
    /// Dotted keys with their values; table values are flattened below the key.
    Inline(Vec<(String, Value)>),
}

/// Environment variable name for a dotted key: `transport.http.port` → `TRANSPORT_HTTP_PORT`.
pub fn environment_variable(key: &str) -> String {
    key.to_uppercase().replace(['.', '-'], "_")
}

/// Loads and layers configuration sources into one [`ConfigSnapshot`].
pub struct ConfigResolver {
    kind: TransportKind,
    config_dir: Option<PathBuf>,
    required: Vec<String>,
    environment: Box<dyn Environment>,
}

impl std::fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigResolver")
            .field("kind", &self.kind)
            .field("config_dir", &self.config_dir)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl ConfigResolver {
    /// Create a resolver for a service of the given transport kind.
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            config_dir: None,
            required: Vec::new(),
            environment: Box::new(ProcessEnvironment),
        }
    }

    /// Directory holding `common/` and per-service folders.
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Declare an extra key the service cannot run without.
    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Environment + 'static) -> Self {
        self.environment = Box::new(environment);
        self
    }

    /// Resolve every layer for `service_name`.
    pub fn resolve(
        &self,
        service_name: &str,
        overrides: &[OverrideSource],
    ) -> Result<ConfigSnapshot, ConfigError> {
        let mut merged = LayerStack::default();

        merged.apply(parse_layer("framework defaults", FRAMEWORK_DEFAULTS)?)?;

        let mut service_type = parse_layer("service-type defaults", service_type_defaults(self.kind))?;
        service_type
            .values
            .insert("service.name".to_string(), Value::String(service_name.to_string()));
        merged.apply(service_type)?;

        if let Some(dir) = &self.config_dir {
            let common_dir = dir.join("common");
            let own_dir = dir.join(service_name);
            let common = read_optional(&common_dir.join(APPLICATION_FILE))?;
            let own = read_optional(&own_dir.join(APPLICATION_FILE))?;

            let named: Vec<&BTreeMap<String, Value>> = [own.as_ref(), common.as_ref()]
                .into_iter()
                .flatten()
                .map(|layer| &layer.values)
                .chain([&merged.values])
                .collect();
            let placement = Placement::locate(self.environment.as_ref(), &named);
            tracing::debug!(
                cluster = ?placement.cluster,
                pod = ?placement.pod,
                container = ?placement.container,
                "Configuration placement"
            );

            merged.apply_branch(common, &placement.directories(&common_dir))?;
            merged.apply_branch(own, &placement.directories(&own_dir))?;
        }

        for source in overrides {
            match source {
                OverrideSource::Path(path) => {
                    if !path.is_file() {
                        return Err(ConfigError::MissingOverride(path.clone()));
                    }
                    merged.apply(read_layer(path)?)?;
                }
                OverrideSource::Inline(entries) => {
                    let mut values = BTreeMap::new();
                    for (key, value) in entries {
                        flatten_value(key, value, &mut values);
                    }
                    merged.apply(Layer {
                        name: "inline overrides".to_string(),
                        values,
                    })?;
                }
            }
        }

        let required = self.required_keys(&merged);
        merged.apply_environment(self.environment.as_ref(), &required)?;

        for key in &required {
            if !merged.values.contains_key(key) {
                return Err(ConfigError::MissingKey(key.clone()));
            }
        }

        let snapshot = merged.freeze();
        for (key, value) in snapshot.iter() {
            tracing::debug!(key, value = %value, "Resolved configuration key");
        }
        tracing::info!(
            service = service_name,
            keys = snapshot.len(),
            "Configuration resolved"
        );

        Ok(snapshot)
    }

    fn required_keys(&self, merged: &LayerStack) -> Vec<String> {
        let mut keys: Vec<String> = REQUIRED_KEYS.iter().map(|k| k.to_string()).collect();
        if merged.get_str("transport.kind") == Some(TransportKind::Hybrid.as_str()) {
            keys.push("transport.http.port".to_string());
        }
        keys.extend(self.required.iter().cloned());
        keys
    }
}

/// Flattened content of one source.
#[derive(Debug)]
struct Layer {
    name: String,
    values: BTreeMap<String, Value>,
}

fn parse_layer(name: &str, text: &str) -> Result<Layer, ConfigError> {
    let table: Table = toml::from_str(text).map_err(|source| ConfigError::Parse {
        layer: name.to_string(),
        source,
    })?;
    let mut values = BTreeMap::new();
    flatten_into(None, &table, &mut values);
    Ok(Layer {
        name: name.to_string(),
        values,
    })
}

fn read_layer(path: &Path) -> Result<Layer, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_layer(&path.display().to_string(), &text)
}

fn read_optional(path: &Path) -> Result<Option<Layer>, ConfigError> {
    if path.is_file() {
        read_layer(path).map(Some)
    } else {
        tracing::debug!(path = %path.display(), "Optional configuration file absent");
        Ok(None)
    }
}

/// Where the instance sits below its service directory.
#[derive(Debug, Default)]
struct Placement {
    cluster: Option<String>,
    pod: Option<String>,
    container: Option<String>,
}

impl Placement {
    /// Environment first, then the first of `named` holding the key.
    fn locate(environment: &dyn Environment, named: &[&BTreeMap<String, Value>]) -> Self {
        let name = |key: &str| {
            environment
                .var(&environment_variable(key))
                .filter(|value| !value.is_empty())
                .or_else(|| {
                    named
                        .iter()
                        .find_map(|values| values.get(key).and_then(Value::as_str).filter(|v| !v.is_empty()))
                        .map(str::to_owned)
                })
        };
        Self {
            cluster: name("cluster.name"),
            pod: name("pod.name"),
            container: name("container.name"),
        }
    }

    /// Nested directories below `base`, shallowest first. Stops at the first
    /// unnamed level.
    fn directories(&self, base: &Path) -> Vec<PathBuf> {
        let mut current = base.to_path_buf();
        let mut directories = Vec::new();
        for level in [&self.cluster, &self.pod, &self.container] {
            let Some(name) = level else { break };
            current.push(name);
            directories.push(current.clone());
        }
        directories
    }
}

/// Private merge target; never visible outside `resolve`.
#[derive(Debug, Default)]
struct LayerStack {
    values: BTreeMap<String, Value>,
}

impl LayerStack {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// A base file, then the `application.toml` of each nested directory.
    fn apply_branch(&mut self, base: Option<Layer>, nested: &[PathBuf]) -> Result<(), ConfigError> {
        if let Some(layer) = base {
            self.apply(layer)?;
        }
        for directory in nested {
            if let Some(layer) = read_optional(&directory.join(APPLICATION_FILE))? {
                self.apply(layer)?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, layer: Layer) -> Result<(), ConfigError> {
        for (key, value) in &layer.values {
            self.check_kind(&layer.name, key, value)?;
        }
        tracing::debug!(layer = %layer.name, keys = layer.values.len(), "Configuration layer applied");
        self.values.extend(layer.values);
        Ok(())
    }

    fn check_kind(&self, layer: &str, key: &str, value: &Value) -> Result<(), ConfigError> {
        let incoming = ValueKind::of(value);
        let conflict = |existing| ConfigError::TypeConflict {
            key: key.to_string(),
            layer: layer.to_string(),
            existing,
            incoming,
        };

        if let Some(existing) = self.values.get(key) {
            let existing = ValueKind::of(existing);
            if existing != incoming {
                return Err(conflict(existing));
            }
            return Ok(());
        }

        // An earlier layer holds a table where this one puts a leaf.
        let lead = format!("{key}.");
        if self
            .values
            .range(lead.clone()..)
            .next()
            .is_some_and(|(other, _)| other.starts_with(&lead))
        {
            return Err(conflict(ValueKind::Table));
        }

        // An earlier layer holds a leaf where this one nests a table.
        for (index, _) in key.match_indices('.') {
            if self.values.contains_key(&key[..index]) {
                return Err(ConfigError::TypeConflict {
                    key: key[..index].to_string(),
                    layer: layer.to_string(),
                    existing: ValueKind::of(&self.values[&key[..index]]),
                    incoming: ValueKind::Table,
                });
            }
        }

        Ok(())
    }

    fn apply_environment(
        &mut self,
        environment: &dyn Environment,
        required: &[String],
    ) -> Result<(), ConfigError> {
        let keys: BTreeSet<String> = self
            .values
            .keys()
            .cloned()
            .chain(required.iter().cloned())
            .collect();

        let mut applied = 0usize;
        for key in keys {
            let variable = environment_variable(&key);
            let Some(raw) = environment.var(&variable) else {
                continue;
            };
            let value = match self.values.get(&key) {
                Some(existing) => coerce(&variable, &raw, existing)?,
                None => infer(&raw),
            };
            tracing::debug!(key = %key, variable = %variable, "Environment override applied");
            self.values.insert(key, value);
            applied += 1;
        }
        tracing::debug!(layer = "environment", keys = applied, "Configuration layer applied");
        Ok(())
    }

    fn freeze(self) -> ConfigSnapshot {
        ConfigSnapshot::from_values(self.values)
    }
}

/// Convert a raw environment string to the kind the key already has.
fn coerce(variable: &str, raw: &str, existing: &Value) -> Result<Value, ConfigError> {
    let mismatch = |expected| ConfigError::Environment {
        variable: variable.to_string(),
        expected,
        value: raw.to_string(),
    };
    let trimmed = raw.trim();

    let value = match existing {
        Value::String(_) => Value::String(raw.to_string()),
        Value::Integer(_) => match trimmed.parse::<i64>() {
            Ok(number) => Value::Integer(number),
            Err(_) => trimmed
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| mismatch(ValueKind::Number))?,
        },
        Value::Float(_) => trimmed
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| mismatch(ValueKind::Number))?,
        Value::Boolean(_) => trimmed
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| mismatch(ValueKind::Boolean))?,
        Value::Datetime(_) => trimmed
            .parse::<toml::value::Datetime>()
            .map(Value::Datetime)
            .map_err(|_| mismatch(ValueKind::Datetime))?,
        Value::Array(items) => {
            let items = trimmed
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| match items.first() {
                    Some(sample) => coerce(variable, item, sample),
                    None => Ok(infer(item)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| mismatch(ValueKind::Array))?;
            Value::Array(items)
        }
        Value::Table(_) => return Err(mismatch(ValueKind::Table)),
    };
    Ok(value)
}

/// Best-effort typing for keys that no file layer declared.
fn infer(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(number) = trimmed.parse::<i64>() {
        Value::Integer(number)
    } else if let Ok(flag) = trimmed.parse::<bool>() {
        Value::Boolean(flag)
    } else {
        Value::String(raw.to_string())
    }
}
