//! Immutable, fully merged configuration.
//!
//! A snapshot maps dotted keys (`transport.port`) to TOML leaf values. Tables
//! never appear as values: they are flattened into their leaves when a layer
//! is loaded, and rebuilt only when the typed view is deserialized.

use std::collections::BTreeMap;
use std::fmt;

use toml::{Table, Value};

/// Type family of a configuration value, used to detect layer disagreements.
///
/// Integers and floats share the `Number` family so that `30` and `30.0`
/// may override each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Datetime,
    Array,
    Table,
}

impl ValueKind {
    /// Classify a TOML value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::String,
            Value::Integer(_) | Value::Float(_) => Self::Number,
            Value::Boolean(_) => Self::Boolean,
            Value::Datetime(_) => Self::Datetime,
            Value::Array(_) => Self::Array,
            Value::Table(_) => Self::Table,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Datetime => "datetime",
            Self::Array => "list",
            Self::Table => "table",
        };
        f.write_str(name)
    }
}

/// The merged configuration in effect for one service run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSnapshot {
    values: BTreeMap<String, Value>,
}

impl ConfigSnapshot {
    pub(crate) fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Look up a leaf value by dotted key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether any layer set `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_integer)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// String elements of a list value; non-string elements are skipped.
    pub fn get_strings(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
    }

    /// All leaves below `prefix`, keyed by the remainder of their key.
    pub fn section(&self, prefix: &str) -> BTreeMap<String, Value> {
        let lead = format!("{prefix}.");
        self.values
            .range(lead.clone()..)
            .take_while(|(key, _)| key.starts_with(&lead))
            .map(|(key, value)| (key[lead.len()..].to_owned(), value.clone()))
            .collect()
    }

    /// Iterate over every key and value in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Rebuild the nested table form, for deserializing into typed structs.
    pub fn to_table(&self) -> Table {
        let mut root = Table::new();
        for (key, value) in &self.values {
            insert_dotted(&mut root, key, value.clone());
        }
        root
    }
}

/// Flatten a parsed table into dotted leaf keys, appending to `out`.
pub(crate) fn flatten_into(prefix: Option<&str>, table: &Table, out: &mut BTreeMap<String, Value>) {
    for (name, value) in table {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.clone(),
        };
        match value {
            Value::Table(inner) => flatten_into(Some(&key), inner, out),
            leaf => {
                out.insert(key, leaf.clone());
            }
        }
    }
}

/// Flatten a single value stored under `key`.
pub(crate) fn flatten_value(key: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Table(inner) => flatten_into(Some(key), inner, out),
        leaf => {
            out.insert(key.to_owned(), leaf.clone());
        }
    }
}

fn insert_dotted(root: &mut Table, key: &str, value: Value) {
    let mut segments = key.split('.').peekable();
    let mut table = root;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        let entry = table
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        match entry {
            Value::Table(inner) => table = inner,
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> BTreeMap<String, Value> {
        let table: Table = toml::from_str(text).unwrap();
        let mut out = BTreeMap::new();
        flatten_into(None, &table, &mut out);
        out
    }

    #[test]
    fn flattens_nested_tables_to_dotted_keys() {
        let values = parse("[transport]\nport = 9000\n[transport.http]\nport = 9001\n");
        assert_eq!(values.get("transport.port"), Some(&Value::Integer(9000)));
        assert_eq!(values.get("transport.http.port"), Some(&Value::Integer(9001)));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn arrays_stay_leaves() {
        let values = parse("[metrics]\nexporters = [\"scrape\", \"push\"]\n");
        let snapshot = ConfigSnapshot::from_values(values);
        assert_eq!(
            snapshot.get_strings("metrics.exporters"),
            Some(vec!["scrape".to_string(), "push".to_string()])
        );
    }

    #[test]
    fn section_strips_prefix() {
        let values = parse("[metrics.defaultTags]\nregion = \"eu\"\nzone = \"a\"\n[metricsx]\nother = 1\n");
        let snapshot = ConfigSnapshot::from_values(values);
        let tags = snapshot.section("metrics.defaultTags");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.get("region"), Some(&Value::String("eu".into())));
    }

    #[test]
    fn table_round_trips_through_dotted_keys() {
        let values = parse("[service]\nname = \"orders\"\n[service.admin]\nport = 0\n");
        let snapshot = ConfigSnapshot::from_values(values);
        let table = snapshot.to_table();
        let service = table.get("service").and_then(Value::as_table).unwrap();
        assert_eq!(service.get("name"), Some(&Value::String("orders".into())));
        assert!(service.get("admin").unwrap().is_table());
    }

    #[test]
    fn numbers_share_a_kind() {
        assert_eq!(ValueKind::of(&Value::Integer(1)), ValueKind::of(&Value::Float(1.5)));
        assert_ne!(ValueKind::of(&Value::Integer(1)), ValueKind::of(&Value::Array(vec![])));
    }
}
