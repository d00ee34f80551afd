//! Property configuration.
//!
//! Properties are flat string pairs with dotted keys. They come from three
//! places, later ones overriding earlier ones:
//!
//! 1. properties handed in programmatically (`InitData`)
//! 2. a TOML file named by `--Blitz.Config=<path>` or `$BLITZ_CONFIG`
//! 3. `--Key.Name=value` command-line arguments

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ClientError, Result};

/// Proxy string of the router every session goes through: `<identity>@<endpoint>`.
pub const DEFAULT_ROUTER: &str = "Blitz.Default.Router";
/// Path of a TOML property file.
pub const CONFIG_FILE: &str = "Blitz.Config";
pub const USERNAME: &str = "blitz.user";
pub const PASSWORD: &str = "blitz.pass";

/// Environment variable consulted when no `--Blitz.Config` argument is given.
pub const CONFIG_ENV: &str = "BLITZ_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, or the empty string when unset.
    pub fn get_property(&self, key: &str) -> String {
        self.values.get(key).cloned().unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Overlay `other` on top of `self`.
    pub fn merge(&mut self, other: Properties) {
        self.values.extend(other.values);
    }

    /// Pull `--Key.Name=value` options out of `args`.
    ///
    /// Returns the arguments that were not property options, in order.
    /// Only keys containing a dot are treated as properties so ordinary
    /// flags pass through untouched. A bare `--Key.Name` sets `1`.
    pub fn parse_command_line_options(&mut self, args: &[String]) -> Vec<String> {
        let mut rest = Vec::new();
        for arg in args {
            match parse_option(arg) {
                Some((key, value)) => self.set_property(key, value),
                None => rest.push(arg.clone()),
            }
        }
        rest
    }

    /// Parse TOML text. Nested tables flatten into dotted keys.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e| ClientError::Initialization(format!("invalid property file: {}", e)))?;

        let mut props = Properties::new();
        flatten_table("", &table, &mut props);
        Ok(props)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ClientError::Initialization(format!(
                "cannot read property file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Resolve the full property set for a communicator.
    pub fn resolve(args: &[String], base: Properties) -> Result<Self> {
        let mut overrides = Properties::new();
        overrides.parse_command_line_options(args);

        let config_path = overrides
            .get(CONFIG_FILE)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| base.get(CONFIG_FILE).map(PathBuf::from));

        let mut props = base;
        if let Some(path) = config_path {
            tracing::debug!("loading properties from {}", path.display());
            props.merge(Properties::load_file(&path)?);
        }
        props.merge(overrides);
        Ok(props)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.set_property(k, v);
        }
        props
    }
}

fn parse_option(arg: &str) -> Option<(String, String)> {
    let body = arg.strip_prefix("--")?;
    let (key, value) = match body.split_once('=') {
        Some((k, v)) => (k, v),
        None => (body, "1"),
    };
    if key.is_empty() || !key.contains('.') || key.starts_with('.') || key.ends_with('.') {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

fn flatten_table(prefix: &str, table: &toml::Table, props: &mut Properties) {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            toml::Value::Table(inner) => flatten_table(&full, inner, props),
            toml::Value::String(s) => props.set_property(full, s.clone()),
            other => props.set_property(full, other.to_string()),
        }
    }
}
