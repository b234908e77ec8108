//! Configuration loading and option coercion.
//!
//! The configuration file is YAML. Device, filter, and storage options are
//! kept as untyped [`Options`] maps so that unknown keys pass through to the
//! driver that understands them; only the keys the scheduler itself consumes
//! are interpreted here.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::storage::StorageError;

/// The only supported configuration schema version.
pub const CONFIG_VERSION: &str = "1";

/// Configuration error types. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The file declares a schema version this build does not understand.
    #[error("unknown config version: `{0}'")]
    Version(String),

    /// A driver option that must be present is missing.
    #[error("missing required option `{0}'")]
    MissingOption(&'static str),

    /// An unparsable duration string.
    #[error("invalid duration for `{name}': {reason}")]
    Duration { name: String, reason: String },

    /// No exporter driver registered under this name.
    #[error("unknown exporter driver: `{0}'")]
    UnknownExporter(String),

    /// No filter registered under this name.
    #[error("unknown filter: `{0}'")]
    UnknownFilter(String),

    /// A device references a filter name that was never declared.
    #[error("filter `{0}' is not declared")]
    UndeclaredFilter(String),

    /// An invalid regular expression in a filter declaration.
    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    /// Storage driver initialization failed.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Anything else that makes the configuration unusable.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// An untyped option map as it appears in the configuration file.
///
/// Scalar values are coerced on access: [`get_str`](Options::get_str) formats
/// numbers and booleans, [`get_int`](Options::get_int) accepts quoted digits,
/// and [`get_bool`](Options::get_bool) treats `"true"`/`"false"` strings and
/// nonzero numbers as booleans.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Options(pub BTreeMap<String, Value>);

impl Options {
    /// Raw value lookup.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// String coercion: strings return as-is, other scalars are formatted.
    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Like [`get_str`](Options::get_str), but missing or non-scalar values
    /// are a configuration error.
    pub fn require_str(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get_str(name).ok_or(ConfigError::MissingOption(name))
    }

    /// Integer coercion: any numeric representation, including quoted digits.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean coercion: literal booleans, `"true"`/`"false"` strings, and
    /// nonzero numbers.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.0.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => Some(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            _ => None,
        }
    }

    /// A value that may be written either as a single string or as a sequence
    /// of strings (filter references, git refspecs). Non-string sequence
    /// elements are skipped.
    pub fn get_str_seq(&self, name: &str) -> Option<Vec<String>> {
        match self.0.get(name)? {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// A duration option; a present but unparsable value is a configuration
    /// error.
    pub fn get_duration(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        self.get_str(name)
            .map(|value| parse_duration(name, &value))
            .transpose()
    }

    /// Non-destructive overlay: returns a new map with `over`'s entries
    /// winning on key collision.
    pub fn merged_with(&self, over: &Options) -> Options {
        let mut out = self.0.clone();
        for (k, v) in &over.0 {
            out.insert(k.clone(), v.clone());
        }
        Options(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Device section: a list of per-device option maps plus a common map merged
/// beneath each entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicesConfig {
    #[serde(default)]
    pub list: Vec<Options>,
    #[serde(default)]
    pub common: Options,
}

/// One named filter declaration. Devices reference declarations by `name`;
/// declarations without a name are skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterDecl {
    pub filter: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub options: Options,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub version: String,

    /// Default per-device timeout, as a duration string.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Pause between runs in daemon mode.
    #[serde(default)]
    pub interval: Option<String>,

    /// Worker cap; zero or negative means one worker per device.
    #[serde(default)]
    pub max_goroutines: i64,

    #[serde(default)]
    pub devices: DevicesConfig,

    /// Storage driver options; must carry a `driver` key.
    #[serde(default)]
    pub storage: Options,

    #[serde(default)]
    pub filters: Vec<FilterDecl>,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Environment references (`${VAR}`, `${VAR:-default}`) are expanded in
    /// the raw text before parsing, so secrets can stay out of the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&content)?;
        if config.version != CONFIG_VERSION {
            return Err(ConfigError::Version(config.version));
        }
        Ok(config)
    }

    /// The default per-device timeout, if configured.
    pub fn default_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.timeout
            .as_deref()
            .map(|value| parse_duration("timeout", value))
            .transpose()
    }

    /// The daemon-mode interval, if configured.
    pub fn interval(&self) -> Result<Option<Duration>, ConfigError> {
        self.interval
            .as_deref()
            .map(|value| parse_duration("interval", value))
            .transpose()
    }
}

/// Parse a duration value such as `30s`, `5m30s`, `1h`, or `100ms`. `name`
/// is the option the value came from, for the error message.
pub fn parse_duration(name: &str, value: &str) -> Result<Duration, ConfigError> {
    let duration = |reason: String| ConfigError::Duration {
        name: name.to_string(),
        reason,
    };

    let value = value.trim();
    if value.is_empty() {
        return Err(duration("empty duration string".to_string()));
    }
    humantime::parse_duration(value).map_err(|e| duration(e.to_string()))
}

static ENV_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{(?P<var>[A-Za-z_]\w*)(?::-(?P<default>[^}]*))?\}")
        .expect("env reference pattern")
});

/// Substitute `${VAR}` and `${VAR:-default}` references with values from
/// the process environment. Unset variables without a default expand to the
/// empty string.
pub fn expand_env_vars(input: &str) -> String {
    ENV_REFERENCE
        .replace_all(input, |caps: &regex::Captures| {
            match std::env::var(&caps["var"]) {
                Ok(value) => value,
                Err(_) => caps
                    .name("default")
                    .map_or_else(String::new, |m| m.as_str().to_string()),
            }
        })
        .into_owned()
}
