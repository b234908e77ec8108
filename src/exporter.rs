//! Device exporters.
//!
//! An exporter knows how to produce one device's configuration dump as a
//! byte stream. Exporters are stateless between runs; the scheduler drives
//! them through the [`Exporter`] trait and pairs each stream with the
//! [`Metadata`] describing the export.

pub mod ssh_command;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, Options};

/// A boxed readable byte stream.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Descriptive fields about a device or export (`name`, `host`, `device`,
/// `time`, ...). Values are opaque; storage drivers interpret them through
/// path and message templates.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// String rendition of a scalar field, for log decoration.
    pub fn string(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Non-destructive merge; `other`'s entries win on collision.
    pub fn append(&self, other: &Metadata) -> Metadata {
        let mut out = self.0.clone();
        for (k, v) in &other.0 {
            out.insert(k.clone(), v.clone());
        }
        Metadata(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Metadata(iter.into_iter().collect())
    }
}

/// Errors produced while exporting from a device. These are transient: the
/// run logs them against the device and moves on.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// SSH transport or protocol error.
    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),

    /// Identity file could not be decoded.
    #[error("ssh key: {0}")]
    Key(String),

    /// All offered authentication methods were rejected.
    #[error("authentication failed for user `{user}'")]
    AuthenticationFailed { user: String },

    /// The remote command finished with a non-zero status.
    #[error("remote command exited with status {0}")]
    ExitStatus(u32),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The export was cancelled before it finished.
    #[error("export cancelled")]
    Cancelled,
}

/// Teardown handle for an export stream. Must be closed exactly once;
/// closing waits for the remote side to finish and releases the connection.
#[async_trait]
pub trait StreamCloser: Send {
    async fn close(self: Box<Self>) -> Result<(), ExporterError>;
}

/// A closer for streams that need no teardown.
pub struct NopCloser;

#[async_trait]
impl StreamCloser for NopCloser {
    async fn close(self: Box<Self>) -> Result<(), ExporterError> {
        Ok(())
    }
}

/// One successfully started export: the byte stream, its teardown handle,
/// and the metadata describing the export (the caller may add fields).
pub struct Export {
    pub stream: ByteStream,
    pub closer: Box<dyn StreamCloser>,
    pub metadata: Metadata,
}

/// The capability to produce an export stream for one device.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Start the export. On success the returned stream must be read to
    /// end-of-stream (or abandoned) and its closer closed exactly once; on
    /// failure there is nothing to release.
    ///
    /// When `cancel` fires before or during the export, pending reads on the
    /// stream promptly return the cancellation error and closing remains
    /// safe.
    async fn export(&self, cancel: &CancellationToken) -> Result<Export, ExporterError>;

    /// Fixed identifying metadata, for log decoration.
    fn metadata(&self) -> Metadata;
}

impl std::fmt::Debug for dyn Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Exporter").field(&self.metadata()).finish()
    }
}

/// Exporter driver constructor.
pub type NewExporterFn = fn(&Options) -> Result<Box<dyn Exporter>, ConfigError>;

/// Name-keyed exporter driver lookup. Populated once at startup; read-only
/// thereafter. Tests inject their own instance instead of mutating a global.
pub struct ExporterRegistry {
    drivers: HashMap<String, NewExporterFn>,
}

impl ExporterRegistry {
    /// An empty registry with no drivers.
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, driver: NewExporterFn) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn create(&self, name: &str, options: &Options) -> Result<Box<dyn Exporter>, ConfigError> {
        match self.drivers.get(name) {
            Some(driver) => driver(options),
            None => Err(ConfigError::UnknownExporter(name.to_string())),
        }
    }
}

impl Default for ExporterRegistry {
    /// The built-in driver set.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("ssh-command", ssh_command::new_ssh_command);
        registry
    }
}
