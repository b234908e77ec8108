//! Transactional artifact sinks.
//!
//! A storage driver persists the artifacts of one run inside a transaction:
//! `begin` once, `add` a writer per artifact from any worker, `commit` once
//! after every worker is done. Writers have two terminal operations so that
//! a failed stream copy can drop its artifact from the pending commit while
//! the rest of the run proceeds.

pub mod file;
pub mod git;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::config::Options;
use crate::exporter::Metadata;
use crate::template::TemplateError;

pub use file::FileStorage;
pub use git::{GitStorage, GitStorageOptions};

/// Errors from the storage layer. `begin`/`commit` failures abort the run;
/// `add`/writer failures cost a single artifact.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A driver option that must be present is missing.
    #[error("missing required option `{0}'")]
    MissingOption(&'static str),

    /// No storage driver registered under this name.
    #[error("unknown storage driver: `{0}'")]
    UnknownDriver(String),

    /// A blocking storage task failed to complete.
    #[error("storage task failed: {0}")]
    Task(String),

    /// Anything else that makes the driver unusable.
    #[error("{0}")]
    Invalid(String),
}

/// The byte sink for one artifact.
///
/// Exactly one terminal call per writer, and no writes after it:
/// [`close`](ArtifactWriter::close) includes the artifact in the pending
/// commit, [`close_with_error`](ArtifactWriter::close_with_error) drops it
/// (bytes may remain in the sink's scratch space).
#[async_trait]
pub trait ArtifactWriter: AsyncWrite + Send + Unpin {
    async fn close(self: Box<Self>) -> Result<(), StorageError>;

    async fn close_with_error(self: Box<Self>, cause: &std::io::Error)
        -> Result<(), StorageError>;
}

impl std::fmt::Debug for dyn ArtifactWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ArtifactWriter")
    }
}

/// One run's transaction. The timestamp is fixed at `begin` and identical
/// for every artifact of the run.
#[async_trait]
pub trait Tx: Send + Sync {
    /// Open a writer for the artifact described by `metadata`. Callable from
    /// any worker; drivers serialize internally where they must.
    async fn add(&self, metadata: Metadata) -> Result<Box<dyn ArtifactWriter>, StorageError>;

    fn timestamp(&self) -> DateTime<Utc>;

    /// Commit every successfully closed artifact. Never called concurrently
    /// with `add`; the scheduler orders it after all workers return.
    async fn commit(&self) -> Result<(), StorageError>;
}

/// A transactional artifact sink.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn begin(&self) -> Result<Arc<dyn Tx>, StorageError>;
}

impl std::fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Storage")
    }
}

/// Storage driver constructor. Async because opening a driver may clone or
/// pull a remote repository.
pub type NewStorageFn = fn(Options) -> BoxFuture<'static, Result<Arc<dyn Storage>, StorageError>>;

/// Name-keyed storage driver lookup. Populated once at startup; read-only
/// thereafter.
pub struct StorageRegistry {
    drivers: HashMap<String, NewStorageFn>,
}

impl StorageRegistry {
    /// An empty registry with no drivers.
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, driver: NewStorageFn) {
        self.drivers.insert(name.into(), driver);
    }

    pub async fn create(
        &self,
        name: &str,
        options: Options,
    ) -> Result<Arc<dyn Storage>, StorageError> {
        match self.drivers.get(name) {
            Some(driver) => driver(options).await,
            None => Err(StorageError::UnknownDriver(name.to_string())),
        }
    }
}

impl Default for StorageRegistry {
    /// The built-in driver set.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("file", file::new_file_storage);
        registry.register("git", git::new_git_storage);
        registry
    }
}
