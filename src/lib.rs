//! confdump: versioned snapshots of network device configuration.
//!
//! This crate periodically harvests configuration exports from a fleet of
//! devices over SSH and commits the captured artifacts into a transactional
//! sink: a git repository or a directory of files. It can be embedded as a
//! library or run standalone through the `confdump` binary.
//!
//! # Architecture
//!
//! - **Exporters**: produce one device's configuration as a byte stream
//!   (`ssh-command` runs a remote command and captures stdout)
//! - **Filters**: ordered, composable stream transformers (`regexp`)
//! - **Storage**: transactional artifact sinks (`file`, `git`) with
//!   write-many / commit-once semantics
//! - **Scraper**: the worker-pool scheduler gluing the pipeline together
//!
//! # Quick start
//!
//! ```rust,no_run
//! use confdump::{Config, DriverRegistries, Scraper};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("confdump.yaml")?;
//! let registries = DriverRegistries::default();
//! let scraper = Scraper::from_config(&config, &registries).await?;
//!
//! let cancel = CancellationToken::new();
//! scraper.run(&cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod exporter;
pub mod filter;
pub mod pipe;
pub mod scraper;
pub mod ssh;
pub mod storage;
pub mod template;

// Re-export public types
pub use config::{Config, ConfigError, Options};
pub use exporter::{
    ByteStream, Export, Exporter, ExporterError, ExporterRegistry, Metadata, NopCloser,
    StreamCloser,
};
pub use filter::{Filter, FilterRegistry};
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use scraper::{DriverRegistries, ExporterJob, Scraper, ScraperError};
pub use storage::{
    ArtifactWriter, FileStorage, GitStorage, Storage, StorageError, StorageRegistry, Tx,
};
