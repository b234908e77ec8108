//! The scheduler: fans export jobs out over a bounded worker pool, plumbs
//! each device's stream through its filter chain into a storage writer, and
//! commits the transaction once every worker is done.
//!
//! Three cancellation scopes are in play: the run token governs the whole
//! pass, each exporter call gets a child token bounded by the device
//! timeout, and each storage call is bounded by the storage timeout. A
//! failing device costs one artifact; a failing begin or commit costs the
//! run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use crate::config::{Config, ConfigError};
use crate::exporter::{ByteStream, Exporter, ExporterError, ExporterRegistry};
use crate::filter::{Filter, FilterRegistry};
use crate::pipe::pipe;
use crate::storage::{Storage, StorageError, StorageRegistry, Tx};

/// Device driver used when a device entry names none.
pub const DEFAULT_EXPORTER_DRIVER: &str = "ssh-command";

/// The full driver set the scraper resolves names against. Tests substitute
/// their own registries here instead of touching process-global state.
#[derive(Default)]
pub struct DriverRegistries {
    pub exporters: ExporterRegistry,
    pub filters: FilterRegistry,
    pub storages: StorageRegistry,
}

/// One device's work order: the exporter, its timeout, and the filter chain
/// applied to its output. Built once at startup, immutable afterwards.
pub struct ExporterJob {
    pub exporter: Box<dyn Exporter>,
    pub timeout: Option<Duration>,
    pub filters: Vec<Arc<dyn Filter>>,
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("storage operation timed out")]
    StorageTimeout,

    #[error("run cancelled")]
    Cancelled,
}

/// Per-job failures; logged against the device, never fatal to the run.
#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    Exporter(#[from] ExporterError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("copy: {0}")]
    Copy(#[from] std::io::Error),

    #[error("device timed out")]
    Timeout,

    #[error("storage operation timed out")]
    StorageTimeout,

    #[error("cancelled")]
    Cancelled,
}

/// Outcome of a storage call made under the run token and the storage
/// timeout. Converts into [`ScraperError`] at the run level (begin/commit)
/// and into [`JobError`] inside a worker (add).
enum ScopeError {
    Storage(StorageError),
    Timeout,
    Cancelled,
}

impl From<ScopeError> for ScraperError {
    fn from(e: ScopeError) -> Self {
        match e {
            ScopeError::Storage(e) => ScraperError::Storage(e),
            ScopeError::Timeout => ScraperError::StorageTimeout,
            ScopeError::Cancelled => ScraperError::Cancelled,
        }
    }
}

impl From<ScopeError> for JobError {
    fn from(e: ScopeError) -> Self {
        match e {
            ScopeError::Storage(e) => JobError::Storage(e),
            ScopeError::Timeout => JobError::StorageTimeout,
            ScopeError::Cancelled => JobError::Cancelled,
        }
    }
}

pub struct Scraper {
    devices: Vec<Arc<ExporterJob>>,
    storage: Arc<dyn Storage>,
    max_goroutines: i64,
    storage_timeout: Option<Duration>,
}

impl std::fmt::Debug for Scraper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scraper")
            .field("devices", &self.devices.len())
            .field("max_goroutines", &self.max_goroutines)
            .field("storage_timeout", &self.storage_timeout)
            .finish()
    }
}

impl Scraper {
    pub fn new(devices: Vec<ExporterJob>, storage: Arc<dyn Storage>) -> Self {
        Self {
            devices: devices.into_iter().map(Arc::new).collect(),
            storage,
            max_goroutines: 0,
            storage_timeout: None,
        }
    }

    /// Cap the worker pool; zero or negative means one worker per device.
    pub fn with_max_goroutines(mut self, max: i64) -> Self {
        self.max_goroutines = max;
        self
    }

    /// Bound every individual storage call.
    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = Some(timeout);
        self
    }

    /// Build a scraper from configuration, resolving driver and filter names
    /// against `registries`.
    pub async fn from_config(
        config: &Config,
        registries: &DriverRegistries,
    ) -> Result<Self, ConfigError> {
        // Declared filters, shared by every device that references them.
        let mut declared: std::collections::HashMap<String, Arc<dyn Filter>> =
            std::collections::HashMap::new();
        for decl in &config.filters {
            if decl.name.is_empty() {
                continue;
            }
            let filter = registries.filters.create(&decl.filter, &decl.options)?;
            declared.insert(decl.name.clone(), filter);
        }

        let default_timeout = config.default_timeout()?;

        let mut devices = Vec::with_capacity(config.devices.list.len());
        for entry in &config.devices.list {
            let options = config.devices.common.merged_with(entry);

            let driver = options
                .get_str("driver")
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| DEFAULT_EXPORTER_DRIVER.to_string());

            info!(driver = %driver, "initializing device");
            let exporter = registries.exporters.create(&driver, &options)?;

            let timeout = options.get_duration("timeout")?.or(default_timeout);

            let mut filters = Vec::new();
            for name in options.get_str_seq("filters").unwrap_or_default() {
                let filter = declared
                    .get(&name)
                    .cloned()
                    .ok_or(ConfigError::UndeclaredFilter(name))?;
                filters.push(filter);
            }

            devices.push(Arc::new(ExporterJob {
                exporter,
                timeout,
                filters,
            }));
        }

        if devices.is_empty() {
            return Err(ConfigError::Validation("no devices specified".to_string()));
        }
        info!("{} devices found", devices.len());

        let driver = config
            .storage
            .get_str("driver")
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                ConfigError::Validation("storage driver is not specified".to_string())
            })?;
        let storage_timeout = config.storage.get_duration("timeout")?;

        info!(driver = %driver, "initializing storage");
        let storage_init = registries.storages.create(&driver, config.storage.clone());
        let storage = match storage_timeout {
            Some(timeout) => tokio::time::timeout(timeout, storage_init)
                .await
                .map_err(|_| {
                    ConfigError::Validation("storage initialization timed out".to_string())
                })??,
            None => storage_init.await?,
        };

        Ok(Self {
            devices,
            storage,
            max_goroutines: config.max_goroutines,
            storage_timeout,
        })
    }

    /// One end-to-end pass: begin, fan out, commit.
    ///
    /// Per-device failures are logged and skipped. A begin or commit failure
    /// aborts the run, and cancellation of `cancel` suppresses the commit
    /// entirely.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ScraperError> {
        let tx = storage_scope(cancel, self.storage_timeout, self.storage.begin())
            .await
            .map_err(ScraperError::from)?;

        let worker_count = if self.max_goroutines > 0 {
            self.devices.len().min(self.max_goroutines as usize)
        } else {
            self.devices.len()
        };

        let (job_tx, job_rx) = mpsc::channel::<Arc<ExporterJob>>(1);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let job_rx = job_rx.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let storage_timeout = self.storage_timeout;
            workers.spawn(async move {
                worker_loop(job_rx, tx, cancel, storage_timeout).await;
            });
        }

        for job in &self.devices {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = job_tx.send(job.clone()) => res,
            };
            if sent.is_err() {
                break;
            }
        }
        drop(job_tx);

        while workers.join_next().await.is_some() {}

        if cancel.is_cancelled() {
            return Err(ScraperError::Cancelled);
        }

        info!("committing");
        storage_scope(cancel, self.storage_timeout, tx.commit())
            .await
            .map_err(ScraperError::from)?;

        info!("done");
        Ok(())
    }
}

/// Consume jobs until the channel closes or the run is cancelled. The
/// current job is always drained before the cancellation check, so writers
/// reach their terminal call.
async fn worker_loop(
    job_rx: Arc<Mutex<mpsc::Receiver<Arc<ExporterJob>>>>,
    tx: Arc<dyn Tx>,
    cancel: CancellationToken,
    storage_timeout: Option<Duration>,
) {
    loop {
        let job = { job_rx.lock().await.recv().await };
        let Some(job) = job else { break };

        let meta = job.exporter.metadata();
        let span = tracing::info_span!(
            "device",
            name = %meta.string("name").unwrap_or_default(),
            host = %meta.string("host").unwrap_or_default(),
            device = %meta.string("device").unwrap_or_default(),
        );

        if let Err(e) = export_one(&job, &tx, &cancel, storage_timeout)
            .instrument(span.clone())
            .await
        {
            span.in_scope(|| error!(error = %e, "export failed"));
        }

        if cancel.is_cancelled() {
            break;
        }
    }
}

/// Export one device into the transaction.
async fn export_one(
    job: &ExporterJob,
    tx: &Arc<dyn Tx>,
    cancel: &CancellationToken,
    storage_timeout: Option<Duration>,
) -> Result<(), JobError> {
    let export_cancel = scoped_token(cancel, job.timeout);

    info!("exporting");
    let export = match job.exporter.export(&export_cancel).await {
        Ok(export) => export,
        Err(ExporterError::Cancelled) if !cancel.is_cancelled() && job.timeout.is_some() => {
            return Err(JobError::Timeout);
        }
        Err(e) => return Err(e.into()),
    };

    let mut metadata = export.metadata;
    metadata.insert("time", tx.timestamp().to_rfc3339());

    info!("adding stream to transaction");
    let writer = match storage_scope(cancel, storage_timeout, tx.add(metadata)).await {
        Ok(writer) => writer,
        Err(e) => {
            let _ = export.closer.close().await;
            return Err(e.into());
        }
    };

    // Thread the stream through the filter chain; each filter owns the
    // previous stage and hands back the read end of a fresh pipe.
    let mut src: ByteStream = export.stream;
    for filter in &job.filters {
        let (pipe_writer, pipe_reader) = pipe();
        filter.start(pipe_writer, src);
        src = Box::new(pipe_reader);
    }

    let mut writer = writer;
    let copied = tokio::io::copy(&mut src, &mut writer).await;
    // Release the chain so the stream worker is not left blocked on a full
    // pipe while we wait for it below.
    drop(src);

    let close_result = match &copied {
        Ok(_) => writer.close().await,
        Err(e) => writer.close_with_error(e).await,
    };

    let stream_result = export.closer.close().await;

    // The copy error wins, then the writer close error, then the stream
    // close error.
    copied?;
    close_result?;
    match stream_result {
        Err(ExporterError::Cancelled) if !cancel.is_cancelled() && job.timeout.is_some() => {
            Err(JobError::Timeout)
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}

/// Child token that also fires when `timeout` elapses.
fn scoped_token(parent: &CancellationToken, timeout: Option<Duration>) -> CancellationToken {
    let token = parent.child_token();
    if let Some(timeout) = timeout {
        let deadline = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => deadline.cancel(),
                _ = deadline.cancelled() => {}
            }
        });
    }
    token
}

/// Run a storage future under the run token and the per-call storage
/// timeout.
async fn storage_scope<T>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    op: impl Future<Output = Result<T, StorageError>>,
) -> Result<T, ScopeError> {
    let bounded = async {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, op)
                .await
                .map_err(|_| ScopeError::Timeout)?
                .map_err(ScopeError::Storage),
            None => op.await.map_err(ScopeError::Storage),
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ScopeError::Cancelled),
        res = bounded => res,
    }
}
