//! End-to-end scheduler tests against a scripted exporter and a recording
//! storage, plus the real file storage on temporary directories.

use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use confdump::scraper::DriverRegistries;
use confdump::{
    ArtifactWriter, Config, ConfigError, Export, Exporter, ExporterError, ExporterJob, Filter,
    FilterRegistry, FileStorage, Metadata, NopCloser, Scraper, ScraperError, Storage,
    StorageError, Tx,
};

// --- scripted exporter ---

#[derive(Clone, Copy)]
enum Behavior {
    /// Produce the payload.
    Succeed,
    /// Fail the export call itself.
    Fail,
    /// Block until cancelled.
    Block,
}

#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedExporter {
    name: String,
    payload: Vec<u8>,
    behavior: Behavior,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    gauge: Option<Arc<Gauge>>,
    on_export: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ScriptedExporter {
    fn new(name: &str, payload: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            payload: payload.to_vec(),
            behavior: Behavior::Succeed,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            gauge: None,
            on_export: None,
        }
    }

    fn failing(mut self) -> Self {
        self.behavior = Behavior::Fail;
        self
    }

    fn blocking(mut self) -> Self {
        self.behavior = Behavior::Block;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn with_calls(mut self, calls: Arc<AtomicUsize>) -> Self {
        self.calls = calls;
        self
    }

    fn with_gauge(mut self, gauge: Arc<Gauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    fn on_export(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_export = Some(Box::new(hook));
        self
    }

    fn into_job(self) -> ExporterJob {
        ExporterJob {
            exporter: Box::new(self),
            timeout: None,
            filters: Vec::new(),
        }
    }
}

#[async_trait]
impl Exporter for ScriptedExporter {
    async fn export(&self, cancel: &CancellationToken) -> Result<Export, ExporterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_export {
            hook();
        }

        match self.behavior {
            Behavior::Fail => Err(ExporterError::Io(std::io::Error::other(
                "synthetic export failure",
            ))),
            Behavior::Block => {
                cancel.cancelled().await;
                Err(ExporterError::Cancelled)
            }
            Behavior::Succeed => {
                if let Some(gauge) = &self.gauge {
                    gauge.enter();
                }
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(gauge) = &self.gauge {
                    gauge.exit();
                }

                let mut metadata = Metadata::new();
                metadata.insert("name", self.name.clone());

                Ok(Export {
                    stream: Box::new(Cursor::new(self.payload.clone())),
                    closer: Box::new(NopCloser),
                    metadata,
                })
            }
        }
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("name", self.name.clone());
        metadata.insert("host", "test");
        metadata.insert("device", "scripted");
        metadata
    }
}

// --- recording storage ---

struct Artifact {
    name: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct StorageLog {
    begin_calls: AtomicUsize,
    add_calls: AtomicUsize,
    commit_calls: AtomicUsize,
    committed: AtomicBool,
    terminal_after_commit: AtomicBool,
    staged: Mutex<Vec<Artifact>>,
    dropped: Mutex<Vec<Artifact>>,
    times: Mutex<Vec<String>>,
}

struct RecordingStorage {
    log: Arc<StorageLog>,
    fail_begin: bool,
}

impl RecordingStorage {
    fn new() -> (Arc<dyn Storage>, Arc<StorageLog>) {
        let log = Arc::new(StorageLog::default());
        (
            Arc::new(Self {
                log: log.clone(),
                fail_begin: false,
            }),
            log,
        )
    }

    fn failing_begin() -> (Arc<dyn Storage>, Arc<StorageLog>) {
        let log = Arc::new(StorageLog::default());
        (
            Arc::new(Self {
                log: log.clone(),
                fail_begin: true,
            }),
            log,
        )
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn begin(&self) -> Result<Arc<dyn Tx>, StorageError> {
        self.log.begin_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_begin {
            return Err(StorageError::Invalid("synthetic begin failure".to_string()));
        }
        Ok(Arc::new(RecordingTx {
            log: self.log.clone(),
            timestamp: Utc::now(),
        }))
    }
}

struct RecordingTx {
    log: Arc<StorageLog>,
    timestamp: DateTime<Utc>,
}

#[async_trait]
impl Tx for RecordingTx {
    async fn add(&self, metadata: Metadata) -> Result<Box<dyn ArtifactWriter>, StorageError> {
        self.log.add_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(time) = metadata.string("time") {
            self.log.times.lock().unwrap().push(time);
        }
        Ok(Box::new(RecordingWriter {
            log: self.log.clone(),
            name: metadata.string("name").unwrap_or_default(),
            bytes: Vec::new(),
        }))
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    async fn commit(&self) -> Result<(), StorageError> {
        self.log.commit_calls.fetch_add(1, Ordering::SeqCst);
        self.log.committed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct RecordingWriter {
    log: Arc<StorageLog>,
    name: String,
    bytes: Vec<u8>,
}

impl RecordingWriter {
    fn record(self: Box<Self>, ok: bool) {
        if self.log.committed.load(Ordering::SeqCst) {
            self.log.terminal_after_commit.store(true, Ordering::SeqCst);
        }
        let artifact = Artifact {
            name: self.name,
            bytes: self.bytes,
        };
        let list = if ok { &self.log.staged } else { &self.log.dropped };
        list.lock().unwrap().push(artifact);
    }
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.bytes.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ArtifactWriter for RecordingWriter {
    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        self.record(true);
        Ok(())
    }

    async fn close_with_error(
        self: Box<Self>,
        _cause: &std::io::Error,
    ) -> Result<(), StorageError> {
        self.record(false);
        Ok(())
    }
}

fn regexp_filter(expr: &str, replace: &str) -> Arc<dyn Filter> {
    let options = serde_json::from_value(serde_json::json!({
        "expr": expr,
        "replace": replace,
    }))
    .unwrap();
    FilterRegistry::default().create("regexp", &options).unwrap()
}

// --- scenarios ---

#[tokio::test]
async fn test_bounded_pool_writes_every_device() {
    let dir = tempfile::tempdir().unwrap();
    let template = format!("{}/{{{{ name }}}}", dir.path().display());
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(&template, false).unwrap());

    let devices = vec![
        ScriptedExporter::new("d1", b"A").into_job(),
        ScriptedExporter::new("d2", b"B").into_job(),
        ScriptedExporter::new("d3", b"C").into_job(),
    ];

    let scraper = Scraper::new(devices, storage).with_max_goroutines(2);
    scraper.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(std::fs::read(dir.path().join("d1")).unwrap(), b"A");
    assert_eq!(std::fs::read(dir.path().join("d2")).unwrap(), b"B");
    assert_eq!(std::fs::read(dir.path().join("d3")).unwrap(), b"C");
}

#[tokio::test]
async fn test_device_failure_is_isolated() {
    let (storage, log) = RecordingStorage::new();

    let devices = vec![
        ScriptedExporter::new("d1", b"A").failing().into_job(),
        ScriptedExporter::new("d2", b"B").into_job(),
    ];

    let scraper = Scraper::new(devices, storage);
    scraper.run(&CancellationToken::new()).await.unwrap();

    let staged = log.staged.lock().unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].name, "d2");
    assert_eq!(staged[0].bytes, b"B");
    assert!(log.committed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_filter_rewrites_artifact() {
    let (storage, log) = RecordingStorage::new();

    let mut job = ScriptedExporter::new("d1", b"foo\nfoo foo\n").into_job();
    job.filters = vec![regexp_filter("foo", "bar")];

    let scraper = Scraper::new(vec![job], storage);
    scraper.run(&CancellationToken::new()).await.unwrap();

    let staged = log.staged.lock().unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].bytes, b"bar\nbar bar\n");
}

#[tokio::test]
async fn test_filters_compose_in_order() {
    let (storage, log) = RecordingStorage::new();

    let mut job = ScriptedExporter::new("d1", b"a\n").into_job();
    job.filters = vec![regexp_filter("a", "b"), regexp_filter("b", "c")];

    let scraper = Scraper::new(vec![job], storage);
    scraper.run(&CancellationToken::new()).await.unwrap();

    let staged = log.staged.lock().unwrap();
    assert_eq!(staged[0].bytes, b"c\n");
}

#[tokio::test]
async fn test_device_timeout_skips_artifact() {
    let (storage, log) = RecordingStorage::new();

    let mut job = ScriptedExporter::new("d1", b"").blocking().into_job();
    job.timeout = Some(Duration::from_millis(50));

    let scraper = Scraper::new(vec![job], storage);
    let started = std::time::Instant::now();
    scraper.run(&CancellationToken::new()).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(log.add_calls.load(Ordering::SeqCst), 0);
    assert!(log.staged.lock().unwrap().is_empty());
    assert!(log.committed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancellation_suppresses_commit() {
    let (storage, log) = RecordingStorage::new();
    let cancel = CancellationToken::new();

    let second = {
        let cancel = cancel.clone();
        ScriptedExporter::new("d2", b"B")
            .blocking()
            .on_export(move || cancel.cancel())
    };

    let devices = vec![
        ScriptedExporter::new("d1", b"A").into_job(),
        second.into_job(),
    ];

    let scraper = Scraper::new(devices, storage).with_max_goroutines(1);
    let err = scraper.run(&cancel).await.unwrap_err();

    assert!(matches!(err, ScraperError::Cancelled));
    assert_eq!(log.commit_calls.load(Ordering::SeqCst), 0);
    assert!(!log.committed.load(Ordering::SeqCst));
    // the first device reached the sink but was never committed
    assert_eq!(log.staged.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_begin_failure_aborts_before_any_export() {
    let (storage, log) = RecordingStorage::failing_begin();

    let calls = Arc::new(AtomicUsize::new(0));
    let devices = vec![
        ScriptedExporter::new("d1", b"A")
            .with_calls(calls.clone())
            .into_job(),
        ScriptedExporter::new("d2", b"B")
            .with_calls(calls.clone())
            .into_job(),
    ];

    let scraper = Scraper::new(devices, storage);
    let err = scraper.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ScraperError::Storage(_)));
    assert_eq!(log.begin_calls.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// --- invariants ---

#[tokio::test]
async fn test_worker_cap_bounds_concurrency() {
    let (storage, _log) = RecordingStorage::new();
    let gauge = Arc::new(Gauge::default());

    let devices = (0..5)
        .map(|i| {
            ScriptedExporter::new(&format!("d{i}"), b"X")
                .with_delay(Duration::from_millis(50))
                .with_gauge(gauge.clone())
                .into_job()
        })
        .collect();

    let scraper = Scraper::new(devices, storage).with_max_goroutines(2);
    scraper.run(&CancellationToken::new()).await.unwrap();

    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak concurrency was {peak}");
}

#[tokio::test]
async fn test_unbounded_pool_runs_all_at_once() {
    let (storage, _log) = RecordingStorage::new();
    let gauge = Arc::new(Gauge::default());

    let devices = (0..4)
        .map(|i| {
            ScriptedExporter::new(&format!("d{i}"), b"X")
                .with_delay(Duration::from_millis(200))
                .with_gauge(gauge.clone())
                .into_job()
        })
        .collect();

    let scraper = Scraper::new(devices, storage);
    scraper.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(gauge.peak.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_run_timestamp_is_uniform() {
    let (storage, log) = RecordingStorage::new();

    let devices = vec![
        ScriptedExporter::new("d1", b"A").into_job(),
        ScriptedExporter::new("d2", b"B").into_job(),
        ScriptedExporter::new("d3", b"C").into_job(),
    ];

    let scraper = Scraper::new(devices, storage);
    scraper.run(&CancellationToken::new()).await.unwrap();

    let times = log.times.lock().unwrap();
    assert_eq!(times.len(), 3);
    assert!(times.iter().all(|t| t == &times[0]));
    DateTime::parse_from_rfc3339(&times[0]).unwrap();
}

#[tokio::test]
async fn test_no_terminal_call_after_commit() {
    let (storage, log) = RecordingStorage::new();

    let devices = (0..8)
        .map(|i| ScriptedExporter::new(&format!("d{i}"), b"X").into_job())
        .collect();

    let scraper = Scraper::new(devices, storage).with_max_goroutines(3);
    scraper.run(&CancellationToken::new()).await.unwrap();

    assert!(!log.terminal_after_commit.load(Ordering::SeqCst));
    assert_eq!(log.staged.lock().unwrap().len(), 8);
}

// --- configuration wiring ---

#[tokio::test]
async fn test_unknown_device_driver_is_fatal() {
    let config = Config::parse(
        r#"
version: "1"
devices:
  list:
    - name: sw1
      driver: does-not-exist
storage:
  driver: file
  path: out/{{ name }}
"#,
    )
    .unwrap();

    let err = Scraper::from_config(&config, &DriverRegistries::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownExporter(d) if d == "does-not-exist"));
}

#[tokio::test]
async fn test_undeclared_filter_reference_is_fatal() {
    let config = Config::parse(
        r#"
version: "1"
devices:
  list:
    - name: sw1
      host: 192.0.2.1
      username: backup
      filters: collapse
storage:
  driver: file
  path: out/{{ name }}
"#,
    )
    .unwrap();

    let err = Scraper::from_config(&config, &DriverRegistries::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::UndeclaredFilter(f) if f == "collapse"));
}

#[tokio::test]
async fn test_missing_storage_driver_is_fatal() {
    let config = Config::parse(
        r#"
version: "1"
devices:
  list:
    - name: sw1
      host: 192.0.2.1
      username: backup
storage:
  path: out/{{ name }}
"#,
    )
    .unwrap();

    let err = Scraper::from_config(&config, &DriverRegistries::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[tokio::test]
async fn test_from_config_builds_and_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::parse(&format!(
        r#"
version: "1"
max_goroutines: 2
devices:
  common:
    driver: scripted
  list:
    - name: sw1
    - name: sw2
storage:
  driver: file
  path: "{}/{{{{ name }}}}.rsc"
"#,
        dir.path().display()
    ))
    .unwrap();

    let mut registries = DriverRegistries::default();
    registries.exporters.register("scripted", |options| {
        let name = options.require_str("name")?;
        Ok(Box::new(ScriptedExporter::new(&name, b"payload\n")))
    });

    let scraper = Scraper::from_config(&config, &registries).await.unwrap();
    scraper.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(dir.path().join("sw1.rsc")).unwrap(),
        "payload\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("sw2.rsc")).unwrap(),
        "payload\n"
    );
}
