//! File storage driver: one artifact per file, path chosen by a template.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::Options;
use crate::exporter::Metadata;
use crate::storage::{ArtifactWriter, Storage, StorageError, Tx};
use crate::template::TextTemplate;

/// Storage driver `file`.
///
/// Options: `path` (required; a template expanded against artifact
/// metadata), `compress` (wrap each file in gzip). `commit` is a no-op:
/// every artifact is flushed as its writer closes.
pub struct FileStorage {
    inner: Arc<FileInner>,
}

struct FileInner {
    path: TextTemplate,
    compress: bool,
}

impl FileStorage {
    pub fn new(path_template: &str, compress: bool) -> Result<Self, StorageError> {
        Ok(Self {
            inner: Arc::new(FileInner {
                path: TextTemplate::compile(path_template)?,
                compress,
            }),
        })
    }
}

/// Construct from storage options.
pub(crate) fn new_file_storage(
    options: Options,
) -> BoxFuture<'static, Result<Arc<dyn Storage>, StorageError>> {
    Box::pin(async move {
        let path = options
            .get_str("path")
            .ok_or(StorageError::MissingOption("path"))?;
        let compress = options.get_bool("compress").unwrap_or(false);
        Ok(Arc::new(FileStorage::new(&path, compress)?) as Arc<dyn Storage>)
    })
}

#[async_trait]
impl Storage for FileStorage {
    async fn begin(&self) -> Result<Arc<dyn Tx>, StorageError> {
        Ok(Arc::new(FileTx {
            inner: self.inner.clone(),
            timestamp: Utc::now(),
        }))
    }
}

struct FileTx {
    inner: Arc<FileInner>,
    timestamp: DateTime<Utc>,
}

#[async_trait]
impl Tx for FileTx {
    async fn add(&self, metadata: Metadata) -> Result<Box<dyn ArtifactWriter>, StorageError> {
        let path = std::path::PathBuf::from(self.inner.path.render(&metadata)?);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        debug!(file = %path.display(), compressed = self.inner.compress, "writing");

        let file = File::create(&path).await?;
        let sink = if self.inner.compress {
            FileSink::Gzip(GzipEncoder::new(file))
        } else {
            FileSink::Plain(file)
        };

        Ok(Box::new(FileWriter { sink }))
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    async fn commit(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

enum FileSink {
    Plain(File),
    Gzip(GzipEncoder<File>),
}

impl AsyncWrite for FileSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            FileSink::Plain(f) => Pin::new(f).poll_write(cx, buf),
            FileSink::Gzip(f) => Pin::new(f).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FileSink::Plain(f) => Pin::new(f).poll_flush(cx),
            FileSink::Gzip(f) => Pin::new(f).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FileSink::Plain(f) => Pin::new(f).poll_shutdown(cx),
            FileSink::Gzip(f) => Pin::new(f).poll_shutdown(cx),
        }
    }
}

struct FileWriter {
    sink: FileSink,
}

impl AsyncWrite for FileWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.sink).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.sink).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.sink).poll_shutdown(cx)
    }
}

#[async_trait]
impl ArtifactWriter for FileWriter {
    async fn close(mut self: Box<Self>) -> Result<(), StorageError> {
        // Finishes the gzip trailer and flushes the file.
        self.sink.shutdown().await?;
        Ok(())
    }

    async fn close_with_error(
        mut self: Box<Self>,
        _cause: &std::io::Error,
    ) -> Result<(), StorageError> {
        // The partially written file stays on disk; the next run overwrites
        // it at the same rendered path.
        self.sink.shutdown().await?;
        Ok(())
    }
}
