//! Git storage driver: artifacts become one commit per run, optionally
//! pushed to a remote.
//!
//! libgit2 calls are blocking, so repository work runs on blocking threads;
//! index staging, commit, and push are serialized by the repository mutex.
//! Artifact bytes stream straight into worktree files and only the staging
//! step takes the lock.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    CertificateCheckStatus, Cred, CredentialType, FetchOptions, PushOptions, RemoteCallbacks,
    Repository, Signature,
};
use serde::Serialize;
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::Options;
use crate::exporter::Metadata;
use crate::ssh;
use crate::storage::{ArtifactWriter, Storage, StorageError, Tx};
use crate::template::TextTemplate;

/// Configuration for [`GitStorage`], assembled from the `storage` option
/// map.
pub struct GitStorageOptions {
    /// Local repository path. When absent, the repository is cloned into an
    /// ephemeral scratch directory that lives as long as the storage.
    pub repository_path: Option<PathBuf>,
    pub url: Option<String>,
    /// Fetch and fast-forward the checked-out branch on open.
    pub pull: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM key material for SSH remotes.
    pub identity: Option<Arc<Vec<u8>>>,
    /// Remote used for pull and push; defaults to `origin`.
    pub remote_name: Option<String>,
    /// Branch to clone or pull; defaults to the remote HEAD.
    pub reference_name: Option<String>,
    pub push: bool,
    /// Refspecs for the push; defaults to the checked-out branch.
    pub ref_specs: Vec<String>,
    /// Artifact path template, relative to the worktree.
    pub destination_path: String,
    /// Optional per-artifact log line template, rendered into the commit
    /// message context as `summary`.
    pub summary: Option<String>,
    /// Commit author name.
    pub name: String,
    /// Commit author email.
    pub email: String,
    pub commit_message: String,
}

#[derive(Clone)]
struct GitAuth {
    username: Option<String>,
    password: Option<String>,
    identity: Option<Arc<Vec<u8>>>,
}

/// Storage driver `git`.
pub struct GitStorage {
    inner: Arc<GitInner>,
}

impl std::fmt::Debug for GitStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GitStorage")
    }
}

struct GitInner {
    repo: Mutex<Repository>,
    workdir: PathBuf,
    dest: TextTemplate,
    message: TextTemplate,
    summary: Option<TextTemplate>,
    auth: GitAuth,
    remote_name: Option<String>,
    push: bool,
    ref_specs: Vec<String>,
    author_name: String,
    author_email: String,
    _scratch: Option<TempDir>,
}

impl GitStorage {
    /// Open (or clone) the repository and compile the templates.
    pub async fn open(options: GitStorageOptions) -> Result<Self, StorageError> {
        if options.repository_path.is_none() && options.url.is_none() {
            return Err(StorageError::Invalid(
                "git: either repository path or URL must be specified".to_string(),
            ));
        }
        if options.destination_path.is_empty() {
            return Err(StorageError::MissingOption("destination_path"));
        }
        if options.name.is_empty() {
            return Err(StorageError::MissingOption("name"));
        }
        if options.email.is_empty() {
            return Err(StorageError::MissingOption("email"));
        }
        if options.commit_message.is_empty() {
            return Err(StorageError::MissingOption("commit_message"));
        }

        let dest = TextTemplate::compile(&options.destination_path)?;
        let message = TextTemplate::compile(&options.commit_message)?;
        let summary = options
            .summary
            .as_deref()
            .map(TextTemplate::compile)
            .transpose()?;

        let auth = GitAuth {
            username: options.username.clone(),
            password: options.password.clone(),
            identity: options.identity.clone(),
        };

        let (repo, scratch) = {
            let auth = auth.clone();
            let repository_path = options.repository_path.clone();
            let url = options.url.clone();
            let pull = options.pull;
            let remote_name = options.remote_name.clone();
            let reference_name = options.reference_name.clone();
            tokio::task::spawn_blocking(move || {
                open_or_clone(
                    repository_path.as_deref(),
                    url.as_deref(),
                    pull,
                    remote_name.as_deref(),
                    reference_name.as_deref(),
                    &auth,
                )
            })
            .await
            .map_err(|e| StorageError::Task(e.to_string()))??
        };

        let workdir = repo
            .workdir()
            .ok_or_else(|| {
                StorageError::Invalid("git: bare repositories are not supported".to_string())
            })?
            .to_path_buf();

        Ok(Self {
            inner: Arc::new(GitInner {
                repo: Mutex::new(repo),
                workdir,
                dest,
                message,
                summary,
                auth,
                remote_name: options.remote_name,
                push: options.push,
                ref_specs: options.ref_specs,
                author_name: options.name,
                author_email: options.email,
                _scratch: scratch,
            }),
        })
    }
}

/// Construct from storage options.
pub(crate) fn new_git_storage(
    options: Options,
) -> BoxFuture<'static, Result<Arc<dyn Storage>, StorageError>> {
    Box::pin(async move {
        let identity = match options.get_str("identity_file") {
            Some(path) if !path.is_empty() => Some(ssh::read_identity_file(path)?),
            _ => None,
        };

        let opts = GitStorageOptions {
            repository_path: options.get_str("repository_path").map(PathBuf::from),
            url: options.get_str("url"),
            pull: options.get_bool("pull").unwrap_or(false),
            username: options.get_str("username"),
            password: options.get_str("password"),
            identity,
            remote_name: options.get_str("remote_name"),
            reference_name: options.get_str("reference_name"),
            push: options.get_bool("push").unwrap_or(false),
            ref_specs: options.get_str_seq("ref_specs").unwrap_or_default(),
            destination_path: options.get_str("destination_path").unwrap_or_default(),
            summary: options.get_str("summary"),
            name: options.get_str("name").unwrap_or_default(),
            email: options.get_str("email").unwrap_or_default(),
            commit_message: options.get_str("commit_message").unwrap_or_default(),
        };

        Ok(Arc::new(GitStorage::open(opts).await?) as Arc<dyn Storage>)
    })
}

#[async_trait]
impl Storage for GitStorage {
    async fn begin(&self) -> Result<Arc<dyn Tx>, StorageError> {
        Ok(Arc::new(GitTx {
            state: Arc::new(TxState {
                inner: self.inner.clone(),
                timestamp: Utc::now(),
                log: Mutex::new(Vec::new()),
            }),
        }))
    }
}

struct TxState {
    inner: Arc<GitInner>,
    timestamp: DateTime<Utc>,
    log: Mutex<Vec<String>>,
}

struct GitTx {
    state: Arc<TxState>,
}

#[async_trait]
impl Tx for GitTx {
    async fn add(&self, metadata: Metadata) -> Result<Box<dyn ArtifactWriter>, StorageError> {
        let rel = PathBuf::from(self.state.inner.dest.render(&metadata)?);
        let abs = self.state.inner.workdir.join(&rel);
        if let Some(dir) = abs.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        debug!(file = %rel.display(), "writing");

        let file = File::create(&abs).await?;
        Ok(Box::new(GitWriter {
            file,
            rel,
            metadata,
            state: self.state.clone(),
        }))
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.state.timestamp
    }

    async fn commit(&self) -> Result<(), StorageError> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || commit_blocking(&state))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

struct GitWriter {
    file: File,
    rel: PathBuf,
    metadata: Metadata,
    state: Arc<TxState>,
}

impl GitWriter {
    async fn finish(self: Box<Self>, error: Option<String>) -> Result<(), StorageError> {
        let Self {
            mut file,
            rel,
            metadata,
            state,
        } = *self;

        file.shutdown().await?;
        drop(file);

        tokio::task::spawn_blocking(move || finish_blocking(&state, &rel, &metadata, error))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

impl AsyncWrite for GitWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl ArtifactWriter for GitWriter {
    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        self.finish(None).await
    }

    async fn close_with_error(
        self: Box<Self>,
        cause: &std::io::Error,
    ) -> Result<(), StorageError> {
        // The file stays in the worktree but is never staged, so the commit
        // carries the previous revision of this artifact.
        self.finish(Some(cause.to_string())).await
    }
}

/// Stage a successfully written artifact and record its summary line.
fn finish_blocking(
    state: &TxState,
    rel: &Path,
    metadata: &Metadata,
    error: Option<String>,
) -> Result<(), StorageError> {
    if error.is_none() {
        let repo = lock(&state.inner.repo);
        let mut index = repo.index()?;
        index.add_path(rel)?;
        index.write()?;
    }

    if let Some(summary) = &state.inner.summary {
        let mut data = metadata.clone();
        data.insert("error", error.unwrap_or_default());
        let line = summary.render(&data)?;
        lock(&state.log).push(line);
    }

    Ok(())
}

#[derive(Serialize)]
struct CommitContext {
    time: String,
    summary: Vec<String>,
}

fn commit_blocking(state: &TxState) -> Result<(), StorageError> {
    let context = CommitContext {
        time: state.timestamp.to_rfc3339(),
        summary: lock(&state.log).clone(),
    };
    let message = state.inner.message.render(&context)?;

    let inner = &state.inner;
    let repo = lock(&inner.repo);

    let mut index = repo.index()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let signature = Signature::now(&inner.author_name, &inner.author_email)?;
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.as_ref().into_iter().collect();

    let oid = repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        &message,
        &tree,
        &parents,
    )?;

    info!(hash = %oid, message = %message, "committed");

    if inner.push {
        info!("pushing");
        push(&repo, inner)?;
    }

    Ok(())
}

fn push(repo: &Repository, inner: &GitInner) -> Result<(), StorageError> {
    let remote_name = inner.remote_name.as_deref().unwrap_or("origin");
    let mut remote = repo.find_remote(remote_name)?;

    let mut push_opts = PushOptions::new();
    push_opts.remote_callbacks(remote_callbacks(&inner.auth));

    let specs: Vec<String> = if inner.ref_specs.is_empty() {
        let head = repo.head()?;
        let name = head.name().ok_or_else(|| {
            StorageError::Invalid("git: HEAD reference name is not valid UTF-8".to_string())
        })?;
        vec![format!("{name}:{name}")]
    } else {
        inner.ref_specs.clone()
    };
    let spec_refs: Vec<&str> = specs.iter().map(String::as_str).collect();

    remote.push(&spec_refs, Some(&mut push_opts))?;
    Ok(())
}

fn open_or_clone(
    repository_path: Option<&Path>,
    url: Option<&str>,
    pull: bool,
    remote_name: Option<&str>,
    reference_name: Option<&str>,
    auth: &GitAuth,
) -> Result<(Repository, Option<TempDir>), StorageError> {
    if let Some(path) = repository_path {
        match Repository::open(path) {
            Ok(repo) => {
                debug!(repository = %path.display(), "using existing local repository");
                if pull {
                    pull_fast_forward(&repo, remote_name, reference_name, auth)?;
                }
                Ok((repo, None))
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                let url = url.ok_or_else(clone_url_missing)?;
                info!(repository = %path.display(), url, "cloning");
                Ok((clone(url, path, reference_name, auth)?, None))
            }
            Err(e) => Err(e.into()),
        }
    } else {
        let url = url.ok_or_else(clone_url_missing)?;
        let scratch = TempDir::new()?;
        info!(url, "cloning into scratch checkout");
        let repo = clone(url, scratch.path(), reference_name, auth)?;
        Ok((repo, Some(scratch)))
    }
}

fn clone_url_missing() -> StorageError {
    StorageError::Invalid("git: clone URL must be specified".to_string())
}

fn clone(
    url: &str,
    path: &Path,
    reference_name: Option<&str>,
    auth: &GitAuth,
) -> Result<Repository, StorageError> {
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(remote_callbacks(auth));

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch);
    if let Some(reference) = reference_name {
        builder.branch(branch_shortname(reference));
    }

    Ok(builder.clone(url, path)?)
}

/// Fetch the configured remote and fast-forward the checked-out branch.
fn pull_fast_forward(
    repo: &Repository,
    remote_name: Option<&str>,
    reference_name: Option<&str>,
    auth: &GitAuth,
) -> Result<(), StorageError> {
    let remote_name = remote_name.unwrap_or("origin");
    let mut remote = repo.find_remote(remote_name)?;

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(remote_callbacks(auth));

    let refspecs: Vec<&str> = reference_name.map(branch_shortname).into_iter().collect();

    info!(remote = remote_name, "pulling");
    remote.fetch(&refspecs, Some(&mut fetch), None)?;

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&fetch_commit])?;

    if analysis.is_up_to_date() {
        debug!("already up to date");
        return Ok(());
    }
    if analysis.is_fast_forward() {
        let mut head = repo.head()?;
        head.set_target(fetch_commit.id(), "fast-forward pull")?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
        return Ok(());
    }

    Err(StorageError::Invalid(
        "git: pull would not fast-forward".to_string(),
    ))
}

/// Credential and certificate callbacks for remote operations.
///
/// libgit2 tells us which credential kinds the server accepts, which maps
/// the URL scheme for us: HTTP(S) negotiates user/password pairs, SSH asks
/// for a key first. Host-key and TLS certificate checking is permissive.
fn remote_callbacks(auth: &GitAuth) -> RemoteCallbacks<'static> {
    let auth = auth.clone();
    let mut callbacks = RemoteCallbacks::new();

    callbacks.credentials(move |_url, username_from_url, allowed| {
        let user = username_from_url
            .map(str::to_string)
            .or_else(|| auth.username.clone())
            .unwrap_or_else(|| "git".to_string());

        if allowed.contains(CredentialType::SSH_KEY) {
            if let Some(pem) = &auth.identity {
                let pem = std::str::from_utf8(pem)
                    .map_err(|_| git2::Error::from_str("identity file is not valid UTF-8"))?;
                return Cred::ssh_key_from_memory(&user, None, pem, auth.password.as_deref());
            }
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            return Cred::userpass_plaintext(&user, auth.password.as_deref().unwrap_or(""));
        }

        Err(git2::Error::from_str(
            "no applicable authentication method",
        ))
    });

    callbacks.certificate_check(|_cert, _host| Ok(CertificateCheckStatus::CertificateOk));

    callbacks
}

/// `refs/heads/main` and `main` both name the branch `main`.
fn branch_shortname(reference: &str) -> &str {
    reference.strip_prefix("refs/heads/").unwrap_or(reference)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
