//! SSH session establishment and identity-file caching.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use russh::client::{self, Handle};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg, PublicKey};
use tokio_util::sync::CancellationToken;

use crate::exporter::ExporterError;

static IDENTITY_CACHE: Lazy<Mutex<HashMap<PathBuf, Arc<Vec<u8>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Read an identity file, caching its contents for the process lifetime.
/// Every later request for the same path is served from memory.
pub fn read_identity_file(path: impl AsRef<Path>) -> std::io::Result<Arc<Vec<u8>>> {
    let path = path.as_ref();
    let mut cache = IDENTITY_CACHE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(data) = cache.get(path) {
        return Ok(data.clone());
    }
    let data = Arc::new(std::fs::read(path)?);
    cache.insert(path.to_path_buf(), data.clone());
    Ok(data)
}

/// Credentials offered to a device. When both a key and a password are
/// present, public-key authentication is tried first and the password second.
#[derive(Clone)]
pub struct SshAuth {
    pub username: String,
    pub password: Option<String>,
    pub key: Option<Arc<Vec<u8>>>,
}

/// Client handler that accepts any host key. Fleet devices are reached over
/// management networks where keys churn with reprovisioning.
pub struct Permissive;

impl client::Handler for Permissive {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Dial and authenticate an SSH session. The connect phase aborts promptly
/// when `cancel` fires.
pub async fn connect(
    cancel: &CancellationToken,
    host: &str,
    port: u16,
    auth: &SshAuth,
) -> Result<Handle<Permissive>, ExporterError> {
    let config = Arc::new(client::Config::default());

    let mut session = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ExporterError::Cancelled),
        res = client::connect(config, (host, port), Permissive) => res?,
    };

    authenticate(&mut session, auth).await?;
    Ok(session)
}

async fn authenticate(
    session: &mut Handle<Permissive>,
    auth: &SshAuth,
) -> Result<(), ExporterError> {
    if let Some(pem) = &auth.key {
        let pem = std::str::from_utf8(pem)
            .map_err(|_| ExporterError::Key("identity file is not valid UTF-8".to_string()))?;
        let key = decode_secret_key(pem, None).map_err(|e| ExporterError::Key(e.to_string()))?;

        let hash_alg = session.best_supported_rsa_hash().await?.flatten();

        if session
            .authenticate_publickey(
                &auth.username,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await?
            .success()
        {
            return Ok(());
        }
    }

    if let Some(password) = &auth.password {
        if session
            .authenticate_password(&auth.username, password)
            .await?
            .success()
        {
            return Ok(());
        }
    }

    Err(ExporterError::AuthenticationFailed {
        user: auth.username.clone(),
    })
}
