//! `ssh-command` exporter: runs a command on the remote device and exposes
//! its standard output as the export stream.
//!
//! The defaults target RouterOS-style devices, where `export` prints the
//! full configuration, but any command that writes to stdout works.

use std::io;

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ConfigError, Options};
use crate::exporter::{Export, Exporter, ExporterError, Metadata, StreamCloser};
use crate::pipe::{pipe, PipeWriter};
use crate::ssh::{self, SshAuth};

const DEFAULT_PORT: u16 = 22;
const DEFAULT_COMMAND: &str = "export";

/// Exporter driver `ssh-command`.
pub struct SshCommandExporter {
    name: String,
    host: String,
    port: u16,
    command: String,
    auth: SshAuth,
    export_metadata: Metadata,
    device_metadata: Metadata,
}

/// Construct from device options: `host` and `username` are required;
/// `port`, `command`, `password`, and `identity_file` are optional.
pub(crate) fn new_ssh_command(options: &Options) -> Result<Box<dyn Exporter>, ConfigError> {
    let host = options.require_str("host")?;
    let username = options.require_str("username")?;
    let name = options.get_str("name").unwrap_or_default();
    let port = options.get_int("port").unwrap_or(DEFAULT_PORT as i64) as u16;
    let command = options
        .get_str("command")
        .unwrap_or_else(|| DEFAULT_COMMAND.to_string());
    let password = options.get_str("password");

    let key = match options.get_str("identity_file") {
        Some(path) if !path.is_empty() => Some(ssh::read_identity_file(path)?),
        _ => None,
    };

    // The run metadata is the option map with the password redacted.
    let export_metadata: Metadata = options
        .iter()
        .filter(|(k, _)| k.as_str() != "password")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut device_metadata = Metadata::new();
    device_metadata.insert("name", name.clone());
    device_metadata.insert("host", host.clone());
    device_metadata.insert("device", "ssh-command");

    Ok(Box::new(SshCommandExporter {
        name,
        host,
        port,
        command,
        auth: SshAuth {
            username,
            password,
            key,
        },
        export_metadata,
        device_metadata,
    }))
}

#[async_trait]
impl Exporter for SshCommandExporter {
    async fn export(&self, cancel: &CancellationToken) -> Result<Export, ExporterError> {
        debug!(name = %self.name, host = %self.host, port = self.port, "establishing SSH connection");
        let session = ssh::connect(cancel, &self.host, self.port, &self.auth).await?;

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = session.channel_open_session() => Some(res),
        };
        let channel = match opened {
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                let _ = session.disconnect(Disconnect::ByApplication, "", "en").await;
                return Err(e.into());
            }
            None => {
                let _ = session.disconnect(Disconnect::ByApplication, "", "en").await;
                return Err(ExporterError::Cancelled);
            }
        };

        debug!(command = %self.command, "starting remote command");
        if let Err(e) = channel.exec(true, self.command.as_str()).await {
            let _ = session.disconnect(Disconnect::ByApplication, "", "en").await;
            return Err(e.into());
        }

        let (writer, reader) = pipe();
        let pump = tokio::spawn(pump_stdout(channel, writer, cancel.clone()));

        Ok(Export {
            stream: Box::new(reader),
            closer: Box::new(SshCloser { pump, session }),
            metadata: self.export_metadata.clone(),
        })
    }

    fn metadata(&self) -> Metadata {
        self.device_metadata.clone()
    }
}

/// Forward remote stdout into the pipe until the channel closes.
///
/// An in-flight cancellation is converted into a read error exactly once:
/// the cancellation error is delivered through the pipe in preference to any
/// transport error, and the pipe keeps returning it afterwards.
async fn pump_stdout(
    mut channel: Channel<Msg>,
    mut dst: PipeWriter,
    cancel: CancellationToken,
) -> Result<(), ExporterError> {
    let mut exit_status = None;
    let mut reader_gone = false;

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                dst.close_with_error(cancelled_io_error()).await;
                return Err(ExporterError::Cancelled);
            }
            msg = channel.wait() => msg,
        };

        match msg {
            Some(ChannelMsg::Data { data }) if !reader_gone => {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    res = dst.write_all(&data) => Some(res),
                };
                match written {
                    None => {
                        dst.close_with_error(cancelled_io_error()).await;
                        return Err(ExporterError::Cancelled);
                    }
                    // Reader abandoned the stream; keep consuming channel
                    // messages without writing so the exit status still
                    // arrives.
                    Some(Err(_)) => reader_gone = true,
                    Some(Ok(())) => {}
                }
            }
            Some(ChannelMsg::Data { .. }) => {}
            Some(ChannelMsg::ExitStatus { exit_status: code }) => exit_status = Some(code),
            Some(_) => {}
            None => break,
        }
    }

    let _ = dst.shutdown().await;

    match exit_status {
        Some(code) if code != 0 => Err(ExporterError::ExitStatus(code)),
        _ => Ok(()),
    }
}

fn cancelled_io_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::Interrupted,
        ExporterError::Cancelled.to_string(),
    )
}

struct SshCloser {
    pump: JoinHandle<Result<(), ExporterError>>,
    session: russh::client::Handle<ssh::Permissive>,
}

#[async_trait]
impl StreamCloser for SshCloser {
    async fn close(self: Box<Self>) -> Result<(), ExporterError> {
        let result = match self.pump.await {
            Ok(res) => res,
            Err(e) => Err(ExporterError::Io(io::Error::other(e))),
        };
        let _ = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        result
    }
}
