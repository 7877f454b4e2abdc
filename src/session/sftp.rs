//! SFTP over SSH session
//!
//! Uses russh for the SSH transport and russh-sftp for the file-transfer
//! subsystem. Commands (`df` for free space) run on separate exec channels
//! of the same connection.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession as SftpClient;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use super::auth::Credentials;
use super::{CommandOutput, RemoteAttributes, RemoteOpenFlags, RemoteSession, SetStat};
use crate::backend::HandleIo;
use crate::error::{Result, SkymountError};

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection parameters for an SFTP session
#[derive(Debug, Clone)]
pub struct SftpTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub connect_timeout: Duration,
}

/// Client handler for russh
struct ClientHandler {
    host: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // No known_hosts store; the fingerprint is logged so it can be audited.
        info!(
            "Accepting host key for {}: {}",
            self.host,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}

/// An authenticated SSH connection with an open SFTP subsystem
pub struct SftpSession {
    handle: Handle<ClientHandler>,
    sftp: Arc<SftpClient>,
}

fn session_err(context: &str, err: impl std::fmt::Display) -> SkymountError {
    SkymountError::Session(format!("{}: {}", context, err))
}

fn map_sftp_err(path: &str, err: russh_sftp::client::error::Error) -> SkymountError {
    use russh_sftp::client::error::Error;

    match &err {
        Error::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => SkymountError::NotFound(path.to_string()),
            StatusCode::PermissionDenied => SkymountError::AccessDenied(path.to_string()),
            StatusCode::OpUnsupported => SkymountError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                status.error_message.clone(),
            )),
            _ => session_err(path, &err),
        },
        _ => session_err(path, &err),
    }
}

fn to_remote_attributes(attrs: &FileAttributes) -> RemoteAttributes {
    RemoteAttributes {
        is_dir: attrs.is_dir(),
        size: attrs.size.unwrap_or(0),
        permissions: attrs.permissions,
        atime: attrs.atime,
        mtime: attrs.mtime,
    }
}

impl SftpSession {
    /// Connect, authenticate and start the SFTP subsystem
    pub async fn connect(target: &SftpTarget) -> Result<Self> {
        let config = Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..<_>::default()
        };

        let handler = ClientHandler {
            host: target.host.clone(),
        };
        let addr = (target.host.as_str(), target.port);

        let mut handle = tokio::time::timeout(
            target.connect_timeout,
            client::connect(Arc::new(config), addr, handler),
        )
        .await
        .map_err(|_| {
            SkymountError::Session(format!(
                "connection to {}:{} timed out",
                target.host, target.port
            ))
        })?
        .map_err(|e| session_err("connect", e))?;

        debug!(
            "Connected to {}:{}, authenticating as {}",
            target.host, target.port, target.username
        );

        let auth = match &target.credentials {
            Credentials::Password(password) => handle
                .authenticate_password(&target.username, password)
                .await
                .map_err(|e| session_err("password auth", e))?,
            Credentials::KeyFile(path) => {
                let key = russh::keys::load_secret_key(path, None)
                    .map_err(|e| session_err("load private key", e))?;
                authenticate_key(&mut handle, &target.username, key).await?
            }
            Credentials::KeyMaterial(pem) => {
                let key = russh::keys::decode_secret_key(pem, None)
                    .map_err(|e| session_err("decode private key", e))?;
                authenticate_key(&mut handle, &target.username, key).await?
            }
        };

        if !auth.success() {
            return Err(SkymountError::AccessDenied(format!(
                "authentication rejected for {}@{}",
                target.username, target.host
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| session_err("open channel", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| session_err("request sftp subsystem", e))?;

        let sftp = SftpClient::new(channel.into_stream())
            .await
            .map_err(|e| session_err("start sftp", e))?;

        info!(
            "SFTP session established with {}@{}:{}",
            target.username, target.host, target.port
        );

        Ok(Self {
            handle,
            sftp: Arc::new(sftp),
        })
    }
}

async fn authenticate_key(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    key: PrivateKey,
) -> Result<AuthResult> {
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();
    handle
        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(|e| session_err("public key auth", e))
}

#[async_trait]
impl RemoteSession for SftpSession {
    async fn stat(&self, path: &str) -> Result<RemoteAttributes> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| map_sftp_err(path, e))?;
        Ok(to_remote_attributes(&attrs))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<(String, RemoteAttributes)>> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_err(path, e))?;

        Ok(entries
            .map(|entry| (entry.file_name(), to_remote_attributes(&entry.metadata())))
            .collect())
    }

    async fn open(&self, path: &str, flags: RemoteOpenFlags) -> Result<Box<dyn HandleIo>> {
        let mut open_flags = OpenFlags::empty();
        if flags.read {
            open_flags |= OpenFlags::READ;
        }
        if flags.write {
            open_flags |= OpenFlags::WRITE;
        }
        if flags.create {
            open_flags |= OpenFlags::CREATE;
        }
        if flags.exclusive {
            open_flags |= OpenFlags::EXCLUDE;
        }
        if flags.truncate {
            open_flags |= OpenFlags::TRUNCATE;
        }

        let file = self
            .sftp
            .open_with_flags(path, open_flags)
            .await
            .map_err(|e| map_sftp_err(path, e))?;

        Ok(Box::new(SftpHandle {
            file,
            path: path.to_string(),
            sftp: self.sftp.clone(),
        }))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_sftp_err(path, e))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_err(path, e))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_err(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_err(from, e))
    }

    async fn set_stat(&self, path: &str, changes: SetStat) -> Result<()> {
        let mut attrs = FileAttributes::empty();
        attrs.size = changes.size;
        attrs.permissions = changes.permissions;
        attrs.atime = changes.atime;
        attrs.mtime = changes.mtime;

        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| map_sftp_err(path, e))
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| session_err("open exec channel", e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| session_err("exec", e))?;

        let mut stdout = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        Ok(CommandOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
        })
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close failed: {}", e);
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
            .map_err(|e| session_err("disconnect", e))
    }
}

struct SftpHandle {
    file: File,
    path: String,
    sftp: Arc<SftpClient>,
}

#[async_trait]
impl HandleIo for SftpHandle {
    async fn read_at(&mut self, len: usize, offset: u64) -> Result<Bytes> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<u64> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(data.len() as u64)
    }

    async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }

    async fn set_len(&mut self, len: u64) -> Result<()> {
        let mut attrs = FileAttributes::empty();
        attrs.size = Some(len);
        self.sftp
            .set_metadata(self.path.as_str(), attrs)
            .await
            .map_err(|e| map_sftp_err(&self.path, e))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.shutdown().await?;
        Ok(())
    }
}
