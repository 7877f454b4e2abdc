//! Remote file-transfer sessions
//!
//! The remote backend talks to its store through the [`RemoteSession`]
//! trait. The shipped implementation is SFTP over SSH ([`sftp`]).

pub mod auth;
#[cfg(test)]
pub mod memory;
pub mod sftp;

use async_trait::async_trait;

use crate::backend::HandleIo;
use crate::error::Result;

/// Attributes reported by the remote side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteAttributes {
    pub is_dir: bool,
    pub size: u64,
    pub permissions: Option<u32>,
    /// Seconds since the epoch
    pub atime: Option<u32>,
    /// Seconds since the epoch
    pub mtime: Option<u32>,
}

/// Flags for opening a remote file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteOpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    /// Fail if the file already exists (only meaningful with `create`)
    pub exclusive: bool,
    pub truncate: bool,
}

/// Attribute changes sent to the remote side; `None` fields are left alone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetStat {
    pub size: Option<u64>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// None when the remote side closed without reporting a status
    pub exit_status: Option<u32>,
    pub stdout: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// A persistent, authenticated connection to a remote store.
///
/// Paths are absolute, `/`-separated remote paths.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn stat(&self, path: &str) -> Result<RemoteAttributes>;

    /// Children of a directory; may include `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<(String, RemoteAttributes)>>;

    async fn exists(&self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    async fn open(&self, path: &str, flags: RemoteOpenFlags) -> Result<Box<dyn HandleIo>>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn remove_file(&self, path: &str) -> Result<()>;

    async fn remove_dir(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn set_stat(&self, path: &str, changes: SetStat) -> Result<()>;

    /// Run a shell command and collect its stdout
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    async fn close(&self) -> Result<()>;
}
