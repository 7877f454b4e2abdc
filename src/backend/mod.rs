pub mod local;
pub mod remote;

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

pub use crate::config::BackendKind;
use crate::error::{Result, SkymountError};

/// Entry kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Default file mode (rw-r--r--)
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default directory mode (rwxr-xr-x)
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Metadata for a file or directory
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntity {
    /// Last path component; empty for the root
    pub name: String,
    pub kind: EntryKind,
    /// Not every backend reports a creation time
    pub created: Option<SystemTime>,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    /// Size in bytes; always 0 for directories
    pub size: u64,
    /// POSIX permission bits (e.g., 0o644). None means use default.
    pub mode: Option<u32>,
}

impl MetadataEntity {
    pub fn file(name: impl Into<String>, size: u64, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            created: None,
            modified,
            accessed: modified,
            size,
            mode: None,
        }
    }

    pub fn directory(name: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            created: None,
            modified,
            accessed: modified,
            size: 0,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: Option<u32>) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_times(mut self, accessed: SystemTime, created: Option<SystemTime>) -> Self {
        self.accessed = accessed;
        self.created = created;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Get the mode, using defaults if not set
    pub fn mode_or_default(&self) -> u32 {
        self.mode.unwrap_or(if self.is_dir() {
            DEFAULT_DIR_MODE
        } else {
            DEFAULT_FILE_MODE
        })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }
}

/// Last component of a path as an entry name
pub fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Timestamps to apply; `None` leaves the value untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryTimes {
    pub accessed: Option<SystemTime>,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

impl EntryTimes {
    pub fn is_empty(&self) -> bool {
        self.accessed.is_none() && self.modified.is_none() && self.created.is_none()
    }
}

/// Attribute changes; `None` leaves the value untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeChanges {
    pub readonly: Option<bool>,
    pub mode: Option<u32>,
}

impl AttributeChanges {
    pub fn is_empty(&self) -> bool {
        self.readonly.is_none() && self.mode.is_none()
    }
}

/// Requested access for an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    Read,
    Write,
    ReadWrite,
}

impl AccessIntent {
    pub fn reads(self) -> bool {
        matches!(self, AccessIntent::Read | AccessIntent::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessIntent::Write | AccessIntent::ReadWrite)
    }
}

/// Sharing requested by the caller. Recorded, not enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareMode {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

/// What to do when the target does or does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Open an existing entry
    Open,
    /// Open, creating the entry if absent
    OpenOrCreate,
    /// Create; fail if the entry exists
    CreateNew,
    /// Create or truncate
    Create,
    /// Truncate an existing entry
    Truncate,
}

impl Disposition {
    /// Whether an absent target should be created
    pub fn creates(self) -> bool {
        matches!(
            self,
            Disposition::OpenOrCreate | Disposition::CreateNew | Disposition::Create
        )
    }

    pub fn truncates(self) -> bool {
        matches!(self, Disposition::Create | Disposition::Truncate)
    }
}

/// Parameters for opening a file handle on a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    pub access: AccessIntent,
    pub truncate: bool,
}

/// Volume capacity in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeSpace {
    pub total: u64,
    pub free: u64,
}

/// Byte IO on an open file.
///
/// Every read and write seeks to the given offset first.
#[async_trait]
pub trait HandleIo: Send {
    async fn read_at(&mut self, len: usize, offset: u64) -> Result<Bytes>;

    async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<u64>;

    async fn flush(&mut self) -> Result<()>;

    async fn set_len(&mut self, len: u64) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// A handle bound to one open-file context, tagged with the kind of
/// backend that produced it.
pub struct OpenHandle {
    pub kind: BackendKind,
    /// Virtual path the handle was opened on
    pub path: PathBuf,
    io: Box<dyn HandleIo>,
}

impl OpenHandle {
    pub fn new(kind: BackendKind, path: impl Into<PathBuf>, io: Box<dyn HandleIo>) -> Self {
        Self {
            kind,
            path: path.into(),
            io,
        }
    }

    /// Check the handle belongs to a backend of `kind`
    pub fn ensure_kind(&self, kind: BackendKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(SkymountError::InvalidHandle)
        }
    }

    pub fn io(&mut self) -> &mut dyn HandleIo {
        self.io.as_mut()
    }

    pub fn into_io(self) -> Box<dyn HandleIo> {
        self.io
    }
}

impl std::fmt::Debug for OpenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenHandle")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Core trait for storage backends
///
/// Backends are path-based: every operation receives a virtual path
/// (already shaped by the file management policy) and maps it under the
/// backend's root itself.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether metadata queries cost a network round-trip
    fn metadata_is_expensive(&self) -> bool {
        false
    }

    /// Never fails; any error counts as absent
    async fn exists(&self, path: &Path) -> bool;

    async fn stat(&self, path: &Path) -> Result<MetadataEntity>;

    async fn is_directory(&self, path: &Path) -> bool {
        matches!(self.stat(path).await, Ok(meta) if meta.is_dir())
    }

    /// Children of a directory, without `.` and `..`
    async fn list_entries(&self, path: &Path) -> Result<Vec<MetadataEntity>>;

    /// Read up to `len` bytes; fewer at end of file
    async fn read_at(&self, path: &Path, len: usize, offset: u64) -> Result<Bytes>;

    /// Write and flush; returns the number of bytes written
    async fn write_at(&self, path: &Path, data: &[u8], offset: u64) -> Result<u64>;

    /// Fails with `AlreadyExists` if the target exists
    async fn create_file(&self, path: &Path) -> Result<()>;

    /// Fails with `AlreadyExists` if the target exists
    async fn create_dir(&self, path: &Path) -> Result<()>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Remove a file or directory tree.
    ///
    /// Nested failures are not propagated; the result reports whether
    /// everything went away.
    async fn delete_recursive(&self, path: &Path) -> bool;

    async fn set_times(&self, path: &Path, times: EntryTimes) -> Result<()>;

    async fn set_size(&self, path: &Path, size: u64) -> Result<()>;

    async fn set_attributes(&self, path: &Path, changes: AttributeChanges) -> Result<()>;

    async fn free_space(&self) -> Result<FreeSpace>;

    async fn open(&self, path: &Path, request: OpenRequest) -> Result<OpenHandle>;

    async fn io_read(&self, handle: &mut OpenHandle, len: usize, offset: u64) -> Result<Bytes> {
        handle.ensure_kind(self.kind())?;
        handle.io().read_at(len, offset).await
    }

    async fn io_write(&self, handle: &mut OpenHandle, data: &[u8], offset: u64) -> Result<u64> {
        handle.ensure_kind(self.kind())?;
        handle.io().write_at(data, offset).await
    }

    async fn flush_handle(&self, handle: &mut OpenHandle) -> Result<()> {
        handle.ensure_kind(self.kind())?;
        handle.io().flush().await
    }

    async fn set_handle_length(&self, handle: &mut OpenHandle, len: u64) -> Result<()> {
        handle.ensure_kind(self.kind())?;
        handle.io().set_len(len).await
    }

    async fn close_handle(&self, handle: OpenHandle) -> Result<()> {
        handle.ensure_kind(self.kind())?;
        handle.into_io().close().await
    }

    /// Release sessions and stop background work
    async fn shutdown(&self) {}
}
