//! Local filesystem passthrough backend

use std::ffi::CString;
use std::fs::FileTimes;
use std::io::SeekFrom;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{
    entry_name, AttributeChanges, Backend, BackendKind, EntryTimes, FreeSpace, HandleIo,
    MetadataEntity, OpenHandle, OpenRequest,
};
use crate::error::{Result, SkymountError};
use crate::path::PathTranslator;

/// Backend that delegates to a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalBackend {
    translator: PathTranslator,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, which must be an existing directory
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = std::fs::metadata(&root).map_err(|e| SkymountError::io(&root, e))?;
        if !meta.is_dir() {
            return Err(SkymountError::NotADirectory(root.display().to_string()));
        }
        Ok(Self {
            translator: PathTranslator::new(root),
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.translator.translate(path)
    }
}

fn entity_from_metadata(name: String, meta: &std::fs::Metadata) -> MetadataEntity {
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let accessed = meta.accessed().unwrap_or(modified);
    let created = meta.created().ok();
    let mode = Some(meta.permissions().mode() & 0o7777);

    let entity = if meta.is_dir() {
        MetadataEntity::directory(name, modified)
    } else {
        MetadataEntity::file(name, meta.len(), modified)
    };
    entity.with_mode(mode).with_times(accessed, created)
}

/// Read until `len` bytes are collected or EOF is reached
async fn read_full(file: &mut File, len: usize) -> std::io::Result<Bytes> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

/// Remove a file or directory tree, continuing past failures
fn remove_tree(path: &Path) -> bool {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) => {
            debug!("delete: cannot stat {:?}: {}", path, e);
            return false;
        }
    };

    if !meta.is_dir() {
        return match std::fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                warn!("delete: failed to remove {:?}: {}", path, e);
                false
            }
        };
    }

    let mut ok = true;
    match std::fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries {
                match entry {
                    Ok(entry) => ok &= remove_tree(&entry.path()),
                    Err(e) => {
                        warn!("delete: failed to read entry in {:?}: {}", path, e);
                        ok = false;
                    }
                }
            }
        }
        Err(e) => {
            warn!("delete: failed to list {:?}: {}", path, e);
            ok = false;
        }
    }

    if let Err(e) = std::fs::remove_dir(path) {
        warn!("delete: failed to remove directory {:?}: {}", path, e);
        ok = false;
    }
    ok
}

fn statvfs(path: &Path) -> std::io::Result<FreeSpace> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a valid out pointer
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let block = stat.f_frsize as u64;
    Ok(FreeSpace {
        total: (stat.f_blocks as u64).saturating_mul(block),
        free: (stat.f_bavail as u64).saturating_mul(block),
    })
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SkymountError::Other(format!("blocking task failed: {}", e)))?
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(self.resolve(path)).await.is_ok()
    }

    async fn stat(&self, path: &Path) -> Result<MetadataEntity> {
        let meta = fs::metadata(self.resolve(path))
            .await
            .map_err(|e| SkymountError::io(path, e))?;
        Ok(entity_from_metadata(entry_name(path), &meta))
    }

    async fn list_entries(&self, path: &Path) -> Result<Vec<MetadataEntity>> {
        let full = self.resolve(path);
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| SkymountError::io(path, e))?;
        if !meta.is_dir() {
            return Err(SkymountError::NotADirectory(path.display().to_string()));
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full)
            .await
            .map_err(|e| SkymountError::io(path, e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| SkymountError::io(path, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            match fs::metadata(entry.path()).await {
                Ok(meta) => entries.push(entity_from_metadata(name, &meta)),
                // Dangling symlinks and entries removed mid-listing
                Err(e) => debug!("list: skipping {:?}: {}", entry.path(), e),
            }
        }

        Ok(entries)
    }

    async fn read_at(&self, path: &Path, len: usize, offset: u64) -> Result<Bytes> {
        let mut file = File::open(self.resolve(path))
            .await
            .map_err(|e| SkymountError::io(path, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(read_full(&mut file, len).await?)
    }

    async fn write_at(&self, path: &Path, data: &[u8], offset: u64) -> Result<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.resolve(path))
            .await
            .map_err(|e| SkymountError::io(path, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u64)
    }

    async fn create_file(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.resolve(path))
            .await
            .map_err(|e| SkymountError::io(path, e))?;
        drop(file);
        Ok(())
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir(self.resolve(path))
            .await
            .map_err(|e| SkymountError::io(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
            .await
            .map_err(|e| SkymountError::io(from, e))
    }

    async fn delete_recursive(&self, path: &Path) -> bool {
        let full = self.resolve(path);
        if full == self.translator.root() {
            warn!("delete: refusing to remove the backend root");
            return false;
        }
        tokio::task::spawn_blocking(move || remove_tree(&full))
            .await
            .unwrap_or(false)
    }

    async fn set_times(&self, path: &Path, times: EntryTimes) -> Result<()> {
        let mut file_times = FileTimes::new();
        let mut any = false;
        if let Some(accessed) = times.accessed {
            file_times = file_times.set_accessed(accessed);
            any = true;
        }
        if let Some(modified) = times.modified {
            file_times = file_times.set_modified(modified);
            any = true;
        }
        if times.created.is_some() {
            debug!("set_times: creation time is not settable here, ignoring");
        }
        if !any {
            return Ok(());
        }

        let full = self.resolve(path);
        let virtual_path = path.to_path_buf();
        blocking(move || {
            let file =
                std::fs::File::open(&full).map_err(|e| SkymountError::io(&virtual_path, e))?;
            file.set_times(file_times)
                .map_err(|e| SkymountError::io(&virtual_path, e))
        })
        .await
    }

    async fn set_size(&self, path: &Path, size: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.resolve(path))
            .await
            .map_err(|e| SkymountError::io(path, e))?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn set_attributes(&self, path: &Path, changes: AttributeChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let full = self.resolve(path);

        if let Some(mode) = changes.mode {
            fs::set_permissions(&full, std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(|e| SkymountError::io(path, e))?;
        }

        if let Some(readonly) = changes.readonly {
            let mut perms = fs::metadata(&full)
                .await
                .map_err(|e| SkymountError::io(path, e))?
                .permissions();
            let mode = perms.mode();
            perms.set_mode(if readonly { mode & !0o222 } else { mode | 0o200 });
            fs::set_permissions(&full, perms)
                .await
                .map_err(|e| SkymountError::io(path, e))?;
        }

        Ok(())
    }

    async fn free_space(&self) -> Result<FreeSpace> {
        let root = self.translator.root().to_path_buf();
        blocking(move || statvfs(&root).map_err(SkymountError::Io)).await
    }

    async fn open(&self, path: &Path, request: OpenRequest) -> Result<OpenHandle> {
        let file = OpenOptions::new()
            .read(request.access.reads())
            .write(request.access.writes())
            .truncate(request.truncate && request.access.writes())
            .open(self.resolve(path))
            .await
            .map_err(|e| SkymountError::io(path, e))?;

        Ok(OpenHandle::new(
            BackendKind::Local,
            path,
            Box::new(LocalHandle { file }),
        ))
    }
}

struct LocalHandle {
    file: File,
}

#[async_trait]
impl HandleIo for LocalHandle {
    async fn read_at(&mut self, len: usize, offset: u64) -> Result<Bytes> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        Ok(read_full(&mut self.file, len).await?)
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
        self.file.set_len(len).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}
