//! Remote session backend

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{
    entry_name, AttributeChanges, Backend, BackendKind, EntryTimes, FreeSpace, MetadataEntity,
    OpenHandle, OpenRequest,
};
use crate::error::{Result, SkymountError};
use crate::path::PathTranslator;
use crate::session::{RemoteAttributes, RemoteOpenFlags, RemoteSession, SetStat};

/// Command used to query capacity; POSIX output in 1-KiB blocks
const DF_COMMAND: &str = "df -P -k";

/// Backend that delegates to a remote file-transfer session
pub struct RemoteBackend {
    session: Arc<dyn RemoteSession>,
    translator: PathTranslator,
}

impl RemoteBackend {
    pub fn new(session: Arc<dyn RemoteSession>, root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            session,
            translator: PathTranslator::new(root),
        }
    }

    fn resolve(&self, path: &Path) -> String {
        self.translator.translate_str(path)
    }
}

fn from_epoch(secs: Option<u32>) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.unwrap_or(0) as u64)
}

fn to_epoch(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

fn entity_from_attributes(name: String, attrs: &RemoteAttributes) -> MetadataEntity {
    let modified = from_epoch(attrs.mtime);
    let accessed = attrs.atime.map(|t| from_epoch(Some(t))).unwrap_or(modified);
    let mode = attrs.permissions.map(|p| p & 0o7777);

    let entity = if attrs.is_dir {
        MetadataEntity::directory(name, modified)
    } else {
        MetadataEntity::file(name, attrs.size, modified)
    };
    entity.with_mode(mode).with_times(accessed, None)
}

/// Parse `df -P -k` output into total and available bytes.
///
/// The header line is skipped, lines with fewer than six columns are
/// ignored and an unparsable number counts as zero. Values are summed over
/// every listed filesystem.
pub fn parse_df_output(output: &str) -> FreeSpace {
    let mut total_blocks: u64 = 0;
    let mut free_blocks: u64 = 0;

    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.first() == Some(&"Filesystem") || parts.len() < 6 {
            continue;
        }
        total_blocks = total_blocks.saturating_add(parts[1].parse().unwrap_or(0));
        free_blocks = free_blocks.saturating_add(parts[3].parse().unwrap_or(0));
    }

    FreeSpace {
        total: total_blocks.saturating_mul(1024),
        free: free_blocks.saturating_mul(1024),
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn metadata_is_expensive(&self) -> bool {
        true
    }

    async fn exists(&self, path: &Path) -> bool {
        self.session.exists(&self.resolve(path)).await
    }

    async fn stat(&self, path: &Path) -> Result<MetadataEntity> {
        let attrs = self.session.stat(&self.resolve(path)).await?;
        Ok(entity_from_attributes(entry_name(path), &attrs))
    }

    async fn list_entries(&self, path: &Path) -> Result<Vec<MetadataEntity>> {
        let remote = self.resolve(path);
        let entries = self.session.read_dir(&remote).await?;
        Ok(entries
            .into_iter()
            .filter(|(name, _)| name != "." && name != "..")
            .map(|(name, attrs)| entity_from_attributes(name, &attrs))
            .collect())
    }

    async fn read_at(&self, path: &Path, len: usize, offset: u64) -> Result<Bytes> {
        let mut io = self
            .session
            .open(
                &self.resolve(path),
                RemoteOpenFlags {
                    read: true,
                    ..Default::default()
                },
            )
            .await?;
        let data = io.read_at(len, offset).await;
        io.close().await?;
        data
    }

    async fn write_at(&self, path: &Path, data: &[u8], offset: u64) -> Result<u64> {
        let mut io = self
            .session
            .open(
                &self.resolve(path),
                RemoteOpenFlags {
                    write: true,
                    ..Default::default()
                },
            )
            .await?;
        let written = io.write_at(data, offset).await;
        io.close().await?;
        written
    }

    async fn create_file(&self, path: &Path) -> Result<()> {
        let remote = self.resolve(path);
        if self.session.exists(&remote).await {
            return Err(SkymountError::AlreadyExists(path.display().to_string()));
        }
        let io = self
            .session
            .open(
                &remote,
                RemoteOpenFlags {
                    write: true,
                    create: true,
                    exclusive: true,
                    ..Default::default()
                },
            )
            .await?;
        io.close().await
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let remote = self.resolve(path);
        if self.session.exists(&remote).await {
            return Err(SkymountError::AlreadyExists(path.display().to_string()));
        }
        self.session.mkdir(&remote).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let (remote_from, remote_to) = (self.resolve(from), self.resolve(to));
        self.session.rename(&remote_from, &remote_to).await?;

        if !self.session.exists(&remote_to).await {
            return Err(SkymountError::Session(format!(
                "rename {} -> {} did not take effect",
                remote_from, remote_to
            )));
        }
        Ok(())
    }

    async fn delete_recursive(&self, path: &Path) -> bool {
        let remote = self.resolve(path);
        if remote == self.translator.translate_str(Path::new("/")) {
            warn!("delete: refusing to remove the backend root");
            return false;
        }
        delete_tree(self.session.as_ref(), remote).await
    }

    async fn set_times(&self, path: &Path, times: EntryTimes) -> Result<()> {
        if times.created.is_some() {
            debug!("set_times: remote sessions cannot set creation time, ignoring");
        }
        if times.accessed.is_none() && times.modified.is_none() {
            return Ok(());
        }

        // Both fields travel together on the wire; fill the missing one.
        let remote = self.resolve(path);
        let current = self.session.stat(&remote).await?;
        let changes = SetStat {
            atime: Some(times.accessed.map(to_epoch).or(current.atime).unwrap_or(0)),
            mtime: Some(times.modified.map(to_epoch).or(current.mtime).unwrap_or(0)),
            ..Default::default()
        };
        self.session.set_stat(&remote, changes).await
    }

    async fn set_size(&self, path: &Path, size: u64) -> Result<()> {
        self.session
            .set_stat(
                &self.resolve(path),
                SetStat {
                    size: Some(size),
                    ..Default::default()
                },
            )
            .await
    }

    async fn set_attributes(&self, path: &Path, changes: AttributeChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let remote = self.resolve(path);
        let mut mode = match changes.mode {
            Some(mode) => mode & 0o7777,
            None => self.session.stat(&remote).await?.permissions.unwrap_or(0o644) & 0o7777,
        };
        match changes.readonly {
            Some(true) => mode &= !0o222,
            Some(false) => mode |= 0o200,
            None => {}
        }
        self.session
            .set_stat(
                &remote,
                SetStat {
                    permissions: Some(mode),
                    ..Default::default()
                },
            )
            .await
    }

    async fn free_space(&self) -> Result<FreeSpace> {
        let output = self.session.exec(DF_COMMAND).await?;
        if !output.success() {
            warn!(
                "'{}' exited with status {:?}; reporting no capacity",
                DF_COMMAND, output.exit_status
            );
            return Ok(FreeSpace::default());
        }
        Ok(parse_df_output(&output.stdout))
    }

    async fn open(&self, path: &Path, request: OpenRequest) -> Result<OpenHandle> {
        let io = self
            .session
            .open(
                &self.resolve(path),
                RemoteOpenFlags {
                    read: request.access.reads(),
                    write: request.access.writes(),
                    truncate: request.truncate && request.access.writes(),
                    ..Default::default()
                },
            )
            .await?;
        Ok(OpenHandle::new(BackendKind::Remote, path, io))
    }

    async fn shutdown(&self) {
        if let Err(e) = self.session.close().await {
            warn!("Failed to close remote session: {}", e);
        }
    }
}

/// Depth-first removal; failures are logged and folded into the result
fn delete_tree<'a>(
    session: &'a dyn RemoteSession,
    path: String,
) -> futures::future::BoxFuture<'a, bool> {
    Box::pin(async move {
        let attrs = match session.stat(&path).await {
            Ok(attrs) => attrs,
            Err(e) => {
                debug!("delete: cannot stat {}: {}", path, e);
                return false;
            }
        };

        if !attrs.is_dir {
            return match session.remove_file(&path).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("delete: failed to remove {}: {}", path, e);
                    false
                }
            };
        }

        let mut ok = true;
        match session.read_dir(&path).await {
            Ok(children) => {
                for (name, _) in children {
                    if name == "." || name == ".." {
                        continue;
                    }
                    let child = format!("{}/{}", path.trim_end_matches('/'), name);
                    ok &= delete_tree(session, child).await;
                }
            }
            Err(e) => {
                warn!("delete: failed to list {}: {}", path, e);
                ok = false;
            }
        }

        if let Err(e) = session.remove_dir(&path).await {
            warn!("delete: failed to remove directory {}: {}", path, e);
            ok = false;
        }
        ok
    })
}
