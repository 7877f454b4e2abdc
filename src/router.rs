//! Operation router
//!
//! Implements the filesystem-operation contract a mount driver calls into.
//! Every call validates its preconditions, applies the instance's file
//! management policy and dispatches to the backend. Failures leave this
//! module as a bare [`DriverStatus`]; the error text is logged here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use globset::GlobBuilder;
use tracing::{debug, info, trace, warn};

use crate::backend::{
    entry_name, AccessIntent, AttributeChanges, Backend, Disposition, EntryTimes, FreeSpace,
    MetadataEntity, OpenHandle, OpenRequest, ShareMode,
};
use crate::config::InstanceConfig;
use crate::error::{DriverStatus, SkymountError};
use crate::instance::health::InstanceHealth;
use crate::path::PathTranslator;
use crate::policy::FileManagementPolicy;

/// Result type at the driver boundary
pub type RouterResult<T> = std::result::Result<T, DriverStatus>;

/// State of one open-file context (Closed -> Open -> Closed)
#[derive(Debug, Default)]
pub struct FileContext {
    handle: Option<OpenHandle>,
    /// Set when `create` resolved to a directory; no handle is bound then
    pub is_directory: bool,
}

impl FileContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn handle_mut(&mut self) -> RouterResult<&mut OpenHandle> {
        self.handle.as_mut().ok_or(DriverStatus::InvalidHandle)
    }
}

/// Arguments of a `create` call
#[derive(Debug, Clone, Copy)]
pub struct CreateRequest {
    pub access: AccessIntent,
    pub share: ShareMode,
    pub disposition: Disposition,
    /// Applied to newly created entries only
    pub attributes: AttributeChanges,
    /// The caller expects a directory
    pub directory: bool,
}

impl CreateRequest {
    pub fn open(access: AccessIntent) -> Self {
        Self {
            access,
            share: ShareMode::default(),
            disposition: Disposition::Open,
            attributes: AttributeChanges::default(),
            directory: false,
        }
    }
}

pub struct OperationRouter {
    config: Arc<InstanceConfig>,
    backend: Arc<dyn Backend>,
    policy: Arc<dyn FileManagementPolicy>,
    health: Arc<InstanceHealth>,
}

impl OperationRouter {
    /// Build the router and bind it into its policy
    pub fn wire(
        config: Arc<InstanceConfig>,
        backend: Arc<dyn Backend>,
        policy: Arc<dyn FileManagementPolicy>,
        health: Arc<InstanceHealth>,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            config,
            backend,
            policy,
            health,
        });
        router.policy.bind(Arc::downgrade(&router));
        router
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn volume_label(&self) -> &str {
        &self.config.label
    }

    /// Log a failure, record faults in the health log and reduce to a status
    fn fail(&self, operation: &str, path: &Path, err: SkymountError) -> DriverStatus {
        let status = err.status();
        match status {
            DriverStatus::NotFound
            | DriverStatus::AlreadyExists
            | DriverStatus::NotADirectory
            | DriverStatus::AccessDenied => {
                debug!("{} {:?}: {}", operation, path, err);
            }
            _ => {
                self.health
                    .record_error(operation, &path.display().to_string(), &err);
            }
        }
        status
    }

    /// Find an existing entry, preferring the directory mapping
    async fn locate(&self, path: &Path) -> Result<(PathBuf, MetadataEntity), SkymountError> {
        let dir_path = self.policy.resolve_dir_name(path);
        let file_path = self.policy.resolve_file_name(path);

        match self.backend.stat(&dir_path).await {
            Ok(meta) if meta.is_dir() || dir_path == file_path => return Ok((dir_path, meta)),
            Err(e) if dir_path == file_path => return Err(e),
            _ => {}
        }
        let meta = self.backend.stat(&file_path).await?;
        Ok((file_path, meta))
    }

    pub async fn create(
        &self,
        path: &Path,
        request: CreateRequest,
        ctx: &mut FileContext,
    ) -> RouterResult<()> {
        trace!("create {:?} {:?}", path, request);
        let dir_path = self.policy.resolve_dir_name(path);
        let file_path = self.policy.resolve_file_name(path);

        if self.backend.is_directory(&dir_path).await {
            if request.disposition == Disposition::CreateNew {
                return Err(DriverStatus::AlreadyExists);
            }
            self.release(ctx).await;
            ctx.is_directory = true;
            return Ok(());
        }

        let exists = self.backend.exists(&file_path).await;

        if request.directory {
            if exists {
                return Err(DriverStatus::NotADirectory);
            }
            if !request.disposition.creates() {
                return Err(DriverStatus::NotFound);
            }
            if !self.policy.create_allowed().directories {
                return Err(DriverStatus::AccessDenied);
            }
            self.backend
                .create_dir(&dir_path)
                .await
                .map_err(|e| self.fail("create_dir", path, e))?;
            self.apply_initial_attributes(&dir_path, request.attributes)
                .await;
            self.release(ctx).await;
            ctx.is_directory = true;
            return Ok(());
        }

        if exists && request.disposition == Disposition::CreateNew {
            return Err(DriverStatus::AlreadyExists);
        }

        if !exists {
            if !request.disposition.creates() {
                return Err(DriverStatus::NotFound);
            }
            if !self.policy.create_allowed().files {
                return Err(DriverStatus::AccessDenied);
            }
            self.policy
                .prepare_file(&file_path)
                .await
                .map_err(|e| self.fail("create", path, e))?;
            self.backend
                .create_file(&file_path)
                .await
                .map_err(|e| self.fail("create", path, e))?;
        }

        if request.access.writes() && !self.policy.write_allowed() {
            return Err(DriverStatus::AccessDenied);
        }

        let handle = self
            .backend
            .open(
                &file_path,
                OpenRequest {
                    access: request.access,
                    truncate: exists && request.disposition.truncates(),
                },
            )
            .await
            .map_err(|e| self.fail("open", path, e))?;

        // A read-only mode must not stop the creator from writing
        if !exists {
            self.apply_initial_attributes(&file_path, request.attributes)
                .await;
        }

        self.release(ctx).await;
        ctx.handle = Some(handle);
        ctx.is_directory = false;
        Ok(())
    }

    async fn apply_initial_attributes(&self, backend_path: &Path, attributes: AttributeChanges) {
        if attributes.is_empty() {
            return;
        }
        if let Err(e) = self.backend.set_attributes(backend_path, attributes).await {
            warn!("Failed to apply attributes to {:?}: {}", backend_path, e);
        }
    }

    /// Close whatever handle `ctx` holds
    async fn release(&self, ctx: &mut FileContext) {
        if let Some(handle) = ctx.handle.take() {
            let path = handle.path.clone();
            if let Err(e) = self.backend.close_handle(handle).await {
                self.fail("close", &path, e);
            }
        }
    }

    pub async fn read(
        &self,
        ctx: &mut FileContext,
        len: usize,
        offset: u64,
    ) -> RouterResult<Bytes> {
        let handle = ctx.handle_mut()?;
        let path = handle.path.clone();
        self.backend
            .io_read(handle, len, offset)
            .await
            .map_err(|e| self.fail("read", &path, e))
    }

    pub async fn write(
        &self,
        ctx: &mut FileContext,
        data: &[u8],
        offset: u64,
    ) -> RouterResult<u64> {
        let handle = ctx.handle_mut()?;
        if !self.policy.write_allowed() {
            return Err(DriverStatus::AccessDenied);
        }
        let path = handle.path.clone();
        self.backend
            .io_write(handle, data, offset)
            .await
            .map_err(|e| self.fail("write", &path, e))
    }

    pub async fn flush(&self, ctx: &mut FileContext) -> RouterResult<()> {
        if ctx.is_directory {
            return Ok(());
        }
        let handle = ctx.handle_mut()?;
        let path = handle.path.clone();
        self.backend
            .flush_handle(handle)
            .await
            .map_err(|e| self.fail("flush", &path, e))
    }

    pub async fn set_end_of_file(&self, ctx: &mut FileContext, len: u64) -> RouterResult<()> {
        let handle = ctx.handle_mut()?;
        let path = handle.path.clone();
        self.backend
            .set_handle_length(handle, len)
            .await
            .map_err(|e| self.fail("set_end_of_file", &path, e))
    }

    /// Close and unbind the context's handle. Safe to call repeatedly.
    pub async fn cleanup(&self, ctx: &mut FileContext) -> RouterResult<()> {
        ctx.is_directory = false;
        let Some(handle) = ctx.handle.take() else {
            return Ok(());
        };
        let path = handle.path.clone();
        self.backend
            .close_handle(handle)
            .await
            .map_err(|e| self.fail("cleanup", &path, e))
    }

    pub async fn get_info(&self, path: &Path) -> RouterResult<MetadataEntity> {
        let (_, meta) = self
            .locate(path)
            .await
            .map_err(|e| self.fail("get_info", path, e))?;
        Ok(meta.with_name(entry_name(&PathTranslator::normalize(path))))
    }

    pub async fn list(&self, path: &Path) -> RouterResult<Vec<MetadataEntity>> {
        let (_, meta) = self
            .locate(path)
            .await
            .map_err(|e| self.fail("list", path, e))?;
        if !meta.is_dir() {
            return Err(DriverStatus::NotADirectory);
        }
        self.policy
            .list_entries(path)
            .await
            .map_err(|e| self.fail("list", path, e))
    }

    /// Listing filtered by a glob over entry names
    pub async fn find_with_pattern(
        &self,
        path: &Path,
        pattern: &str,
    ) -> RouterResult<Vec<MetadataEntity>> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| {
                debug!("find_with_pattern: invalid pattern {:?}: {}", pattern, e);
                DriverStatus::Error
            })?
            .compile_matcher();

        let entries = self.list(path).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| matcher.is_match(&entry.name))
            .collect())
    }

    pub async fn move_entry(
        &self,
        path: &Path,
        new_path: &Path,
        replace: bool,
    ) -> RouterResult<()> {
        let (source, meta) = self
            .locate(path)
            .await
            .map_err(|e| self.fail("move", path, e))?;

        if !self.policy.move_allowed().for_kind(meta.is_dir()) {
            return Err(DriverStatus::AccessDenied);
        }

        let target = if meta.is_dir() {
            self.policy.resolve_dir_name(new_path)
        } else {
            self.policy.resolve_file_name(new_path)
        };
        if target == source {
            return Ok(());
        }

        match self.backend.stat(&target).await {
            Ok(_) if !replace => return Err(DriverStatus::AlreadyExists),
            Ok(existing) if existing.is_dir() => return Err(DriverStatus::AccessDenied),
            Ok(_) => {
                if !self.backend.delete_recursive(&target).await {
                    return Err(self.fail(
                        "move",
                        new_path,
                        SkymountError::Other("failed to remove replaced target".into()),
                    ));
                }
            }
            Err(_) => {}
        }

        if !meta.is_dir() {
            self.policy
                .prepare_file(&target)
                .await
                .map_err(|e| self.fail("move", new_path, e))?;
        }

        self.backend
            .rename(&source, &target)
            .await
            .map_err(|e| self.fail("move", path, e))
    }

    pub async fn delete(&self, path: &Path) -> RouterResult<()> {
        let (resolved, meta) = self
            .locate(path)
            .await
            .map_err(|e| self.fail("delete", path, e))?;

        if !self.policy.delete_allowed().for_kind(meta.is_dir()) {
            return Err(DriverStatus::AccessDenied);
        }
        if PathTranslator::normalize(path) == Path::new("/") {
            return Err(DriverStatus::AccessDenied);
        }

        if self.backend.delete_recursive(&resolved).await {
            Ok(())
        } else {
            Err(self.fail(
                "delete",
                path,
                SkymountError::Other("recursive delete left entries behind".into()),
            ))
        }
    }

    pub async fn set_size(&self, path: &Path, size: u64) -> RouterResult<()> {
        if !self.policy.write_allowed() {
            return Err(DriverStatus::AccessDenied);
        }
        let file_path = self.policy.resolve_file_name(path);
        self.backend
            .set_size(&file_path, size)
            .await
            .map_err(|e| self.fail("set_size", path, e))
    }

    pub async fn set_times(&self, path: &Path, times: EntryTimes) -> RouterResult<()> {
        let (resolved, _) = self
            .locate(path)
            .await
            .map_err(|e| self.fail("set_times", path, e))?;
        self.backend
            .set_times(&resolved, times)
            .await
            .map_err(|e| self.fail("set_times", path, e))
    }

    pub async fn set_attributes(&self, path: &Path, changes: AttributeChanges) -> RouterResult<()> {
        let (resolved, _) = self
            .locate(path)
            .await
            .map_err(|e| self.fail("set_attributes", path, e))?;
        self.backend
            .set_attributes(&resolved, changes)
            .await
            .map_err(|e| self.fail("set_attributes", path, e))
    }

    pub async fn free_space(&self) -> RouterResult<FreeSpace> {
        self.backend
            .free_space()
            .await
            .map_err(|e| self.fail("free_space", Path::new("/"), e))
    }

    /// No ACL model; always fails
    pub fn get_security(&self, path: &Path) -> RouterResult<()> {
        trace!("get_security {:?}: unsupported", path);
        Err(DriverStatus::Error)
    }

    pub fn lock(&self, path: &Path, offset: u64, len: u64) -> RouterResult<()> {
        trace!("lock {:?} [{}; {}]", path, offset, len);
        Ok(())
    }

    pub fn unlock(&self, path: &Path, offset: u64, len: u64) -> RouterResult<()> {
        trace!("unlock {:?} [{}; {}]", path, offset, len);
        Ok(())
    }

    pub fn mounted(&self, mount_point: &Path) {
        info!(
            "Volume '{}' mounted at {:?}",
            self.config.label, mount_point
        );
    }

    pub fn unmounted(&self) {
        info!("Volume '{}' unmounted", self.config.label);
    }
}
