pub mod inode;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::backend::{
    AccessIntent, AttributeChanges, Disposition, EntryKind, EntryTimes, MetadataEntity,
};
use crate::config::MountOptions;
use crate::error::{DriverStatus, Result, SkymountError};
use crate::mount::{ensure_mount_point, ActiveMount, MountDriver};
use crate::router::{CreateRequest, FileContext, OperationRouter};

use self::inode::{InodeTable, ROOT_INODE};

/// Default TTL for attribute caching (1 second)
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

/// Block size for reporting
const BLOCK_SIZE: u32 = 4096;

const RENAME_NOREPLACE: u32 = 1;

fn to_fuse_file_type(kind: EntryKind) -> FuseFileType {
    match kind {
        EntryKind::File => FuseFileType::RegularFile,
        EntryKind::Directory => FuseFileType::Directory,
    }
}

/// Convert a metadata entity to FileAttr
fn metadata_to_attr(ino: u64, meta: &MetadataEntity, uid: u32, gid: u32) -> FileAttr {
    let kind = to_fuse_file_type(meta.kind);
    let perm = (meta.mode_or_default() & 0o7777) as u16;
    let nlink = if meta.is_dir() { 2 } else { 1 };
    let blocks = meta.size.div_ceil(BLOCK_SIZE as u64);

    FileAttr {
        ino,
        size: meta.size,
        blocks,
        atime: meta.accessed,
        mtime: meta.modified,
        ctime: meta.modified,
        crtime: meta.created.unwrap_or(meta.modified),
        kind,
        perm,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Access intent carried by open(2) flags
fn access_from_flags(flags: i32) -> AccessIntent {
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => AccessIntent::Write,
        libc::O_RDWR => AccessIntent::ReadWrite,
        _ => AccessIntent::Read,
    }
}

/// Disposition for create(2)
fn create_disposition(flags: i32) -> Disposition {
    if flags & libc::O_EXCL != 0 {
        Disposition::CreateNew
    } else if flags & libc::O_TRUNC != 0 {
        Disposition::Create
    } else {
        Disposition::OpenOrCreate
    }
}

fn time_or_now(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Mount driver backed by the kernel FUSE module
pub struct FuseDriver {
    handle: Handle,
    options: MountOptions,
}

impl FuseDriver {
    pub fn new(handle: Handle, options: MountOptions) -> Self {
        Self { handle, options }
    }

    fn mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.options.fs_name.clone()),
            MountOption::DefaultPermissions,
        ];
        if self.options.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.options.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}

impl MountDriver for FuseDriver {
    fn mount(&self, router: Arc<OperationRouter>, mount_point: &Path) -> Result<ActiveMount> {
        info!("Mounting '{}' at {:?}", router.volume_label(), mount_point);
        ensure_mount_point(mount_point)?;

        let adapter = FuseAdapter::new(router, self.handle.clone(), mount_point.to_path_buf());
        let session = fuser::spawn_mount2(adapter, mount_point, &self.mount_options())
            .map_err(|e| SkymountError::io(mount_point, e))?;

        info!("Successfully mounted at {:?}", mount_point);
        Ok(ActiveMount::new(mount_point.to_path_buf(), session))
    }
}

/// FUSE filesystem implementation that delegates to an operation router
pub struct FuseAdapter {
    router: Arc<OperationRouter>,
    /// Runtime the backends live on; callbacks block on it
    handle: Handle,
    inodes: InodeTable,
    /// Open contexts keyed by file handle
    contexts: HashMap<u64, FileContext>,
    next_fh: u64,
    mount_point: PathBuf,
    uid: u32,
    gid: u32,
}

impl FuseAdapter {
    pub fn new(router: Arc<OperationRouter>, handle: Handle, mount_point: PathBuf) -> Self {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        Self {
            router,
            handle,
            inodes: InodeTable::new(),
            contexts: HashMap::new(),
            next_fh: 1,
            mount_point,
            uid,
            gid,
        }
    }

    /// Get path for inode, returning ENOENT if not found
    fn inode_to_path(&self, ino: u64) -> std::result::Result<PathBuf, i32> {
        self.inodes.get_path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> std::result::Result<PathBuf, i32> {
        Ok(self.inode_to_path(parent)?.join(name))
    }

    fn attr_for(&mut self, path: &Path, meta: &MetadataEntity) -> FileAttr {
        let ino = self.inodes.get_or_create_inode(path);
        metadata_to_attr(ino, meta, self.uid, self.gid)
    }

    fn register(&mut self, ctx: FileContext) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.contexts.insert(fh, ctx);
        fh
    }

    /// Open a context for `path` and hand back its file handle
    fn open_context(
        &mut self,
        path: &Path,
        request: CreateRequest,
    ) -> std::result::Result<u64, DriverStatus> {
        let mut ctx = FileContext::new();
        self.handle
            .block_on(self.router.create(path, request, &mut ctx))?;
        Ok(self.register(ctx))
    }

    fn close_context(&mut self, fh: u64, reply: ReplyEmpty) {
        let Some(mut ctx) = self.contexts.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match self.handle.block_on(self.router.cleanup(&mut ctx)) {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.to_errno()),
        }
    }
}

impl Filesystem for FuseAdapter {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), c_int> {
        self.router.mounted(&self.mount_point);
        Ok(())
    }

    fn destroy(&mut self) {
        let router = &self.router;
        for (fh, mut ctx) in self.contexts.drain() {
            if let Err(status) = self.handle.block_on(router.cleanup(&mut ctx)) {
                warn!("Failed to close fh {} on unmount: {:?}", fh, status);
            }
        }
        router.unmounted();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("lookup: {:?}", path);

        match self.handle.block_on(self.router.get_info(&path)) {
            Ok(meta) => {
                let attr = self.attr_for(&path, &meta);
                reply.entry(&ATTR_TTL, &attr, GENERATION);
            }
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("getattr: {:?} (ino={})", path, ino);

        match self.handle.block_on(self.router.get_info(&path)) {
            Ok(meta) => reply.attr(&ATTR_TTL, &metadata_to_attr(ino, &meta, self.uid, self.gid)),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("setattr: {:?} mode={:?} size={:?}", path, mode, size);

        let times = EntryTimes {
            accessed: atime.map(time_or_now),
            modified: mtime.map(time_or_now),
            created: crtime,
        };
        let router = &self.router;
        let ctx = fh
            .and_then(|fh| self.contexts.get_mut(&fh))
            .filter(|ctx| ctx.is_open());

        let result = self.handle.block_on(async {
            if let Some(mode) = mode {
                let changes = AttributeChanges {
                    mode: Some(mode & 0o7777),
                    readonly: None,
                };
                router.set_attributes(&path, changes).await?;
            }
            if let Some(size) = size {
                match ctx {
                    Some(ctx) => router.set_end_of_file(ctx, size).await?,
                    None => router.set_size(&path, size).await?,
                }
            }
            if !times.is_empty() {
                router.set_times(&path, times).await?;
            }
            router.get_info(&path).await
        });

        match result {
            Ok(meta) => reply.attr(&ATTR_TTL, &metadata_to_attr(ino, &meta, self.uid, self.gid)),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read: fh={} offset={} size={}", fh, offset, size);
        let Some(ctx) = self.contexts.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        match self
            .handle
            .block_on(self.router.read(ctx, size as usize, offset as u64))
        {
            Ok(data) => reply.data(&data),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write: fh={} offset={} size={}", fh, offset, data.len());
        let Some(ctx) = self.contexts.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        match self
            .handle
            .block_on(self.router.write(ctx, data, offset as u64))
        {
            Ok(written) => reply.written(written as u32),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        // Apply umask to get effective mode (permission bits only)
        let effective_mode = (mode & !umask) & 0o7777;
        debug!("create: {:?} mode={:o} flags={:#x}", path, effective_mode, flags);

        let request = CreateRequest {
            disposition: create_disposition(flags),
            attributes: AttributeChanges {
                mode: Some(effective_mode),
                readonly: None,
            },
            ..CreateRequest::open(access_from_flags(flags))
        };
        let fh = match self.open_context(&path, request) {
            Ok(fh) => fh,
            Err(status) => {
                reply.error(status.to_errno());
                return;
            }
        };

        match self.handle.block_on(self.router.get_info(&path)) {
            Ok(meta) => {
                let attr = self.attr_for(&path, &meta);
                reply.created(&ATTR_TTL, &attr, GENERATION, fh, 0);
            }
            Err(status) => {
                if let Some(mut ctx) = self.contexts.remove(&fh) {
                    if let Err(cleanup) = self.handle.block_on(self.router.cleanup(&mut ctx)) {
                        warn!("create: cleanup after failure returned {:?}", cleanup);
                    }
                }
                reply.error(status.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let effective_mode = (mode & !umask) & 0o7777;
        debug!("mkdir: {:?} mode={:o}", path, effective_mode);

        let request = CreateRequest {
            disposition: Disposition::CreateNew,
            attributes: AttributeChanges {
                mode: Some(effective_mode),
                readonly: None,
            },
            directory: true,
            ..CreateRequest::open(AccessIntent::Read)
        };
        let router = &self.router;
        let result = self.handle.block_on(async {
            let mut ctx = FileContext::new();
            router.create(&path, request, &mut ctx).await?;
            router.cleanup(&mut ctx).await?;
            router.get_info(&path).await
        });

        match result {
            Ok(meta) => {
                let attr = self.attr_for(&path, &meta);
                reply.entry(&ATTR_TTL, &attr, GENERATION);
            }
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        debug!("unlink: {:?}", path);

        match self.handle.block_on(self.router.delete(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        // Deletion is recursive either way
        self.unlink(req, parent, name, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags & !RENAME_NOREPLACE != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let (old_path, new_path) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };
        let replace = flags & RENAME_NOREPLACE == 0;
        debug!("rename: {:?} -> {:?} (replace={})", old_path, new_path, replace);

        match self
            .handle
            .block_on(self.router.move_entry(&old_path, &new_path, replace))
        {
            Ok(()) => {
                self.inodes.rename_path(&old_path, &new_path);
                reply.ok();
            }
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("open: {:?} flags={:#x}", path, flags);

        let disposition = if flags & libc::O_TRUNC != 0 {
            Disposition::Truncate
        } else {
            Disposition::Open
        };
        let request = CreateRequest {
            disposition,
            ..CreateRequest::open(access_from_flags(flags))
        };
        match self.open_context(&path, request) {
            Ok(fh) => reply.opened(fh, 0),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release: fh={}", fh);
        self.close_context(fh, reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let request = CreateRequest {
            directory: true,
            ..CreateRequest::open(AccessIntent::Read)
        };
        match self.open_context(&path, request) {
            Ok(fh) => reply.opened(fh, 0),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.close_context(fh, reply);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("readdir: {:?} offset={}", path, offset);

        let entries = match self.handle.block_on(self.router.list(&path)) {
            Ok(entries) => entries,
            Err(status) => {
                reply.error(status.to_errno());
                return;
            }
        };

        // Add . and ..
        let mut idx = 0i64;

        if offset <= idx && reply.add(ino, idx + 1, FuseFileType::Directory, ".") {
            reply.ok();
            return;
        }
        idx += 1;

        if offset <= idx {
            let parent_ino = if ino == ROOT_INODE {
                ROOT_INODE
            } else {
                path.parent()
                    .and_then(|p| self.inodes.get_inode(p))
                    .unwrap_or(ROOT_INODE)
            };
            if reply.add(parent_ino, idx + 1, FuseFileType::Directory, "..") {
                reply.ok();
                return;
            }
        }
        idx += 1;

        for entry in entries {
            if offset <= idx {
                let entry_ino = self.inodes.get_or_create_inode(&path.join(&entry.name));
                if reply.add(entry_ino, idx + 1, to_fuse_file_type(entry.kind), &entry.name) {
                    // Buffer full
                    reply.ok();
                    return;
                }
            }
            idx += 1;
        }

        reply.ok();
    }

    fn fsync(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        self.flush(req, ino, fh, 0, reply);
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        trace!("flush: fh={}", fh);
        let Some(ctx) = self.contexts.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        match self.handle.block_on(self.router.flush(ctx)) {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        _pid: u32,
        _sleep: bool,
        reply: ReplyEmpty,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let len = end.saturating_sub(start);
        let result = if typ == libc::F_UNLCK as i32 {
            self.router.unlock(&path, start, len)
        } else {
            self.router.lock(&path, start, len)
        };
        match result {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("getxattr: {:?} {:?}", path, name);

        // No security descriptors to hand out
        if self.router.get_security(&path).is_err() {
            reply.error(libc::ENOTSUP);
        } else {
            reply.size(0);
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.handle.block_on(self.router.get_info(&path)) {
            Ok(_) => reply.ok(),
            Err(status) => reply.error(status.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.handle.block_on(self.router.free_space()) {
            Ok(space) => {
                let block = BLOCK_SIZE as u64;
                reply.statfs(
                    space.total / block, // blocks
                    space.free / block,  // bfree
                    space.free / block,  // bavail
                    u64::MAX,            // files
                    u64::MAX,            // ffree
                    BLOCK_SIZE,          // bsize
                    255,                 // namelen
                    BLOCK_SIZE,          // frsize
                );
            }
            Err(status) => reply.error(status.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_access_from_flags() {
        assert_eq!(access_from_flags(libc::O_RDONLY), AccessIntent::Read);
        assert_eq!(
            access_from_flags(libc::O_WRONLY | libc::O_APPEND),
            AccessIntent::Write
        );
        assert_eq!(access_from_flags(libc::O_RDWR), AccessIntent::ReadWrite);
    }

    #[test]
    fn test_create_disposition() {
        assert_eq!(
            create_disposition(libc::O_CREAT | libc::O_EXCL),
            Disposition::CreateNew
        );
        assert_eq!(
            create_disposition(libc::O_CREAT | libc::O_TRUNC),
            Disposition::Create
        );
        assert_eq!(create_disposition(libc::O_CREAT), Disposition::OpenOrCreate);
    }

    #[test]
    fn test_metadata_to_attr() {
        let mtime = UNIX_EPOCH + Duration::from_secs(1_000);
        let atime = UNIX_EPOCH + Duration::from_secs(2_000);
        let meta = MetadataEntity::file("a.txt", 5000, mtime)
            .with_mode(Some(0o100600))
            .with_times(atime, None);

        let attr = metadata_to_attr(7, &meta, 10, 20);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FuseFileType::RegularFile);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.atime, atime);
        assert_eq!(attr.crtime, mtime);
        assert_eq!((attr.uid, attr.gid, attr.nlink), (10, 20, 1));

        let dir = metadata_to_attr(1, &MetadataEntity::directory("/", mtime), 0, 0);
        assert_eq!(dir.kind, FuseFileType::Directory);
        assert_eq!(dir.nlink, 2);
    }

    #[test]
    fn test_mount_options() {
        let driver = FuseDriver {
            handle: tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .handle()
                .clone(),
            options: MountOptions {
                fs_name: "skymount".into(),
                allow_other: true,
                auto_unmount: false,
            },
        };
        let options = driver.mount_options();
        assert!(options.contains(&MountOption::AllowOther));
        assert!(!options.contains(&MountOption::AutoUnmount));
        assert!(options.contains(&MountOption::FSName("skymount".into())));
    }
}
