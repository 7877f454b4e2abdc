//! Mount-driver boundary
//!
//! The instance manager never talks to a concrete driver; it hands a wired
//! [`OperationRouter`] to whatever [`MountDriver`] it was built with and
//! holds the returned [`ActiveMount`] for as long as the instance runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, SkymountError};
use crate::router::OperationRouter;

/// Something that can expose a router as a mounted volume
pub trait MountDriver: Send + Sync {
    fn mount(&self, router: Arc<OperationRouter>, mount_point: &Path) -> Result<ActiveMount>;
}

/// Represents an active mount
pub struct ActiveMount {
    /// Mount path
    pub path: PathBuf,
    /// Driver session; dropping it ends the mount
    session: Option<Box<dyn Send>>,
}

impl ActiveMount {
    /// Create a new active mount owning a driver session
    pub fn new(path: PathBuf, session: impl Send + 'static) -> Self {
        Self {
            path,
            session: Some(Box::new(session)),
        }
    }

    /// A mount with no session attached (drivers that serve nothing)
    pub fn detached(path: PathBuf) -> Self {
        Self {
            path,
            session: None,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.session.is_some()
    }

    /// Unmount this volume
    pub fn unmount(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Unmounting {:?}", self.path);
            drop(session);
        }
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Make sure `path` can be used as a mount point, creating it if missing
pub fn ensure_mount_point(path: &Path) -> Result<()> {
    if !path.exists() {
        debug!("Creating mount point directory {:?}", path);
        std::fs::create_dir_all(path).map_err(|e| SkymountError::io(path, e))?;
    }

    if !path.is_dir() {
        return Err(SkymountError::NotADirectory(format!(
            "Mount point is not a directory: {:?}",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(Arc<AtomicBool>);

    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_ends_session() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mount = ActiveMount::new(PathBuf::from("/mnt/x"), Flag(dropped.clone()));
        assert!(mount.is_mounted());
        drop(mount);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unmount_is_idempotent() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut mount = ActiveMount::new(PathBuf::from("/mnt/x"), Flag(dropped.clone()));
        mount.unmount();
        mount.unmount();
        assert!(!mount.is_mounted());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_ensure_mount_point() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("a/b");
        ensure_mount_point(&target).unwrap();
        assert!(target.is_dir());

        let file = dir.path().join("f");
        std::fs::write(&file, b"").unwrap();
        assert!(matches!(
            ensure_mount_point(&file),
            Err(SkymountError::NotADirectory(_))
        ));
    }
}
