//! Extension-bucketing policy
//!
//! The mount shows a single flat directory. Each file is stored under a
//! bucket directory named after its extension:
//!
//! ```text
//! virtual              backend
//! /report.pdf    <->   /pdf/report
//! /archive.tar.gz <->  /gz/archive.tar
//! /Makefile      <->   /.none/Makefile
//! ```
//!
//! `.none` can never be produced by an extension, so the mapping stays
//! reversible for extensionless files.

use std::path::{Path, PathBuf};
use std::sync::Weak;

use async_trait::async_trait;
use tracing::debug;

use super::{Allowed, FileManagementPolicy, RouterSlot};
use crate::backend::{entry_name, MetadataEntity};
use crate::config::PolicyKind;
use crate::error::{Result, SkymountError};
use crate::path::PathTranslator;
use crate::router::OperationRouter;

/// Bucket for files without an extension
pub const NO_EXTENSION_BUCKET: &str = ".none";

#[derive(Debug, Default)]
pub struct ExtensionBucketPolicy {
    router: RouterSlot,
}

impl ExtensionBucketPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a file name into (bucket, stored name)
    fn bucket_of(name: &str) -> (&str, &str) {
        match name.rfind('.') {
            Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[idx + 1..], &name[..idx]),
            _ => (NO_EXTENSION_BUCKET, name),
        }
    }

    /// Virtual name for a stored file in `bucket`
    fn virtual_name(bucket: &str, stored: &str) -> String {
        if bucket == NO_EXTENSION_BUCKET {
            stored.to_string()
        } else {
            format!("{}.{}", stored, bucket)
        }
    }

    fn is_root(path: &Path) -> bool {
        PathTranslator::normalize(path) == Path::new("/")
    }
}

#[async_trait]
impl FileManagementPolicy for ExtensionBucketPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::ExtensionBuckets
    }

    fn bind(&self, router: Weak<OperationRouter>) {
        self.router.bind(router);
    }

    fn resolve_file_name(&self, virtual_path: &Path) -> PathBuf {
        if Self::is_root(virtual_path) {
            return PathBuf::from("/");
        }
        let name = entry_name(&PathTranslator::normalize(virtual_path));
        let (bucket, stored) = Self::bucket_of(&name);
        Path::new("/").join(bucket).join(stored)
    }

    fn resolve_dir_name(&self, virtual_path: &Path) -> PathBuf {
        // The root is the only directory the flat namespace has.
        self.resolve_file_name(virtual_path)
    }

    fn create_allowed(&self) -> Allowed {
        Allowed::FILES_ONLY
    }

    fn move_allowed(&self) -> Allowed {
        Allowed::FILES_ONLY
    }

    fn delete_allowed(&self) -> Allowed {
        Allowed::FILES_ONLY
    }

    fn write_allowed(&self) -> bool {
        true
    }

    async fn list_entries(&self, virtual_dir: &Path) -> Result<Vec<MetadataEntity>> {
        if !Self::is_root(virtual_dir) {
            return Err(SkymountError::NotADirectory(
                virtual_dir.display().to_string(),
            ));
        }

        let router = self.router.router()?;
        let backend = router.backend();
        let mut out = Vec::new();

        for bucket in backend.list_entries(Path::new("/")).await? {
            if !bucket.is_dir() {
                debug!("Skipping stray file {:?} outside any bucket", bucket.name);
                continue;
            }
            let bucket_path = Path::new("/").join(&bucket.name);
            for entry in backend.list_entries(&bucket_path).await? {
                if entry.is_dir() {
                    continue;
                }
                let name = Self::virtual_name(&bucket.name, &entry.name);
                out.push(entry.with_name(name));
            }
        }

        Ok(out)
    }

    async fn prepare_file(&self, backend_path: &Path) -> Result<()> {
        let Some(bucket) = backend_path.parent() else {
            return Ok(());
        };
        if bucket == Path::new("/") {
            return Ok(());
        }

        let router = self.router.router()?;
        match router.backend().create_dir(bucket).await {
            Ok(()) => {
                debug!("Created bucket {:?}", bucket);
                Ok(())
            }
            Err(SkymountError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
