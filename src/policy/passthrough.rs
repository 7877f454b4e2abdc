//! Identity policy: virtual paths are backend paths, everything allowed

use std::path::{Path, PathBuf};
use std::sync::Weak;

use async_trait::async_trait;

use super::{Allowed, FileManagementPolicy, RouterSlot};
use crate::backend::MetadataEntity;
use crate::config::PolicyKind;
use crate::error::Result;
use crate::path::PathTranslator;
use crate::router::OperationRouter;

#[derive(Debug, Default)]
pub struct PassthroughPolicy {
    router: RouterSlot,
}

impl PassthroughPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileManagementPolicy for PassthroughPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Passthrough
    }

    fn bind(&self, router: Weak<OperationRouter>) {
        self.router.bind(router);
    }

    fn resolve_file_name(&self, virtual_path: &Path) -> PathBuf {
        PathTranslator::normalize(virtual_path)
    }

    fn resolve_dir_name(&self, virtual_path: &Path) -> PathBuf {
        PathTranslator::normalize(virtual_path)
    }

    fn create_allowed(&self) -> Allowed {
        Allowed::ALL
    }

    fn move_allowed(&self) -> Allowed {
        Allowed::ALL
    }

    fn delete_allowed(&self) -> Allowed {
        Allowed::ALL
    }

    fn write_allowed(&self) -> bool {
        true
    }

    async fn list_entries(&self, virtual_dir: &Path) -> Result<Vec<MetadataEntity>> {
        let router = self.router.router()?;
        router
            .backend()
            .list_entries(&self.resolve_dir_name(virtual_dir))
            .await
    }

    async fn prepare_file(&self, _backend_path: &Path) -> Result<()> {
        Ok(())
    }
}
