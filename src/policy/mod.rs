//! File management policies
//!
//! A policy decides how virtual names map to backend paths and which
//! operations are allowed. It is bound to its router after both exist,
//! since policy-shaped listings and bucket preparation go through the
//! router's backend.

pub mod bucket;
pub mod passthrough;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tracing::warn;

use crate::backend::MetadataEntity;
use crate::config::PolicyKind;
use crate::error::{Result, SkymountError};
use crate::router::OperationRouter;

pub use bucket::ExtensionBucketPolicy;
pub use passthrough::PassthroughPolicy;

/// Per-kind permission answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allowed {
    pub files: bool,
    pub directories: bool,
}

impl Allowed {
    pub const ALL: Allowed = Allowed {
        files: true,
        directories: true,
    };

    pub const FILES_ONLY: Allowed = Allowed {
        files: true,
        directories: false,
    };

    pub fn for_kind(&self, is_directory: bool) -> bool {
        if is_directory {
            self.directories
        } else {
            self.files
        }
    }
}

#[async_trait]
pub trait FileManagementPolicy: Send + Sync {
    fn kind(&self) -> PolicyKind;

    /// Attach the router this policy serves. Must happen before routing.
    fn bind(&self, router: Weak<OperationRouter>);

    /// Backend path for a virtual file path
    fn resolve_file_name(&self, virtual_path: &Path) -> PathBuf;

    /// Backend path for a virtual directory path
    fn resolve_dir_name(&self, virtual_path: &Path) -> PathBuf;

    fn create_allowed(&self) -> Allowed;

    fn move_allowed(&self) -> Allowed;

    fn delete_allowed(&self) -> Allowed;

    fn write_allowed(&self) -> bool;

    /// Entries of a virtual directory, named as the mount should show them
    async fn list_entries(&self, virtual_dir: &Path) -> Result<Vec<MetadataEntity>>;

    /// Run before a file is created at, or moved to, `backend_path`
    async fn prepare_file(&self, backend_path: &Path) -> Result<()>;
}

/// Late-bound, non-owning reference from a policy back to its router
#[derive(Debug, Default)]
pub struct RouterSlot(OnceLock<Weak<OperationRouter>>);

impl RouterSlot {
    pub fn new() -> Self {
        Self(OnceLock::new())
    }

    pub fn bind(&self, router: Weak<OperationRouter>) {
        if self.0.set(router).is_err() {
            warn!("Policy is already bound to a router; ignoring rebind");
        }
    }

    pub fn is_bound(&self) -> bool {
        self.0.get().is_some()
    }

    /// The bound router, or an error if unbound or already dropped
    pub fn router(&self) -> Result<Arc<OperationRouter>> {
        self.0
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SkymountError::Other("policy is not bound to a live router".into()))
    }
}

/// Instantiate the policy for `kind`
pub fn build_policy(kind: PolicyKind) -> Arc<dyn FileManagementPolicy> {
    match kind {
        PolicyKind::Passthrough => Arc::new(PassthroughPolicy::new()),
        PolicyKind::ExtensionBuckets => Arc::new(ExtensionBucketPolicy::new()),
    }
}
