//! Inode management for path <-> inode mapping
//!
//! The kernel addresses entries by inode while the router works with
//! virtual paths. Renaming a directory moves every tracked descendant.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::path::PathTranslator;

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Manages bidirectional inode <-> path mapping
pub struct InodeTable {
    inode_to_path: DashMap<u64, PathBuf>,
    path_to_inode: DashMap<PathBuf, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Create a new inode table with root directory pre-registered
    pub fn new() -> Self {
        let table = Self {
            inode_to_path: DashMap::new(),
            path_to_inode: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };

        let root_path = PathBuf::from("/");
        table.inode_to_path.insert(ROOT_INODE, root_path.clone());
        table.path_to_inode.insert(root_path, ROOT_INODE);

        table
    }

    /// Get inode for a path, allocating one if it doesn't exist
    pub fn get_or_create_inode(&self, path: &Path) -> u64 {
        let normalized = PathTranslator::normalize(path);

        if let Some(inode) = self.path_to_inode.get(&normalized) {
            return *inode;
        }

        // The entry guard serializes racing allocations for the same path.
        *self
            .path_to_inode
            .entry(normalized.clone())
            .or_insert_with(|| {
                let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
                self.inode_to_path.insert(inode, normalized);
                inode
            })
    }

    pub fn get_path(&self, inode: u64) -> Option<PathBuf> {
        self.inode_to_path.get(&inode).map(|p| p.clone())
    }

    /// Get inode for a path (without creating)
    pub fn get_inode(&self, path: &Path) -> Option<u64> {
        self.path_to_inode
            .get(&PathTranslator::normalize(path))
            .map(|i| *i)
    }

    /// Forget a path and everything below it
    pub fn remove_path(&self, path: &Path) {
        let normalized = PathTranslator::normalize(path);
        let doomed: Vec<PathBuf> = self
            .path_to_inode
            .iter()
            .filter(|e| e.key().starts_with(&normalized) && *e.value() != ROOT_INODE)
            .map(|e| e.key().clone())
            .collect();

        for p in doomed {
            if let Some((_, inode)) = self.path_to_inode.remove(&p) {
                self.inode_to_path.remove(&inode);
            }
        }
    }

    /// Move a path and its tracked descendants, keeping their inodes
    pub fn rename_path(&self, old: &Path, new: &Path) {
        let old_normalized = PathTranslator::normalize(old);
        let new_normalized = PathTranslator::normalize(new);

        // Whatever the target inode was, it has been replaced.
        self.remove_path(&new_normalized);

        let moved: Vec<(PathBuf, u64)> = self
            .path_to_inode
            .iter()
            .filter(|e| e.key().starts_with(&old_normalized))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        for (path, inode) in moved {
            let Ok(suffix) = path.strip_prefix(&old_normalized) else {
                continue;
            };
            let target = if suffix.as_os_str().is_empty() {
                new_normalized.clone()
            } else {
                new_normalized.join(suffix)
            };
            self.path_to_inode.remove(&path);
            self.inode_to_path.insert(inode, target.clone());
            self.path_to_inode.insert(target, inode);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
