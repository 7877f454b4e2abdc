//! In-memory remote session used by tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{CommandOutput, RemoteAttributes, RemoteOpenFlags, RemoteSession, SetStat};
use crate::backend::HandleIo;
use crate::error::{Result, SkymountError};

#[derive(Debug, Clone)]
struct Node {
    is_dir: bool,
    data: Vec<u8>,
    permissions: u32,
    atime: u32,
    mtime: u32,
}

impl Node {
    fn dir() -> Self {
        Self {
            is_dir: true,
            data: Vec::new(),
            permissions: 0o755,
            atime: 1_700_000_000,
            mtime: 1_700_000_000,
        }
    }

    fn file() -> Self {
        Self {
            is_dir: false,
            permissions: 0o644,
            ..Self::dir()
        }
    }

    fn attributes(&self) -> RemoteAttributes {
        RemoteAttributes {
            is_dir: self.is_dir,
            size: if self.is_dir { 0 } else { self.data.len() as u64 },
            permissions: Some(self.permissions),
            atime: Some(self.atime),
            mtime: Some(self.mtime),
        }
    }
}

type Tree = Arc<Mutex<BTreeMap<String, Node>>>;

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// A remote session backed by a map of paths.
///
/// Counts `stat` calls, can delay them to widen race windows, and serves a
/// scripted result for `exec`.
pub struct MemorySession {
    tree: Tree,
    stat_calls: AtomicUsize,
    stat_delay: Mutex<Option<Duration>>,
    exec_output: Mutex<CommandOutput>,
    ignore_renames: AtomicBool,
}

impl MemorySession {
    pub fn new() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), Node::dir());
        Self {
            tree: Arc::new(Mutex::new(tree)),
            stat_calls: AtomicUsize::new(0),
            stat_delay: Mutex::new(None),
            exec_output: Mutex::new(CommandOutput::default()),
            ignore_renames: AtomicBool::new(false),
        }
    }

    pub fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    pub fn set_stat_delay(&self, delay: Duration) {
        *self.stat_delay.lock() = Some(delay);
    }

    pub fn set_exec_output(&self, exit_status: Option<u32>, stdout: &str) {
        *self.exec_output.lock() = CommandOutput {
            exit_status,
            stdout: stdout.to_string(),
        };
    }

    /// Make `rename` report success without moving anything
    pub fn ignore_renames(&self) {
        self.ignore_renames.store(true, Ordering::SeqCst);
    }

    /// Insert a file, creating parent directories
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let mut tree = self.tree.lock();
        let mut dir = parent(path);
        while dir != "/" {
            tree.entry(dir.clone()).or_insert_with(Node::dir);
            dir = parent(&dir);
        }
        let mut node = Node::file();
        node.data = data.to_vec();
        tree.insert(path.to_string(), node);
    }

    /// Mutate the store behind the session's back
    pub fn remove_behind(&self, path: &str) {
        self.tree.lock().remove(path);
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn stat(&self, path: &str) -> Result<RemoteAttributes> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.stat_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.tree
            .lock()
            .get(path)
            .map(Node::attributes)
            .ok_or_else(|| SkymountError::NotFound(path.to_string()))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<(String, RemoteAttributes)>> {
        let tree = self.tree.lock();
        match tree.get(path) {
            Some(node) if node.is_dir => {}
            Some(_) => return Err(SkymountError::NotADirectory(path.to_string())),
            None => return Err(SkymountError::NotFound(path.to_string())),
        }

        let mut out = vec![
            (".".to_string(), Node::dir().attributes()),
            ("..".to_string(), Node::dir().attributes()),
        ];
        for (child, node) in tree.iter() {
            if child != path && parent(child) == path {
                let name = child.rsplit('/').next().unwrap_or_default().to_string();
                out.push((name, node.attributes()));
            }
        }
        Ok(out)
    }

    async fn open(&self, path: &str, flags: RemoteOpenFlags) -> Result<Box<dyn HandleIo>> {
        let mut tree = self.tree.lock();
        match tree.get_mut(path) {
            Some(_) if flags.create && flags.exclusive => {
                return Err(SkymountError::Session(format!("{} exists", path)))
            }
            Some(node) if node.is_dir => {
                return Err(SkymountError::Session(format!("{} is a directory", path)))
            }
            Some(node) => {
                if flags.truncate {
                    node.data.clear();
                }
            }
            None if flags.create => {
                if !tree.get(&parent(path)).map(|n| n.is_dir).unwrap_or(false) {
                    return Err(SkymountError::NotFound(path.to_string()));
                }
                tree.insert(path.to_string(), Node::file());
            }
            None => return Err(SkymountError::NotFound(path.to_string())),
        }

        Ok(Box::new(MemoryHandle {
            tree: self.tree.clone(),
            path: path.to_string(),
        }))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        if tree.contains_key(path) {
            return Err(SkymountError::Session(format!("{} exists", path)));
        }
        if !tree.get(&parent(path)).map(|n| n.is_dir).unwrap_or(false) {
            return Err(SkymountError::NotFound(path.to_string()));
        }
        tree.insert(path.to_string(), Node::dir());
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        match tree.get(path) {
            Some(node) if !node.is_dir => {
                tree.remove(path);
                Ok(())
            }
            Some(_) => Err(SkymountError::Session(format!("{} is a directory", path))),
            None => Err(SkymountError::NotFound(path.to_string())),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let has_children = tree.keys().any(|k| k != path && parent(k) == path);
        match tree.get(path) {
            Some(node) if node.is_dir && !has_children => {
                tree.remove(path);
                Ok(())
            }
            Some(_) => Err(SkymountError::Session(format!("cannot remove {}", path))),
            None => Err(SkymountError::NotFound(path.to_string())),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        if self.ignore_renames.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut tree = self.tree.lock();
        if !tree.contains_key(from) {
            return Err(SkymountError::NotFound(from.to_string()));
        }

        let prefix = format!("{}/", from);
        let moved: Vec<String> = tree
            .keys()
            .filter(|k| k.as_str() == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = tree.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                tree.insert(new, node);
            }
        }
        Ok(())
    }

    async fn set_stat(&self, path: &str, changes: SetStat) -> Result<()> {
        let mut tree = self.tree.lock();
        let node = tree
            .get_mut(path)
            .ok_or_else(|| SkymountError::NotFound(path.to_string()))?;
        if let Some(size) = changes.size {
            node.data.resize(size as usize, 0);
        }
        if let Some(perms) = changes.permissions {
            node.permissions = perms;
        }
        if let Some(atime) = changes.atime {
            node.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            node.mtime = mtime;
        }
        Ok(())
    }

    async fn exec(&self, _command: &str) -> Result<CommandOutput> {
        Ok(self.exec_output.lock().clone())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryHandle {
    tree: Tree,
    path: String,
}

impl MemoryHandle {
    fn with_node<T>(&self, f: impl FnOnce(&mut Node) -> T) -> Result<T> {
        let mut tree = self.tree.lock();
        let node = tree
            .get_mut(&self.path)
            .ok_or_else(|| SkymountError::NotFound(self.path.clone()))?;
        Ok(f(node))
    }
}

#[async_trait]
impl HandleIo for MemoryHandle {
    async fn read_at(&mut self, len: usize, offset: u64) -> Result<Bytes> {
        self.with_node(|node| {
            let start = (offset as usize).min(node.data.len());
            let end = start.saturating_add(len).min(node.data.len());
            Bytes::copy_from_slice(&node.data[start..end])
        })
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<u64> {
        self.with_node(|node| {
            let start = offset as usize;
            let end = start + data.len();
            if node.data.len() < end {
                node.data.resize(end, 0);
            }
            node.data[start..end].copy_from_slice(data);
            data.len() as u64
        })
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_len(&mut self, len: u64) -> Result<()> {
        self.with_node(|node| node.data.resize(len as usize, 0))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
