//! Metadata cache layer
//!
//! Wraps a backend whose metadata queries are expensive (a network round
//! trip per `stat`) and keeps a path → [`MetadataEntity`] map that a
//! background task refreshes on a fixed interval.
//!
//! Consistency rules:
//! - every mutating call invalidates the touched paths (and cached
//!   descendants) before it returns;
//! - concurrent lookups of the same uncached path share one fetch;
//! - a fetch or refresh that started before an invalidation never writes
//!   its result back (tracked with an epoch counter).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backend::{
    AttributeChanges, Backend, BackendKind, EntryTimes, FreeSpace, MetadataEntity, OpenHandle,
    OpenRequest,
};
use crate::error::{Result, SkymountError};
use crate::path::PathTranslator;

/// Metadata cache configuration
#[derive(Debug, Clone)]
pub struct MetadataCacheConfig {
    /// Pause between refresh passes
    pub refresh_interval: Duration,
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of one shared fetch
#[derive(Debug, Clone)]
enum Fetched {
    Found(MetadataEntity),
    Missing,
    Denied(String),
    Failed(String),
}

impl Fetched {
    fn into_result(self, path: &Path) -> Result<MetadataEntity> {
        match self {
            Fetched::Found(meta) => Ok(meta),
            Fetched::Missing => Err(SkymountError::not_found(path)),
            Fetched::Denied(msg) => Err(SkymountError::AccessDenied(msg)),
            Fetched::Failed(msg) => Err(SkymountError::Session(msg)),
        }
    }
}

type InflightCell = Arc<OnceCell<Fetched>>;

/// Caching backend wrapper for expensive metadata
pub struct MetadataCache<B: Backend> {
    inner: Arc<B>,
    config: MetadataCacheConfig,
    entries: Mutex<HashMap<PathBuf, MetadataEntity>>,
    inflight: Mutex<HashMap<PathBuf, InflightCell>>,
    /// Bumped under the `entries` lock by every invalidation
    epoch: AtomicU64,
    shutdown: Arc<Notify>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

fn key(path: &Path) -> PathBuf {
    PathTranslator::normalize(path)
}

impl<B: Backend + 'static> MetadataCache<B> {
    pub fn new(inner: B, config: MetadataCacheConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
            refresher: Mutex::new(None),
        }
    }

    /// Spawn the background refresher. Calling it twice is a no-op.
    pub fn start_refresher(self: &Arc<Self>) {
        let mut slot = self.refresher.lock();
        if slot.is_some() {
            return;
        }

        let cache = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.refresh_interval;

        *slot = Some(tokio::spawn(async move {
            info!("Metadata refresher started with interval {:?}", interval);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        cache.refresh_pass().await;
                    }
                    _ = shutdown.notified() => {
                        info!("Metadata refresher shutting down");
                        break;
                    }
                }
            }
        }));
    }

    /// Cached entry for `path`, if any. Never fetches.
    pub fn cached(&self, path: &Path) -> Option<MetadataEntity> {
        self.entries.lock().get(&key(path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cached value if present, otherwise fetch from the backend and store
    pub async fn get_or_fetch(&self, path: &Path) -> Result<MetadataEntity> {
        let path = key(path);
        if let Some(meta) = self.entries.lock().get(&path).cloned() {
            trace!("cache hit: {:?}", path);
            return Ok(meta);
        }

        let cell = self
            .inflight
            .lock()
            .entry(path.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let fetched = cell
            .get_or_init(|| self.fetch(path.clone()))
            .await
            .clone();

        {
            let mut inflight = self.inflight.lock();
            if inflight.get(&path).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                inflight.remove(&path);
            }
        }

        fetched.into_result(&path)
    }

    async fn fetch(&self, path: PathBuf) -> Fetched {
        let epoch = self.epoch.load(Ordering::SeqCst);
        debug!("cache miss, fetching {:?}", path);

        match self.inner.stat(&path).await {
            Ok(meta) => {
                let mut entries = self.entries.lock();
                if self.epoch.load(Ordering::SeqCst) == epoch {
                    entries.insert(path, meta.clone());
                }
                Fetched::Found(meta)
            }
            Err(e) if e.is_not_found() => Fetched::Missing,
            Err(SkymountError::AccessDenied(msg)) => Fetched::Denied(msg),
            Err(e) => Fetched::Failed(e.to_string()),
        }
    }

    /// Drop `path` and every cached descendant
    pub fn invalidate(&self, path: &Path) {
        let path = key(path);
        {
            let mut entries = self.entries.lock();
            entries.retain(|k, _| !k.starts_with(&path));
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.inflight.lock().retain(|k, _| !k.starts_with(&path));
        trace!("invalidated {:?}", path);
    }

    /// Re-fetch every cached path once, updating or evicting it
    pub async fn refresh_pass(&self) {
        let paths: Vec<PathBuf> = self.entries.lock().keys().cloned().collect();
        if paths.is_empty() {
            return;
        }
        debug!("Refreshing {} cached entries", paths.len());

        for path in paths {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let result = self.inner.stat(&path).await;

            let mut entries = self.entries.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                // Invalidated mid-fetch; whatever we got may predate the mutation.
                continue;
            }
            match result {
                Ok(meta) => {
                    if let Some(slot) = entries.get_mut(&path) {
                        *slot = meta;
                    }
                }
                Err(e) if e.is_not_found() => {
                    trace!("evicting {:?}", path);
                    entries.remove(&path);
                }
                Err(e) => warn!("Refresh of {:?} failed: {}", path, e),
            }
        }
    }

    fn warm(&self, dir: &Path, children: &[MetadataEntity], epoch: u64) {
        let dir = key(dir);
        let mut entries = self.entries.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        for child in children {
            entries.insert(dir.join(&child.name), child.clone());
        }
    }
}

#[async_trait]
impl<B: Backend + 'static> Backend for MetadataCache<B> {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn exists(&self, path: &Path) -> bool {
        self.get_or_fetch(path).await.is_ok()
    }

    async fn stat(&self, path: &Path) -> Result<MetadataEntity> {
        self.get_or_fetch(path).await
    }

    async fn is_directory(&self, path: &Path) -> bool {
        matches!(self.get_or_fetch(path).await, Ok(meta) if meta.is_dir())
    }

    async fn list_entries(&self, path: &Path) -> Result<Vec<MetadataEntity>> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let children = self.inner.list_entries(path).await?;
        self.warm(path, &children, epoch);
        Ok(children)
    }

    async fn read_at(&self, path: &Path, len: usize, offset: u64) -> Result<Bytes> {
        self.inner.read_at(path, len, offset).await
    }

    async fn write_at(&self, path: &Path, data: &[u8], offset: u64) -> Result<u64> {
        let result = self.inner.write_at(path, data, offset).await;
        self.invalidate(path);
        result
    }

    async fn create_file(&self, path: &Path) -> Result<()> {
        let result = self.inner.create_file(path).await;
        self.invalidate(path);
        result
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let result = self.inner.create_dir(path).await;
        self.invalidate(path);
        result
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let result = self.inner.rename(from, to).await;
        self.invalidate(from);
        self.invalidate(to);
        result
    }

    async fn delete_recursive(&self, path: &Path) -> bool {
        let ok = self.inner.delete_recursive(path).await;
        self.invalidate(path);
        ok
    }

    async fn set_times(&self, path: &Path, times: EntryTimes) -> Result<()> {
        let result = self.inner.set_times(path, times).await;
        self.invalidate(path);
        result
    }

    async fn set_size(&self, path: &Path, size: u64) -> Result<()> {
        let result = self.inner.set_size(path, size).await;
        self.invalidate(path);
        result
    }

    async fn set_attributes(&self, path: &Path, changes: AttributeChanges) -> Result<()> {
        let result = self.inner.set_attributes(path, changes).await;
        self.invalidate(path);
        result
    }

    async fn free_space(&self) -> Result<FreeSpace> {
        self.inner.free_space().await
    }

    async fn open(&self, path: &Path, request: OpenRequest) -> Result<OpenHandle> {
        let result = self.inner.open(path, request).await;
        if request.truncate {
            self.invalidate(path);
        }
        result
    }

    async fn io_read(&self, handle: &mut OpenHandle, len: usize, offset: u64) -> Result<Bytes> {
        self.inner.io_read(handle, len, offset).await
    }

    async fn io_write(&self, handle: &mut OpenHandle, data: &[u8], offset: u64) -> Result<u64> {
        let result = self.inner.io_write(handle, data, offset).await;
        self.invalidate(&handle.path);
        result
    }

    async fn flush_handle(&self, handle: &mut OpenHandle) -> Result<()> {
        self.inner.flush_handle(handle).await
    }

    async fn set_handle_length(&self, handle: &mut OpenHandle, len: u64) -> Result<()> {
        let result = self.inner.set_handle_length(handle, len).await;
        self.invalidate(&handle.path);
        result
    }

    async fn close_handle(&self, handle: OpenHandle) -> Result<()> {
        let path = handle.path.clone();
        let result = self.inner.close_handle(handle).await;
        self.invalidate(&path);
        result
    }

    async fn shutdown(&self) {
        self.shutdown.notify_one();
        let task = self.refresher.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Metadata refresher ended abnormally: {}", e);
            }
        }
        self.inner.shutdown().await;
    }
}
