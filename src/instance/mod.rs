//! Instance lifecycle management
//!
//! An instance is one configured backend mounted through the injected
//! [`MountDriver`]. Each running instance owns a tokio task that connects
//! the backend, wires the router, mounts, and then parks until its
//! shutdown signal fires.

pub mod health;
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::local::LocalBackend;
use crate::backend::remote::RemoteBackend;
use crate::backend::{Backend, BackendKind};
use crate::cache::{MetadataCache, MetadataCacheConfig};
use crate::config::{InstanceConfig, InstanceSettings};
use crate::error::{Result, SkymountError};
use crate::mount::MountDriver;
use crate::policy::build_policy;
use crate::router::OperationRouter;
use crate::session::auth::Credentials;
use crate::session::sftp::{SftpSession, SftpTarget};

pub use health::{InstanceHealth, InstanceState};
pub use store::{InstanceStore, PersistedInstance};

struct InstanceRecord {
    config: Arc<InstanceConfig>,
    health: Arc<InstanceHealth>,
    started_at: DateTime<Utc>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Merged live and persisted view of one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceDescription {
    pub id: String,
    pub running: bool,
    pub persisted: bool,
    pub autostart: bool,
    pub status: String,
    pub started_at: Option<String>,
    pub last_error: Option<String>,
    pub recent_errors: Vec<String>,
    /// Configuration with the secret redacted
    pub config: BTreeMap<String, String>,
}

fn unknown_instance(id: &str) -> SkymountError {
    SkymountError::NotFound(format!("instance {}", id))
}

/// Owns every running instance and the persisted records
pub struct InstanceManager {
    instances: Mutex<HashMap<String, InstanceRecord>>,
    store: InstanceStore,
    driver: Arc<dyn MountDriver>,
    settings: InstanceSettings,
}

impl InstanceManager {
    pub fn new(
        store: InstanceStore,
        driver: Arc<dyn MountDriver>,
        settings: InstanceSettings,
    ) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            store,
            driver,
            settings,
        }
    }

    /// Start an instance and return its identifier
    ///
    /// Fails with `Unable2Start` when the instance reports a failure within
    /// the startup grace period.
    pub async fn create(&self, config: InstanceConfig) -> Result<String> {
        let id = config.identifier();
        let config = Arc::new(config);
        let health = Arc::new(InstanceHealth::new());
        let shutdown = Arc::new(Notify::new());

        {
            let mut instances = self.instances.lock();
            if instances.contains_key(&id) {
                return Err(SkymountError::AlreadyExists(format!("instance {}", id)));
            }

            info!(
                "Starting instance {} ({} backend, {:?})",
                id, config.backend_kind, config.mount_point
            );
            let task = tokio::spawn(run_instance(
                id.clone(),
                config.clone(),
                health.clone(),
                shutdown.clone(),
                self.driver.clone(),
                self.settings.clone(),
            ));
            instances.insert(
                id.clone(),
                InstanceRecord {
                    config,
                    health: health.clone(),
                    started_at: Utc::now(),
                    shutdown,
                    task,
                },
            );
        }

        tokio::time::sleep(self.settings.startup_grace).await;

        if let InstanceState::Failed(message) = health.state() {
            let record = self.instances.lock().remove(&id);
            if let Some(record) = record {
                record.shutdown.notify_one();
                if let Err(e) = record.task.await {
                    warn!("Instance {} task ended abnormally: {}", id, e);
                }
            }
            return Err(SkymountError::Unable2Start(message));
        }

        Ok(id)
    }

    /// Signal the instance and wait for its task to finish
    pub async fn stop(&self, id: &str) -> Result<()> {
        let record = self
            .instances
            .lock()
            .remove(id)
            .ok_or_else(|| unknown_instance(id))?;

        record.shutdown.notify_one();
        if let Err(e) = record.task.await {
            warn!("Instance {} task ended abnormally: {}", id, e);
        }
        info!("Stopped instance {}", id);
        Ok(())
    }

    /// Persist a running or already persisted instance
    pub fn save(&self, id: &str, autostart: bool) -> Result<()> {
        let live = self.instances.lock().get(id).map(|r| r.config.to_map());
        let values = match live {
            Some(values) => values,
            None => {
                self.store
                    .load(id)?
                    .ok_or_else(|| unknown_instance(id))?
                    .values
            }
        };

        self.store.save(id, &values, autostart)?;
        info!("Saved instance {} (autostart={})", id, autostart);
        Ok(())
    }

    /// Stop the instance if it runs and forget its persisted record
    pub async fn delete(&self, id: &str) -> Result<()> {
        let running = match self.stop(id).await {
            Ok(()) => true,
            Err(SkymountError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        let removed = self.store.remove(id)?;

        if !running && !removed {
            return Err(unknown_instance(id));
        }
        info!("Deleted instance {}", id);
        Ok(())
    }

    /// Running and persisted ids, sorted; failed or stopped records are pruned
    pub fn list_all(&self) -> Vec<String> {
        let mut ids: Vec<String> = {
            let mut instances = self.instances.lock();
            instances.retain(|id, record| {
                let state = record.health.state();
                if state.is_terminal() {
                    debug!("Pruning instance {} ({})", id, state);
                }
                !state.is_terminal()
            });
            instances.keys().cloned().collect()
        };

        match self.store.list_ids() {
            Ok(persisted) => ids.extend(persisted),
            Err(e) => warn!("Failed to list persisted instances: {}", e),
        }

        ids.sort();
        ids.dedup();
        ids
    }

    pub fn describe(&self, id: &str) -> Result<InstanceDescription> {
        let live = self.instances.lock().get(id).map(|record| {
            (
                record.config.to_redacted_map(),
                record.health.state(),
                record.health.last_error(),
                record.health.recent_errors(),
                record.started_at,
            )
        });
        let persisted = self.store.load(id)?;

        match (live, persisted) {
            (Some((config, state, last_error, recent_errors, started_at)), persisted) => {
                Ok(InstanceDescription {
                    id: id.to_string(),
                    running: !state.is_terminal(),
                    persisted: persisted.is_some(),
                    autostart: persisted.map(|p| p.autostart).unwrap_or(false),
                    status: state.label().to_string(),
                    started_at: Some(started_at.to_rfc3339()),
                    last_error,
                    recent_errors,
                    config,
                })
            }
            (None, Some(persisted)) => {
                let config = match InstanceConfig::from_map(&persisted.values) {
                    Ok(config) => config.to_redacted_map(),
                    Err(e) => {
                        warn!("Persisted instance {} is unreadable: {}", id, e);
                        BTreeMap::new()
                    }
                };
                Ok(InstanceDescription {
                    id: id.to_string(),
                    running: false,
                    persisted: true,
                    autostart: persisted.autostart,
                    status: InstanceState::Stopped.label().to_string(),
                    started_at: None,
                    last_error: None,
                    recent_errors: Vec::new(),
                    config,
                })
            }
            (None, None) => Err(unknown_instance(id)),
        }
    }

    /// Stop every running instance; returns how many were stopped
    pub async fn stop_all(&self) -> usize {
        let records: Vec<(String, InstanceRecord)> = self.instances.lock().drain().collect();
        let count = records.len();

        for (_, record) in &records {
            record.shutdown.notify_one();
        }
        for (id, record) in records {
            if let Err(e) = record.task.await {
                warn!("Instance {} task ended abnormally: {}", id, e);
            }
        }

        if count > 0 {
            info!("Stopped {} instance(s)", count);
        }
        count
    }

    /// Start every persisted autostart record; returns how many came up
    pub async fn autostart_on_boot(&self) -> usize {
        let records = match self.store.load_all() {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to read persisted instances: {}", e);
                return 0;
            }
        };

        let mut started = 0;
        for record in records.into_iter().filter(|r| r.autostart) {
            let config = match InstanceConfig::from_map(&record.values) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Skipping autostart of {}: {}", record.id, e);
                    continue;
                }
            };
            match self.create(config).await {
                Ok(id) => {
                    info!("Autostarted instance {}", id);
                    started += 1;
                }
                Err(e) => warn!("Autostart of {} failed: {}", record.id, e),
            }
        }
        started
    }

    pub fn running_count(&self) -> usize {
        self.instances.lock().len()
    }
}

/// Body of an instance task; the outcome lands in `health`
async fn run_instance(
    id: String,
    config: Arc<InstanceConfig>,
    health: Arc<InstanceHealth>,
    shutdown: Arc<Notify>,
    driver: Arc<dyn MountDriver>,
    settings: InstanceSettings,
) {
    match serve_instance(&config, &health, &shutdown, driver, &settings).await {
        Ok(()) => {
            health.mark_stopped();
            info!("Instance {} finished", id);
        }
        Err(e) => {
            error!("Instance {} failed: {}", id, e);
            health.mark_failed(e.to_string());
        }
    }
}

async fn serve_instance(
    config: &Arc<InstanceConfig>,
    health: &Arc<InstanceHealth>,
    shutdown: &Notify,
    driver: Arc<dyn MountDriver>,
    settings: &InstanceSettings,
) -> Result<()> {
    let backend = connect_backend(config, settings).await?;
    let router = OperationRouter::wire(
        config.clone(),
        backend.clone(),
        build_policy(config.policy),
        health.clone(),
    );

    let mount_point = config.mount_point.clone();
    let mounted = tokio::task::spawn_blocking(move || driver.mount(router, &mount_point))
        .await
        .map_err(|e| SkymountError::Other(format!("mount task failed: {}", e)))
        .and_then(|result| result);
    let mount = match mounted {
        Ok(mount) => mount,
        Err(e) => {
            backend.shutdown().await;
            return Err(e);
        }
    };

    health.mark_healthy();
    shutdown.notified().await;

    // Dropping the session joins the driver thread
    if let Err(e) = tokio::task::spawn_blocking(move || drop(mount)).await {
        warn!("Unmount task failed: {}", e);
    }
    backend.shutdown().await;
    Ok(())
}

async fn connect_backend(
    config: &InstanceConfig,
    settings: &InstanceSettings,
) -> Result<Arc<dyn Backend>> {
    match config.backend_kind {
        BackendKind::Local => Ok(Arc::new(LocalBackend::new(&config.root)?)),
        BackendKind::Remote => {
            let target = SftpTarget {
                host: config.host.clone(),
                port: config.port,
                username: config.username.clone(),
                credentials: Credentials::from_config(config)?,
                connect_timeout: settings.connect_timeout,
            };
            let session = SftpSession::connect(&target).await?;

            let backend = RemoteBackend::new(Arc::new(session), &config.root);
            let cache = Arc::new(MetadataCache::new(
                backend,
                MetadataCacheConfig {
                    refresh_interval: settings.refresh_interval,
                },
            ));
            cache.start_refresher();
            Ok(cache)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::ActiveMount;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Mounts nothing; counts calls
    #[derive(Default)]
    struct RecordingDriver {
        mounts: AtomicUsize,
    }

    impl MountDriver for RecordingDriver {
        fn mount(&self, router: Arc<OperationRouter>, mount_point: &Path) -> Result<ActiveMount> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            router.mounted(mount_point);
            Ok(ActiveMount::detached(mount_point.to_path_buf()))
        }
    }

    struct FailingDriver;

    impl MountDriver for FailingDriver {
        fn mount(&self, _router: Arc<OperationRouter>, _mount_point: &Path) -> Result<ActiveMount> {
            Err(SkymountError::AccessDenied("fuse device unavailable".into()))
        }
    }

    fn settings() -> InstanceSettings {
        InstanceSettings {
            startup_grace: Duration::from_millis(100),
            ..InstanceSettings::default()
        }
    }

    fn manager(dir: &TempDir, driver: Arc<dyn MountDriver>) -> InstanceManager {
        InstanceManager::new(InstanceStore::new(dir.path().join("state")), driver, settings())
    }

    fn local_config(dir: &TempDir, name: &str) -> InstanceConfig {
        let root = dir.path().join(name);
        std::fs::create_dir_all(&root).unwrap();
        InstanceConfig::local(root.to_string_lossy(), dir.path().join("mnt").join(name))
    }

    #[tokio::test]
    async fn test_create_and_stop() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let manager = manager(&dir, driver.clone());

        let config = local_config(&dir, "a");
        let expected = config.identifier();
        let id = manager.create(config.clone()).await.unwrap();
        assert_eq!(id, expected);
        assert_eq!(driver.mounts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.list_all(), vec![id.clone()]);
        assert_eq!(manager.describe(&id).unwrap().status, "healthy");

        assert!(matches!(
            manager.create(config).await,
            Err(SkymountError::AlreadyExists(_))
        ));

        manager.stop(&id).await.unwrap();
        assert!(manager.list_all().is_empty());
        assert!(matches!(
            manager.stop(&id).await,
            Err(SkymountError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_is_unable2start() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Arc::new(RecordingDriver::default()));

        let config = InstanceConfig::local(
            dir.path().join("missing").to_string_lossy(),
            dir.path().join("mnt"),
        );
        match manager.create(config).await {
            Err(SkymountError::Unable2Start(msg)) => assert!(msg.contains("missing")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_mount_failure_is_unable2start() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Arc::new(FailingDriver));

        let err = manager.create(local_config(&dir, "a")).await.unwrap_err();
        assert_eq!(err.code(), "Unable2Start");
        assert!(err.to_string().contains("fuse device unavailable"));
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_save_describe_delete() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Arc::new(RecordingDriver::default()));

        assert!(matches!(
            manager.save("nope", true),
            Err(SkymountError::NotFound(_))
        ));

        let id = manager.create(local_config(&dir, "a")).await.unwrap();
        manager.save(&id, true).unwrap();
        manager.stop(&id).await.unwrap();

        // Still listed through its persisted record
        assert_eq!(manager.list_all(), vec![id.clone()]);
        let described = manager.describe(&id).unwrap();
        assert!(!described.running);
        assert!(described.persisted);
        assert!(described.autostart);
        assert_eq!(described.config["backend_kind"], "local");

        // Saving a persisted but stopped instance flips the flag
        manager.save(&id, false).unwrap();
        assert!(!manager.describe(&id).unwrap().autostart);

        manager.delete(&id).await.unwrap();
        assert!(manager.list_all().is_empty());
        assert!(matches!(
            manager.delete(&id).await,
            Err(SkymountError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all_and_autostart() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let manager = manager(&dir, driver.clone());

        let a = manager.create(local_config(&dir, "a")).await.unwrap();
        let b = manager.create(local_config(&dir, "b")).await.unwrap();
        manager.save(&a, true).unwrap();
        manager.save(&b, false).unwrap();

        assert_eq!(manager.stop_all().await, 2);
        assert_eq!(manager.running_count(), 0);

        assert_eq!(manager.autostart_on_boot().await, 1);
        assert_eq!(manager.describe(&a).unwrap().status, "healthy");
        assert!(!manager.describe(&b).unwrap().running);
        assert_eq!(driver.mounts.load(Ordering::SeqCst), 3);

        manager.stop_all().await;
    }
}
