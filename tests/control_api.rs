//! Create, list and stop an instance through the control API, backed by the
//! local backend and a driver that mounts nothing.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::{Method, StatusCode, Uri};
use tempfile::TempDir;
use tokio::sync::Notify;

use skymount::config::InstanceSettings;
use skymount::control::{ControlApi, ControlResponse};
use skymount::instance::{InstanceManager, InstanceStore};
use skymount::mount::{ActiveMount, MountDriver};
use skymount::router::OperationRouter;
use skymount::Result;

#[derive(Default)]
struct NoopDriver {
    mounted: AtomicUsize,
}

impl MountDriver for NoopDriver {
    fn mount(&self, router: Arc<OperationRouter>, mount_point: &Path) -> Result<ActiveMount> {
        self.mounted.fetch_add(1, Ordering::SeqCst);
        router.mounted(mount_point);
        Ok(ActiveMount::detached(mount_point.to_path_buf()))
    }
}

struct Harness {
    _dir: TempDir,
    api: ControlApi,
    driver: Arc<NoopDriver>,
    body: String,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("hello.txt"), b"hi").unwrap();

        let driver = Arc::new(NoopDriver::default());
        let settings = InstanceSettings {
            startup_grace: Duration::from_millis(100),
            ..InstanceSettings::default()
        };
        let manager = InstanceManager::new(
            InstanceStore::new(dir.path().join("state")),
            driver.clone(),
            settings,
        );
        let api = ControlApi::new(Arc::new(manager), Arc::new(Notify::new()));

        let body = serde_json::json!({
            "backend_kind": "local",
            "root": root.to_string_lossy(),
            "mount_point": dir.path().join("drive").to_string_lossy(),
        })
        .to_string();

        Self {
            _dir: dir,
            api,
            driver,
            body,
        }
    }

    async fn call(&self, method: Method, uri: &str, body: &str) -> ControlResponse {
        let uri: Uri = uri.parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        self.api.handle(&method, &uri, peer, body.as_bytes()).await
    }
}

#[tokio::test]
async fn test_create_list_stop() {
    let harness = Harness::new();

    let created = harness
        .call(Method::POST, "/create-instance", &harness.body)
        .await;
    assert_eq!(created.status, StatusCode::OK, "{}", created.body);
    let id = created.body;
    assert_eq!(id.len(), 64);
    assert_eq!(harness.driver.mounted.load(Ordering::SeqCst), 1);

    let listed = harness.call(Method::GET, "/instances", "").await;
    assert_eq!(listed.body, id);

    let stopped = harness
        .call(Method::POST, &format!("/instance/{}/stop", id), "")
        .await;
    assert_eq!(stopped.status, StatusCode::OK);
    assert_eq!(stopped.body, id);

    let listed = harness.call(Method::GET, "/instances", "").await;
    assert_eq!(listed.status, StatusCode::OK);
    assert!(listed.body.is_empty());
}

#[tokio::test]
async fn test_same_config_same_id() {
    let harness = Harness::new();

    let first = harness
        .call(Method::POST, "/create-instance", &harness.body)
        .await
        .body;
    harness
        .call(Method::POST, &format!("/instance/{}/stop", first), "")
        .await;

    let second = harness
        .call(Method::POST, "/create-instance", &harness.body)
        .await
        .body;
    assert_eq!(first, second);

    assert_eq!(harness.call(Method::POST, "/wipe", "").await.body, "1");
}
