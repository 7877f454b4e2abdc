//! Loopback control API
//!
//! Plain HTTP/1.1 endpoint driving the [`InstanceManager`]:
//!
//! | Path                                   | Method | Action      |
//! |----------------------------------------|--------|-------------|
//! | `/create-instance`                     | POST   | create      |
//! | `/instance/{id}/stop`                  | POST   | stop        |
//! | `/instance/{id}/save[?autostart=true]` | POST   | save        |
//! | `/instance/{id}/delete`                | POST   | delete      |
//! | `/instance/{id}`                       | GET    | describe    |
//! | `/instances`                           | GET    | list        |
//! | `/wipe`                                | POST   | stop all    |
//! | `/shutdown`                            | POST   | stop server |
//!
//! Only loopback peers are served. Failure bodies start with the error
//! code name (`InvalidConfig`, `Unable2Start`, ...).

pub mod server;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{Method, StatusCode, Uri};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::error::{Result, SkymountError};
use crate::instance::InstanceManager;

const TEXT: &str = "text/plain; charset=utf-8";
const JSON: &str = "application/json";

/// A fully rendered reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl ControlResponse {
    fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: TEXT,
            body: body.into(),
        }
    }

    fn ok(body: impl Into<String>) -> Self {
        Self::text(StatusCode::OK, body)
    }

    fn failure(err: &SkymountError) -> Self {
        let status = match err {
            SkymountError::Unable2Start(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = match err {
            SkymountError::Unable2Start(msg) => format!("{}: {}", err.code(), msg),
            _ => format!("{}: {}", err.code(), err),
        };
        Self::text(status, body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    CreateInstance,
    Instances,
    Wipe,
    Shutdown,
    Describe(&'a str),
    Stop(&'a str),
    Save(&'a str),
    Delete(&'a str),
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let route = match segments.as_slice() {
            ["create-instance"] => Route::CreateInstance,
            ["instances"] => Route::Instances,
            ["wipe"] => Route::Wipe,
            ["shutdown"] => Route::Shutdown,
            ["instance", id] if !id.is_empty() => Route::Describe(id),
            ["instance", id, "stop"] if !id.is_empty() => Route::Stop(id),
            ["instance", id, "save"] if !id.is_empty() => Route::Save(id),
            ["instance", id, "delete"] if !id.is_empty() => Route::Delete(id),
            _ => return None,
        };
        Some(route)
    }

    fn method(&self) -> Method {
        match self {
            Route::Instances | Route::Describe(_) => Method::GET,
            _ => Method::POST,
        }
    }
}

/// `autostart=true` (or `1`) anywhere in the query string
fn wants_autostart(uri: &Uri) -> bool {
    uri.query()
        .map(|query| {
            query.split('&').any(|pair| {
                matches!(
                    pair.split_once('='),
                    Some(("autostart", "true")) | Some(("autostart", "1"))
                )
            })
        })
        .unwrap_or(false)
}

/// Flatten a JSON object of scalars into a config mapping
fn parse_config_body(body: &[u8]) -> Result<BTreeMap<String, String>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| SkymountError::InvalidConfig(format!("body is not JSON: {}", e)))?;
    let Value::Object(object) = value else {
        return Err(SkymountError::InvalidConfig(
            "body must be a JSON object".to_string(),
        ));
    };

    let mut values = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(SkymountError::CorruptedConfig(format!(
                    "{} must be a scalar",
                    key
                )))
            }
        };
        values.insert(key, text);
    }
    Ok(values)
}

/// Request dispatcher shared by every connection
pub struct ControlApi {
    manager: Arc<InstanceManager>,
    shutdown: Arc<Notify>,
}

impl ControlApi {
    pub fn new(manager: Arc<InstanceManager>, shutdown: Arc<Notify>) -> Self {
        Self { manager, shutdown }
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Signal fired by `/shutdown`
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn handle(
        &self,
        method: &Method,
        uri: &Uri,
        peer: SocketAddr,
        body: &[u8],
    ) -> ControlResponse {
        debug!("{} {} from {}", method, uri, peer);

        if !peer.ip().is_loopback() {
            warn!("Rejected control request from {}", peer);
            return ControlResponse::text(StatusCode::FORBIDDEN, "Forbidden");
        }

        let Some(route) = Route::parse(uri.path()) else {
            return ControlResponse::text(StatusCode::NOT_FOUND, "Not Found");
        };
        if *method != route.method() {
            return ControlResponse::text(StatusCode::METHOD_NOT_ALLOWED, "Invalid Method");
        }

        let result = match route {
            Route::CreateInstance => self.create(body).await,
            Route::Stop(id) => self.manager.stop(id).await.map(|()| id.to_string()),
            Route::Save(id) => self
                .manager
                .save(id, wants_autostart(uri))
                .map(|()| id.to_string()),
            Route::Delete(id) => self.manager.delete(id).await.map(|()| id.to_string()),
            Route::Describe(id) => return self.describe(id),
            Route::Instances => Ok(self.manager.list_all().join("\n")),
            Route::Wipe => Ok(self.manager.stop_all().await.to_string()),
            Route::Shutdown => {
                info!("Shutdown requested over control API");
                self.shutdown.notify_one();
                Ok("bye".to_string())
            }
        };

        match result {
            Ok(body) => ControlResponse::ok(body),
            Err(e) => {
                debug!("{} {} failed: {}", method, uri.path(), e);
                ControlResponse::failure(&e)
            }
        }
    }

    async fn create(&self, body: &[u8]) -> Result<String> {
        let values = parse_config_body(body)?;
        let config = InstanceConfig::from_map(&values)?;
        self.manager.create(config).await
    }

    fn describe(&self, id: &str) -> ControlResponse {
        let description = match self.manager.describe(id) {
            Ok(description) => description,
            Err(e) => return ControlResponse::failure(&e),
        };
        match serde_json::to_string(&description) {
            Ok(body) => ControlResponse {
                status: StatusCode::OK,
                content_type: JSON,
                body,
            },
            Err(e) => ControlResponse::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error: {}", e),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceSettings;
    use crate::instance::InstanceStore;
    use crate::mount::{ActiveMount, MountDriver};
    use crate::router::OperationRouter;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct DetachedDriver;

    impl MountDriver for DetachedDriver {
        fn mount(&self, _router: Arc<OperationRouter>, mount_point: &Path) -> Result<ActiveMount> {
            Ok(ActiveMount::detached(mount_point.to_path_buf()))
        }
    }

    fn api(dir: &TempDir) -> ControlApi {
        let settings = InstanceSettings {
            startup_grace: Duration::from_millis(100),
            ..InstanceSettings::default()
        };
        let manager = InstanceManager::new(
            InstanceStore::new(dir.path().join("state")),
            Arc::new(DetachedDriver),
            settings,
        );
        ControlApi::new(Arc::new(manager), Arc::new(Notify::new()))
    }

    fn local() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn call(api: &ControlApi, method: Method, uri: &str, body: &str) -> ControlResponse {
        let uri: Uri = uri.parse().unwrap();
        api.handle(&method, &uri, local(), body.as_bytes()).await
    }

    fn create_body(dir: &TempDir) -> String {
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        serde_json::json!({
            "method": "clone",
            "remotePath": root.to_string_lossy(),
            "mountPath": dir.path().join("mnt").to_string_lossy(),
            "port": 22,
            "isKeyAuth": false,
        })
        .to_string()
    }

    #[test]
    fn test_route_parse() {
        assert_eq!(Route::parse("/instances"), Some(Route::Instances));
        assert_eq!(Route::parse("/instance/ab12/"), Some(Route::Describe("ab12")));
        assert_eq!(Route::parse("/instance/ab12/save"), Some(Route::Save("ab12")));
        assert_eq!(Route::parse("/instance//stop"), None);
        assert_eq!(Route::parse("/instance/a/b/c"), None);
        assert_eq!(Route::parse("/"), None);
    }

    #[test]
    fn test_wants_autostart() {
        let yes: Uri = "/instance/x/save?autostart=true".parse().unwrap();
        let no: Uri = "/instance/x/save?autostart=false".parse().unwrap();
        let bare: Uri = "/instance/x/save".parse().unwrap();
        assert!(wants_autostart(&yes));
        assert!(!wants_autostart(&no));
        assert!(!wants_autostart(&bare));
    }

    #[test]
    fn test_parse_config_body() {
        let values = parse_config_body(br#"{"port": 2222, "isKeyAuth": true, "x": null}"#).unwrap();
        assert_eq!(values["port"], "2222");
        assert_eq!(values["isKeyAuth"], "true");
        assert!(!values.contains_key("x"));

        assert_eq!(parse_config_body(b"[1]").unwrap_err().code(), "InvalidConfig");
        assert_eq!(
            parse_config_body(br#"{"a": [1]}"#).unwrap_err().code(),
            "CorruptedConfig"
        );
    }

    #[tokio::test]
    async fn test_rejects_remote_peers() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir);
        let uri: Uri = "/instances".parse().unwrap();
        let peer: SocketAddr = "10.0.0.5:4000".parse().unwrap();

        let response = api.handle(&Method::GET, &uri, peer, b"").await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_method_and_path_errors() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir);

        let response = call(&api, Method::POST, "/instances", "").await;
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.body, "Invalid Method");

        let response = call(&api, Method::GET, "/nowhere", "").await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_failures() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir);

        let response = call(&api, Method::POST, "/create-instance", r#"{"method": "ftp"}"#).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert!(response.body.starts_with("UnknownMethod"));

        let response = call(&api, Method::POST, "/create-instance", r#"{"method": "local"}"#).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert!(response.body.starts_with("InvalidConfig"));

        let body = serde_json::json!({
            "method": "local",
            "root": dir.path().join("absent").to_string_lossy(),
            "mount_point": "/mnt/x",
        })
        .to_string();
        let response = call(&api, Method::POST, "/create-instance", &body).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.body.starts_with("Unable2Start: "));
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir);

        let response = call(&api, Method::POST, "/create-instance", &create_body(&dir)).await;
        assert_eq!(response.status, StatusCode::OK, "{}", response.body);
        let id = response.body.clone();

        let response = call(&api, Method::POST, "/create-instance", &create_body(&dir)).await;
        assert!(response.body.starts_with("AlreadyExists"));

        let response = call(&api, Method::GET, "/instances", "").await;
        assert_eq!(response.body, id);

        let response = call(&api, Method::GET, &format!("/instance/{}", id), "").await;
        assert_eq!(response.content_type, JSON);
        let described: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(described["status"], "healthy");
        assert_eq!(described["config"]["label"], "mnt");

        let save = format!("/instance/{}/save?autostart=true", id);
        assert_eq!(call(&api, Method::POST, &save, "").await.body, id);

        let stop = format!("/instance/{}/stop", id);
        assert_eq!(call(&api, Method::POST, &stop, "").await.body, id);
        let response = call(&api, Method::POST, &stop, "").await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert!(response.body.starts_with("NotFound"));

        // Persisted record keeps it listed
        assert_eq!(call(&api, Method::GET, "/instances", "").await.body, id);

        let delete = format!("/instance/{}/delete", id);
        assert_eq!(call(&api, Method::POST, &delete, "").await.body, id);
        assert_eq!(call(&api, Method::GET, "/instances", "").await.body, "");
    }

    #[tokio::test]
    async fn test_wipe_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir);
        call(&api, Method::POST, "/create-instance", &create_body(&dir)).await;

        assert_eq!(call(&api, Method::POST, "/wipe", "").await.body, "1");
        assert_eq!(call(&api, Method::POST, "/wipe", "").await.body, "0");

        let signal = api.shutdown_signal();
        assert_eq!(call(&api, Method::POST, "/shutdown", "").await.body, "bye");
        tokio::time::timeout(Duration::from_secs(1), signal.notified())
            .await
            .unwrap();
    }
}
