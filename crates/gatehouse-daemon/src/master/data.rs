//! Bridge from the config store to the worker pool.
//!
//! Watch events arrive as raw key/value pairs; this module parses them
//! into typed changes and fans them out through [`WorkerPool::apply`].
//! Keys follow `<profession>/<name>`, and the JSON body names its
//! driver in a top-level `driver` field. Entries that do not parse are
//! logged and dropped rather than pushed half-formed.
//!
//! Every node pushes to its own local workers regardless of leadership;
//! the leader flag only feeds the status surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use gatehouse_core::push::{DeleteRequest, SetRequest};
use gatehouse_core::store::{LeaderHandler, WatchHandler};

use super::workers::{Change, WorkerPool};

/// Applies store events to the local worker pool.
pub struct DataController {
    pool: Arc<WorkerPool>,
    leading: AtomicBool,
}

impl DataController {
    /// Wraps the pool; leadership starts unknown (false).
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            leading: AtomicBool::new(false),
        }
    }

    /// Whether this node currently holds a leadership term.
    #[must_use]
    pub fn is_leading(&self) -> bool {
        self.leading.load(Ordering::Relaxed)
    }

    async fn apply_put(&self, key: &str, value: &[u8]) {
        let Some((profession, name)) = split_key(key) else {
            warn!(key, "ignoring entry without a profession/name key");
            return;
        };
        let Some(driver) = driver_from_body(value) else {
            warn!(key, "ignoring entry whose body names no driver");
            return;
        };
        self.push(Change::Set(SetRequest {
            id: key.to_string(),
            profession: profession.to_string(),
            name: name.to_string(),
            driver,
            body: value.to_vec(),
        }))
        .await;
    }

    async fn push(&self, change: Change) {
        let id = change.id().to_string();
        match self.pool.apply(change).await {
            Ok(summary) => info!(
                id,
                applied = summary.applied,
                skipped = summary.skipped,
                failed = summary.failed,
                "change pushed"
            ),
            Err(err) => warn!(id, error = %err, "change not applied"),
        }
    }
}

#[async_trait]
impl WatchHandler for DataController {
    async fn on_put(&self, key: &str, value: &[u8]) {
        self.apply_put(key, value).await;
    }

    async fn on_delete(&self, key: &str) {
        self.push(Change::Delete(DeleteRequest {
            id: key.to_string(),
        }))
        .await;
    }

    async fn on_reset(&self, all: &[(String, Vec<u8>)]) {
        info!(entries = all.len(), "replaying configuration snapshot");
        for (key, value) in all {
            self.apply_put(key, value).await;
        }
    }
}

#[async_trait]
impl LeaderHandler for DataController {
    async fn on_leader(&self) {
        self.leading.store(true, Ordering::Relaxed);
        info!("assumed config store leadership");
    }
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    let (profession, name) = key.split_once('/')?;
    if profession.is_empty() || name.is_empty() {
        return None;
    }
    Some((profession, name))
}

fn driver_from_body(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get("driver")?.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use gatehouse_core::config::NodeConfig;
    use gatehouse_core::push::{
        DeleteResponse, HelloRequest, HelloResponse, PushError, RefreshRequest, RefreshResponse,
        SetResponse,
    };
    use gatehouse_core::store::{ConfigStore, MemoryStore};

    use super::super::workers::PushClient;
    use super::*;

    #[derive(Default)]
    struct RecordingClient {
        sets: Mutex<Vec<SetRequest>>,
        deletes: Mutex<Vec<DeleteRequest>>,
    }

    #[async_trait]
    impl PushClient for RecordingClient {
        async fn ping(
            &self,
            _socket: &Path,
            request: HelloRequest,
        ) -> Result<HelloResponse, PushError> {
            Ok(HelloResponse::echo(&request, Vec::new()))
        }

        async fn set_check(
            &self,
            _socket: &Path,
            _request: SetRequest,
        ) -> Result<SetResponse, PushError> {
            Ok(SetResponse::success(Vec::new()))
        }

        async fn set(
            &self,
            _socket: &Path,
            request: SetRequest,
        ) -> Result<SetResponse, PushError> {
            self.sets.lock().unwrap().push(request);
            Ok(SetResponse::success(Vec::new()))
        }

        async fn delete_check(
            &self,
            _socket: &Path,
            _request: DeleteRequest,
        ) -> Result<DeleteResponse, PushError> {
            Ok(DeleteResponse::success(Vec::new()))
        }

        async fn delete(
            &self,
            _socket: &Path,
            request: DeleteRequest,
        ) -> Result<DeleteResponse, PushError> {
            self.deletes.lock().unwrap().push(request);
            Ok(DeleteResponse::success(Vec::new()))
        }

        async fn refresh(
            &self,
            _socket: &Path,
            _request: RefreshRequest,
        ) -> Result<RefreshResponse, PushError> {
            Ok(RefreshResponse::success())
        }
    }

    fn controller_with(
        client: Arc<RecordingClient>,
    ) -> (Arc<DataController>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.workers.count = 2;
        config.workers.base_port = 18200;
        config.socket_dir = dir.path().to_path_buf();
        let pool = Arc::new(WorkerPool::with_client(
            Arc::new(config),
            PathBuf::from("gatehouse.toml"),
            0,
            client,
        ));
        (Arc::new(DataController::new(pool)), dir)
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("router/api"), Some(("router", "api")));
        assert_eq!(split_key("router/api/v2"), Some(("router", "api/v2")));
        assert_eq!(split_key("no-slash"), None);
        assert_eq!(split_key("/name"), None);
        assert_eq!(split_key("router/"), None);
    }

    #[test]
    fn test_driver_from_body() {
        assert_eq!(
            driver_from_body(br#"{"driver":"http","listen":":80"}"#),
            Some("http".to_string())
        );
        assert_eq!(driver_from_body(br#"{"listen":":80"}"#), None);
        assert_eq!(driver_from_body(b"not json"), None);
        assert_eq!(driver_from_body(br#"{"driver":7}"#), None);
    }

    #[tokio::test]
    async fn test_store_put_reaches_every_worker() {
        let client = Arc::new(RecordingClient::default());
        let (controller, _dir) = controller_with(Arc::clone(&client));

        let store = MemoryStore::new();
        store
            .watch("", Arc::clone(&controller) as Arc<dyn WatchHandler>)
            .await
            .unwrap();
        store
            .put(
                "router/api",
                br#"{"driver":"http","listen":"0.0.0.0:8088"}"#.to_vec(),
            )
            .await
            .unwrap();

        let sets = client.sets.lock().unwrap().clone();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].id, "router/api");
        assert_eq!(sets[0].profession, "router");
        assert_eq!(sets[0].name, "api");
        assert_eq!(sets[0].driver, "http");
    }

    #[tokio::test]
    async fn test_store_delete_reaches_every_worker() {
        let client = Arc::new(RecordingClient::default());
        let (controller, _dir) = controller_with(Arc::clone(&client));

        let store = MemoryStore::new();
        store
            .put("auth/users", br#"{"driver":"basic"}"#.to_vec())
            .await
            .unwrap();
        store
            .watch("", Arc::clone(&controller) as Arc<dyn WatchHandler>)
            .await
            .unwrap();
        store.delete("auth/users").await.unwrap();

        let deletes = client.deletes.lock().unwrap().clone();
        assert_eq!(deletes.len(), 2);
        assert!(deletes.iter().all(|request| request.id == "auth/users"));
    }

    #[tokio::test]
    async fn test_watch_establishment_replays_existing_entries() {
        let client = Arc::new(RecordingClient::default());
        let (controller, _dir) = controller_with(Arc::clone(&client));

        let store = MemoryStore::new();
        store
            .put("router/api", br#"{"driver":"http"}"#.to_vec())
            .await
            .unwrap();
        store
            .put("auth/users", br#"{"driver":"basic"}"#.to_vec())
            .await
            .unwrap();
        store
            .watch("", Arc::clone(&controller) as Arc<dyn WatchHandler>)
            .await
            .unwrap();

        let sets = client.sets.lock().unwrap().clone();
        let mut ids: Vec<String> = sets.iter().map(|request| request.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids, vec!["auth/users".to_string(), "router/api".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_dropped() {
        let client = Arc::new(RecordingClient::default());
        let (controller, _dir) = controller_with(Arc::clone(&client));

        controller.on_put("no-slash-key", br#"{"driver":"http"}"#).await;
        controller.on_put("router/api", b"not json at all").await;

        assert!(client.sets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leadership_term_flips_the_flag() {
        let client = Arc::new(RecordingClient::default());
        let (controller, _dir) = controller_with(client);
        assert!(!controller.is_leading());

        let store = MemoryStore::new();
        store
            .handle_leader(Arc::clone(&controller) as Arc<dyn LeaderHandler>)
            .await;
        assert!(controller.is_leading());
    }
}
