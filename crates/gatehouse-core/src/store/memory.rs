//! In-memory config store for single-node operation and tests.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::{ConfigStore, LeaderHandler, StoreError, WatchHandler};

/// A process-local [`ConfigStore`].
///
/// Always leader (there is no cluster to lose an election to). Watch
/// events are delivered inline: `put` returns only after every matching
/// handler has observed the event, which keeps single-node propagation
/// deterministic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    watchers: RwLock<Vec<(String, Arc<dyn WatchHandler>)>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn watchers_for(&self, key: &str) -> Vec<Arc<dyn WatchHandler>> {
        self.shared
            .watchers
            .read()
            .map(|watchers| {
                watchers
                    .iter()
                    .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn snapshot(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.shared
            .data
            .read()
            .map(|data| {
                data.iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        {
            let mut data = self
                .shared
                .data
                .write()
                .map_err(|_| StoreError::Closed)?;
            data.insert(key.to_string(), value.clone());
        }
        debug!(key, len = value.len(), "stored config entry");

        for handler in self.watchers_for(key) {
            handler.on_put(key, &value).await;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let existed = {
            let mut data = self
                .shared
                .data
                .write()
                .map_err(|_| StoreError::Closed)?;
            data.remove(key).is_some()
        };
        if !existed {
            return Ok(());
        }
        debug!(key, "removed config entry");

        for handler in self.watchers_for(key) {
            handler.on_delete(key).await;
        }
        Ok(())
    }

    fn is_leader(&self) -> bool {
        true
    }

    async fn watch(&self, prefix: &str, handler: Arc<dyn WatchHandler>) -> Result<(), StoreError> {
        let current = self.snapshot(prefix);
        handler.on_reset(&current).await;

        self.shared
            .watchers
            .write()
            .map_err(|_| StoreError::Closed)?
            .push((prefix.to_string(), handler));
        Ok(())
    }

    async fn handle_leader(&self, handler: Arc<dyn LeaderHandler>) {
        // Single eternal term: leadership is held from construction.
        handler.on_leader().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Put(String, Vec<u8>),
        Delete(String),
        Reset(Vec<String>),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WatchHandler for Recorder {
        async fn on_put(&self, key: &str, value: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Put(key.to_string(), value.to_vec()));
        }

        async fn on_delete(&self, key: &str) {
            self.events.lock().unwrap().push(Event::Delete(key.to_string()));
        }

        async fn on_reset(&self, all: &[(String, Vec<u8>)]) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Reset(all.iter().map(|(k, _)| k.clone()).collect()));
        }
    }

    #[tokio::test]
    async fn test_watch_delivers_reset_then_events() {
        let store = MemoryStore::new();
        store.put("/configs/auth/basic", b"a".to_vec()).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        store
            .watch("/configs/", Arc::clone(&recorder) as Arc<dyn WatchHandler>)
            .await
            .unwrap();

        store.put("/configs/router/http", b"b".to_vec()).await.unwrap();
        store.delete("/configs/auth/basic").await.unwrap();

        assert_eq!(
            recorder.events(),
            vec![
                Event::Reset(vec!["/configs/auth/basic".to_string()]),
                Event::Put("/configs/router/http".to_string(), b"b".to_vec()),
                Event::Delete("/configs/auth/basic".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        store
            .watch("/configs/", Arc::clone(&recorder) as Arc<dyn WatchHandler>)
            .await
            .unwrap();

        store.put("/nodes/1", b"x".to_vec()).await.unwrap();
        store.put("/configs/auth/basic", b"y".to_vec()).await.unwrap();

        assert_eq!(
            recorder.events(),
            vec![
                Event::Reset(Vec::new()),
                Event::Put("/configs/auth/basic".to_string(), b"y".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_of_absent_key_is_silent() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        store
            .watch("/", Arc::clone(&recorder) as Arc<dyn WatchHandler>)
            .await
            .unwrap();

        store.delete("/configs/missing").await.unwrap();
        assert_eq!(recorder.events(), vec![Event::Reset(Vec::new())]);
    }

    #[tokio::test]
    async fn test_leader_handler_runs_immediately() {
        struct Flag(Mutex<u32>);

        #[async_trait]
        impl LeaderHandler for Flag {
            async fn on_leader(&self) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let store = MemoryStore::new();
        assert!(store.is_leader());

        let flag = Arc::new(Flag(Mutex::new(0)));
        store.handle_leader(Arc::clone(&flag) as Arc<dyn LeaderHandler>).await;
        assert_eq!(*flag.0.lock().unwrap(), 1);
    }
}
