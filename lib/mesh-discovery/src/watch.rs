//! Watch-based discovery of peer nodes
//!
//! Push-style alternative to pure polling: peer nodes advertise their
//! discovery locator in a shared index-based store under a common
//! namespace, each entry guarded by a time-to-live. This component
//! keeps a long-lived watch on that namespace and feeds the changes
//! into a [`DiscoveryPoller`] as source add/remove operations, while a
//! second task periodically refreshes the local node's own
//! advertisement before its lease expires.
//!
//! When a watch cannot be armed or handled, the component falls back to
//! a full re-listing after a short delay instead of tight-looping the
//! watch call; a long disconnection therefore costs one snapshot, not
//! an unbounded replay.

use crate::poller::DiscoveryPoller;
use crate::store::{Listing, WatchAction, WatchEvent, WatchStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Bounded wait for the background tasks to finish during close.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);
/// Base delay before re-initializing after a watch failure.
const REINIT_DELAY: Duration = Duration::from_secs(1);
/// Slack subtracted from the lease TTL to get the refresh period.
const LEASE_REFRESH_SLACK: Duration = Duration::from_secs(5);

/// Watch discovery configuration
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Store namespace the peer advertisements live under
    pub namespace: String,
    /// Id of the local node
    pub node_id: String,
    /// Discovery locator advertised for the local node
    pub local_url: String,
    /// Lease time-to-live for the local advertisement
    pub ttl: Duration,
}

impl WatchConfig {
    fn local_key(&self) -> String {
        if self.namespace.ends_with('/') {
            format!("{}{}", self.namespace, self.node_id)
        } else {
            format!("{}/{}", self.namespace, self.node_id)
        }
    }
}

/// The JSON value stored per node advertisement.
#[derive(Serialize, Deserialize)]
struct Advertisement {
    url: String,
}

struct WatchInner {
    store: Arc<dyn WatchStore>,
    poller: Arc<DiscoveryPoller>,
    config: WatchConfig,
    local_key: String,
}

/// Watch-based peer discovery with leased self-registration.
pub struct WatchDiscovery {
    inner: Arc<WatchInner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WatchDiscovery {
    /// Start watching `config.namespace` and advertising the local
    /// node. Discovered peers become sources of `poller`.
    pub fn new(
        store: Arc<dyn WatchStore>,
        poller: Arc<DiscoveryPoller>,
        config: WatchConfig,
    ) -> Self {
        let local_key = config.local_key();
        let inner = Arc::new(WatchInner {
            store,
            poller,
            config,
            local_key,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let watch_inner = Arc::clone(&inner);
        let watch_shutdown = shutdown_rx.clone();
        let watch_task = tokio::spawn(async move {
            watch_inner.watch_loop(watch_shutdown).await;
        });

        let lease_inner = Arc::clone(&inner);
        let lease_task = tokio::spawn(async move {
            lease_inner.lease_loop(shutdown_rx).await;
        });

        Self {
            inner,
            shutdown,
            tasks: Mutex::new(vec![watch_task, lease_task]),
            closed: AtomicBool::new(false),
        }
    }

    /// Stop both background tasks and delete the local advertisement so
    /// peers see the departure immediately instead of waiting for the
    /// lease to expire. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        for mut handle in self.tasks.lock().await.drain(..) {
            if tokio::time::timeout(SHUTDOWN_WAIT, &mut handle).await.is_err() {
                warn!("Watch task did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
        if let Err(e) = self.inner.store.delete(&self.inner.local_key).await {
            error!("Deregistration failed: {}", e);
        }
    }
}

impl WatchInner {
    async fn watch_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let index = self.initialize().await;
            let mut next = index + 1;
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => return,
                    result = self.store.watch(&self.config.namespace, next) => result,
                };
                match event {
                    Ok(event) => {
                        next = event.index + 1;
                        self.handle_event(event).await;
                    }
                    Err(e) => {
                        warn!("Watch failed, re-initializing: {}", e);
                        break;
                    }
                }
            }
            // Re-list instead of re-watching; a jittered delay keeps a
            // flapping store from being hammered by every peer at once.
            let jitter = rand::thread_rng().gen_range(0..250);
            let delay = REINIT_DELAY + Duration::from_millis(jitter);
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Take a full snapshot of the namespace and replace the poller's
    /// source set with it. Returns the index to arm the watch from.
    async fn initialize(&self) -> u64 {
        match self.store.list(&self.config.namespace).await {
            Ok(listing) => {
                let index = listing.watch_index();
                debug!("Initializing peer sources at store index {}", index);
                let sources = self.sources_from(&listing);
                self.poller.set_sources(&sources).await;
                index
            }
            Err(e) => {
                error!("Could not initialize peer discovery sources: {}", e);
                0
            }
        }
    }

    fn sources_from(&self, listing: &Listing) -> HashMap<String, String> {
        let mut sources = HashMap::new();
        for entry in &listing.entries {
            if entry.key == self.local_key {
                debug!("Skipping local advertisement {}", entry.key);
                continue;
            }
            match serde_json::from_str::<Advertisement>(&entry.value) {
                Ok(ad) => {
                    sources.insert(entry.key.clone(), ad.url);
                }
                Err(e) => warn!("Ignoring unreadable advertisement {}: {}", entry.key, e),
            }
        }
        sources
    }

    async fn handle_event(&self, event: WatchEvent) {
        debug!("Handling peer change at store index {}", event.index);
        if event.key == self.local_key {
            return;
        }
        match event.action {
            WatchAction::Set => {
                let value = match &event.value {
                    Some(value) => value,
                    None => {
                        warn!("Set event without value for {}", event.key);
                        return;
                    }
                };
                let changed = event
                    .prev_value
                    .as_ref()
                    .map(|prev| prev != value)
                    .unwrap_or(false);
                if changed {
                    self.poller.remove_source(&event.key).await;
                }
                if event.prev_value.is_none() || changed {
                    match serde_json::from_str::<Advertisement>(value) {
                        Ok(ad) => self.poller.add_source(&event.key, &ad.url).await,
                        Err(e) => {
                            warn!("Ignoring unreadable advertisement {}: {}", event.key, e)
                        }
                    }
                }
            }
            WatchAction::Delete | WatchAction::Expire => {
                self.poller.remove_source(&event.key).await;
            }
        }
    }

    async fn lease_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let period = std::cmp::max(
            self.config.ttl.saturating_sub(LEASE_REFRESH_SLACK),
            Duration::from_secs(1),
        );
        let value = match serde_json::to_string(&Advertisement {
            url: self.config.local_url.clone(),
        }) {
            Ok(value) => value,
            Err(e) => {
                error!("Could not encode local advertisement: {}", e);
                return;
            }
        };
        loop {
            match self
                .store
                .put(&self.local_key, &value, self.config.ttl)
                .await
            {
                Ok(()) => debug!("Refreshed advertisement {}", self.local_key),
                Err(e) => error!("Advertisement refresh failed: {}", e),
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(period) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;
    use crate::fetch::{FetchOutcome, Fetcher};
    use crate::poller::PollerConfig;
    use crate::store::StoreEntry;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use mesh_core::{EndpointDescription, EndpointListener};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct SilentFetcher;

    #[async_trait]
    impl Fetcher for SilentFetcher {
        async fn fetch(&self, _: &str, _: Option<DateTime<Utc>>) -> FetchOutcome {
            FetchOutcome::NotModified
        }
    }

    struct SilentListener;

    impl EndpointListener for SilentListener {
        fn endpoint_added(&self, _: &EndpointDescription) {}
        fn endpoint_removed(&self, _: &EndpointDescription) {}
    }

    #[derive(Default)]
    struct MockStore {
        listings: StdMutex<VecDeque<Result<Listing, DiscoveryError>>>,
        watches: StdMutex<VecDeque<Result<WatchEvent, DiscoveryError>>>,
        list_count: StdMutex<u32>,
        watch_indices: StdMutex<Vec<u64>>,
        puts: StdMutex<Vec<(String, String, Duration)>>,
        deletes: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl WatchStore for MockStore {
        async fn list(&self, _namespace: &str) -> Result<Listing, DiscoveryError> {
            *self.list_count.lock().unwrap() += 1;
            self.listings
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Listing::default()))
        }

        async fn watch(&self, _namespace: &str, since: u64) -> Result<WatchEvent, DiscoveryError> {
            self.watch_indices.lock().unwrap().push(since);
            let next = self.watches.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                // Out of script: block like a quiet store would.
                None => std::future::pending().await,
            }
        }

        async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DiscoveryError> {
            self.puts
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string(), ttl));
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), DiscoveryError> {
            self.deletes.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    fn test_poller() -> Arc<DiscoveryPoller> {
        Arc::new(DiscoveryPoller::new(
            Arc::new(SilentFetcher),
            Arc::new(SilentListener),
            PollerConfig::default(),
        ))
    }

    fn test_config() -> WatchConfig {
        WatchConfig {
            namespace: "/mesh/nodes".to_string(),
            node_id: "local".to_string(),
            local_url: "http://local:8080/endpoints".to_string(),
            ttl: Duration::from_secs(60),
        }
    }

    fn inner(store: Arc<MockStore>, poller: Arc<DiscoveryPoller>) -> WatchInner {
        let config = test_config();
        let local_key = config.local_key();
        WatchInner {
            store,
            poller,
            config,
            local_key,
        }
    }

    fn entry(key: &str, url: &str, index: u64) -> StoreEntry {
        StoreEntry {
            key: key.to_string(),
            value: format!(r#"{{"url":"{}"}}"#, url),
            modified_index: index,
        }
    }

    fn set_event(key: &str, url: &str, prev: Option<&str>, index: u64) -> WatchEvent {
        WatchEvent {
            action: WatchAction::Set,
            key: key.to_string(),
            value: Some(format!(r#"{{"url":"{}"}}"#, url)),
            prev_value: prev.map(|p| format!(r#"{{"url":"{}"}}"#, p)),
            index,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_snapshots_peers_and_skips_local_node() {
        let store = Arc::new(MockStore::default());
        let poller = test_poller();
        store.listings.lock().unwrap().push_back(Ok(Listing {
            entries: vec![
                entry("/mesh/nodes/n1", "http://n1:8080/endpoints", 3),
                entry("/mesh/nodes/local", "http://local:8080/endpoints", 4),
                entry("/mesh/nodes/n2", "http://n2:8080/endpoints", 7),
            ],
            index: Some(7),
        }));

        let inner = inner(Arc::clone(&store), Arc::clone(&poller));
        let index = inner.initialize().await;

        assert_eq!(index, 7);
        let sources = poller.sources().await;
        assert_eq!(sources.len(), 2);
        assert_eq!(
            sources.get("/mesh/nodes/n1"),
            Some(&"http://n1:8080/endpoints".to_string())
        );
        assert_eq!(
            sources.get("/mesh/nodes/n2"),
            Some(&"http://n2:8080/endpoints".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_event_adds_new_peer() {
        let store = Arc::new(MockStore::default());
        let poller = test_poller();
        let inner = inner(store, Arc::clone(&poller));

        inner
            .handle_event(set_event("/mesh/nodes/n1", "http://n1:8080/endpoints", None, 5))
            .await;

        assert_eq!(
            poller.sources().await.get("/mesh/nodes/n1"),
            Some(&"http://n1:8080/endpoints".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_event_with_changed_value_replaces_peer() {
        let store = Arc::new(MockStore::default());
        let poller = test_poller();
        let inner = inner(store, Arc::clone(&poller));

        inner
            .handle_event(set_event("/mesh/nodes/n1", "http://old:8080/endpoints", None, 5))
            .await;
        inner
            .handle_event(set_event(
                "/mesh/nodes/n1",
                "http://new:8080/endpoints",
                Some("http://old:8080/endpoints"),
                6,
            ))
            .await;

        let sources = poller.sources().await;
        assert_eq!(sources.len(), 1);
        assert_eq!(
            sources.get("/mesh/nodes/n1"),
            Some(&"http://new:8080/endpoints".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_event_with_unchanged_value_is_noop() {
        let store = Arc::new(MockStore::default());
        let poller = test_poller();
        let inner = inner(store, Arc::clone(&poller));

        inner
            .handle_event(set_event("/mesh/nodes/n1", "http://n1:8080/endpoints", None, 5))
            .await;
        inner
            .handle_event(set_event(
                "/mesh/nodes/n1",
                "http://n1:8080/endpoints",
                Some("http://n1:8080/endpoints"),
                6,
            ))
            .await;

        assert_eq!(poller.sources().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_removes_peer_but_never_local_node() {
        let store = Arc::new(MockStore::default());
        let poller = test_poller();
        let inner = inner(store, Arc::clone(&poller));

        inner
            .handle_event(set_event("/mesh/nodes/n1", "http://n1:8080/endpoints", None, 5))
            .await;
        inner
            .handle_event(WatchEvent {
                action: WatchAction::Expire,
                key: "/mesh/nodes/local".to_string(),
                value: None,
                prev_value: Some(r#"{"url":"http://local:8080/endpoints"}"#.to_string()),
                index: 6,
            })
            .await;
        assert_eq!(poller.sources().await.len(), 1);

        inner
            .handle_event(WatchEvent {
                action: WatchAction::Expire,
                key: "/mesh/nodes/n1".to_string(),
                value: None,
                prev_value: Some(r#"{"url":"http://n1:8080/endpoints"}"#.to_string()),
                index: 7,
            })
            .await;
        assert!(poller.sources().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_rearms_after_each_event_and_reinits_on_failure() {
        let store = Arc::new(MockStore::default());
        let poller = test_poller();

        store.listings.lock().unwrap().push_back(Ok(Listing {
            entries: Vec::new(),
            index: Some(10),
        }));
        store
            .watches
            .lock()
            .unwrap()
            .push_back(Ok(set_event("/mesh/nodes/n1", "http://n1:8080/endpoints", None, 12)));
        store
            .watches
            .lock()
            .unwrap()
            .push_back(Err(DiscoveryError::InvalidResponse("boom".to_string())));
        store.listings.lock().unwrap().push_back(Ok(Listing {
            entries: vec![entry("/mesh/nodes/n1", "http://n1:8080/endpoints", 12)],
            index: Some(12),
        }));

        let discovery = WatchDiscovery::new(store.clone(), Arc::clone(&poller), test_config());

        // Let the watch task run through: init, event, failure, re-init.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if *store.list_count.lock().unwrap() >= 2 {
                break;
            }
        }

        assert_eq!(*store.list_count.lock().unwrap(), 2);
        let indices = store.watch_indices.lock().unwrap().clone();
        // First armed after the listing index, then after the event.
        assert_eq!(&indices[..2], &[11, 13]);
        assert_eq!(poller.sources().await.len(), 1);

        discovery.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_refreshes_before_ttl_and_deletes_on_close() {
        let store = Arc::new(MockStore::default());
        let poller = test_poller();
        let discovery = WatchDiscovery::new(store.clone(), poller, test_config());

        // Refresh period is ttl - 5s = 55s; two refreshes within 60s.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let puts = store.puts.lock().unwrap().clone();
        assert!(puts.len() >= 2, "expected at least two refreshes, got {}", puts.len());
        assert_eq!(puts[0].0, "/mesh/nodes/local");
        assert_eq!(puts[0].1, r#"{"url":"http://local:8080/endpoints"}"#);
        assert_eq!(puts[0].2, Duration::from_secs(60));

        discovery.close().await;
        assert_eq!(
            store.deletes.lock().unwrap().clone(),
            vec!["/mesh/nodes/local".to_string()]
        );

        // Close is idempotent and does not double-delete.
        discovery.close().await;
        assert_eq!(store.deletes.lock().unwrap().len(), 1);
    }
}
