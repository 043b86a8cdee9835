//! Polling discovery of remote endpoints
//!
//! The poller owns a dynamic set of discovery sources and runs one
//! fixed-period background cycle that conditionally fetches every
//! source and diffs the listing against what the source announced
//! before. Removals for a cycle are always delivered before that
//! cycle's adds, and every endpoint of a modified listing is
//! re-announced so consumers can treat adds as upserts.

use crate::fetch::{FetchOutcome, Fetcher};
use mesh_core::{EndpointDescription, EndpointListener};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bounded wait for the background cycle to finish during close.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

/// Poller configuration
#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Interval between fetch-and-diff cycles
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

struct SourceState {
    locator: String,
    modified_since: Option<DateTime<Utc>>,
    current: Vec<EndpointDescription>,
}

struct PollerInner {
    sources: Mutex<HashMap<String, SourceState>>,
    fetcher: Arc<dyn Fetcher>,
    listener: Arc<dyn EndpointListener>,
    closed: AtomicBool,
}

/// Polling discovery over a dynamic set of sources.
pub struct DiscoveryPoller {
    inner: Arc<PollerInner>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryPoller {
    /// Create a poller and start its background cycle.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        listener: Arc<dyn EndpointListener>,
        config: PollerConfig,
    ) -> Self {
        let inner = Arc::new(PollerInner {
            sources: Mutex::new(HashMap::new()),
            fetcher,
            listener,
            closed: AtomicBool::new(false),
        });

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let cycle_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(config.interval) => {
                        cycle_inner.run_cycle().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self {
            inner,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Add a discovery source.
    ///
    /// Any existing source with the same locator, or the same id under
    /// a different locator, is torn down first. A peer that crashed and
    /// restarted must not leave a stale source behind that would later
    /// revoke the restarted peer's endpoints.
    pub async fn add_source(&self, id: &str, locator: &str) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut sources = self.inner.sources.lock().await;
        self.inner.add_locked(&mut sources, id, locator);
    }

    /// Replace the whole source set.
    ///
    /// Sources absent from `new_sources` are removed, unknown ids are
    /// added, unchanged entries keep their state untouched.
    pub async fn set_sources(&self, new_sources: &HashMap<String, String>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut sources = self.inner.sources.lock().await;
        let removed: Vec<String> = sources
            .keys()
            .filter(|id| !new_sources.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            self.inner.remove_locked(&mut sources, &id);
        }
        for (id, locator) in new_sources {
            if !sources.contains_key(id) {
                self.inner.add_locked(&mut sources, id, locator);
            }
        }
    }

    /// Remove a discovery source, announcing the removal of every
    /// endpoint it currently advertises. No-op for an unknown id.
    pub async fn remove_source(&self, id: &str) {
        let mut sources = self.inner.sources.lock().await;
        self.inner.remove_locked(&mut sources, id);
    }

    /// Ids of the currently configured sources.
    pub async fn source_ids(&self) -> Vec<String> {
        let sources = self.inner.sources.lock().await;
        let mut ids: Vec<String> = sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The currently configured sources as an id-to-locator map.
    pub async fn sources(&self) -> HashMap<String, String> {
        let sources = self.inner.sources.lock().await;
        sources
            .iter()
            .map(|(id, state)| (id.clone(), state.locator.clone()))
            .collect()
    }

    /// Run one fetch-and-diff cycle immediately.
    pub async fn poll_once(&self) {
        self.inner.run_cycle().await;
    }

    /// Stop the background cycle and announce the removal of every
    /// known endpoint. Idempotent; no events fire after this returns.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Some(mut handle) = self.task.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_WAIT, &mut handle).await.is_err() {
                warn!("Discovery cycle did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }

        let mut sources = self.inner.sources.lock().await;
        for (id, state) in sources.drain() {
            debug!("Closing discovery source: {}", id);
            for endpoint in &state.current {
                self.inner.listener.endpoint_removed(endpoint);
            }
        }
    }
}

impl PollerInner {
    async fn run_cycle(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut sources = self.sources.lock().await;
        debug!("Start updating {} discovery sources", sources.len());
        for (id, state) in sources.iter_mut() {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let outcome = self.fetcher.fetch(&state.locator, state.modified_since).await;
            match outcome {
                FetchOutcome::NotModified => {
                    debug!("Source {} not modified", id);
                }
                FetchOutcome::Modified {
                    endpoints,
                    modified,
                } => {
                    state.modified_since = modified;
                    Self::apply_listing(state, endpoints, &*self.listener);
                }
                FetchOutcome::Failed { reason } => {
                    // Assume everything this source announced is gone and
                    // refetch unconditionally next cycle.
                    warn!("Fetch from source {} failed: {}", id, reason);
                    state.modified_since = None;
                    Self::apply_listing(state, Vec::new(), &*self.listener);
                }
            }
        }
        debug!("Done updating discovery sources");
    }

    /// Diff a fresh listing against the source's known endpoints.
    ///
    /// Removals go out first for endpoints that are no longer listed
    /// (by structural equality, so a property change counts as gone),
    /// then *every* endpoint of the new listing is announced. The
    /// re-announcement lets consumers distinguish "still alive" from
    /// "disappeared and came back" without extra bookkeeping.
    fn apply_listing(
        state: &mut SourceState,
        endpoints: Vec<EndpointDescription>,
        listener: &dyn EndpointListener,
    ) {
        for old in &state.current {
            if !endpoints.contains(old) {
                debug!("* removed: {}", old);
                listener.endpoint_removed(old);
            }
        }
        state.current = endpoints;
        for endpoint in &state.current {
            debug!("* added: {}", endpoint);
            listener.endpoint_added(endpoint);
        }
    }

    fn add_locked(&self, sources: &mut HashMap<String, SourceState>, id: &str, locator: &str) {
        debug!("Adding discovery source, id: {}, locator: {}", id, locator);

        let stale: Vec<String> = sources
            .iter()
            .filter(|(old_id, state)| {
                state.locator == locator || (old_id.as_str() == id && state.locator != locator)
            })
            .map(|(old_id, _)| old_id.clone())
            .collect();
        for old_id in stale {
            self.remove_locked(sources, &old_id);
        }

        sources.entry(id.to_string()).or_insert_with(|| SourceState {
            locator: locator.to_string(),
            modified_since: None,
            current: Vec::new(),
        });
    }

    fn remove_locked(&self, sources: &mut HashMap<String, SourceState>, id: &str) {
        if let Some(state) = sources.remove(id) {
            debug!("Removing discovery source id: {}", id);
            for endpoint in &state.current {
                self.listener.endpoint_removed(endpoint);
            }
        }
    }
}
