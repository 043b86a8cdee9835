//! Index-based watch store
//!
//! The watch strategy talks to a KV store that supports "wait for a
//! change after index N" long polling and per-key time-to-live, the way
//! etcd's v2 key-space does. The store is consumed through the
//! [`WatchStore`] trait; [`HttpWatchStore`] implements that HTTP API.

use crate::error::DiscoveryError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// A key/value entry in the watched namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: String,
    pub value: String,
    pub modified_index: u64,
}

/// A full listing of the watched namespace.
#[derive(Clone, Debug, Default)]
pub struct Listing {
    pub entries: Vec<StoreEntry>,
    /// The store-wide index at the time of the listing, when the store
    /// reports one.
    pub index: Option<u64>,
}

impl Listing {
    /// The index to arm the next watch from: the store-wide index when
    /// present, else the highest per-entry modification index, else 0.
    pub fn watch_index(&self) -> u64 {
        self.index.unwrap_or_else(|| {
            self.entries
                .iter()
                .map(|e| e.modified_index)
                .max()
                .unwrap_or(0)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchAction {
    Set,
    Delete,
    Expire,
}

/// A single change reported by a watch.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    /// The new value, for `Set`.
    pub value: Option<String>,
    /// The previous value, when the key existed before.
    pub prev_value: Option<String>,
    /// The modification index of this change.
    pub index: u64,
}

#[async_trait]
pub trait WatchStore: Send + Sync {
    /// List every entry under `namespace`.
    async fn list(&self, namespace: &str) -> Result<Listing, DiscoveryError>;

    /// Block until a change at or after `since` happens under
    /// `namespace`, then report it.
    async fn watch(&self, namespace: &str, since: u64) -> Result<WatchEvent, DiscoveryError>;

    /// Write `value` under `key` with a time-to-live.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DiscoveryError>;

    /// Delete `key`.
    async fn delete(&self, key: &str) -> Result<(), DiscoveryError>;
}

#[derive(Deserialize)]
struct KeysResponse {
    action: String,
    node: Node,
    #[serde(rename = "prevNode")]
    prev_node: Option<Node>,
}

#[derive(Deserialize)]
struct Node {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
    #[serde(default)]
    nodes: Vec<Node>,
}

/// Watch store over an etcd-v2-style HTTP key-space.
pub struct HttpWatchStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWatchStore {
    /// `base_url` is the store root, e.g. `http://127.0.0.1:2379`.
    /// Watches block server-side, so the client has no overall request
    /// timeout; only connecting is bounded.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn keys_url(&self, path: &str) -> String {
        format!("{}/v2/keys/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn read_response(
        response: reqwest::Response,
    ) -> Result<(KeysResponse, Option<u64>), DiscoveryError> {
        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::InvalidResponse(format!(
                "status {}",
                status
            )));
        }
        let index = response
            .headers()
            .get("X-Etcd-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let parsed: KeysResponse = response
            .json()
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;
        Ok((parsed, index))
    }

    /// A listing's index is the store-wide header index when the server
    /// sent one; otherwise [`Listing::watch_index`] falls back to the
    /// highest per-entry index. The root dir's own `modifiedIndex` may
    /// be older than its children and is never used.
    fn listing_from(parsed: KeysResponse, index: Option<u64>) -> Listing {
        let mut entries = Vec::new();
        if parsed.node.dir {
            for node in &parsed.node.nodes {
                if let Some(value) = &node.value {
                    entries.push(StoreEntry {
                        key: node.key.clone(),
                        value: value.clone(),
                        modified_index: node.modified_index,
                    });
                }
            }
        }
        Listing { entries, index }
    }

    /// A watch event's index is the delivered node's `modifiedIndex`,
    /// never the store-wide header index: re-arming past the cluster
    /// index would skip every change committed between the two.
    fn event_from(parsed: KeysResponse) -> Result<WatchEvent, DiscoveryError> {
        let action = match parsed.action.as_str() {
            "set" | "create" | "update" | "compareAndSwap" => WatchAction::Set,
            "delete" | "compareAndDelete" => WatchAction::Delete,
            "expire" => WatchAction::Expire,
            other => {
                return Err(DiscoveryError::InvalidResponse(format!(
                    "unknown watch action {:?}",
                    other
                )))
            }
        };
        Ok(WatchEvent {
            action,
            key: parsed.node.key.clone(),
            value: parsed.node.value.clone(),
            prev_value: parsed.prev_node.and_then(|n| n.value),
            index: parsed.node.modified_index,
        })
    }
}

#[async_trait]
impl WatchStore for HttpWatchStore {
    async fn list(&self, namespace: &str) -> Result<Listing, DiscoveryError> {
        let url = self.keys_url(namespace);
        debug!("Listing {}", url);
        let response = self
            .client
            .get(&url)
            .query(&[("recursive", "true")])
            .send()
            .await?;
        let (parsed, index) = Self::read_response(response).await?;
        Ok(Self::listing_from(parsed, index))
    }

    async fn watch(&self, namespace: &str, since: u64) -> Result<WatchEvent, DiscoveryError> {
        let url = self.keys_url(namespace);
        debug!("Watching {} from index {}", url, since);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("wait", "true".to_string()),
                ("recursive", "true".to_string()),
                ("waitIndex", since.to_string()),
            ])
            .send()
            .await?;
        let (parsed, _) = Self::read_response(response).await?;
        Self::event_from(parsed)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DiscoveryError> {
        let url = self.keys_url(key);
        let response = self
            .client
            .put(&url)
            .form(&[
                ("value", value.to_string()),
                ("ttl", ttl.as_secs().to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::InvalidResponse(format!(
                "put {} failed with status {}",
                key,
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DiscoveryError> {
        let url = self.keys_url(key);
        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::InvalidResponse(format!(
                "delete {} failed with status {}",
                key,
                response.status()
            )));
        }
        Ok(())
    }
}
