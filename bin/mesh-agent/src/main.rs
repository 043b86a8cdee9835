mod config;

use anyhow::Result;
use config::MeshConfig;
use mesh_core::{EndpointDescription, EndpointListener};
use mesh_discovery::{
    DiscoveryPoller, HttpFetcher, HttpWatchStore, PollerConfig, WatchConfig, WatchDiscovery,
};
use mesh_topology::{ServiceEventListener, ServiceRegistry, TopologyManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::fmt::init as tracing_init;

/// Logs discovered endpoints. An embedding application would hook a
/// real import manager in here instead.
struct LogListener;

impl EndpointListener for LogListener {
    fn endpoint_added(&self, endpoint: &EndpointDescription) {
        info!("Endpoint available: {} {:?}", endpoint, endpoint.interfaces());
    }

    fn endpoint_removed(&self, endpoint: &EndpointDescription) {
        info!("Endpoint gone: {}", endpoint);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting mesh-agent...");

    let config = load_config()?;
    info!("Node id: {}", config.node_id);

    // Export side: the registry and topology manager are ready for
    // embedding code to register services and exporter capabilities.
    let registry = Arc::new(ServiceRegistry::new());
    let topology = Arc::new(TopologyManager::new());
    if let Some(filter) = &config.export_filter {
        topology.set_filter_str(Some(filter)).await?;
    }
    registry
        .add_listener(Arc::clone(&topology) as Arc<dyn ServiceEventListener>, None)
        .await;

    let fetcher = Arc::new(HttpFetcher::new(
        Duration::from_secs(config.connect_timeout_secs),
        Duration::from_secs(config.read_timeout_secs),
    )?);
    let poller = Arc::new(DiscoveryPoller::new(
        fetcher,
        Arc::new(LogListener),
        PollerConfig {
            interval: Duration::from_secs(config.poll_interval_secs),
        },
    ));

    for (id, locator) in &config.static_sources {
        info!("Configured source: {} at {}", id, locator);
        poller.add_source(id, locator).await;
    }

    let watcher = match &config.etcd {
        Some(etcd) => {
            info!("Watching peers at {}{}", etcd.connect_url, etcd.root_path);
            let store = Arc::new(HttpWatchStore::new(
                &etcd.connect_url,
                Duration::from_secs(config.connect_timeout_secs),
            )?);
            Some(WatchDiscovery::new(
                store,
                Arc::clone(&poller),
                WatchConfig {
                    namespace: etcd.root_path.clone(),
                    node_id: config.node_id.clone(),
                    local_url: etcd.local_url.clone(),
                    ttl: Duration::from_secs(etcd.ttl_secs),
                },
            ))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(watcher) = watcher {
        watcher.close().await;
    }
    poller.close().await;
    topology.close().await;

    Ok(())
}

fn load_config() -> Result<MeshConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MESH_AGENT_CONFIG").ok())
        .map(PathBuf::from);
    match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            MeshConfig::load(&path)
        }
        None => {
            info!("No config file given, using defaults");
            Ok(MeshConfig::default())
        }
    }
}
