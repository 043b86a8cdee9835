//! Agent configuration
//!
//! Loaded from a YAML file; every field has a sensible default so an
//! empty file (or none at all) yields a working agent. Validation is
//! strict at load time: an unparsable export filter or a zero poll
//! interval rejects the whole config rather than surfacing later.

use anyhow::{Context, Result};
use mesh_core::Filter;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

fn default_node_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_timeout() -> u64 {
    5
}

fn default_ttl() -> u64 {
    60
}

/// Watch-based discovery settings, optional.
#[derive(Clone, Debug, Deserialize)]
pub struct EtcdConfig {
    /// Store base URL, e.g. `http://127.0.0.1:2379`
    pub connect_url: String,
    /// Namespace the peer advertisements live under
    pub root_path: String,
    /// Discovery locator advertised for this node
    pub local_url: String,
    /// Lease time-to-live in seconds
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MeshConfig {
    /// Identity of this node among its peers
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Seconds between discovery fetch cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// HTTP connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// HTTP read timeout in seconds
    #[serde(default = "default_timeout")]
    pub read_timeout_secs: u64,

    /// Statically configured discovery sources (id to locator)
    #[serde(default)]
    pub static_sources: HashMap<String, String>,

    /// Optional watch-based peer discovery
    #[serde(default)]
    pub etcd: Option<EtcdConfig>,

    /// Optional LDAP filter gating which local services get exported
    #[serde(default)]
    pub export_filter: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            poll_interval_secs: default_poll_interval(),
            connect_timeout_secs: default_timeout(),
            read_timeout_secs: default_timeout(),
            static_sources: HashMap::new(),
            etcd: None,
            export_filter: None,
        }
    }
}

impl MeshConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: MeshConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be at least 1");
        }
        if let Some(filter) = &self.export_filter {
            Filter::parse(filter)
                .with_context(|| format!("invalid export_filter {:?}", filter))?;
        }
        if let Some(etcd) = &self.etcd {
            if etcd.ttl_secs == 0 {
                anyhow::bail!("etcd.ttl_secs must be at least 1");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.read_timeout_secs, 5);
        assert!(config.static_sources.is_empty());
        assert!(config.etcd.is_none());
        assert!(!config.node_id.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
node_id: node-1
poll_interval_secs: 30
static_sources:
  peer-a: http://a:8080/endpoints
etcd:
  connect_url: http://127.0.0.1:2379
  root_path: /mesh/nodes
  local_url: http://local:8080/endpoints
export_filter: "(tier=gold)"
"#;
        let config: MeshConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(
            config.static_sources.get("peer-a"),
            Some(&"http://a:8080/endpoints".to_string())
        );
        assert_eq!(config.etcd.as_ref().unwrap().ttl_secs, 60);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let yaml = r#"export_filter: "(tier=gold""#;
        let config: MeshConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let yaml = "poll_interval_secs: 0";
        let config: MeshConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
