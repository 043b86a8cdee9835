//! Endpoint descriptions
//!
//! An [`EndpointDescription`] is the published identity and metadata of a
//! remote service instance: a flat, case-sensitive property map. Two
//! descriptions denote the *same* endpoint when their ids are equal;
//! whether anything about the endpoint *changed* is decided by structural
//! equality over the whole map.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Property key holding the globally unique endpoint id.
pub const ENDPOINT_ID: &str = "endpoint.id";
/// Property key holding the id of the node that published the endpoint.
pub const ENDPOINT_NODE_ID: &str = "endpoint.framework.uuid";
/// Property key listing the interface names the endpoint exposes.
pub const OBJECT_CLASS: &str = "objectClass";
/// Property key listing configuration types, carried verbatim.
pub const SERVICE_IMPORTED_CONFIGS: &str = "service.imported.configs";
/// Property key listing service intents, carried verbatim.
pub const SERVICE_INTENTS: &str = "service.intents";
/// Property key on a *local* service declaring which interfaces to export.
pub const SERVICE_EXPORTED_INTERFACES: &str = "service.exported.interfaces";

/// A single endpoint property value.
///
/// Lists are ordered and may nest plain values; filters match a list
/// property when any element matches. Whole JSON numbers parse as
/// `Int`, fractional ones as `Float`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// String form used for filter comparison. Lists have no single
    /// string form and return `None`.
    pub fn as_comparable(&self) -> Option<String> {
        match self {
            PropertyValue::Str(s) => Some(s.clone()),
            PropertyValue::Int(i) => Some(i.to_string()),
            PropertyValue::Float(x) => Some(x.to_string()),
            PropertyValue::Bool(b) => Some(b.to_string()),
            PropertyValue::List(_) => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        PropertyValue::List(value.into_iter().map(PropertyValue::Str).collect())
    }
}

/// Immutable description of a remote endpoint.
///
/// Construction validates the required properties; once built the map
/// never changes. Equality is structural over the full property map so
/// consumers can use it directly for "did anything change" diffing.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EndpointDescription {
    properties: BTreeMap<String, PropertyValue>,
}

impl EndpointDescription {
    /// Build a description from raw properties.
    ///
    /// Requires a non-empty `endpoint.id`, an `endpoint.framework.uuid`
    /// and at least one interface name under `objectClass`.
    pub fn new(properties: BTreeMap<String, PropertyValue>) -> Result<Self> {
        let endpoint = Self { properties };
        endpoint.require_string(ENDPOINT_ID)?;
        endpoint.require_string(ENDPOINT_NODE_ID)?;
        if endpoint.interfaces().is_empty() {
            return Err(CoreError::MissingProperty(OBJECT_CLASS));
        }
        Ok(endpoint)
    }

    /// The globally unique endpoint id.
    pub fn id(&self) -> &str {
        self.string_property(ENDPOINT_ID).unwrap_or_default()
    }

    /// The id of the node that published this endpoint.
    pub fn node_id(&self) -> &str {
        self.string_property(ENDPOINT_NODE_ID).unwrap_or_default()
    }

    /// The interface names this endpoint exposes.
    pub fn interfaces(&self) -> Vec<&str> {
        match self.properties.get(OBJECT_CLASS) {
            Some(PropertyValue::Str(s)) if !s.is_empty() => vec![s.as_str()],
            Some(PropertyValue::List(values)) => values
                .iter()
                .filter_map(|v| match v {
                    PropertyValue::Str(s) if !s.is_empty() => Some(s.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Look up a single property.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// The full property map.
    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Whether `other` denotes the same endpoint (id equality only).
    pub fn is_same_endpoint(&self, other: &EndpointDescription) -> bool {
        !self.id().is_empty() && self.id() == other.id()
    }

    fn string_property(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropertyValue::Str(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    fn require_string(&self, key: &'static str) -> Result<()> {
        match self.properties.get(key) {
            None => Err(CoreError::MissingProperty(key)),
            Some(PropertyValue::Str(s)) if !s.is_empty() => Ok(()),
            Some(other) => Err(CoreError::InvalidProperty {
                key,
                reason: format!("expected non-empty string, got {:?}", other),
            }),
        }
    }
}

impl fmt::Display for EndpointDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id(), self.node_id())
    }
}

/// Parse a JSON array of property maps into validated descriptions.
///
/// Used for discovery payloads; any invalid entry rejects the whole
/// payload so a half-parsed listing is never acted upon.
pub fn read_endpoints(payload: &[u8]) -> Result<Vec<EndpointDescription>> {
    let raw: Vec<BTreeMap<String, PropertyValue>> = serde_json::from_slice(payload)?;
    raw.into_iter().map(EndpointDescription::new).collect()
}
