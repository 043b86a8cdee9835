//! Exporter capability seam
//!
//! An exporter turns a locally-registered service into a remotely
//! callable endpoint. The topology manager only ever sees this trait;
//! what "exporting" means (wire protocol, serialization) is the
//! exporter's business.

use crate::error::Result;
use async_trait::async_trait;
use mesh_core::{EndpointDescription, PropertyValue};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque handle identifying a locally-registered service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(pub u64);

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service-{}", self.0)
    }
}

/// A live export of one service through one exporter.
pub trait ExportRegistration: Send + Sync {
    /// Tear the export down. Idempotent.
    fn close(&self);

    /// The endpoint this registration published. Fails when the
    /// registration could not be resolved, which marks it invalid.
    fn endpoint(&self) -> Result<EndpointDescription>;
}

/// Capability that exports local services.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export_service(
        &self,
        service: ServiceHandle,
        properties: &BTreeMap<String, PropertyValue>,
    ) -> Result<Box<dyn ExportRegistration>>;
}
