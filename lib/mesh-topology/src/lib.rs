//! Export topology management
//!
//! This library provides:
//! - The `Exporter` capability seam that turns a local service into a
//!   remotely callable endpoint
//! - The `TopologyManager`, which decides per service and per exporter
//!   whether an export registration should currently exist and keeps
//!   that decision consistent as filters, properties and exporter
//!   availability change
//! - The `ServiceRegistry`, an in-process registry of local services
//!   with filtered event subscriptions that feed the manager

pub mod error;
pub mod exporter;
pub mod manager;
pub mod registry;

pub use error::{Result, TopologyError};
pub use exporter::{Exporter, ExportRegistration, ServiceHandle};
pub use manager::TopologyManager;
pub use registry::{ServiceEventListener, ServiceRegistry};
