//! Core value types for remote-service discovery
//!
//! This library provides:
//! - Endpoint descriptions (property-map identity of a remote service)
//! - LDAP-style property filters
//! - Fault tracking for per-endpoint call health
//! - The endpoint event listener seam shared by all discovery strategies

pub mod endpoint;
pub mod event;
pub mod fault;
pub mod filter;
pub mod error;

pub use endpoint::{EndpointDescription, PropertyValue};
pub use event::EndpointListener;
pub use fault::{FaultTracker, Severity};
pub use filter::Filter;
pub use error::{CoreError, Result};
