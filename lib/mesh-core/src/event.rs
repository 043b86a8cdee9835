//! Endpoint event listener seam
//!
//! Every discovery strategy (polling or watch based) reports endpoint
//! changes through this trait with identical semantics, so downstream
//! consumers stay transport-agnostic. `endpoint_added` is an upsert: a
//! source may legitimately re-announce an endpoint it already reported
//! whenever it detects any modification, and removals for a cycle are
//! always delivered before that cycle's adds.

use crate::endpoint::EndpointDescription;

pub trait EndpointListener: Send + Sync {
    /// An endpoint is (still) present at one of the discovery sources.
    fn endpoint_added(&self, endpoint: &EndpointDescription);

    /// An endpoint disappeared from the source that announced it.
    fn endpoint_removed(&self, endpoint: &EndpointDescription);
}
