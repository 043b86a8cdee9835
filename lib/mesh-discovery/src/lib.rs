//! Endpoint discovery strategies
//!
//! This library provides:
//! - A polling strategy that performs conditional fetches against a
//!   dynamic set of discovery sources and diffs the results
//! - A watch strategy that tracks an index-based store and keeps a
//!   leased advertisement of the local node alive
//! - The `Fetcher` and `WatchStore` seams those strategies consume,
//!   with HTTP implementations of both

pub mod error;
pub mod fetch;
pub mod poller;
pub mod store;
pub mod watch;

pub use error::DiscoveryError;
pub use fetch::{FetchOutcome, Fetcher, HttpFetcher};
pub use poller::{DiscoveryPoller, PollerConfig};
pub use store::{HttpWatchStore, Listing, StoreEntry, WatchAction, WatchEvent, WatchStore};
pub use watch::{WatchConfig, WatchDiscovery};
