//! The xDS side of ambex.
//!
//! A [Snapshot] is a complete, versioned set of resources. The
//! [SnapshotCache] holds the latest snapshot for every node along with the
//! watches that streams have opened on it, and the [server] module speaks the
//! state-of-the-world discovery protocol on top of the cache.

mod cache;
mod resources;
pub mod server;
mod snapshot;

pub use cache::{node_key, FetchError, SnapshotCache, StatusInfo, WatchId, WatchResponse};
pub use resources::{Resource, ResourceType, ResourceVersion};
pub use snapshot::{ResourceSet, Snapshot};


/// The node every snapshot is installed under.
///
/// ambex serves a single Envoy, and that Envoy's bootstrap identifies it with
/// this node id.
pub const NODE_KEY: &str = "test-id";
