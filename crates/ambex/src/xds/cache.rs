// The snapshot cache holds the most recent snapshot for every node and the
// set of open watches each node's streams have registered.
//
// A watch is a stream saying "I have version V of type T, tell me when that
// changes". Requests for a version that's already stale are answered
// immediately and never become watches. Installing a snapshot answers and
// removes every watch whose version no longer matches.
//
// Watch responses are delivered on bounded channels with room for exactly one
// response. Every watch gets a fresh channel and is removed as soon as it's
// answered, so the only way a send can fail is if the stream on the other end
// has gone away. Delivery happens while holding the cache lock and never
// blocks.
//
// In ADS mode, a request that names resources is only answered if it names
// every resource of that type in the snapshot. Answering a partial request
// would hand an ADS client a version it could ACK without having seen every
// resource.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use xds_api::pb::envoy::{
    config::core::v3 as xds_core,
    service::discovery::v3::{DiscoveryRequest, DiscoveryResponse},
};

use crate::error::{Error, Result};

use super::{Resource, ResourceType, ResourceVersion, Snapshot};

/// Identifies an open watch within a node.
pub type WatchId = u64;

macro_rules! no_poison {
    ($guard:expr) => {
        $guard.expect("SnapshotCache was poisoned: this is a bug in ambex")
    };
}

/// The key a node is stored under.
///
/// Requests that don't identify a node at all share the `"unknown"` key. A
/// node with an empty id is keyed by that empty id.
pub fn node_key(node: Option<&xds_core::Node>) -> &str {
    match node {
        Some(node) => &node.id,
        None => "unknown",
    }
}

/// A response to a watch or fetch.
#[derive(Debug, Clone)]
pub struct WatchResponse {
    /// The request being answered.
    pub request: DiscoveryRequest,
    pub resource_type: ResourceType,
    pub version: ResourceVersion,
    pub resources: Vec<Arc<Resource>>,
}

impl WatchResponse {
    pub fn to_discovery_response(&self, nonce: String) -> DiscoveryResponse {
        DiscoveryResponse {
            version_info: self.version.to_string(),
            type_url: self.resource_type.type_url().to_string(),
            resources: self.resources.iter().map(|r| r.to_any()).collect(),
            nonce,
            ..Default::default()
        }
    }

    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name()).collect()
    }
}

/// Errors returned from [SnapshotCache::fetch].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("version up to date")]
    UpToDate,

    #[error("missing snapshot for {0:?}")]
    MissingSnapshot(String),
}

/// A summary of a node's watch state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub last_watch_request_time: Option<SystemTime>,
    pub num_watches: usize,
}

#[derive(Debug)]
struct Watch {
    resource_type: ResourceType,
    request: DiscoveryRequest,
    tx: mpsc::Sender<WatchResponse>,
}

#[derive(Debug, Default)]
struct NodeStatus {
    last_watch_request_time: Option<SystemTime>,
    watches: BTreeMap<WatchId, Watch>,
}

#[derive(Debug, Default)]
struct CacheData {
    snapshots: HashMap<String, Arc<Snapshot>>,
    status: HashMap<String, NodeStatus>,
    next_watch_id: WatchId,
}

/// A node-keyed store of snapshots and the watches waiting on them.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    ads: bool,
    data: Mutex<CacheData>,
}

impl SnapshotCache {
    /// Create a new cache. With `ads` set, requests that name a subset of the
    /// resources of a type are not answered.
    pub fn new(ads: bool) -> Self {
        Self {
            ads,
            data: Mutex::new(CacheData::default()),
        }
    }

    /// Replace a node's snapshot and answer every watch that's now out of date.
    ///
    /// Snapshots that fail a consistency check are rejected and leave the
    /// cache unchanged.
    pub fn install(&self, node: &str, snapshot: Snapshot) -> Result<()> {
        snapshot
            .consistent()
            .map_err(|e| Error::Install(e.to_string()))?;

        let mut data = no_poison!(self.data.lock());
        let snapshot = Arc::new(snapshot);
        data.snapshots.insert(node.to_string(), snapshot.clone());

        let Some(status) = data.status.get_mut(node) else {
            return Ok(());
        };

        let mut answered = 0;
        status.watches.retain(|id, watch| {
            let version = snapshot.version_of(watch.resource_type);
            if **version == *watch.request.version_info {
                return true;
            }

            respond(self.ads, *id, watch, &snapshot);
            answered += 1;
            false
        });

        info!(node, version = %snapshot.version(), answered, "installed snapshot");
        Ok(())
    }

    /// Register interest in a resource type.
    ///
    /// If the node's snapshot is newer than the version in `request`, the
    /// returned channel already holds a response and no watch is created.
    /// Otherwise a watch is registered and its id returned, and the channel
    /// receives a single response when a newer snapshot is installed.
    pub fn create_watch(
        &self,
        resource_type: ResourceType,
        request: &DiscoveryRequest,
    ) -> (mpsc::Receiver<WatchResponse>, Option<WatchId>) {
        let (tx, rx) = mpsc::channel(1);
        let node = node_key(request.node.as_ref());

        let mut data = no_poison!(self.data.lock());
        let data = &mut *data;

        let status = data.status.entry(node.to_string()).or_default();
        status.last_watch_request_time = Some(SystemTime::now());

        let watch = Watch {
            resource_type,
            request: request.clone(),
            tx,
        };

        match data.snapshots.get(node) {
            Some(snapshot) if **snapshot.version_of(resource_type) != *request.version_info => {
                respond(self.ads, 0, &watch, snapshot);
                (rx, None)
            }
            _ => {
                let id = data.next_watch_id;
                data.next_watch_id += 1;
                debug!(
                    node,
                    watch_id = id,
                    type_url = resource_type.type_url(),
                    version = %request.version_info,
                    "open watch"
                );
                status.watches.insert(id, watch);
                (rx, Some(id))
            }
        }
    }

    /// Cancel an open watch. Cancelling a watch that was already answered or
    /// cancelled does nothing.
    pub fn cancel_watch(&self, node: &str, id: WatchId) {
        let mut data = no_poison!(self.data.lock());
        if let Some(status) = data.status.get_mut(node) {
            if status.watches.remove(&id).is_some() {
                debug!(node, watch_id = id, "cancelled watch");
            }
        }
    }

    /// Answer a request immediately, without creating a watch.
    pub fn fetch(
        &self,
        resource_type: ResourceType,
        request: &DiscoveryRequest,
    ) -> std::result::Result<WatchResponse, FetchError> {
        let node = node_key(request.node.as_ref());
        let data = no_poison!(self.data.lock());

        let Some(snapshot) = data.snapshots.get(node) else {
            return Err(FetchError::MissingSnapshot(node.to_string()));
        };

        let version = snapshot.version_of(resource_type);
        if **version == *request.version_info {
            return Err(FetchError::UpToDate);
        }

        Ok(create_response(resource_type, request, snapshot))
    }

    /// Remove a node's snapshot and all of its watches.
    pub fn clear(&self, node: &str) {
        let mut data = no_poison!(self.data.lock());
        data.snapshots.remove(node);
        data.status.remove(node);
    }

    /// The current snapshot for a node.
    pub fn snapshot(&self, node: &str) -> Option<Arc<Snapshot>> {
        let data = no_poison!(self.data.lock());
        data.snapshots.get(node).cloned()
    }

    pub fn status_info(&self, node: &str) -> Option<StatusInfo> {
        let data = no_poison!(self.data.lock());
        data.status.get(node).map(|status| StatusInfo {
            last_watch_request_time: status.last_watch_request_time,
            num_watches: status.watches.len(),
        })
    }

    /// The keys of every node that has made a request.
    pub fn status_keys(&self) -> Vec<String> {
        let data = no_poison!(self.data.lock());
        let mut keys: Vec<_> = data.status.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn respond(ads: bool, id: WatchId, watch: &Watch, snapshot: &Snapshot) {
    let resources = snapshot.resources(watch.resource_type);

    if ads && !watch.request.resource_names.is_empty() {
        let requested: BTreeSet<&str> = watch
            .request
            .resource_names
            .iter()
            .map(|s| s.as_str())
            .collect();

        let missing: Vec<_> = resources
            .names()
            .filter(|name| !requested.contains(name))
            .collect();
        if !missing.is_empty() {
            debug!(
                watch_id = id,
                type_url = watch.resource_type.type_url(),
                ?missing,
                "not responding to a partial ADS request"
            );
            return;
        }
    }

    let response = create_response(watch.resource_type, &watch.request, snapshot);
    if let Err(e) = watch.tx.try_send(response) {
        warn!(
            watch_id = id,
            type_url = watch.resource_type.type_url(),
            "failed to deliver watch response: {e}"
        );
    }
}

fn create_response(
    resource_type: ResourceType,
    request: &DiscoveryRequest,
    snapshot: &Snapshot,
) -> WatchResponse {
    let set = snapshot.resources(resource_type);

    let resources = if request.resource_names.is_empty() {
        set.iter().cloned().collect()
    } else {
        request
            .resource_names
            .iter()
            .filter_map(|name| set.get(name).cloned())
            .collect()
    };

    WatchResponse {
        request: request.clone(),
        resource_type,
        version: set.version.clone(),
        resources,
    }
}
