//! Logging snapshots to disk.
//!
//! Every snapshot the builder produces gets written out as JSON before it's
//! handed to the updater, so there's a record of exactly what Envoy was sent.
//! `ambex-0.json` is always the newest snapshot and `ambex-{count}.json` the
//! oldest.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use prost_reflect::DynamicMessage;
use serde::Serialize;
use tracing::{error, info};

use crate::decode::message_descriptor;
use crate::xds::{Resource, ResourceSet, ResourceType, Snapshot};

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

#[derive(Debug, Serialize)]
struct MarshaledSnapshot<'a> {
    version: &'a str,
    v3: BTreeMap<&'static str, MarshaledElements<'a>>,
}

#[derive(Debug, Serialize)]
struct MarshaledElements<'a> {
    version: &'a str,
    elements: Vec<serde_json::Value>,
}

/// Writes snapshots to a directory, keeping the last few around.
#[derive(Debug, Clone)]
pub struct SnapshotLog {
    dir: PathBuf,
    count: usize,
}

impl SnapshotLog {
    /// Create a new log that keeps `count` old snapshots in `dir` alongside
    /// the newest one. Returns `None` if `count` is not positive.
    pub fn new(dir: impl Into<PathBuf>, count: i64) -> Option<Self> {
        let count = usize::try_from(count).ok().filter(|c| *c > 0)?;
        Some(Self {
            dir: dir.into(),
            count,
        })
    }

    fn path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("ambex-{n}.json"))
    }

    /// Write a snapshot, logging any failure.
    pub fn write(&self, snapshot: &Snapshot) {
        match self.try_write(snapshot) {
            Ok(()) => info!(version = %snapshot.version(), "saved snapshot"),
            Err(e) => error!(version = %snapshot.version(), "failed to save snapshot: {e}"),
        }
    }

    fn try_write(&self, snapshot: &Snapshot) -> io::Result<()> {
        let bytes = marshal(snapshot)?;
        self.rotate();
        std::fs::write(self.path(0), bytes)
    }

    fn rotate(&self) {
        for i in (1..=self.count).rev() {
            let from = self.path(i - 1);
            let to = self.path(i);
            if let Err(e) = std::fs::rename(&from, &to) {
                if e.kind() != io::ErrorKind::NotFound {
                    info!(
                        "could not rename {} -> {}: {e}",
                        from.display(),
                        to.display()
                    );
                }
            }
        }
    }
}

fn marshal(snapshot: &Snapshot) -> io::Result<Vec<u8>> {
    let logged = [
        ResourceType::Endpoint,
        ResourceType::Cluster,
        ResourceType::Route,
        ResourceType::Listener,
        ResourceType::Runtime,
    ];

    let mut v3 = BTreeMap::new();
    for rtype in logged {
        v3.insert(rtype.plural_name(), marshal_set(snapshot.resources(rtype))?);
    }

    let marshaled = MarshaledSnapshot {
        version: snapshot.version(),
        v3,
    };
    Ok(serde_json::to_vec(&marshaled)?)
}

fn marshal_set(set: &ResourceSet) -> io::Result<MarshaledElements<'_>> {
    let elements = set
        .iter()
        .map(|r| to_json(r))
        .collect::<io::Result<Vec<_>>>()?;

    Ok(MarshaledElements {
        version: &set.version,
        elements,
    })
}

/// Render a resource as canonical protobuf JSON, with any typed config
/// expanded in place.
pub(crate) fn to_json(resource: &Resource) -> io::Result<serde_json::Value> {
    let any = resource.to_any();
    let name = any.type_url.trim_start_matches(TYPE_URL_PREFIX);
    let descriptor = message_descriptor(name)
        .ok_or_else(|| io::Error::other(format!("unknown message type: {name}")))?;

    let message = DynamicMessage::decode(descriptor, any.value.as_slice())
        .map_err(io::Error::other)?;
    Ok(serde_json::to_value(&message)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xds::test::*;
    use pretty_assertions::assert_eq;

    fn snapshot(version: &str) -> Snapshot {
        let vhost = vhost!("vh", ["*"], [route!(default "c")]);
        Snapshot::new(
            version.into(),
            [
                cluster!("c").into(),
                cla!("c" => [("10.0.0.1", 80)]).into(),
                listener!("l" => [vhost]).into(),
            ],
        )
    }

    fn read(path: PathBuf) -> serde_json::Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_disabled() {
        assert!(SnapshotLog::new("/tmp", 0).is_none());
        assert!(SnapshotLog::new("/tmp", -1).is_none());
        assert!(SnapshotLog::new("/tmp", 1).is_some());
    }

    #[test]
    fn test_snapshot_format() {
        let dir = tempfile::tempdir().unwrap();
        let log = SnapshotLog::new(dir.path(), 3).unwrap();
        log.write(&snapshot("v1"));

        let json = read(log.path(0));
        assert_eq!(json["version"], "v1");
        assert_eq!(json["v3"]["Clusters"]["version"], "v1");
        assert_eq!(json["v3"]["Clusters"]["elements"][0]["name"], "c");
        assert_eq!(
            json["v3"]["Endpoints"]["elements"][0]["clusterName"],
            "c"
        );
        assert_eq!(json["v3"]["Routes"]["elements"], serde_json::json!([]));
        assert_eq!(json["v3"]["Runtimes"]["elements"], serde_json::json!([]));

        // typed config is expanded with its type
        let filter = &json["v3"]["Listeners"]["elements"][0]["filterChains"][0]["filters"][0];
        assert_eq!(
            filter["typedConfig"]["@type"],
            "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager"
        );
        assert_eq!(filter["typedConfig"]["statPrefix"], "ingress_http");
    }

    #[test]
    fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log = SnapshotLog::new(dir.path(), 2).unwrap();

        for n in 1..=5 {
            log.write(&snapshot(&format!("v{n}")));
        }

        assert_eq!(read(log.path(0))["version"], "v5");
        assert_eq!(read(log.path(1))["version"], "v4");
        assert_eq!(read(log.path(2))["version"], "v3");
        assert!(!log.path(3).exists());
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let log = SnapshotLog::new(dir.path().join("missing"), 2).unwrap();
        log.write(&snapshot("v1"));
        assert!(!log.path(0).exists());
    }
}
