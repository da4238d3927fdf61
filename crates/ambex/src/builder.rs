//! Assembling snapshots from files on disk and fastpath input.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};
use xds_api::pb::envoy::config::{
    cluster::v3 as xds_cluster, listener::v3 as xds_listener, route::v3 as xds_route,
};
use xds_api::pb::envoy::service::runtime::v3 as xds_runtime;

use crate::decode::{decodable, decode, Decoded};
use crate::endpoints::{self, EndpointMap, StaticResources};
use crate::error::Result;
use crate::rewrite::rewrite_listener;
use crate::xds::{Resource, ResourceVersion, Snapshot};

/// Where a resource came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    File(PathBuf),
    Fastpath,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::File(path) => write!(f, "{}", path.display()),
            Source::Fastpath => f.write_str("fastpath"),
        }
    }
}

trait Named {
    fn name(&self) -> &str;
}

macro_rules! impl_named {
    ($xds_ty:ty) => {
        impl Named for $xds_ty {
            fn name(&self) -> &str {
                &self.name
            }
        }
    };
}

impl_named!(xds_cluster::Cluster);
impl_named!(xds_route::RouteConfiguration);
impl_named!(xds_listener::Listener);
impl_named!(xds_runtime::Runtime);

/// Resources of a single type, indexed by name.
///
/// A resource pushed with the name of an existing resource takes its place.
struct Bucket<T> {
    kind: &'static str,
    items: Vec<T>,
    index: HashMap<String, (usize, Source)>,
}

impl<T: Named> Bucket<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn push(&mut self, source: Source, item: T) {
        match self.index.get_mut(item.name()) {
            Some((idx, previous)) => {
                warn!(
                    kind = self.kind,
                    name = item.name(),
                    previous = %previous,
                    replacement = %source,
                    "duplicate resource name, keeping the last one"
                );
                self.items[*idx] = item;
                *previous = source;
            }
            None => {
                self.index
                    .insert(item.name().to_string(), (self.items.len(), source));
                self.items.push(item);
            }
        }
    }
}

/// Builds snapshots from a set of config directories.
///
/// Every call to [build][SnapshotBuilder::build] uses up a generation, even
/// when the snapshot it builds gets thrown away, so versions are never
/// reused.
#[derive(Debug)]
pub struct SnapshotBuilder {
    dirs: Vec<PathBuf>,
    eds_bypass: bool,
    generation: u64,
}

impl SnapshotBuilder {
    pub fn new(dirs: Vec<PathBuf>, eds_bypass: bool) -> Self {
        Self {
            dirs,
            eds_bypass,
            generation: 0,
        }
    }

    /// The generation the next snapshot will be built with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Build a new snapshot.
    ///
    /// Files that fail to decode are logged and skipped. Fastpath resources
    /// are added after every resource loaded from disk and replace any file
    /// resource with the same name. Returns an error if the resulting
    /// snapshot is inconsistent.
    pub fn build(
        &mut self,
        endpoint_map: &EndpointMap,
        fastpath: Option<&StaticResources>,
    ) -> Result<Snapshot> {
        let mut clusters: Bucket<xds_cluster::Cluster> = Bucket::new("Cluster");
        let mut routes: Bucket<xds_route::RouteConfiguration> = Bucket::new("RouteConfiguration");
        let mut listeners: Bucket<xds_listener::Listener> = Bucket::new("Listener");
        let mut runtimes: Bucket<xds_runtime::Runtime> = Bucket::new("Runtime");

        for path in self.files() {
            let decoded = match decode(&path) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("skipping {}: {e}", path.display());
                    continue;
                }
            };

            let source = Source::File(path);
            match decoded {
                Decoded::Cluster(c) => clusters.push(source, c),
                Decoded::Route(r) => routes.push(source, r),
                Decoded::Listener(l) => listeners.push(source, l),
                Decoded::Runtime(r) => runtimes.push(source, r),
                Decoded::Bootstrap(bootstrap) => {
                    let Some(static_resources) = bootstrap.static_resources else {
                        continue;
                    };

                    for listener in static_resources.listeners {
                        match rewrite_listener(&listener) {
                            Ok((rewritten, route_configs)) => {
                                listeners.push(source.clone(), rewritten);
                                for rc in route_configs {
                                    routes.push(source.clone(), rc);
                                }
                            }
                            Err(e) => {
                                error!("failed to convert listener to RDS, using it as-is: {e}");
                                listeners.push(source.clone(), listener);
                            }
                        }
                    }
                    for cluster in static_resources.clusters {
                        clusters.push(source.clone(), cluster);
                    }
                }
            }
        }

        if let Some(fastpath) = fastpath {
            for l in &fastpath.listeners {
                listeners.push(Source::Fastpath, l.clone());
            }
            for r in &fastpath.routes {
                routes.push(Source::Fastpath, r.clone());
            }
            for c in &fastpath.clusters {
                clusters.push(Source::Fastpath, c.clone());
            }
        }

        let load_assignments = endpoints::join(&mut clusters.items, endpoint_map, self.eds_bypass);

        let version = ResourceVersion::generation(self.generation);
        self.generation += 1;

        let resources = (clusters.items.into_iter().map(Resource::from))
            .chain(routes.items.into_iter().map(Resource::from))
            .chain(listeners.items.into_iter().map(Resource::from))
            .chain(runtimes.items.into_iter().map(Resource::from))
            .chain(load_assignments.into_iter().map(Resource::from));
        let snapshot = Snapshot::new(version, resources);

        snapshot.consistent()?;
        debug!(version = %snapshot.version(), "built snapshot");
        Ok(snapshot)
    }

    /// Every decodable file in every config directory. Files are sorted by
    /// name within each directory, and directories are visited in order.
    fn files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for dir in &self.dirs {
            match list_dir(dir) {
                Ok(names) => files.extend(names),
                Err(e) => warn!("error listing {}: {e}", dir.display()),
            }
        }
        files
    }
}

fn list_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
            continue;
        };
        if decodable(&name) && entry.path().is_file() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names.into_iter().map(|name| dir.join(name)).collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::endpoints::{Endpoint, Endpoints};
    use crate::error::Error;
    use crate::xds::test::*;
    use crate::xds::ResourceType;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    fn endpoint_map(name: &str, endpoints: Vec<Endpoint>) -> EndpointMap {
        [(name.to_string(), endpoints)]
            .into_iter()
            .collect::<Endpoints>()
            .to_load_assignments()
    }

    fn names(snapshot: &Snapshot, rtype: ResourceType) -> Vec<&str> {
        snapshot.resources(rtype).names().collect()
    }

    #[test]
    fn test_build_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);

        let snapshot = builder.build(&EndpointMap::new(), None).unwrap();
        assert_eq!(&**snapshot.version(), "v0");
        for rtype in ResourceType::all() {
            assert!(snapshot.resources(*rtype).is_empty());
        }
    }

    #[test]
    fn test_build_versions() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);

        let versions: Vec<_> = (0..3)
            .map(|_| builder.build(&EndpointMap::new(), None).unwrap().version().to_string())
            .collect();
        assert_eq!(versions, vec!["v0", "v1", "v2"]);
        assert_eq!(builder.generation(), 3);
    }

    #[test]
    fn test_build_bootstrap_with_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bootstrap.json", BOOTSTRAP_JSON);

        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);
        let map = endpoint_map("c", vec![Endpoint::tcp("10.0.0.1", 80)]);
        let snapshot = builder.build(&map, None).unwrap();

        assert_eq!(
            names(&snapshot, ResourceType::Listener),
            vec!["ambassador-listener-8080"]
        );
        assert_eq!(
            names(&snapshot, ResourceType::Route),
            vec!["ambassador-listener-8080-routeconfig-0"]
        );
        assert_eq!(names(&snapshot, ResourceType::Cluster), vec!["c"]);
        assert_eq!(
            snapshot
                .resources(ResourceType::Endpoint)
                .get("c")
                .map(|r| r.as_ref()),
            Some(&Resource::from(cla!("c" => [("10.0.0.1", 80)])))
        );
    }

    #[test]
    fn test_build_synthesizes_empty_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "cluster.json", EDS_CLUSTER_JSON);

        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);
        let snapshot = builder.build(&EndpointMap::new(), None).unwrap();

        assert_eq!(
            snapshot
                .resources(ResourceType::Endpoint)
                .get("c")
                .map(|r| r.as_ref()),
            Some(&Resource::from(cla!("c")))
        );
    }

    #[test]
    fn test_build_eds_bypass() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "cluster.json", EDS_CLUSTER_JSON);

        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], true);
        let map = endpoint_map("c", vec![Endpoint::tcp("10.0.0.1", 80)]);
        let snapshot = builder.build(&map, None).unwrap();

        assert!(snapshot.resources(ResourceType::Endpoint).is_empty());
        let Some(Resource::Cluster(cluster)) = snapshot
            .resources(ResourceType::Cluster)
            .get("c")
            .map(|r| r.as_ref())
        else {
            panic!("missing cluster");
        };
        assert_eq!(
            cluster.load_assignment,
            Some(cla!("c" => [("10.0.0.1", 80)]))
        );
    }

    #[test]
    fn test_build_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a-broken.json", "{ this is not json");
        write(dir.path(), "b-cluster.json", EDS_CLUSTER_JSON);
        write(dir.path(), ".hidden.json", "{ also not json");
        write(dir.path(), "notes.txt", "ignore me");
        write(
            dir.path(),
            "cla.json",
            r#"{"@type": "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment", "cluster_name": "x"}"#,
        );
        std::fs::create_dir(dir.path().join("subdir.json")).unwrap();

        let mut builder = SnapshotBuilder::new(
            vec![dir.path().to_path_buf(), dir.path().join("missing")],
            false,
        );
        let snapshot = builder.build(&EndpointMap::new(), None).unwrap();
        assert_eq!(names(&snapshot, ResourceType::Cluster), vec!["c"]);
        assert_eq!(names(&snapshot, ResourceType::Endpoint), vec!["c"]);
    }

    #[test]
    fn test_build_plain_listeners_are_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "listener.json",
            r#"{
                "@type": "type.googleapis.com/envoy.config.listener.v3.Listener",
                "name": "l",
                "filter_chains": [{"filters": [{"name": "envoy.filters.network.tcp_proxy"}]}]
            }"#,
        );

        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);
        let snapshot = builder.build(&EndpointMap::new(), None).unwrap();
        assert_eq!(names(&snapshot, ResourceType::Listener), vec!["l"]);
        assert!(snapshot.resources(ResourceType::Route).is_empty());
    }

    #[test]
    fn test_build_text_format_listener() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "listener.pb",
            r#"
            [type.googleapis.com/envoy.config.listener.v3.Listener] {
                name: "l"
                filter_chains {
                    filters { name: "envoy.filters.network.tcp_proxy" }
                }
            }
            "#,
        );

        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);
        let snapshot = builder.build(&EndpointMap::new(), None).unwrap();
        assert_eq!(names(&snapshot, ResourceType::Listener), vec!["l"]);
        assert!(snapshot.resources(ResourceType::Route).is_empty());
    }

    #[test]
    fn test_build_text_format_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "bootstrap.pb",
            r#"
            [type.googleapis.com/envoy.config.bootstrap.v3.Bootstrap] {
                static_resources {
                    listeners {
                        name: "ambassador-listener-8443"
                        filter_chains {
                            filters {
                                name: "envoy.filters.network.http_connection_manager"
                                typed_config {
                                    [type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager] {
                                        stat_prefix: "ingress_https"
                                        route_config {
                                            virtual_hosts {
                                                name: "vh"
                                                domains: "*"
                                                routes {
                                                    match { prefix: "/" }
                                                    route { cluster: "c" }
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                    clusters {
                        name: "c"
                        type: EDS
                        eds_cluster_config {
                            eds_config {
                                ads {}
                                resource_api_version: V3
                            }
                        }
                    }
                }
            }
            "#,
        );

        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);
        let snapshot = builder.build(&EndpointMap::new(), None).unwrap();

        assert_eq!(
            names(&snapshot, ResourceType::Listener),
            vec!["ambassador-listener-8443"]
        );
        assert_eq!(
            names(&snapshot, ResourceType::Route),
            vec!["ambassador-listener-8443-routeconfig-0"]
        );
        assert_eq!(names(&snapshot, ResourceType::Cluster), vec!["c"]);
        assert_eq!(names(&snapshot, ResourceType::Endpoint), vec!["c"]);
    }

    #[test]
    fn test_build_bootstrap_listener_that_cant_be_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "bootstrap.pb",
            r#"
            [type.googleapis.com/envoy.config.bootstrap.v3.Bootstrap] {
                static_resources {
                    listeners {
                        name: "broken-hcm"
                        filter_chains {
                            filters {
                                name: "envoy.filters.network.http_connection_manager"
                                typed_config {
                                    type_url: "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager"
                                    value: "\377\377\377"
                                }
                            }
                        }
                    }
                }
            }
            "#,
        );

        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);
        let snapshot = builder.build(&EndpointMap::new(), None).unwrap();

        // the listener is served exactly as it was written
        assert_eq!(names(&snapshot, ResourceType::Listener), vec!["broken-hcm"]);
        assert!(snapshot.resources(ResourceType::Route).is_empty());

        let Some(Resource::Listener(listener)) = snapshot
            .resources(ResourceType::Listener)
            .get("broken-hcm")
            .map(|r| r.as_ref())
        else {
            panic!("missing listener");
        };
        let Some(xds_listener::filter::ConfigType::TypedConfig(any)) =
            &listener.filter_chains[0].filters[0].config_type
        else {
            panic!("listener lost its typed config");
        };
        assert_eq!(any.value, vec![0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_build_inconsistent_uses_a_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);

        let fastpath = StaticResources {
            listeners: vec![listener!(rds "l", "missing-routes")],
            ..Default::default()
        };
        let err = builder
            .build(&EndpointMap::new(), Some(&fastpath))
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistent(_)));
        assert!(err.is_input_error());

        let snapshot = builder.build(&EndpointMap::new(), None).unwrap();
        assert_eq!(&**snapshot.version(), "v1");
    }

    #[test]
    fn test_build_fastpath_wins() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "cluster.json", EDS_CLUSTER_JSON);

        let fastpath = StaticResources {
            clusters: vec![cluster!(static "c"), cluster!("fast", service = "fast-svc")],
            routes: vec![route_config!("fast-routes", [])],
            listeners: vec![listener!(rds "fast-listener", "fast-routes")],
        };

        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);
        let snapshot = builder
            .build(&EndpointMap::new(), Some(&fastpath))
            .unwrap();

        assert_eq!(names(&snapshot, ResourceType::Cluster), vec!["c", "fast"]);
        assert_eq!(
            snapshot
                .resources(ResourceType::Cluster)
                .get("c")
                .map(|r| r.as_ref()),
            Some(&Resource::from(cluster!(static "c")))
        );
        // the static fastpath cluster doesn't need endpoints, the EDS one does
        assert_eq!(names(&snapshot, ResourceType::Endpoint), vec!["fast-svc"]);
        assert_eq!(names(&snapshot, ResourceType::Listener), vec!["fast-listener"]);
        assert_eq!(names(&snapshot, ResourceType::Route), vec!["fast-routes"]);
    }

    #[test]
    fn test_build_later_files_win() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", EDS_CLUSTER_JSON);
        write(
            dir.path(),
            "b.json",
            r#"{"@type": "type.googleapis.com/envoy.config.cluster.v3.Cluster", "name": "c", "type": "STATIC"}"#,
        );

        let mut builder = SnapshotBuilder::new(vec![dir.path().to_path_buf()], false);
        let snapshot = builder.build(&EndpointMap::new(), None).unwrap();
        assert!(snapshot.resources(ResourceType::Endpoint).is_empty());
    }

    #[test]
    fn test_list_dir_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.json", "a.pb", "b.json", "d.yaml"] {
            write(dir.path(), name, "");
        }

        let files: Vec<_> = list_dir(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(files, vec!["a.pb", "b.json", "c.json"]);
    }
}
