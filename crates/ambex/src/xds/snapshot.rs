use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use enum_map::EnumMap;

use crate::endpoints::eds_reference_name;
use crate::error::{Error, Result};
use crate::rewrite::rds_route_names;

use super::{Resource, ResourceType, ResourceVersion};

/// A versioned, name-indexed set of resources of a single type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSet {
    pub version: ResourceVersion,
    pub items: BTreeMap<String, Arc<Resource>>,
}

impl ResourceSet {
    fn new(version: ResourceVersion) -> Self {
        Self {
            version,
            items: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Resource>> {
        self.items.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.items.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Resource>> + '_ {
        self.items.values()
    }
}

/// A complete, versioned set of xDS resources for a node.
///
/// Every type in a snapshot shares the same version. Snapshots are immutable
/// once built and are shared between the cache and any stream responding with
/// their resources.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    version: ResourceVersion,
    resources: EnumMap<ResourceType, ResourceSet>,
}

impl Snapshot {
    /// Build a snapshot from a list of resources.
    ///
    /// Resources are indexed by type and name. When two resources share a
    /// type and a name, the one that comes later in `resources` wins.
    pub fn new(version: ResourceVersion, resources: impl IntoIterator<Item = Resource>) -> Self {
        let mut sets: EnumMap<ResourceType, ResourceSet> =
            EnumMap::from_fn(|_| ResourceSet::new(version.clone()));

        for resource in resources {
            let set = &mut sets[resource.resource_type()];
            set.items
                .insert(resource.name().to_string(), Arc::new(resource));
        }

        Self {
            version,
            resources: sets,
        }
    }

    pub fn empty(version: ResourceVersion) -> Self {
        Self::new(version, [])
    }

    pub fn version(&self) -> &ResourceVersion {
        &self.version
    }

    pub fn version_of(&self, resource_type: ResourceType) -> &ResourceVersion {
        &self.resources[resource_type].version
    }

    pub fn resources(&self, resource_type: ResourceType) -> &ResourceSet {
        &self.resources[resource_type]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, &ResourceSet)> + '_ {
        self.resources.iter()
    }

    /// Check that every cross-resource reference in this snapshot resolves.
    ///
    /// Every EDS cluster needs a ClusterLoadAssignment named after its EDS
    /// reference name, and every route configuration a listener asks for over
    /// RDS must be present. Clusters that carry their endpoints inline don't
    /// reference anything.
    pub fn consistent(&self) -> Result<()> {
        let mut missing_endpoints = BTreeSet::new();
        for resource in self.resources[ResourceType::Cluster].iter() {
            let Resource::Cluster(cluster) = resource.as_ref() else {
                continue;
            };
            if let Some(name) = eds_reference_name(cluster) {
                if !self.resources[ResourceType::Endpoint].items.contains_key(name) {
                    missing_endpoints.insert(name.to_string());
                }
            }
        }

        let mut missing_routes = BTreeSet::new();
        for resource in self.resources[ResourceType::Listener].iter() {
            let Resource::Listener(listener) = resource.as_ref() else {
                continue;
            };
            for name in rds_route_names(listener) {
                if !self.resources[ResourceType::Route].items.contains_key(&name) {
                    missing_routes.insert(name);
                }
            }
        }

        if missing_endpoints.is_empty() && missing_routes.is_empty() {
            return Ok(());
        }

        let mut message = format!("snapshot {} is inconsistent:", self.version);
        if !missing_endpoints.is_empty() {
            message.push_str(&format!(" missing endpoints {missing_endpoints:?}"));
        }
        if !missing_routes.is_empty() {
            message.push_str(&format!(" missing routes {missing_routes:?}"));
        }
        Err(Error::Inconsistent(message))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xds::test as xds_test;
    use crate::xds::test::*;
    use pretty_assertions::assert_eq;
    use xds_api::pb::envoy::config::route::v3 as xds_route;

    #[test]
    fn test_later_resources_win() {
        let snapshot = Snapshot::new(
            "v1".into(),
            [
                cluster!(static "a").into(),
                cluster!("a").into(),
                cluster!(static "b").into(),
            ],
        );

        let clusters = snapshot.resources(ResourceType::Cluster);
        assert_eq!(clusters.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(
            clusters.get("a").map(|r| r.as_ref()),
            Some(&Resource::from(cluster!("a")))
        );
    }

    #[test]
    fn test_versions_are_shared() {
        let snapshot = Snapshot::new("v7".into(), [cluster!(static "a").into()]);
        for rtype in ResourceType::all() {
            assert_eq!(&**snapshot.version_of(*rtype), "v7");
        }
    }

    #[test]
    fn test_consistent() {
        let snapshot = Snapshot::new(
            "v1".into(),
            [
                cluster!("c").into(),
                cla!("c").into(),
                listener!(rds "l", "l-routeconfig-0").into(),
                route_config!("l-routeconfig-0", []).into(),
            ],
        );
        assert!(snapshot.consistent().is_ok());
    }

    #[test]
    fn test_consistent_eds_service_name() {
        let snapshot = Snapshot::new(
            "v1".into(),
            [cluster!("c", service = "c-svc").into(), cla!("c-svc").into()],
        );
        assert!(snapshot.consistent().is_ok());

        let snapshot = Snapshot::new(
            "v1".into(),
            [cluster!("c", service = "c-svc").into(), cla!("c").into()],
        );
        assert!(snapshot.consistent().is_err());
    }

    #[test]
    fn test_inconsistent_missing_endpoints() {
        let snapshot = Snapshot::new("v1".into(), [cluster!("c").into()]);
        let err = snapshot.consistent().unwrap_err();
        assert!(matches!(err, Error::Inconsistent(_)));
        assert!(err.to_string().contains("\"c\""));
    }

    #[test]
    fn test_inconsistent_missing_routes() {
        let snapshot = Snapshot::new("v1".into(), [listener!(rds "l", "l-routes").into()]);
        let err = snapshot.consistent().unwrap_err();
        assert!(err.to_string().contains("l-routes"));
    }

    #[test]
    fn test_inline_routes_are_not_references() {
        let vhost = xds_test::virtual_host("vh", ["*"], [route!(default "c")]);
        let snapshot = Snapshot::new(
            "v1".into(),
            [listener!("l" => [vhost]).into(), cluster!(static "c").into()],
        );
        assert!(snapshot.consistent().is_ok());

        // unused routes are fine
        let snapshot = Snapshot::new(
            "v1".into(),
            [xds_route::RouteConfiguration {
                name: "unused".to_string(),
                ..Default::default()
            }
            .into()],
        );
        assert!(snapshot.consistent().is_ok());
    }
}
