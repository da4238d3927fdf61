//! Fastpath input and the cluster/endpoint join.

use std::collections::BTreeMap;

use tracing::debug;
use xds_api::pb::envoy::config::{
    cluster::v3::{
        self as xds_cluster,
        cluster::{ClusterDiscoveryType, DiscoveryType},
    },
    core::v3 as xds_core,
    endpoint::v3 as xds_endpoint,
    listener::v3 as xds_listener,
    route::v3 as xds_route,
};

/// The transport protocol of a fastpath endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl From<Protocol> for xds_core::socket_address::Protocol {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Tcp => xds_core::socket_address::Protocol::Tcp,
            Protocol::Udp => xds_core::socket_address::Protocol::Udp,
        }
    }
}

/// A single resolved address for a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u32,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn tcp(ip: impl Into<String>, port: u32) -> Self {
        Self {
            ip: ip.into(),
            port,
            protocol: Protocol::Tcp,
        }
    }
}

/// Endpoint data delivered over the fastpath, keyed by cluster reference name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub entries: BTreeMap<String, Vec<Endpoint>>,
}

impl FromIterator<(String, Vec<Endpoint>)> for Endpoints {
    fn from_iter<T: IntoIterator<Item = (String, Vec<Endpoint>)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Materialized endpoint data: one ClusterLoadAssignment per reference name.
pub type EndpointMap = BTreeMap<String, xds_endpoint::ClusterLoadAssignment>;

impl Endpoints {
    /// Convert every entry into a ClusterLoadAssignment with a single,
    /// locality-less group of endpoints.
    pub fn to_load_assignments(&self) -> EndpointMap {
        self.entries
            .iter()
            .map(|(name, endpoints)| {
                let lb_endpoints = endpoints.iter().map(lb_endpoint).collect();
                let cla = xds_endpoint::ClusterLoadAssignment {
                    cluster_name: name.clone(),
                    endpoints: vec![xds_endpoint::LocalityLbEndpoints {
                        lb_endpoints,
                        ..Default::default()
                    }],
                    ..Default::default()
                };
                (name.clone(), cla)
            })
            .collect()
    }
}

fn lb_endpoint(endpoint: &Endpoint) -> xds_endpoint::LbEndpoint {
    let protocol: xds_core::socket_address::Protocol = endpoint.protocol.into();
    let address = xds_core::Address {
        address: Some(xds_core::address::Address::SocketAddress(
            xds_core::SocketAddress {
                protocol: protocol.into(),
                address: endpoint.ip.clone(),
                port_specifier: Some(xds_core::socket_address::PortSpecifier::PortValue(
                    endpoint.port,
                )),
                ..Default::default()
            },
        )),
    };

    xds_endpoint::LbEndpoint {
        host_identifier: Some(xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(
            xds_endpoint::Endpoint {
                address: Some(address),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

/// Static resources delivered over the fastpath.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticResources {
    pub listeners: Vec<xds_listener::Listener>,
    pub routes: Vec<xds_route::RouteConfiguration>,
    pub clusters: Vec<xds_cluster::Cluster>,
}

/// A single fastpath event.
///
/// Either half may be missing: an event with no endpoints leaves the current
/// endpoint data alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FastpathSnapshot {
    pub snapshot: Option<StaticResources>,
    pub endpoints: Option<Endpoints>,
}

/// The name a cluster uses to look up its endpoints, if it's an EDS cluster.
///
/// This is the EDS service name when one is set, and the cluster name
/// otherwise.
pub fn eds_reference_name(cluster: &xds_cluster::Cluster) -> Option<&str> {
    let eds = Some(ClusterDiscoveryType::Type(DiscoveryType::Eds.into()));
    if cluster.cluster_discovery_type != eds {
        return None;
    }

    let service_name = cluster
        .eds_cluster_config
        .as_ref()
        .map(|c| c.service_name.as_str())
        .filter(|s| !s.is_empty());
    Some(service_name.unwrap_or(&cluster.name))
}

/// Join EDS clusters against known endpoint data.
///
/// Every EDS cluster gets exactly one ClusterLoadAssignment named after its
/// reference name, synthesized empty if there's no endpoint data for it. A
/// cluster that doesn't exist and a cluster with no endpoints are very
/// different things to Envoy, so a gap in endpoint data must never make a
/// cluster disappear.
///
/// With `eds_bypass` set, EDS clusters are instead rewritten in place into
/// STATIC clusters carrying their load assignment inline and nothing is
/// returned. Otherwise `clusters` is left untouched.
pub fn join(
    clusters: &mut [xds_cluster::Cluster],
    endpoints: &EndpointMap,
    eds_bypass: bool,
) -> Vec<xds_endpoint::ClusterLoadAssignment> {
    let mut assignments = Vec::new();

    for cluster in clusters.iter_mut() {
        let Some(ref_name) = eds_reference_name(cluster) else {
            continue;
        };

        let cla = match endpoints.get(ref_name) {
            Some(cla) => cla.clone(),
            None => {
                debug!(cluster = %cluster.name, ref_name, "no endpoints found, using an empty assignment");
                xds_endpoint::ClusterLoadAssignment {
                    cluster_name: ref_name.to_string(),
                    ..Default::default()
                }
            }
        };

        if eds_bypass {
            cluster.cluster_discovery_type =
                Some(ClusterDiscoveryType::Type(DiscoveryType::Static.into()));
            cluster.eds_cluster_config = None;
            cluster.load_assignment = Some(cla);
        } else {
            assignments.push(cla);
        }
    }

    assignments
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xds::test::*;
    use pretty_assertions::assert_eq;

    fn endpoint_map(entries: Vec<(&str, Vec<Endpoint>)>) -> EndpointMap {
        entries
            .into_iter()
            .map(|(name, eps)| (name.to_string(), eps))
            .collect::<Endpoints>()
            .to_load_assignments()
    }

    #[test]
    fn test_to_load_assignments() {
        let map = endpoint_map(vec![(
            "c",
            vec![Endpoint::tcp("10.0.0.1", 80), Endpoint::tcp("10.0.0.2", 8080)],
        )]);

        assert_eq!(
            map.get("c"),
            Some(&cla!("c" => [("10.0.0.1", 80), ("10.0.0.2", 8080)]))
        );
    }

    #[test]
    fn test_udp_endpoint() {
        let map = endpoint_map(vec![(
            "dns",
            vec![Endpoint {
                ip: "10.0.0.53".to_string(),
                port: 53,
                protocol: Protocol::Udp,
            }],
        )]);

        let lb_endpoint = &map["dns"].endpoints[0].lb_endpoints[0];
        let Some(xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(endpoint)) =
            &lb_endpoint.host_identifier
        else {
            panic!("missing endpoint");
        };
        let Some(xds_core::address::Address::SocketAddress(addr)) =
            endpoint.address.as_ref().and_then(|a| a.address.as_ref())
        else {
            panic!("missing socket address");
        };
        assert_eq!(addr.protocol, xds_core::socket_address::Protocol::Udp as i32);
    }

    #[test]
    fn test_eds_reference_name() {
        assert_eq!(eds_reference_name(&cluster!("c")), Some("c"));
        assert_eq!(
            eds_reference_name(&cluster!("c", service = "c-svc")),
            Some("c-svc")
        );
        assert_eq!(eds_reference_name(&cluster!(static "c")), None);
    }

    #[test]
    fn test_join() {
        let mut clusters = vec![cluster!("a"), cluster!(static "b"), cluster!("c")];
        let before = clusters.clone();
        let map = endpoint_map(vec![("a", vec![Endpoint::tcp("10.0.0.1", 80)])]);

        let assignments = join(&mut clusters, &map, false);
        assert_eq!(
            assignments,
            vec![cla!("a" => [("10.0.0.1", 80)]), cla!("c")]
        );
        assert_eq!(clusters, before);
    }

    #[test]
    fn test_join_is_total() {
        let mut clusters = vec![
            cluster!("a"),
            cluster!("b", service = "b-svc"),
            cluster!(static "c"),
            cluster!("d"),
        ];
        let map = endpoint_map(vec![
            ("b-svc", vec![Endpoint::tcp("10.0.0.2", 80)]),
            ("unused", vec![Endpoint::tcp("10.0.0.3", 80)]),
        ]);

        let assignments = join(&mut clusters, &map, false);
        let names: Vec<_> = assignments.iter().map(|a| a.cluster_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b-svc", "d"]);
    }

    #[test]
    fn test_join_bypass() {
        let mut clusters = vec![cluster!("a"), cluster!("b"), cluster!(static "c")];
        let map = endpoint_map(vec![("a", vec![Endpoint::tcp("10.0.0.1", 80)])]);

        let assignments = join(&mut clusters, &map, true);
        assert!(assignments.is_empty());

        let static_type = Some(ClusterDiscoveryType::Type(DiscoveryType::Static.into()));
        for cluster in &clusters {
            assert_eq!(cluster.cluster_discovery_type, static_type);
            assert_eq!(cluster.eds_cluster_config, None);
            assert_eq!(eds_reference_name(cluster), None);
        }
        assert_eq!(
            clusters[0].load_assignment,
            Some(cla!("a" => [("10.0.0.1", 80)]))
        );
        assert_eq!(clusters[1].load_assignment, Some(cla!("b")));
        assert_eq!(clusters[2].load_assignment, None);
    }
}
