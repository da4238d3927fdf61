use std::ops::Deref;
use std::sync::Arc;

use smol_str::SmolStr;
use xds_api::pb::{
    envoy::{
        config::{
            cluster::v3 as xds_cluster, endpoint::v3 as xds_endpoint,
            listener::v3 as xds_listener, route::v3 as xds_route,
        },
        extensions::transport_sockets::tls::v3 as xds_tls,
        service::runtime::v3 as xds_runtime,
    },
    google::protobuf,
};
use xds_api::WellKnownTypes;

/// An opaque string used to version a set of xDS resources.
///
/// `ResourceVersion`s are immutable and cheap to `clone` and share.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(SmolStr);

impl ResourceVersion {
    /// The version assigned to the snapshot built for `generation`.
    pub fn generation(generation: u64) -> Self {
        Self(smol_str::format_smolstr!("v{generation}"))
    }
}

impl Deref for ResourceVersion {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for ResourceVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

macro_rules! impl_resource_version_from {
    ($from_ty:ty) => {
        impl From<$from_ty> for ResourceVersion {
            fn from(s: $from_ty) -> ResourceVersion {
                ResourceVersion(s.into())
            }
        }
    };
}

impl_resource_version_from!(&str);
impl_resource_version_from!(String);
impl_resource_version_from!(&String);
impl_resource_version_from!(Arc<str>);

/// The kinds of resource a snapshot carries.
///
/// Variants are declared in make-before-break order, so iterating over an
/// `EnumMap<ResourceType, _>` visits clusters and endpoints before the
/// listeners and routes that might reference them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, enum_map::Enum)]
pub enum ResourceType {
    Cluster,
    Endpoint,
    Listener,
    Route,
    Runtime,
    Secret,
}

impl ResourceType {
    pub fn all() -> &'static [Self] {
        &[
            Self::Cluster,
            Self::Endpoint,
            Self::Listener,
            Self::Route,
            Self::Runtime,
            Self::Secret,
        ]
    }

    fn as_well_known(&self) -> WellKnownTypes {
        match self {
            ResourceType::Cluster => WellKnownTypes::Cluster,
            ResourceType::Endpoint => WellKnownTypes::ClusterLoadAssignment,
            ResourceType::Listener => WellKnownTypes::Listener,
            ResourceType::Route => WellKnownTypes::RouteConfiguration,
            ResourceType::Runtime => WellKnownTypes::Runtime,
            ResourceType::Secret => WellKnownTypes::Secret,
        }
    }

    fn from_well_known(wkt: WellKnownTypes) -> Option<Self> {
        match wkt {
            WellKnownTypes::Cluster => Some(Self::Cluster),
            WellKnownTypes::ClusterLoadAssignment => Some(Self::Endpoint),
            WellKnownTypes::Listener => Some(Self::Listener),
            WellKnownTypes::RouteConfiguration => Some(Self::Route),
            WellKnownTypes::Runtime => Some(Self::Runtime),
            WellKnownTypes::Secret => Some(Self::Secret),
            _ => None,
        }
    }

    pub fn type_url(&self) -> &'static str {
        self.as_well_known().type_url()
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::from_well_known(WellKnownTypes::from_type_url(type_url)?)
    }

    /// The name used for this kind of resource in logs and snapshot dumps.
    pub(crate) fn plural_name(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "Clusters",
            ResourceType::Endpoint => "Endpoints",
            ResourceType::Listener => "Listeners",
            ResourceType::Route => "Routes",
            ResourceType::Runtime => "Runtimes",
            ResourceType::Secret => "Secrets",
        }
    }
}

/// A single validated xDS resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Cluster(xds_cluster::Cluster),
    Endpoint(xds_endpoint::ClusterLoadAssignment),
    Listener(xds_listener::Listener),
    Route(xds_route::RouteConfiguration),
    Runtime(xds_runtime::Runtime),
    Secret(xds_tls::Secret),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Cluster(_) => ResourceType::Cluster,
            Resource::Endpoint(_) => ResourceType::Endpoint,
            Resource::Listener(_) => ResourceType::Listener,
            Resource::Route(_) => ResourceType::Route,
            Resource::Runtime(_) => ResourceType::Runtime,
            Resource::Secret(_) => ResourceType::Secret,
        }
    }

    /// The name this resource is indexed by. Endpoints are named after the
    /// cluster they belong to, everything else has a `name` field.
    pub fn name(&self) -> &str {
        match self {
            Resource::Cluster(c) => &c.name,
            Resource::Endpoint(e) => &e.cluster_name,
            Resource::Listener(l) => &l.name,
            Resource::Route(r) => &r.name,
            Resource::Runtime(r) => &r.name,
            Resource::Secret(s) => &s.name,
        }
    }

    pub fn to_any(&self) -> protobuf::Any {
        let any = match self {
            Resource::Cluster(c) => protobuf::Any::from_msg(c),
            Resource::Endpoint(e) => protobuf::Any::from_msg(e),
            Resource::Listener(l) => protobuf::Any::from_msg(l),
            Resource::Route(r) => protobuf::Any::from_msg(r),
            Resource::Runtime(r) => protobuf::Any::from_msg(r),
            Resource::Secret(s) => protobuf::Any::from_msg(s),
        };
        any.expect("generated invalid protobuf")
    }
}

macro_rules! impl_resource_from {
    ($variant:ident, $xds_ty:ty) => {
        impl From<$xds_ty> for Resource {
            fn from(xds: $xds_ty) -> Self {
                Resource::$variant(xds)
            }
        }
    };
}

impl_resource_from!(Cluster, xds_cluster::Cluster);
impl_resource_from!(Endpoint, xds_endpoint::ClusterLoadAssignment);
impl_resource_from!(Listener, xds_listener::Listener);
impl_resource_from!(Route, xds_route::RouteConfiguration);
impl_resource_from!(Runtime, xds_runtime::Runtime);
impl_resource_from!(Secret, xds_tls::Secret);
