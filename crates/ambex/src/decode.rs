//! Decoding Envoy resources from files.
//!
//! Every input file holds a single `google.protobuf.Any`, either as
//! protobuf JSON (`.json`) or protobuf text format (`.pb`). The `Any` is
//! unpacked into one of the handful of message types ambex knows how to put
//! into a snapshot and then checked against the basic constraints Envoy would
//! reject it for.

use std::path::Path;

use once_cell::sync::Lazy;
use prost::Name;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use xds_api::pb::{
    envoy::{
        config::{
            bootstrap::v3 as xds_bootstrap, cluster::v3 as xds_cluster,
            listener::v3 as xds_listener, route::v3 as xds_route,
        },
        service::runtime::v3 as xds_runtime,
    },
    google::protobuf,
};

use crate::error::{Error, Result};
use crate::xds::ResourceType;

pub(crate) static DESCRIPTOR_POOL: Lazy<DescriptorPool> = Lazy::new(|| {
    DescriptorPool::decode(xds_api::FILE_DESCRIPTOR_SET)
        .expect("xds-api contains an invalid file descriptor set")
});

/// Look up the descriptor for a message by its fully qualified name.
pub(crate) fn message_descriptor(name: &str) -> Option<MessageDescriptor> {
    DESCRIPTOR_POOL.get_message_by_name(name)
}

/// A decoded and validated input file.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Cluster(xds_cluster::Cluster),
    Route(xds_route::RouteConfiguration),
    Listener(xds_listener::Listener),
    Runtime(xds_runtime::Runtime),
    Bootstrap(Box<xds_bootstrap::Bootstrap>),
}

/// Returns `true` if a file with this name should be decoded.
///
/// Only `.json` and `.pb` files are decoded and hidden files are always
/// skipped.
pub fn decodable(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    matches!(
        Path::new(name).extension().and_then(|e| e.to_str()),
        Some("json") | Some("pb")
    )
}

/// Read, decode, and validate a single file.
pub fn decode(path: &Path) -> Result<Decoded> {
    let contents = std::fs::read_to_string(path).map_err(|e| Error::decode(path, e))?;
    decode_str(path, &contents)
}

/// Decode and validate the contents of a file. The format is chosen by the
/// extension of `path`.
pub fn decode_str(path: &Path, contents: &str) -> Result<Decoded> {
    let any = parse_any(path, contents)?;

    let decoded = match ResourceType::from_type_url(&any.type_url) {
        Some(ResourceType::Cluster) => Decoded::Cluster(unpack(path, &any)?),
        Some(ResourceType::Route) => Decoded::Route(unpack(path, &any)?),
        Some(ResourceType::Listener) => Decoded::Listener(unpack(path, &any)?),
        Some(ResourceType::Runtime) => Decoded::Runtime(unpack(path, &any)?),
        _ if any.type_url == xds_bootstrap::Bootstrap::type_url() => {
            Decoded::Bootstrap(Box::new(unpack(path, &any)?))
        }
        _ => {
            return Err(Error::UnrecognizedKind {
                path: path.to_path_buf(),
                type_url: any.type_url,
            })
        }
    };

    decoded.validate().map_err(|e| Error::decode(path, e))?;
    Ok(decoded)
}

fn parse_any(path: &Path, contents: &str) -> Result<protobuf::Any> {
    let any_descriptor = message_descriptor("google.protobuf.Any")
        .ok_or_else(|| Error::decode(path, "google.protobuf.Any is not a known message"))?;

    let message = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let mut deserializer = serde_json::Deserializer::from_str(contents);
            let message = DynamicMessage::deserialize(any_descriptor, &mut deserializer)
                .map_err(|e| Error::decode(path, e))?;
            deserializer.end().map_err(|e| Error::decode(path, e))?;
            message
        }
        Some("pb") => DynamicMessage::parse_text_format(any_descriptor, contents)
            .map_err(|e| Error::decode(path, e))?,
        _ => return Err(Error::decode(path, "unknown file format")),
    };

    message
        .transcode_to::<protobuf::Any>()
        .map_err(|e| Error::decode(path, e))
}

fn unpack<M: prost::Message + prost::Name + Default>(path: &Path, any: &protobuf::Any) -> Result<M> {
    any.to_msg().map_err(|e| Error::decode(path, e))
}

/// The basic structural constraints Envoy places on a resource.
pub(crate) trait Validate {
    fn validate(&self) -> Result<()>;
}

impl Validate for Decoded {
    fn validate(&self) -> Result<()> {
        match self {
            Decoded::Cluster(c) => c.validate(),
            Decoded::Route(r) => r.validate(),
            Decoded::Listener(l) => l.validate(),
            Decoded::Runtime(r) => r.validate(),
            Decoded::Bootstrap(b) => b.validate(),
        }
    }
}

impl Validate for xds_cluster::Cluster {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid("Cluster", "", "name must not be empty"));
        }
        if let Some(timeout) = &self.connect_timeout {
            if timeout.seconds < 0 || (timeout.seconds == 0 && timeout.nanos <= 0) {
                return Err(Error::invalid(
                    "Cluster",
                    &self.name,
                    "connect_timeout must be greater than zero",
                ));
            }
        }
        if let Some(cla) = &self.load_assignment {
            if cla.cluster_name.is_empty() {
                return Err(Error::invalid(
                    "Cluster",
                    &self.name,
                    "load_assignment.cluster_name must not be empty",
                ));
            }
        }
        Ok(())
    }
}

impl Validate for xds_route::RouteConfiguration {
    fn validate(&self) -> Result<()> {
        for vhost in &self.virtual_hosts {
            if vhost.name.is_empty() {
                return Err(Error::invalid(
                    "RouteConfiguration",
                    &self.name,
                    "virtual host name must not be empty",
                ));
            }
            if vhost.domains.is_empty() || vhost.domains.iter().any(|d| d.is_empty()) {
                return Err(Error::invalid(
                    "RouteConfiguration",
                    &self.name,
                    format!("virtual host {:?} must have non-empty domains", vhost.name),
                ));
            }
            if vhost.routes.iter().any(|r| r.r#match.is_none()) {
                return Err(Error::invalid(
                    "RouteConfiguration",
                    &self.name,
                    format!("virtual host {:?} has a route without a match", vhost.name),
                ));
            }
        }
        Ok(())
    }
}

impl Validate for xds_listener::Listener {
    fn validate(&self) -> Result<()> {
        let filter_chains = self
            .filter_chains
            .iter()
            .chain(self.default_filter_chain.as_ref());

        for filter_chain in filter_chains {
            if filter_chain.filters.iter().any(|f| f.name.is_empty()) {
                return Err(Error::invalid(
                    "Listener",
                    &self.name,
                    "filter names must not be empty",
                ));
            }
        }
        Ok(())
    }
}

impl Validate for xds_runtime::Runtime {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid("Runtime", "", "name must not be empty"));
        }
        Ok(())
    }
}

impl Validate for xds_bootstrap::Bootstrap {
    fn validate(&self) -> Result<()> {
        let Some(static_resources) = &self.static_resources else {
            return Ok(());
        };

        for listener in &static_resources.listeners {
            listener.validate()?;
        }
        for cluster in &static_resources.clusters {
            cluster.validate()?;
        }
        Ok(())
    }
}
