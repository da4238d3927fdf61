//! Lift inline route configurations out of listeners and into RDS.
//!
//! A listener that embeds its RouteConfiguration has to be drained and
//! replaced by Envoy whenever any route changes. Rewriting those listeners to
//! reference their routes over RDS keeps route churn on the RDS stream and
//! leaves listeners alone unless they actually change.

use xds_api::pb::{
    envoy::{
        config::{
            core::v3 as xds_core,
            listener::v3::{self as xds_listener, filter::ConfigType},
            route::v3 as xds_route,
        },
        extensions::filters::network::http_connection_manager::v3::{
            self as xds_http, http_connection_manager::RouteSpecifier,
        },
    },
    google::protobuf,
};

use crate::error::{Error, Result};

/// The well-known filter name of the HTTP Connection Manager.
pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";

/// Rewrite a listener so that every HTTP Connection Manager that carries an
/// inline route configuration references it over ADS-sourced RDS instead.
///
/// Returns the rewritten listener and the route configurations lifted out of
/// it, in the order they were found. Inline configurations without a name are
/// named `{listener}-routeconfig-{n}` where `n` counts the route
/// configurations already lifted from this listener. A listener without any
/// inline routes comes back unchanged.
pub fn rewrite_listener(
    listener: &xds_listener::Listener,
) -> Result<(xds_listener::Listener, Vec<xds_route::RouteConfiguration>)> {
    let mut listener = listener.clone();
    let mut route_configs = Vec::new();

    for filter_chain in &mut listener.filter_chains {
        for filter in &mut filter_chain.filters {
            if filter.name != HTTP_CONNECTION_MANAGER {
                continue;
            }
            let Some(ConfigType::TypedConfig(any)) = &filter.config_type else {
                continue;
            };

            let mut hcm = decode_hcm(&listener.name, any)?;
            let Some(RouteSpecifier::RouteConfig(mut route_config)) = hcm.route_specifier.take()
            else {
                continue;
            };

            if route_config.name.is_empty() {
                route_config.name =
                    format!("{}-routeconfig-{}", listener.name, route_configs.len());
            }

            hcm.route_specifier = Some(RouteSpecifier::Rds(xds_http::Rds {
                config_source: Some(ads_config_source()),
                route_config_name: route_config.name.clone(),
            }));
            route_configs.push(route_config);

            let any = protobuf::Any::from_msg(&hcm).map_err(|e| {
                Error::invalid(
                    "Listener",
                    &listener.name,
                    format!("failed to encode HttpConnectionManager: {e}"),
                )
            })?;
            filter.config_type = Some(ConfigType::TypedConfig(any));
        }
    }

    Ok((listener, route_configs))
}

/// The names of the route configurations a listener references over RDS.
///
/// HTTP Connection Managers that fail to decode don't reference anything.
pub(crate) fn rds_route_names(listener: &xds_listener::Listener) -> Vec<String> {
    let mut names = Vec::new();
    for filter_chain in &listener.filter_chains {
        for filter in &filter_chain.filters {
            if filter.name != HTTP_CONNECTION_MANAGER {
                continue;
            }
            let Some(ConfigType::TypedConfig(any)) = &filter.config_type else {
                continue;
            };
            if let Ok(hcm) = decode_hcm(&listener.name, any) {
                if let Some(RouteSpecifier::Rds(rds)) = hcm.route_specifier {
                    names.push(rds.route_config_name);
                }
            }
        }
    }
    names
}

fn decode_hcm(listener_name: &str, any: &protobuf::Any) -> Result<xds_http::HttpConnectionManager> {
    any.to_msg().map_err(|e| {
        Error::invalid(
            "Listener",
            listener_name,
            format!("invalid HttpConnectionManager: {e}"),
        )
    })
}

fn ads_config_source() -> xds_core::ConfigSource {
    xds_core::ConfigSource {
        config_source_specifier: Some(xds_core::config_source::ConfigSourceSpecifier::Ads(
            xds_core::AggregatedConfigSource {},
        )),
        resource_api_version: xds_core::ApiVersion::V3.into(),
        ..Default::default()
    }
}
