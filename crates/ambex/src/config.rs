//! Command line and environment configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::builder::FalseyValueParser;
use clap::{Parser, ValueEnum};
use tracing::warn;

use crate::error::{Error, Result};
use crate::updater::UpdaterConfig;

/// Serve Envoy configuration from files on disk over xDS.
#[derive(Debug, Clone, Parser)]
#[command(name = "ambex", version)]
pub struct Args {
    /// Directories to read Envoy resources from.
    #[arg(default_value = ".")]
    pub dirs: Vec<PathBuf>,

    /// Rebuild whenever an input directory changes.
    #[arg(long)]
    pub watch: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    pub debug: bool,

    /// Log as JSON instead of human-readable text.
    #[arg(long)]
    pub log_json: bool,

    /// The network the ADS server listens on.
    #[arg(long, value_enum, default_value_t)]
    pub ads_listen_network: ListenNetwork,

    /// The address the ADS server listens on. Use `:port` to listen on all
    /// interfaces, or a path for unix sockets.
    #[arg(long, default_value = ":18000")]
    pub ads_listen_address: String,

    /// Deprecated. Use --ads-listen-address=:PORT instead.
    #[arg(long = "ads", value_name = "PORT")]
    pub legacy_ads_port: Option<u16>,

    /// How long Envoy takes to drain a replaced configuration, in seconds.
    #[arg(long, env = "AMBASSADOR_DRAIN_TIME", default_value_t = 600)]
    pub drain_time: u64,

    /// Apply every update immediately, regardless of memory pressure.
    #[arg(
        long,
        env = "AMBASSADOR_AMBEX_NO_RATELIMIT",
        value_parser = FalseyValueParser::new()
    )]
    pub disable_ratelimiter: bool,

    /// How many old snapshots to keep on disk. Zero or less disables
    /// snapshot logging entirely. Values that aren't a number fall back to
    /// the default of 30.
    #[arg(
        long = "snapshot-count",
        env = "AMBASSADOR_AMBEX_SNAPSHOT_COUNT",
        value_name = "COUNT",
        allow_hyphen_values = true
    )]
    pub raw_snapshot_count: Option<String>,

    /// Where to write snapshots. Defaults to `snapshots` under
    /// $AMBASSADOR_CONFIG_BASE_DIR, $ambassador_root, or /ambassador.
    #[arg(long)]
    pub snapshot_dir: Option<PathBuf>,

    /// Inline endpoints into clusters instead of serving them over EDS.
    #[arg(
        long,
        env = "AMBASSADOR_EDS_BYPASS",
        value_parser = FalseyValueParser::new()
    )]
    pub eds_bypass: bool,

    /// Where to write this process's pid.
    #[arg(long, default_value = "ambex.pid")]
    pub pid_file: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ListenNetwork {
    #[default]
    Tcp,
    Unix,
}

/// A resolved address for the xDS server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddress::Tcp(addr) => write!(f, "tcp://{addr}"),
            ListenAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

const DEFAULT_SNAPSHOT_COUNT: i64 = 30;

impl Args {
    /// How many snapshots to keep. A count that doesn't parse is logged and
    /// replaced with the default instead of failing startup.
    pub fn snapshot_count(&self) -> i64 {
        let Some(raw) = self.raw_snapshot_count.as_deref() else {
            return DEFAULT_SNAPSHOT_COUNT;
        };

        match raw.trim().parse() {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    value = raw,
                    err = %e,
                    default = DEFAULT_SNAPSHOT_COUNT,
                    "invalid snapshot count, using the default",
                );
                DEFAULT_SNAPSHOT_COUNT
            }
        }
    }

    /// The directory snapshots get logged to.
    pub fn snapshot_dir(&self) -> PathBuf {
        if let Some(dir) = &self.snapshot_dir {
            return dir.clone();
        }

        let root = ["AMBASSADOR_CONFIG_BASE_DIR", "ambassador_root"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| "/ambassador".to_string());

        PathBuf::from(root).join("snapshots")
    }

    /// Resolve the address the xDS server should listen on.
    pub fn listen_address(&self) -> Result<ListenAddress> {
        if let Some(port) = self.legacy_ads_port.filter(|p| *p != 0) {
            return Ok(ListenAddress::Tcp(all_interfaces(port)));
        }

        match self.ads_listen_network {
            ListenNetwork::Unix => Ok(ListenAddress::Unix(PathBuf::from(
                &self.ads_listen_address,
            ))),
            ListenNetwork::Tcp => parse_tcp_address(&self.ads_listen_address),
        }
    }

    pub fn updater_config(&self) -> UpdaterConfig {
        UpdaterConfig {
            drain_time: Duration::from_secs(self.drain_time),
            rate_limit: !self.disable_ratelimiter,
            ..Default::default()
        }
    }
}

fn all_interfaces(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

fn parse_tcp_address(address: &str) -> Result<ListenAddress> {
    if let Some(port) = address.strip_prefix(':') {
        let port = port
            .parse()
            .map_err(|e| Error::Config(format!("invalid port in {address:?}: {e}")))?;
        return Ok(ListenAddress::Tcp(all_interfaces(port)));
    }

    let addr = address
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address {address:?}: {e}")))?;
    Ok(ListenAddress::Tcp(addr))
}
