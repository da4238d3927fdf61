//! An xDS control plane for Envoy.
//!
//! ambex reads Envoy resources from a set of directories and from an
//! in-process fastpath, assembles them into consistent, versioned
//! [snapshots][xds::Snapshot], and serves them to Envoy over ADS and the
//! per-type discovery services. Snapshots are pushed through a
//! [rate limiter][updater::RateLimiter] that holds back new configuration
//! while too many old configurations are still draining and memory is
//! tight.

mod error;
pub use crate::error::{Error, Result};

pub mod config;
pub mod decode;
pub mod endpoints;
pub mod memory;
pub mod rewrite;
pub mod snapshot_log;
pub mod updater;
pub mod xds;

mod ambex;
mod builder;

pub use ambex::{watch_dirs, Ambex, Events};
pub use builder::SnapshotBuilder;
