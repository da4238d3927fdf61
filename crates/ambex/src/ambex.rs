//! The main loop.
//!
//! Everything that can change the configuration Envoy should see (signals,
//! the fastpath, and changes to the input directories) funnels into a single
//! task here. That task owns the endpoint map and the snapshot builder, so
//! builds are strictly sequential and each one sees the latest inputs.

use std::path::PathBuf;
use std::sync::Arc;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::SnapshotBuilder;
use crate::endpoints::{EndpointMap, FastpathSnapshot, StaticResources};
use crate::error::{Error, Result};
use crate::snapshot_log::SnapshotLog;
use crate::updater::Update;
use crate::xds::{SnapshotCache, NODE_KEY};

/// The inputs that drive the main loop.
///
/// A closed channel stops contributing events but never stops the loop. Only
/// cancellation does that.
#[derive(Debug)]
pub struct Events {
    pub reloads: mpsc::Receiver<()>,
    pub fastpath: mpsc::Receiver<FastpathSnapshot>,
    pub fs_events: Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
}

/// Watch `dirs` for changes, sending every event and error to the returned
/// channel.
///
/// The returned watcher must be kept alive for as long as events should be
/// delivered. A directory that can't be watched is logged and skipped.
pub fn watch_dirs(
    dirs: &[PathBuf],
) -> Result<(
    RecommendedWatcher,
    mpsc::UnboundedReceiver<notify::Result<Event>>,
)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })?;

    for dir in dirs {
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => info!(dir = %dir.display(), "watching for changes"),
            Err(e) => warn!(dir = %dir.display(), "failed to watch directory: {e}"),
        }
    }

    Ok((watcher, rx))
}

/// The state of the main loop.
pub struct Ambex {
    builder: SnapshotBuilder,
    endpoints: EndpointMap,
    fastpath: Option<StaticResources>,
    cache: Arc<SnapshotCache>,
    snapshot_log: Option<SnapshotLog>,
    updates: mpsc::Sender<Update>,
}

impl Ambex {
    pub fn new(
        builder: SnapshotBuilder,
        cache: Arc<SnapshotCache>,
        snapshot_log: Option<SnapshotLog>,
        updates: mpsc::Sender<Update>,
    ) -> Self {
        Self {
            builder,
            endpoints: EndpointMap::new(),
            fastpath: None,
            cache,
            snapshot_log,
            updates,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Builds once immediately so there's always something to serve, and
    /// again every time an event arrives. Returns [Error::Shutdown] if the
    /// updater goes away while the loop is still running.
    pub async fn run(mut self, mut events: Events, shutdown: CancellationToken) -> Result<()> {
        self.rebuild(&shutdown).await?;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                Some(()) = events.reloads.recv() => {
                    info!("reload requested");
                }
                Some(fastpath) = events.fastpath.recv() => {
                    debug!(
                        has_snapshot = fastpath.snapshot.is_some(),
                        has_endpoints = fastpath.endpoints.is_some(),
                        "fastpath update",
                    );
                    self.handle_fastpath(fastpath);
                }
                Some(event) = next_fs_event(&mut events.fs_events) => {
                    match event {
                        Ok(event) => debug!(paths = ?event.paths, "input directory changed"),
                        Err(e) => {
                            warn!("directory watcher error: {e}");
                            continue;
                        }
                    }
                }
            }

            self.rebuild(&shutdown).await?;
        }

        debug!("main loop shutting down");
        Ok(())
    }

    fn handle_fastpath(&mut self, fastpath: FastpathSnapshot) {
        if let Some(endpoints) = &fastpath.endpoints {
            self.endpoints = endpoints.to_load_assignments();
        }
        self.fastpath = fastpath.snapshot;
    }

    async fn rebuild(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let snapshot = match self.builder.build(&self.endpoints, self.fastpath.as_ref()) {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_input_error() => {
                error!("dropping snapshot: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(log) = &self.snapshot_log {
            log.write(&snapshot);
        }

        let update = Update::install(self.cache.clone(), NODE_KEY, snapshot);
        let version = update.version.clone();
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!(%version, "shutting down, dropping update");
                Ok(())
            }
            sent = self.updates.send(update) => {
                sent.map_err(|_| Error::Shutdown)?;
                debug!(%version, "sent update");
                Ok(())
            }
        }
    }
}

async fn next_fs_event(
    rx: &mut Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
) -> Option<notify::Result<Event>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
