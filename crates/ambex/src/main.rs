use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ambex::config::Args;
use ambex::memory::CgroupMemory;
use ambex::snapshot_log::SnapshotLog;
use ambex::updater::{interval_ticks, run_updater, RateLimiter, SystemClock};
use ambex::xds::{server, SnapshotCache};
use ambex::{Ambex, Events, SnapshotBuilder};

#[tokio::main]
async fn main() -> ambex::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!(version = env!("CARGO_PKG_VERSION"), "ambex starting");
    write_pid_file(&args.pid_file);

    let address = args.listen_address()?;
    info!(%address, watch = args.watch, eds_bypass = args.eds_bypass, "configured");
    let snapshot_dir = args.snapshot_dir();
    let snapshot_log = SnapshotLog::new(&snapshot_dir, args.snapshot_count());
    info!(
        snapshot_dir = %snapshot_dir.display(),
        snapshot_count = args.snapshot_count(),
        "logging snapshots",
    );

    let shutdown = CancellationToken::new();
    let cache = Arc::new(SnapshotCache::new(true));

    let (updates_tx, updates_rx) = mpsc::channel(1);
    let (reloads_tx, reloads_rx) = mpsc::channel(1);
    // nothing in this process produces fastpath events, but the sender has to
    // stay alive for as long as the main loop runs.
    let (_fastpath_tx, fastpath_rx) = mpsc::channel(1);

    let (_watcher, fs_events) = if args.watch {
        let (watcher, events) = ambex::watch_dirs(&args.dirs)?;
        (Some(watcher), Some(events))
    } else {
        (None, None)
    };

    let mut tasks = JoinSet::new();

    tasks.spawn(server::serve(cache.clone(), address, shutdown.clone()));

    let updater_config = args.updater_config();
    let ticks = interval_ticks(updater_config.tick_interval, SystemClock);
    let limiter = RateLimiter::new(updater_config, CgroupMemory::default());
    tasks.spawn(run_updater(
        limiter,
        SystemClock,
        updates_rx,
        ticks,
        shutdown.clone(),
    ));

    let main_loop = Ambex::new(
        SnapshotBuilder::new(args.dirs.clone(), args.eds_bypass),
        cache,
        snapshot_log,
        updates_tx,
    );
    let events = Events {
        reloads: reloads_rx,
        fastpath: fastpath_rx,
        fs_events,
    };
    tasks.spawn(main_loop.run(events, shutdown.clone()));

    tokio::spawn(handle_signals(reloads_tx, shutdown.clone()));

    // the first task to exit takes everything else down with it
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        shutdown.cancel();
        match joined {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                error!("shutting down: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
            Err(e) => error!("task failed: {e}"),
        }
    }

    info!("ambex stopped");
    result
}

fn init_tracing(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if args.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn write_pid_file(path: &Path) {
    let pid = std::process::id();
    match std::fs::write(path, format!("{pid}\n")) {
        Ok(()) => info!(pid, path = %path.display(), "wrote pid file"),
        Err(e) => warn!(pid, path = %path.display(), "failed to write pid file: {e}"),
    }
}

/// SIGHUP triggers a reload. SIGTERM and ctrl-c shut everything down.
async fn handle_signals(reloads: mpsc::Sender<()>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut terminate) =
        match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
            (Ok(hangup), Ok(terminate)) => (hangup, terminate),
            (Err(e), _) | (_, Err(e)) => {
                error!("failed to install signal handlers: {e}");
                shutdown.cancel();
                return;
            }
        };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            Some(()) = hangup.recv() => {
                info!("got SIGHUP, reloading");
                // a reload that's already queued covers this one
                let _ = reloads.try_send(());
            }
            _ = terminate.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutdown signal received");
    shutdown.cancel();
}
