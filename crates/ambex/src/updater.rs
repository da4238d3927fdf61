//! Rate limiting snapshot updates by memory pressure.
//!
//! Envoy keeps every configuration that still has connections draining
//! through it in memory. Pushing config faster than it drains is how an Envoy
//! gets OOM killed, so the updater keeps track of how many configs have been
//! pushed within the last drain window and stops pushing once that number
//! gets too high for the current memory usage. The most recent update is
//! always remembered, so once the window clears it's the one that gets
//! applied.
//!
//! The decision logic lives in [RateLimiter], which does no io and takes the
//! current time as an argument. [run_updater] drives it from a channel of
//! updates and a tick stream.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::xds::{ResourceVersion, Snapshot, SnapshotCache};

/// A prepared snapshot waiting to be applied.
pub struct Update {
    pub version: ResourceVersion,
    apply: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Update")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Update {
    pub fn new(
        version: ResourceVersion,
        apply: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            version,
            apply: Box::new(apply),
        }
    }

    /// An update that installs `snapshot` into `cache` under `node`.
    pub fn install(cache: Arc<SnapshotCache>, node: impl Into<String>, snapshot: Snapshot) -> Self {
        let node = node.into();
        let version = snapshot.version().clone();
        Self::new(version.clone(), move || {
            debug!(%version, "accepting snapshot");
            cache.install(&node, snapshot)
        })
    }

    pub fn apply(self) -> Result<()> {
        (self.apply)()
    }
}

/// A source of the current memory usage of the process, as a percentage of
/// the memory available to it.
pub trait MemoryProbe: Send {
    fn usage_percent(&self) -> u8;
}

impl<F: Fn() -> u8 + Send> MemoryProbe for F {
    fn usage_percent(&self) -> u8 {
        self()
    }
}

/// A source of wall clock time.
pub trait Clock: Send {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl<F: Fn() -> SystemTime + Send> Clock for F {
    fn now(&self) -> SystemTime {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// How long Envoy takes to drain a replaced configuration.
    pub drain_time: Duration,

    /// When false, memory usage is ignored and every update is applied.
    pub rate_limit: bool,

    /// How often to retry applying a throttled update.
    pub tick_interval: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            drain_time: Duration::from_secs(600),
            rate_limit: true,
            tick_interval: Duration::from_secs(10),
        }
    }
}

/// The number of configs that may be draining at once at a given memory
/// usage. Zero means there is no limit.
pub fn max_stale(usage_percent: u8) -> usize {
    match usage_percent {
        90.. => 1,
        80.. => 15,
        70.. => 30,
        60.. => 60,
        50.. => 120,
        _ => 0,
    }
}

/// What a [RateLimiter] did with its latest input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Applied the latest update.
    Applied(ResourceVersion),

    /// Too many configs are still draining. The latest update is kept.
    Throttled {
        usage_percent: u8,
        max_stale: usize,
        draining: usize,
    },

    /// Nothing to do.
    Idle,
}

/// The decision logic of the updater.
pub struct RateLimiter<P> {
    config: UpdaterConfig,
    probe: P,
    latest: Option<Update>,
    received_any: bool,
    pushed: bool,
    draining: VecDeque<SystemTime>,
}

impl<P: MemoryProbe> RateLimiter<P> {
    pub fn new(config: UpdaterConfig, probe: P) -> Self {
        Self {
            config,
            probe,
            latest: None,
            received_any: false,
            pushed: false,
            draining: VecDeque::new(),
        }
    }

    /// The number of configs pushed within the last drain window, as of the
    /// last decision.
    pub fn draining(&self) -> usize {
        self.draining.len()
    }

    /// Handle a new update, replacing any update that hasn't been applied yet.
    pub fn handle_update(&mut self, update: Update, now: SystemTime) -> Result<Decision> {
        if let Some(dropped) = self.latest.replace(update) {
            debug!(version = %dropped.version, "superseded unapplied update");
        }
        self.received_any = true;
        self.pushed = false;
        self.decide(now)
    }

    /// Handle a timer tick.
    pub fn handle_tick(&mut self, now: SystemTime) -> Result<Decision> {
        if self.pushed {
            return Ok(Decision::Idle);
        }
        self.decide(now)
    }

    fn decide(&mut self, now: SystemTime) -> Result<Decision> {
        let drain_time = self.config.drain_time;
        // clocks can go backwards. treat anything from the future as new.
        self.draining.retain(|t| {
            let age = now.duration_since(*t).unwrap_or_default();
            age < drain_time
        });

        let usage_percent = if self.config.rate_limit {
            self.probe.usage_percent()
        } else {
            0
        };
        let max_stale = max_stale(usage_percent);

        if max_stale > 0 && self.draining.len() >= max_stale {
            debug!(
                usage_percent,
                max_stale,
                draining = self.draining.len(),
                "throttling config updates"
            );
            return Ok(Decision::Throttled {
                usage_percent,
                max_stale,
                draining: self.draining.len(),
            });
        }

        if !self.received_any {
            return Ok(Decision::Idle);
        }

        let Some(update) = self.latest.take() else {
            return Ok(Decision::Idle);
        };
        let version = update.version.clone();
        update.apply()?;

        self.draining.push_back(now);
        self.pushed = true;
        info!(%version, usage_percent, draining = self.draining.len(), "pushed snapshot");
        Ok(Decision::Applied(version))
    }
}

/// A stream that yields the current time from `clock` every `period`.
pub fn interval_ticks<C: Clock + Unpin + 'static>(
    period: Duration,
    clock: C,
) -> impl Stream<Item = SystemTime> + Send + Unpin {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio_stream::wrappers::IntervalStream::new(interval).map(move |_| clock.now())
}

/// Apply updates from `updates` as fast as memory pressure allows.
///
/// Returns when `shutdown` is cancelled or `updates` is closed. Returns an
/// error if an update fails to apply.
pub async fn run_updater<P, C, T>(
    mut limiter: RateLimiter<P>,
    clock: C,
    mut updates: mpsc::Receiver<Update>,
    mut ticks: T,
    shutdown: CancellationToken,
) -> Result<()>
where
    P: MemoryProbe,
    C: Clock,
    T: Stream<Item = SystemTime> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            update = updates.recv() => {
                let Some(update) = update else {
                    break;
                };
                limiter.handle_update(update, clock.now())?;
            }
            Some(now) = ticks.next() => {
                limiter.handle_tick(now)?;
            }
        }
    }

    debug!("updater shutting down");
    Ok(())
}
