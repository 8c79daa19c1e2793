//! The shared tick that drives every timeout registry.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::Sweep;

/// Configuration for the [`Clock`].
#[derive(Debug, Clone)]
pub struct ClockConfig {
    /// Time between sweeps. Timeouts are accurate to within one interval.
    pub interval: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Sweeps a fixed set of registries on one fixed-interval tick.
///
/// Cost per tick is one check per registry (is its oldest entry due?)
/// rather than one timer per entry. Expired entries are delivered in
/// batches on each registry's own [`Expirations`](crate::Expirations)
/// stream.
pub struct Clock {
    config: ClockConfig,
    registries: Vec<Box<dyn Sweep>>,
    tick_count: u64,
}

impl Clock {
    pub fn new(config: ClockConfig) -> Self {
        Self {
            config,
            registries: Vec::new(),
            tick_count: 0,
        }
    }

    /// Adds a registry to the sweep set. Pass a clone of the handle.
    pub fn register(&mut self, registry: impl Sweep + 'static) {
        debug!(registry = registry.name(), "timeout registry registered");
        self.registries.push(Box::new(registry));
    }

    /// Runs one sweep over every registry. Returns the total number of
    /// expired entries.
    pub fn tick(&mut self) -> usize {
        self.tick_count += 1;
        let now = Instant::now();
        let expired = self
            .registries
            .iter()
            .map(|r| r.sweep(now))
            .sum();
        trace!(tick = self.tick_count, expired, "clock tick");
        expired
    }

    /// Ticks forever at the configured interval.
    ///
    /// A late tick is not followed by a burst of catch-up ticks; the
    /// next one is scheduled from now.
    pub async fn run(mut self) {
        let mut interval = time::interval_at(
            Instant::now() + self.config.interval,
            self.config.interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(
            interval_ms = self.config.interval.as_millis() as u64,
            registries = self.registries.len(),
            "clock started"
        );
        loop {
            interval.tick().await;
            self.tick();
        }
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
