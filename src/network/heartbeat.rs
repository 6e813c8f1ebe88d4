//! Control channel liveness
//!
//! The client sends `PING` every [`PING_INTERVAL`] and expects the relay to answer
//! with `PONG`. When nothing has been heard for longer than [`PONG_TIMEOUT`] the
//! channel is declared dead.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Interval between two probes
pub const PING_INTERVAL: Duration = Duration::from_millis(2500);

/// Silence after which the channel is considered dead
pub const PONG_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Result of a watchdog evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Probe answered recently enough
    Alive,
    /// Timeout exceeded; the monitor has stopped itself
    Expired,
    /// Monitor is not running
    Stopped,
}

/// Heartbeat monitor for one channel lifetime at a time
pub struct HeartbeatMonitor {
    ping_interval: Duration,
    pong_timeout: Duration,
    /// Channel lifetime the monitor is armed for
    lifetime: Option<u64>,
    last_alive: Option<Instant>,
    ticker: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
            lifetime: None,
            last_alive: None,
            ticker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifetime.is_some()
    }

    pub fn is_running_for(&self, lifetime: u64) -> bool {
        self.lifetime == Some(lifetime)
    }

    pub fn last_alive(&self) -> Option<Instant> {
        self.last_alive
    }

    /// Arm the monitor and spawn the recurring tick.
    ///
    /// `on_tick` runs every `ping_interval`; the ticker ends when it returns false.
    /// The caller sends the initial probe.
    pub fn start<F>(&mut self, lifetime: u64, now: Instant, on_tick: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.stop();
        self.lifetime = Some(lifetime);
        self.last_alive = Some(now);

        let period = self.ping_interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut ticks = interval_at(now + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if !on_tick() {
                    break;
                }
            }
        }));

        debug!(
            "Heartbeat started for channel lifetime {} (interval {:?}, timeout {:?})",
            lifetime, self.ping_interval, self.pong_timeout
        );
    }

    /// Record a probe acknowledgement
    pub fn on_probe_ack(&mut self, now: Instant) {
        if self.is_running() {
            self.last_alive = Some(now);
        }
    }

    /// Watchdog evaluation, run on every tick
    pub fn check(&mut self, now: Instant) -> Liveness {
        let Some(last_alive) = self.last_alive.filter(|_| self.is_running()) else {
            return Liveness::Stopped;
        };

        if now.saturating_duration_since(last_alive) > self.pong_timeout {
            self.stop();
            Liveness::Expired
        } else {
            Liveness::Alive
        }
    }

    /// Cancel the recurring tick; safe to call when not running
    pub fn stop(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
        if let Some(lifetime) = self.lifetime.take() {
            debug!("Heartbeat stopped for channel lifetime {}", lifetime);
        }
        self.last_alive = None;
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(PING_INTERVAL, PONG_TIMEOUT)
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
