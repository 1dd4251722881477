//! Session Clock
//!
//! Per-session countdown with increment-on-move. The [`Clock`] itself is plain
//! data owned by its session and only touched under the session's lock; the
//! periodic work is done by a ticker task spawned with [`spawn_ticker`], which
//! calls back into the session once per period and stops on the clock's stop
//! signal.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::game::state::Color;

/// Clock settings applied to every new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockConfig {
    /// Starting time per side.
    pub initial: Duration,
    /// Time added to a side after each of its accepted moves.
    pub increment: Duration,
    /// Tick period; also the amount deducted per tick.
    pub tick: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(600),
            increment: Duration::ZERO,
            tick: Duration::from_secs(1),
        }
    }
}

impl ClockConfig {
    /// Read `CLOCK_*` environment variables. Returns `None` when clocks are disabled.
    pub fn from_env() -> Option<Self> {
        let disabled = std::env::var("CLOCK_DISABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        if disabled {
            return None;
        }

        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let defaults = Self::default();
        Some(Self {
            initial: secs("CLOCK_INITIAL_SECS", defaults.initial),
            increment: secs("CLOCK_INCREMENT_SECS", defaults.increment),
            tick: defaults.tick,
        })
    }
}

/// Result of deducting one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTick {
    /// Time remains; keep ticking.
    Running,
    /// The given side reached zero. The clock has stopped itself.
    Expired(Color),
}

/// Two-sided countdown.
#[derive(Debug)]
pub struct Clock {
    remaining: [Duration; 2],
    increment: Duration,
    tick: Duration,
    active: bool,
    epoch: u64,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Clock {
    /// Clock with both sides at `config.initial`. Not running until [`Clock::arm`].
    pub fn new(config: &ClockConfig) -> Self {
        Self::with_remaining(config, config.initial, config.initial)
    }

    /// Clock restored with explicit remaining times.
    pub fn with_remaining(config: &ClockConfig, white: Duration, black: Duration) -> Self {
        Self {
            remaining: [white, black],
            increment: config.increment,
            tick: config.tick,
            active: false,
            epoch: 0,
            stop_tx: None,
        }
    }

    /// Mark the clock running and hand out the stop signal for a new ticker.
    ///
    /// Any previous ticker is stopped first; the returned epoch identifies the
    /// new one.
    pub fn arm(&mut self) -> (u64, oneshot::Receiver<()>) {
        self.stop();
        let (stop_tx, stop_rx) = oneshot::channel();
        self.epoch += 1;
        self.active = true;
        self.stop_tx = Some(stop_tx);
        (self.epoch, stop_rx)
    }

    /// Whether a tick from the ticker armed at `epoch` should be applied.
    pub fn accepts_tick(&self, epoch: u64) -> bool {
        self.active && self.epoch == epoch
    }

    /// Deduct one tick from `side`.
    pub fn tick(&mut self, side: Color) -> ClockTick {
        let remaining = &mut self.remaining[side.index()];
        *remaining = remaining.saturating_sub(self.tick);
        if remaining.is_zero() {
            self.stop();
            ClockTick::Expired(side)
        } else {
            ClockTick::Running
        }
    }

    /// Credit the increment to `side` after its move.
    pub fn add_increment(&mut self, side: Color) {
        if self.active {
            self.remaining[side.index()] += self.increment;
        }
    }

    /// Stop ticking. Idempotent; no tick is applied afterwards.
    pub fn stop(&mut self) {
        self.active = false;
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }

    /// Whether the clock is running.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Remaining time for `side`.
    pub fn remaining(&self, side: Color) -> Duration {
        self.remaining[side.index()]
    }

    /// Remaining time for `side` in whole milliseconds.
    pub fn remaining_ms(&self, side: Color) -> i64 {
        self.remaining(side).as_millis() as i64
    }

    /// Tick period.
    pub fn period(&self) -> Duration {
        self.tick
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the ticking task for an armed clock.
///
/// `on_tick` is awaited once per `period` (first call one period after
/// spawning) and returns whether ticking should continue. The task also ends
/// as soon as `stop_rx` fires or its sender is dropped.
pub fn spawn_ticker<F, Fut>(period: Duration, mut stop_rx: oneshot::Receiver<()>, mut on_tick: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    if !on_tick().await {
                        break;
                    }
                }
            }
        }
    });
}
