//! Timing and capacity knobs for the simulation.
//!
//! All durations are in simulated seconds; `tick_ms` converts them to wall
//! time. The wall-clock only knobs (backoff, polling, debounce) are in
//! milliseconds.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub tick_ms: u64,
    pub prep_secs_min: u64,
    pub prep_secs_max: u64,
    pub fatigue_rate: f64,
    pub staff_rest_secs: u64,
    pub battery_per_tick: f64,
    pub drone_recharge_secs: u64,
    pub drone_capacity: f64,
    pub gate_backoff_ms: u64,
    pub idle_poll_ms: u64,
    pub cancel_poll_ms: u64,
    pub snapshot_debounce_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            prep_secs_min: 20,
            prep_secs_max: 60,
            fatigue_rate: 1.0,
            staff_rest_secs: 60,
            battery_per_tick: 0.25,
            drone_recharge_secs: 120,
            drone_capacity: 10_000.0,
            gate_backoff_ms: 100,
            idle_poll_ms: 50,
            cancel_poll_ms: 10,
            snapshot_debounce_ms: 250,
        }
    }
}

impl SimConfig {
    /// Default timings with a shorter simulated second and tighter polling.
    pub fn accelerated(tick_ms: u64) -> Self {
        Self {
            tick_ms,
            gate_backoff_ms: 2,
            idle_poll_ms: 5,
            cancel_poll_ms: 1,
            snapshot_debounce_ms: 20,
            ..Self::default()
        }
    }

    /// Load overrides from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let raw = fs::read(path)?;
        let config = serde_json::from_slice(&raw)?;
        Ok(config)
    }

    /// Wall time for a number of simulated seconds.
    pub fn sim_duration(&self, secs: f64) -> Duration {
        let micros = (secs.max(0.0) * self.tick_ms as f64 * 1000.0).round();
        Duration::from_micros(micros as u64)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn cancel_poll(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms.max(1))
    }

    pub fn snapshot_debounce(&self) -> Duration {
        Duration::from_millis(self.snapshot_debounce_ms)
    }
}
