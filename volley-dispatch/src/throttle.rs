//! Pacing between sends
//!
//! Three delays are applied by every worker, independently of the others:
//!
//! - a per-send delay before each attempt: `base_delay_ms` plus a uniformly
//!   random jitter in `0..=jitter_ms`
//! - a burst pause of `burst_pause_ms` before every `burst_size`-th recipient
//!   of a shard
//! - a per-relay minimum interval, shared by all workers through the
//!   [`RelayEntry`] timestamp
//!
//! # Example
//!
//! ```text
//! base 200ms, jitter 800ms, burst 10 / 2s, relay interval 1s
//! - recipient 0..9:   200-1000ms before each attempt
//! - recipient 10:     +2s pause, then 200-1000ms
//! - same relay twice within 1s: the second attempt waits out the rest
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::relay::RelayEntry;

/// Configuration for send pacing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Fixed delay before every attempt
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound of the random delay added to `base_delay_ms`
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,

    /// Recipients per burst; 0 disables burst pauses
    #[serde(default = "default_burst_size")]
    pub burst_size: usize,

    /// Pause inserted between bursts
    #[serde(default = "default_burst_pause")]
    pub burst_pause_ms: u64,

    /// Minimum time between two attempts through the same relay
    #[serde(default = "default_relay_min_interval")]
    pub relay_min_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            jitter_ms: default_jitter(),
            burst_size: default_burst_size(),
            burst_pause_ms: default_burst_pause(),
            relay_min_interval_ms: default_relay_min_interval(),
        }
    }
}

impl ThrottleConfig {
    /// No pacing at all. Useful for tests against local relays.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            base_delay_ms: 0,
            jitter_ms: 0,
            burst_size: 0,
            burst_pause_ms: 0,
            relay_min_interval_ms: 0,
        }
    }
}

const fn default_base_delay() -> u64 {
    200
}

const fn default_jitter() -> u64 {
    800
}

const fn default_burst_size() -> usize {
    10
}

const fn default_burst_pause() -> u64 {
    2000
}

const fn default_relay_min_interval() -> u64 {
    1000
}

/// Computes the delays described in the module docs
#[derive(Debug, Clone)]
pub struct Throttle {
    config: ThrottleConfig,
}

impl Throttle {
    #[must_use]
    pub const fn new(config: ThrottleConfig) -> Self {
        Self { config }
    }

    /// Delay applied before every attempt.
    #[must_use]
    pub fn per_send_delay(&self) -> Duration {
        self.per_send_delay_with(&mut rand::rng())
    }

    /// [`Throttle::per_send_delay`] with a caller supplied RNG.
    pub fn per_send_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter = if self.config.jitter_ms == 0 {
            0
        } else {
            rng.random_range(0..=self.config.jitter_ms)
        };

        Duration::from_millis(self.config.base_delay_ms.saturating_add(jitter))
    }

    /// Pause before the recipient at `index_in_shard` (zero based): one full
    /// pause before every `burst_size`-th recipient, none before the first.
    #[must_use]
    pub const fn burst_delay(&self, index_in_shard: usize) -> Duration {
        let size = self.config.burst_size;
        if size == 0 || index_in_shard == 0 || index_in_shard % size != 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.config.burst_pause_ms)
        }
    }

    /// Reserves the next slot on `entry` and returns how long to wait for it.
    #[must_use]
    pub fn per_relay_delay(&self, entry: &RelayEntry) -> Duration {
        entry.reserve_slot(Duration::from_millis(self.config.relay_min_interval_ms))
    }
}
