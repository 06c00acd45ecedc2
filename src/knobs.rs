//! Tuning constants for the simulated network and disk.
//!
//! Defaults match the behavior of a small-latency LAN with SATA-class
//! disks. [`Knobs::randomize_for_buggify`] draws the chaos-sensitive
//! values from the simulation RNG so that different seeds exercise
//! different latency and delay regimes.

use crate::rng::sim_random01;

/// Simulation tuning knobs.
///
/// All latencies are in seconds of virtual time.
#[derive(Debug, Clone)]
pub struct Knobs {
    /// Floor on one-way network latency.
    pub min_network_latency: f64,
    /// Typical (fast path) one-way network latency.
    pub fast_network_latency: f64,
    /// Long-tail one-way network latency.
    pub slow_network_latency: f64,
    /// Upper bound for the permanent per-pair latency drawn at first contact.
    pub max_clogging_latency: f64,
    /// Upper bound for the random extra delay added to 25% of same-process
    /// delays. Zero disables buggified delays.
    pub max_buggified_delay: f64,
    /// Minimum simulated time to open a file.
    pub min_open_time: f64,
    /// Maximum simulated time to open a file.
    pub max_open_time: f64,
    /// Default simulated disk operations per second.
    pub sim_disk_iops: u64,
    /// Default simulated disk bandwidth in bytes per second.
    pub sim_disk_bandwidth: u64,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            min_network_latency: 100e-6,
            fast_network_latency: 800e-6,
            slow_network_latency: 100e-3,
            max_clogging_latency: 0.0,
            max_buggified_delay: 0.0,
            min_open_time: 0.0002,
            max_open_time: 0.0012,
            sim_disk_iops: 5_000,
            sim_disk_bandwidth: 50_000_000,
        }
    }
}

impl Knobs {
    /// Knobs with the chaos-sensitive values randomized from the seed.
    ///
    /// Call after [`crate::rng::set_sim_seed`] so the draw is reproducible.
    pub fn randomize_for_buggify() -> Self {
        Self {
            max_clogging_latency: 0.1 * sim_random01(),
            max_buggified_delay: 0.2 * sim_random01(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{reset_sim_rng, set_sim_seed};

    #[test]
    fn defaults_disable_chaos_delays() {
        let knobs = Knobs::default();
        assert_eq!(knobs.max_clogging_latency, 0.0);
        assert_eq!(knobs.max_buggified_delay, 0.0);
    }

    #[test]
    fn randomized_knobs_are_seed_stable() {
        set_sim_seed(77);
        let a = Knobs::randomize_for_buggify();
        set_sim_seed(77);
        let b = Knobs::randomize_for_buggify();
        assert_eq!(a.max_clogging_latency, b.max_clogging_latency);
        assert_eq!(a.max_buggified_delay, b.max_buggified_delay);
        reset_sim_rng();
    }
}
