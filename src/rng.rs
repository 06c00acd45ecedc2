//! Thread-local random number generation for simulation.
//!
//! A single deterministic PRNG, seeded once per run, supplies every
//! stochastic choice in the simulator. Thread-local state keeps the API
//! free of an explicit RNG parameter while still allowing parallel test
//! execution (each test thread owns an independent stream).

use rand::distr::{Distribution, StandardUniform, uniform::SampleUniform};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cell::RefCell;

use crate::address::UID;

thread_local! {
    /// Uses ChaCha8Rng for deterministic, reproducible randomness.
    static SIM_RNG: RefCell<ChaCha8Rng> = RefCell::new(ChaCha8Rng::seed_from_u64(0));

    /// The last seed set via [`set_sim_seed`], kept for error reporting.
    static CURRENT_SEED: RefCell<u64> = const { RefCell::new(0) };
}

/// Set the seed for this thread's simulation RNG.
///
/// Two runs with equal seeds and equal drivers produce bit-identical
/// random sequences, and therefore bit-identical task schedules.
pub fn set_sim_seed(seed: u64) {
    SIM_RNG.with(|rng| {
        *rng.borrow_mut() = ChaCha8Rng::seed_from_u64(seed);
    });
    CURRENT_SEED.with(|s| {
        *s.borrow_mut() = seed;
    });
}

/// Reset this thread's RNG to the default seed (0).
///
/// Call between consecutive simulations on the same thread so leftover
/// state from one run cannot leak into the next.
pub fn reset_sim_rng() {
    set_sim_seed(0);
}

/// The seed most recently installed on this thread.
pub fn current_sim_seed() -> u64 {
    CURRENT_SEED.with(|s| *s.borrow())
}

/// Generate a random value using the thread-local simulation RNG.
pub fn sim_random<T>() -> T
where
    StandardUniform: Distribution<T>,
{
    SIM_RNG.with(|rng| rng.borrow_mut().sample(StandardUniform))
}

/// Generate a random value within `range` (exclusive upper bound).
pub fn sim_random_range<T>(range: std::ops::Range<T>) -> T
where
    T: SampleUniform + PartialOrd,
{
    SIM_RNG.with(|rng| rng.borrow_mut().random_range(range))
}

/// Like [`sim_random_range`], but returns `range.start` for an empty range
/// instead of panicking.
pub fn sim_random_range_or_default<T>(range: std::ops::Range<T>) -> T
where
    T: SampleUniform + PartialOrd + Copy,
{
    if range.start >= range.end {
        range.start
    } else {
        sim_random_range(range)
    }
}

/// A uniform f64 in `[0, 1)`.
pub fn sim_random01() -> f64 {
    sim_random::<f64>()
}

/// Draw a fresh unique identifier from the simulation RNG.
pub fn random_unique_id() -> UID {
    UID::new(sim_random(), sim_random())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        set_sim_seed(42);
        let a: Vec<u64> = (0..8).map(|_| sim_random()).collect();
        set_sim_seed(42);
        let b: Vec<u64> = (0..8).map(|_| sim_random()).collect();
        assert_eq!(a, b);
        reset_sim_rng();
    }

    #[test]
    fn different_seeds_diverge() {
        set_sim_seed(1);
        let a: u64 = sim_random();
        set_sim_seed(2);
        let b: u64 = sim_random();
        assert_ne!(a, b);
        reset_sim_rng();
    }

    #[test]
    fn range_or_default_handles_empty_range() {
        set_sim_seed(7);
        assert_eq!(sim_random_range_or_default(5u64..5u64), 5);
        let v = sim_random_range_or_default(0u64..10u64);
        assert!(v < 10);
        reset_sim_rng();
    }

    #[test]
    fn unique_ids_are_distinct() {
        set_sim_seed(9);
        let a = random_unique_id();
        let b = random_unique_id();
        assert_ne!(a, b);
        reset_sim_rng();
    }
}
