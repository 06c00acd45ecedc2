//! Randomized rare-path activation ("buggify").
//!
//! A buggify site is a code location that opts into a chaos behavior:
//! shorter writes, larger disk drift, extra delays. Whether a site
//! participates at all is decided once per run at first encounter, so a
//! given seed exercises a stable subset of sites; participating sites
//! then fire per call with the probability named at the site. Sites are
//! identified the same way the fault-injection predicate identifies its
//! call sites: by source file and line.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::rng::sim_random01;

/// Identity of a buggify call site.
type SiteKey = (&'static str, u32);

#[derive(Debug, Default)]
struct BuggifyState {
    /// Chance that a site participates this run. Zero means disabled;
    /// no site can activate and no RNG is consumed.
    activation_prob: f64,
    /// Activation decisions, fixed at first encounter.
    sites: HashMap<SiteKey, bool>,
    /// Fires across all active sites this run.
    fired: u64,
}

thread_local! {
    static BUGGIFY: RefCell<BuggifyState> = RefCell::new(BuggifyState::default());
}

/// Arm buggify for a run: each site participates with probability
/// `activation_prob`, decided the first time it is reached.
pub fn buggify_init(activation_prob: f64) {
    BUGGIFY.with(|state| {
        *state.borrow_mut() = BuggifyState {
            activation_prob,
            sites: HashMap::new(),
            fired: 0,
        };
    });
}

/// Disarm buggify and forget every activation decision.
pub fn buggify_reset() {
    BUGGIFY.with(|state| {
        *state.borrow_mut() = BuggifyState::default();
    });
}

/// Whether buggify is armed on this thread.
pub fn buggify_enabled() -> bool {
    BUGGIFY.with(|state| state.borrow().activation_prob > 0.0)
}

/// How many buggify sites have fired this run. Useful when deciding
/// whether a failing seed actually exercised any rare paths.
pub fn buggify_fired_count() -> u64 {
    BUGGIFY.with(|state| state.borrow().fired)
}

/// Decide whether the site at `file:line` fires. Use the
/// [`buggify!`](crate::buggify!) macro rather than calling this directly.
pub fn buggify_site(prob: f64, file: &'static str, line: u32) -> bool {
    BUGGIFY.with(|state| {
        let mut state = state.borrow_mut();
        if state.activation_prob <= 0.0 || prob <= 0.0 {
            return false;
        }

        let activation_prob = state.activation_prob;
        let active = *state
            .sites
            .entry((file, line))
            .or_insert_with(|| sim_random01() < activation_prob);
        if active && sim_random01() < prob {
            state.fired += 1;
            return true;
        }
        false
    })
}

/// Buggify this call site: 25% per-call fire probability by default, or
/// the probability given as an argument.
#[macro_export]
macro_rules! buggify {
    () => {
        $crate::buggify::buggify_site(0.25, file!(), line!())
    };
    ($prob:expr) => {
        $crate::buggify::buggify_site($prob as f64, file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{reset_sim_rng, set_sim_seed};

    #[test]
    fn disarmed_sites_never_fire() {
        buggify_reset();
        for line in 0..10 {
            assert!(!buggify_site(1.0, "test.rs", line));
        }
        assert_eq!(buggify_fired_count(), 0);
        assert!(!buggify_enabled());
    }

    #[test]
    fn site_activation_is_sticky() {
        set_sim_seed(12345);
        buggify_init(0.5);

        let first = buggify_site(1.0, "sticky.rs", 7);
        let second = buggify_site(1.0, "sticky.rs", 7);
        assert_eq!(first, second);

        buggify_reset();
        reset_sim_rng();
    }

    #[test]
    fn sites_on_different_lines_decide_independently() {
        set_sim_seed(99);
        buggify_init(0.5);

        let outcomes: Vec<bool> = (0..64).map(|line| buggify_site(1.0, "spread.rs", line)).collect();
        // With a 50% activation chance, a 64-site sweep lands on both
        // sides.
        assert!(outcomes.iter().any(|&fired| fired));
        assert!(outcomes.iter().any(|&fired| !fired));

        buggify_reset();
        reset_sim_rng();
    }

    #[test]
    fn fired_count_tracks_active_sites() {
        set_sim_seed(7);
        buggify_init(1.0);

        let mut expected = 0;
        for line in 0..32 {
            if buggify_site(1.0, "counter.rs", line) {
                expected += 1;
            }
        }
        assert_eq!(buggify_fired_count(), expected);
        assert!(expected > 0);

        buggify_reset();
        reset_sim_rng();
    }

    #[test]
    fn deterministic_across_runs() {
        const SEED: u64 = 54321;
        let mut runs: Vec<Vec<bool>> = Vec::new();

        for _ in 0..2 {
            set_sim_seed(SEED);
            buggify_init(0.5);
            runs.push(
                (0..16)
                    .map(|line| buggify_site(0.5, "replay.rs", line))
                    .collect(),
            );
            buggify_reset();
            reset_sim_rng();
        }

        assert_eq!(runs[0], runs[1]);
    }
}
