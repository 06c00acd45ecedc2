//! Driving a simulation to completion.
//!
//! A driver is a single future handed a [`SimWorld`] handle; it builds the
//! cluster, spawns workload tasks with `tokio::task::spawn_local`, and
//! returns when done. The runner alternates one task-queue step with
//! cooperative polling so simulated futures interleave deterministically,
//! then drains the queue to quiescence.

use std::future::Future;
use std::time::Duration;

use crate::buggify::{buggify_init, buggify_reset};
use crate::error::{SimulationError, SimulationResult};
use crate::knobs::Knobs;
use crate::rng::{reset_sim_rng, set_sim_seed};
use crate::sim::SimWorld;

/// Consecutive no-progress rounds before the runner declares a deadlock.
const DEADLOCK_ROUNDS: usize = 250;

/// Summary of one simulation run.
#[derive(Debug, Clone, Default)]
pub struct SimulationMetrics {
    /// Final virtual time.
    pub simulated_time: Duration,
    /// Tasks dispatched by the queue.
    pub tasks_executed: u64,
}

/// Builder for one seeded simulation run.
#[derive(Debug)]
pub struct Simulation {
    seed: u64,
    knobs: Option<Knobs>,
    buggify: bool,
}

impl Simulation {
    /// A simulation run with the given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            knobs: None,
            buggify: false,
        }
    }

    /// Override the knobs. Without this, buggified runs draw randomized
    /// knobs and plain runs use defaults.
    pub fn knobs(mut self, knobs: Knobs) -> Self {
        self.knobs = Some(knobs);
        self
    }

    /// Enable buggify for this run (25% site activation).
    pub fn buggify(mut self) -> Self {
        self.buggify = true;
        self
    }

    /// Run `driver` to completion and drain the world to quiescence.
    ///
    /// The RNG is reseeded first, so equal seeds with equal drivers give
    /// bit-identical runs.
    pub fn run<F, Fut>(self, driver: F) -> SimulationResult<SimulationMetrics>
    where
        F: FnOnce(SimWorld) -> Fut,
        Fut: Future<Output = SimulationResult<()>> + 'static,
    {
        reset_sim_rng();
        set_sim_seed(self.seed);
        if self.buggify {
            buggify_init(0.25);
        } else {
            buggify_reset();
        }
        let knobs = match self.knobs {
            Some(knobs) => knobs,
            None if self.buggify => Knobs::randomize_for_buggify(),
            None => Knobs::default(),
        };

        let sim = SimWorld::new_with_knobs(knobs);
        let seed = self.seed;

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| SimulationError::InvalidState(e.to_string()))?;
        let local = tokio::task::LocalSet::new();

        let sim_loop = sim.clone();
        let driver_future = driver(sim.clone());
        let result = local.block_on(&rt, async move {
            let handle = tokio::task::spawn_local(driver_future);
            let mut idle_rounds = 0usize;
            loop {
                if handle.is_finished() {
                    break match handle.await {
                        Ok(result) => result,
                        Err(_) => Err(SimulationError::InvalidState(format!(
                            "driver panicked with seed {seed}"
                        ))),
                    };
                }
                if sim_loop.is_stopped() {
                    handle.abort();
                    break Ok(());
                }

                if sim_loop.has_pending_tasks() {
                    sim_loop.step();
                    idle_rounds = 0;
                } else if sim_loop.has_outstanding_externals() {
                    // External threads complete in real time; wait for one.
                    sim_loop.wait_external(Duration::from_millis(100));
                } else {
                    idle_rounds += 1;
                    if idle_rounds > DEADLOCK_ROUNDS {
                        tracing::error!(seed, "deadlock: driver stuck with no pending tasks");
                        break Err(SimulationError::InvalidState(format!(
                            "deadlock detected with seed {seed}"
                        )));
                    }
                }

                tokio::task::yield_now().await;
            }
        });

        sim.run_until_quiescent();
        let metrics = SimulationMetrics {
            simulated_time: sim.now(),
            tasks_executed: sim.tasks_executed(),
        };
        tracing::debug!(
            seed,
            simulated_time = ?metrics.simulated_time,
            tasks = metrics.tasks_executed,
            "simulation finished"
        );
        buggify_reset();
        result.map(|()| metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TaskPriority;

    #[test]
    fn driver_result_propagates() {
        let result = Simulation::with_seed(11).run(|_sim| async move {
            Err(SimulationError::InvalidState("boom".to_string()))
        });
        assert!(result.is_err());
    }

    #[test]
    fn metrics_report_virtual_time() {
        let metrics = Simulation::with_seed(12)
            .run(|sim| async move {
                sim.delay(Duration::from_secs(3), TaskPriority::DefaultDelay)
                    .await?;
                Ok(())
            })
            .expect("run");
        assert_eq!(metrics.simulated_time, Duration::from_secs(3));
        assert!(metrics.tasks_executed >= 1);
    }

    #[test]
    fn stop_terminates_the_run() {
        let metrics = Simulation::with_seed(13)
            .run(|sim| async move {
                sim.delay(Duration::from_millis(5), TaskPriority::DefaultDelay)
                    .await?;
                sim.stop();
                // This delay never fires; stop() wins.
                sim.delay(Duration::from_secs(3600), TaskPriority::DefaultDelay)
                    .await?;
                Ok(())
            })
            .expect("run");
        assert!(metrics.simulated_time < Duration::from_secs(3600));
    }
}
