//! # Riptide
//!
//! A deterministic discrete-event simulator for distributed database
//! clusters, inspired by FoundationDB's simulation testing approach.
//!
//! Real wall-clock time, sockets, and disk latency are replaced by a
//! virtual clock, an in-memory byte-oriented connection graph, and a
//! simulated filesystem with modeled IOPS and bandwidth. Every stochastic
//! choice draws from one seeded PRNG, so a run is a pure function of its
//! seed and driver: same seed, same trace.
//!
//! ## What gets simulated
//!
//! | Mechanism | Where | What it tests |
//! |-----------|-------|---------------|
//! | Per-pair permanent latency | network | ordering assumptions |
//! | Send/receive/pair clogging | network | partitions, slow links |
//! | Random connection close | network | reconnection paths |
//! | Partial delivery | network | short-read handling |
//! | Buggified delays | clock | race conditions |
//! | IOPS/bandwidth disk model | filesystem | I/O backpressure |
//! | Atomic create-by-rename | filesystem | crash-safe file creation |
//! | Non-durable deletes | filesystem | reboot data loss |
//! | Kill/reboot with policy gating | fault controller | replication limits |
//! | Site-stable fault injection | fault controller | error paths |
//!
//! ## Getting started
//!
//! ```ignore
//! use riptide::{Simulation, TaskPriority};
//!
//! Simulation::with_seed(42).run(|sim| async move {
//!     let a = sim.new_process("a", "10.0.0.1".parse()?, 1, /* ... */);
//!     sim.delay(std::time::Duration::from_secs(1), TaskPriority::DefaultDelay).await?;
//!     Ok(())
//! });
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Network addresses and unique identifiers.
pub mod address;

/// Buggify fault-injection macros.
pub mod buggify;

/// Error types for simulation operations.
pub mod error;

/// The virtual-time task queue.
pub mod events;

/// Kill, reboot, and fault-injection control.
pub mod fault;

/// Simulated filesystem with disk modeling.
pub mod fs;

/// Simulation tuning constants.
pub mod knobs;

/// Process placement records.
pub mod locality;

/// In-memory connection graph.
pub mod net;

/// Replication-policy validation.
pub mod policy;

/// Simulated processes and machines.
pub mod process;

/// Thread-local deterministic randomness.
pub mod rng;

/// The simulation runner.
pub mod runner;

/// The simulation world: clock, queue, registry, context.
pub mod sim;

pub use address::{NetworkAddress, UID};
pub use error::{SimulationError, SimulationResult};
pub use events::TaskPriority;
pub use fault::KillType;
pub use fs::{AsyncFile, DiskParameters, OpenFlags, SimFile};
pub use knobs::Knobs;
pub use locality::{LocalityAttrib, LocalityData, ProcessClass};
pub use net::{ClogMode, SimConnection, SimListener};
pub use policy::{
    LocalityGroup, PolicyAcross, PolicyOne, ReplicationPolicy, validate_all_combinations,
};
pub use process::ProcessId;
pub use rng::{
    current_sim_seed, random_unique_id, reset_sim_rng, set_sim_seed, sim_random, sim_random01,
    sim_random_range,
};
pub use runner::{Simulation, SimulationMetrics};
pub use sim::{SimWorld, WeakSimWorld};
