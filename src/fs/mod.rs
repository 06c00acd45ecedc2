//! The simulated filesystem: IOPS/bandwidth-modeled file handles, atomic
//! create-by-rename, machine-scoped open-file sharing, and per-machine
//! disk-space accounting.

mod sim_file;

pub use sim_file::{AsyncFile, SimFile};

use std::cell::Cell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::error::{SimulationError, SimulationResult};
use crate::events::TaskPriority;
use crate::rng::sim_random01;
use crate::sim::{SimWorld, dur};

bitflags! {
    /// File open flags. Bit values are stable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading and writing.
        const READWRITE = 0x1;
        /// Create the file if missing.
        const CREATE = 0x2;
        /// Open read-only.
        const READONLY = 0x4;
        /// Fail if the file already exists. Requires `CREATE`.
        const EXCLUSIVE = 0x8;
        /// Create under a `.part` name; the file appears under its real
        /// name atomically on the first `sync`.
        const ATOMIC_WRITE_AND_CREATE = 0x10;
        /// Bypass any caching layer and share the handle machine-wide.
        const UNCACHED = 0x20;
    }
}

/// Performance parameters of one simulated disk, shared by every handle
/// opened against it so they contend for the same op clock.
#[derive(Debug)]
pub struct DiskParameters {
    /// Operations per second.
    pub iops: u64,
    /// Bytes per second.
    pub bandwidth: u64,
    /// Absolute virtual time (seconds) the disk is next free.
    next_operation: Cell<f64>,
}

impl DiskParameters {
    /// New disk parameters with an idle op clock.
    pub fn new(iops: u64, bandwidth: u64) -> Self {
        Self {
            iops,
            bandwidth,
            next_operation: Cell::new(0.0),
        }
    }
}

/// Per-IP disk-space ledger entry. Sizes in bytes; signed so drift math
/// stays simple.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SimDiskSpace {
    pub(crate) total_space: i64,
    /// Free space before subtracting simulated files; drifts to model
    /// external writers.
    pub(crate) base_free_space: i64,
    pub(crate) last_update: f64,
}

/// Reserve time on the disk's op clock and delay until the operation
/// completes, plus a random tail (longer and fsync-shaped for syncs).
pub(crate) async fn wait_until_disk_ready(
    sim: &SimWorld,
    disk: &DiskParameters,
    size: u64,
    sync: bool,
) -> SimulationResult<()> {
    if !sim.connection_failures_enabled() {
        sim.delay(dur(0.0001), TaskPriority::DiskWrite).await?;
        return Ok(());
    }

    let now = sim.now().as_secs_f64();
    let next = disk.next_operation.get().max(now)
        + 1.0 / disk.iops as f64
        + size as f64 / disk.bandwidth as f64;
    disk.next_operation.set(next);

    let tail = if sync {
        0.005 + sim_random01() * if crate::buggify!() { 1.0 } else { 0.010 }
    } else {
        10.0 * sim_random01() / disk.iops as f64
    };

    sim.delay_until(dur(next + tail), TaskPriority::DiskWrite)
        .await
}

impl SimWorld {
    /// Open a file through the machine's shared open-files map.
    ///
    /// Concurrent opens of the same name from any process on the machine
    /// share one handle. With `ATOMIC_WRITE_AND_CREATE`, a pending
    /// (un-synced) `.part` handle is also shared.
    pub async fn open_file(
        &self,
        filename: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> SimulationResult<Rc<SimFile>> {
        if flags.contains(OpenFlags::EXCLUSIVE) {
            assert!(
                flags.contains(OpenFlags::CREATE),
                "EXCLUSIVE requires CREATE"
            );
        }

        let zone = {
            let inner = self.inner_mut();
            inner
                .process(inner.current_process)
                .machine_zone
                .clone()
                .expect("open_file requires a process bound to a machine")
        };

        // Reuse a live machine-wide handle if one exists.
        let mut cache_key = filename.to_string();
        {
            let inner = self.inner_mut();
            let machine = inner.machines.get(&zone);
            if let Some(machine) = machine {
                if let Some(existing) = machine.open_files.get(filename) {
                    return Ok(existing.clone());
                }
                if flags.contains(OpenFlags::ATOMIC_WRITE_AND_CREATE) {
                    let part = format!("{filename}.part");
                    if let Some(pending) = machine.open_files.get(&part) {
                        return Ok(pending.clone());
                    }
                    cache_key = part;
                }
            }
        }

        let (iops, bandwidth) = {
            let inner = self.inner_mut();
            (inner.knobs.sim_disk_iops, inner.knobs.sim_disk_bandwidth)
        };
        let disk = Rc::new(DiskParameters::new(iops, bandwidth));
        let file = SimFile::open(self, filename, flags, mode, disk, true).await?;

        let mut inner = self.inner_mut();
        if let Some(machine) = inner.machines.get_mut(&zone) {
            machine.open_files.insert(cache_key, file.clone());
        }
        Ok(file)
    }

    /// Delete a file.
    ///
    /// The machine's open-files entry disappears immediately. The on-disk
    /// delete is durable when requested, and otherwise on a coin flip —
    /// a non-durable delete that loses the race with a reboot is simply
    /// lost.
    pub async fn delete_file(
        &self,
        filename: &str,
        must_be_durable: bool,
    ) -> SimulationResult<()> {
        {
            let mut inner = self.inner_mut();
            let zone = inner.process(inner.current_process).machine_zone.clone();
            if let Some(zone) = zone {
                if let Some(machine) = inner.machines.get_mut(&zone) {
                    machine.open_files.remove(filename);
                }
            }
        }

        if must_be_durable || sim_random01() < 0.5 {
            self.delay(dur(0.05 * sim_random01()), TaskPriority::DiskWrite)
                .await?;
            let rebooting = {
                let inner = self.inner_mut();
                inner.process(inner.current_process).rebooting
            };
            if !rebooting {
                std::fs::remove_file(filename).map_err(SimulationError::from)?;
                self.delay(dur(0.05 * sim_random01()), TaskPriority::DiskWrite)
                    .await?;
                tracing::debug!(filename, "durable delete");
            }
        } else {
            tracing::debug!(filename, "non-durable delete; may be lost on reboot");
        }
        Ok(())
    }

    /// Free and total disk space for the current process's machine.
    ///
    /// The ledger is initialized lazily per IP and drifts between calls
    /// to model external writers.
    pub fn get_disk_bytes(&self, _directory: &str) -> (u64, u64) {
        let mut inner = self.inner_mut();
        let current = inner.current_process;
        let ip = inner.process(current).address.ip;
        let zone = inner.process(current).machine_zone.clone();

        let total_file_size: i64 = zone
            .and_then(|z| inner.machines.get(&z))
            .map(|m| {
                m.open_files
                    .values()
                    .map(|f| f.approximate_size() as i64)
                    .sum()
            })
            .unwrap_or(0);
        let num_files = zone_file_count(&inner, current);

        let now = inner.now.as_secs_f64();
        let buggified_drift = crate::buggify!();
        let entry = inner.disk_space.entry(ip).or_default();

        if entry.total_space == 0 {
            entry.total_space = (5e9 + sim_random01() * 100e9) as i64;
            // Base free space is at least 5GB or 7.5% of the disk,
            // whichever is larger, on top of what our files already use.
            let floor = (sim_random01() * (1.0 - 0.075) + 0.075) * entry.total_space as f64;
            entry.base_free_space =
                entry.total_space.min(floor.max(5e9) as i64 + total_file_size);
            tracing::info!(
                total = entry.total_space,
                base_free = entry.base_free_space,
                file_bytes = total_file_size,
                num_files,
                "disk space initialized"
            );
        } else {
            let max_delta = 5.0f64.min(now - entry.last_update)
                * if buggified_drift { 10e6 } else { 1e6 };
            let delta = (-max_delta + sim_random01() * max_delta * 2.0) as i64;
            entry.base_free_space = entry
                .total_space
                .min((entry.base_free_space + delta).max(total_file_size));
        }
        entry.last_update = now;

        let total = entry.total_space as u64;
        let free = (entry.base_free_space - total_file_size).max(0) as u64;
        if free == 0 {
            tracing::warn!(
                total,
                base_free = entry.base_free_space,
                file_bytes = total_file_size,
                "no free disk space"
            );
        }
        (free, total)
    }
}

fn zone_file_count(inner: &crate::sim::SimInner, p: crate::process::ProcessId) -> usize {
    inner
        .process(p)
        .machine_zone
        .as_ref()
        .and_then(|z| inner.machines.get(z))
        .map(|m| m.open_files.len())
        .unwrap_or(0)
}
