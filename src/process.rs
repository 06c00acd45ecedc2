//! Simulated processes and machines.
//!
//! A [`ProcessId`] is a handle into the simulation's process table; all
//! state lives inside the world and is reached through
//! [`SimWorld`](crate::sim::SimWorld) methods. A machine groups the
//! processes of one zone and owns the state that survives individual
//! process kills: the hidden machine process and the open-files map.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::task::Waker;

use crate::address::NetworkAddress;
use crate::fault::KillType;
use crate::fs::SimFile;
use crate::locality::{LocalityData, ProcessClass};
use crate::net::ConnectionId;

/// Handle to a simulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Build a handle from a raw value. Only meaningful for ids issued by
    /// the owning world.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Shared state of a process's shutdown signal.
///
/// Fired at most once, with the kill type that caused the reboot.
#[derive(Debug, Default)]
pub struct ShutdownState {
    pub(crate) kill_type: Option<KillType>,
    pub(crate) wakers: Vec<Waker>,
}

pub(crate) type SharedShutdown = Rc<RefCell<ShutdownState>>;

/// Per-process state. Crate-internal; drivers interact through
/// [`SimWorld`](crate::sim::SimWorld) accessors.
pub(crate) struct ProcessInfo {
    pub(crate) name: String,
    pub(crate) locality: LocalityData,
    pub(crate) class: ProcessClass,
    pub(crate) address: NetworkAddress,
    pub(crate) data_folder: String,
    pub(crate) coord_folder: String,
    /// Zone key of the owning machine; `None` only for the bootstrap
    /// system process.
    pub(crate) machine_zone: Option<String>,
    pub(crate) failed: bool,
    pub(crate) rebooting: bool,
    pub(crate) shutdown: SharedShutdown,
    /// Fault-injection triple: site-frequency, firing coin, per-process seed.
    pub(crate) fault_injection_p1: f64,
    pub(crate) fault_injection_p2: f64,
    pub(crate) fault_injection_r: u64,
    /// Opaque singleton attachments.
    pub(crate) globals: HashMap<&'static str, Rc<dyn Any>>,
    /// Inbound connections waiting to be accepted.
    pub(crate) listener_queue: VecDeque<ConnectionId>,
}

impl ProcessInfo {
    pub(crate) fn new(
        name: impl Into<String>,
        locality: LocalityData,
        class: ProcessClass,
        address: NetworkAddress,
        data_folder: impl Into<String>,
        coord_folder: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            locality,
            class,
            address,
            data_folder: data_folder.into(),
            coord_folder: coord_folder.into(),
            machine_zone: None,
            failed: false,
            rebooting: false,
            shutdown: Rc::new(RefCell::new(ShutdownState::default())),
            fault_injection_p1: 0.0,
            fault_injection_p2: 0.0,
            fault_injection_r: 0,
            globals: HashMap::new(),
            listener_queue: VecDeque::new(),
        }
    }

    pub(crate) fn shutdown_signaled(&self) -> bool {
        self.shutdown.borrow().kill_type.is_some()
    }
}

impl std::fmt::Debug for ProcessInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessInfo")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("class", &self.class)
            .field("failed", &self.failed)
            .field("rebooting", &self.rebooting)
            .finish_non_exhaustive()
    }
}

/// Shared non-durable state of one zone's co-located processes.
pub(crate) struct MachineInfo {
    pub(crate) zone_id: String,
    /// Processes in creation order.
    pub(crate) processes: Vec<ProcessId>,
    /// Hidden process that outlives individual process kills; owns async
    /// work on non-durable files.
    pub(crate) machine_process: Option<ProcessId>,
    /// Open files shared across the machine, keyed by physical filename.
    pub(crate) open_files: HashMap<String, Rc<SimFile>>,
    pub(crate) dead: bool,
}

impl MachineInfo {
    pub(crate) fn new(zone_id: String) -> Self {
        Self {
            zone_id,
            processes: Vec::new(),
            machine_process: None,
            open_files: HashMap::new(),
            dead: false,
        }
    }
}

impl std::fmt::Debug for MachineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineInfo")
            .field("zone_id", &self.zone_id)
            .field("processes", &self.processes.len())
            .field("open_files", &self.open_files.len())
            .field("dead", &self.dead)
            .finish()
    }
}
