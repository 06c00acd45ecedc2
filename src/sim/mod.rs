//! The central simulation world: virtual clock, task queue, process and
//! machine registry, and the cooperative execution context.
//!
//! `SimWorld` owns all mutable simulation state behind an `Rc<RefCell<..>>`
//! with handle-based access, so connection and file handles hold
//! [`WeakSimWorld`] references and upgrade per operation. Dispatch is
//! strictly serial: one task at a time, virtual time advancing to each
//! task's due time, with `current_process` bound to the task's owner.

pub mod futures;
pub mod thread;

use std::any::Any;
use std::cell::{RefCell, RefMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::Duration;

use crate::address::NetworkAddress;
use crate::error::{SimulationError, SimulationResult};
use crate::events::{ScheduledTask, TaskPayload, TaskPriority, TaskQueue};
use crate::fault::KillType;
use crate::fs::SimDiskSpace;
use crate::knobs::Knobs;
use crate::locality::{LocalityData, ProcessClass};
use crate::net::clog::CloggingTable;
use crate::net::{ConnectionId, ConnectionState};
use crate::policy::ReplicationPolicy;
use crate::process::{MachineInfo, ProcessId, ProcessInfo};
use crate::rng::{sim_random01, sim_random_range};

use self::futures::{ShutdownFuture, TaskFuture, YieldFuture};
use self::thread::{ExternalWake, ThreadCell, ThreadFuture, ThreadSignal};

/// Convert fractional seconds of virtual time into a `Duration`, clamping
/// negatives to zero.
pub(crate) fn dur(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}

pub(crate) struct SimInner {
    // Clock and queue
    pub(crate) now: Duration,
    pub(crate) queue: TaskQueue,
    next_seq: u64,
    next_task_id: u64,
    pub(crate) tasks_executed: u64,
    stopped: bool,

    // Yield accounting
    yielded: bool,
    yield_limit: i32,

    // Execution context
    pub(crate) current_process: ProcessId,

    // Chaos switches
    pub(crate) knobs: Knobs,
    pub(crate) speed_up_simulation: bool,
    pub(crate) enable_connection_failures: bool,

    // Registry
    next_process_id: u64,
    pub(crate) processes: HashMap<ProcessId, ProcessInfo>,
    pub(crate) machines: BTreeMap<String, MachineInfo>,
    pub(crate) address_map: HashMap<NetworkAddress, ProcessId>,
    pub(crate) currently_rebooting: HashMap<NetworkAddress, ProcessId>,
    pub(crate) protected_addresses: HashSet<NetworkAddress>,
    pub(crate) processes_per_machine: usize,

    // Connection graph
    pub(crate) next_connection_id: u64,
    pub(crate) connections: HashMap<ConnectionId, ConnectionState>,
    pub(crate) clogging: CloggingTable,
    pub(crate) leaked_connections: u64,

    // Simulated filesystem
    pub(crate) open_count: usize,
    pub(crate) disk_space: HashMap<Ipv4Addr, SimDiskSpace>,

    // Fault-controller configuration
    pub(crate) tlog_policy: Option<Rc<dyn ReplicationPolicy>>,
    pub(crate) storage_policy: Option<Rc<dyn ReplicationPolicy>>,
    pub(crate) tlog_write_anti_quorum: usize,
    pub(crate) killed_machines: u64,

    // Async coordination
    awakened: HashSet<u64>,
    task_wakers: HashMap<u64, Waker>,
    pub(crate) read_wakers: HashMap<ConnectionId, Vec<Waker>>,
    pub(crate) write_wakers: HashMap<ConnectionId, Vec<Waker>>,
    pub(crate) accept_wakers: HashMap<ProcessId, Vec<Waker>>,

    // External threads
    external_rx: Receiver<ExternalWake>,
    external_tx: Sender<ExternalWake>,
    pub(crate) outstanding_externals: usize,
}

impl SimInner {
    fn new(knobs: Knobs) -> Self {
        let (external_tx, external_rx) = std::sync::mpsc::channel();
        // The bootstrap process avoids a null current-process special case;
        // it never joins a machine or the address map.
        let system = ProcessInfo::new(
            "NoMachine",
            LocalityData {
                zone_id: None,
                data_hall_id: None,
                dc_id: None,
                machine_id: None,
            },
            ProcessClass::Unset,
            NetworkAddress::new(Ipv4Addr::UNSPECIFIED, 0),
            "",
            "",
        );
        let system_id = ProcessId::from_raw(0);
        let mut processes = HashMap::new();
        processes.insert(system_id, system);

        Self {
            now: Duration::ZERO,
            queue: TaskQueue::new(),
            next_seq: 0,
            next_task_id: 0,
            tasks_executed: 0,
            stopped: false,
            yielded: false,
            yield_limit: sim_random_range(1..150),
            current_process: system_id,
            knobs,
            speed_up_simulation: false,
            enable_connection_failures: sim_random01() < 0.5,
            next_process_id: 1,
            processes,
            machines: BTreeMap::new(),
            address_map: HashMap::new(),
            currently_rebooting: HashMap::new(),
            protected_addresses: HashSet::new(),
            processes_per_machine: 1,
            next_connection_id: 0,
            connections: HashMap::new(),
            clogging: CloggingTable::new(),
            leaked_connections: 0,
            open_count: 0,
            disk_space: HashMap::new(),
            tlog_policy: None,
            storage_policy: None,
            tlog_write_anti_quorum: 0,
            killed_machines: 0,
            awakened: HashSet::new(),
            task_wakers: HashMap::new(),
            read_wakers: HashMap::new(),
            write_wakers: HashMap::new(),
            accept_wakers: HashMap::new(),
            external_rx,
            external_tx,
            outstanding_externals: 0,
        }
    }

    /// Schedule a task `delay` from now, bound to `owner`. Returns the
    /// insertion sequence number.
    pub(crate) fn schedule(
        &mut self,
        payload: TaskPayload,
        delay: Duration,
        priority: TaskPriority,
        owner: ProcessId,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let task = ScheduledTask::new(self.now + delay, seq, priority, owner, payload);
        self.queue.schedule(task);
        seq
    }

    pub(crate) fn alloc_task_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    pub(crate) fn wake_task(&mut self, task_id: u64) {
        self.awakened.insert(task_id);
        if let Some(waker) = self.task_wakers.remove(&task_id) {
            waker.wake();
        }
    }

    pub(crate) fn process(&self, p: ProcessId) -> &ProcessInfo {
        self.processes.get(&p).expect("unknown process id")
    }

    pub(crate) fn process_mut(&mut self, p: ProcessId) -> &mut ProcessInfo {
        self.processes.get_mut(&p).expect("unknown process id")
    }

    /// The machine process of `p`'s machine, if it has one.
    pub(crate) fn machine_process_of(&self, p: ProcessId) -> Option<ProcessId> {
        let zone = self.process(p).machine_zone.as_ref()?;
        self.machines.get(zone).and_then(|m| m.machine_process)
    }
}

/// The central simulation coordinator.
///
/// Cloning produces another handle to the same world.
#[derive(Clone)]
pub struct SimWorld {
    inner: Rc<RefCell<SimInner>>,
}

/// Weak handle to a [`SimWorld`], held by connection and file handles.
#[derive(Clone)]
pub struct WeakSimWorld {
    inner: Weak<RefCell<SimInner>>,
}

impl WeakSimWorld {
    /// Upgrade to a strong handle, failing if the world was dropped.
    pub fn upgrade(&self) -> SimulationResult<SimWorld> {
        self.inner
            .upgrade()
            .map(|inner| SimWorld { inner })
            .ok_or(SimulationError::SimulationShutdown)
    }
}

impl std::fmt::Debug for SimWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SimWorld")
            .field("now", &inner.now)
            .field("pending_tasks", &inner.queue.len())
            .field("processes", &inner.processes.len())
            .finish()
    }
}

impl std::fmt::Debug for WeakSimWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WeakSimWorld")
    }
}

impl SimWorld {
    /// Create a world with default knobs.
    ///
    /// The RNG seed must already be installed via
    /// [`crate::rng::set_sim_seed`]; constructing the world draws from it
    /// (connection-failure coin, first yield budget).
    pub fn new() -> Self {
        Self::new_with_knobs(Knobs::default())
    }

    /// Create a world with explicit knobs.
    pub fn new_with_knobs(knobs: Knobs) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SimInner::new(knobs))),
        }
    }

    /// Weak handle for storage in connection/file handles.
    pub fn downgrade(&self) -> WeakSimWorld {
        WeakSimWorld {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn inner_mut(&self) -> RefMut<'_, SimInner> {
        self.inner.borrow_mut()
    }

    // ------------------------------------------------------------------
    // Clock and scheduling
    // ------------------------------------------------------------------

    /// Current virtual time. Non-decreasing across dispatches.
    pub fn now(&self) -> Duration {
        self.inner.borrow().now
    }

    /// The process the runtime is currently executing on behalf of.
    pub fn current_process(&self) -> ProcessId {
        self.inner.borrow().current_process
    }

    /// Request termination of the dispatch loop.
    pub fn stop(&self) {
        self.inner.borrow_mut().stopped = true;
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.borrow().stopped
    }

    /// Schedule a completion `d` from now on the current process.
    ///
    /// With probability 0.25 — and only when the delay stays on the
    /// current, non-rebooting process — a buggified extra delay of
    /// `max_buggified_delay * U(0,1)^1000` is added.
    pub fn delay(&self, d: Duration, priority: TaskPriority) -> TaskFuture {
        let target = self.current_process();
        self.delay_on(target, d, priority)
    }

    /// Schedule a completion `d` from now on `target`.
    pub fn delay_on(&self, target: ProcessId, d: Duration, priority: TaskPriority) -> TaskFuture {
        let mut inner = self.inner.borrow_mut();
        let mut d = d;

        let cur = inner.current_process;
        let curp = inner.process(cur);
        if target == cur
            && !curp.rebooting
            && !curp.shutdown_signaled()
            && inner.knobs.max_buggified_delay > 0.0
            && sim_random01() < 0.25
        {
            d += dur(inner.knobs.max_buggified_delay * sim_random01().powf(1000.0));
        }

        let task_id = inner.alloc_task_id();
        inner.schedule(TaskPayload::Wake { task_id }, d, priority, target);
        TaskFuture::new(self.downgrade(), task_id)
    }

    /// Schedule a completion at absolute virtual time `t` on the current
    /// process.
    pub fn delay_until(&self, t: Duration, priority: TaskPriority) -> TaskFuture {
        let now = self.now();
        self.delay(t.saturating_sub(now), priority)
    }

    /// Rebind execution to `p` with zero delay.
    ///
    /// Code operating on another process MUST cross the boundary through
    /// this (or [`on_machine`](Self::on_machine)).
    pub fn on_process(&self, p: ProcessId, priority: TaskPriority) -> TaskFuture {
        let mut inner = self.inner.borrow_mut();
        let task_id = inner.alloc_task_id();
        inner.schedule(
            TaskPayload::Wake { task_id },
            Duration::ZERO,
            priority,
            p,
        );
        TaskFuture::new(self.downgrade(), task_id)
    }

    /// Rebind execution to `p`'s machine process (or `p` itself when it
    /// has no machine).
    pub fn on_machine(&self, p: ProcessId, priority: TaskPriority) -> TaskFuture {
        let target = {
            let inner = self.inner.borrow();
            inner.machine_process_of(p).unwrap_or(p)
        };
        self.on_process(target, priority)
    }

    /// Check whether the caller should yield, consuming yield budget.
    pub fn check_yield(&self, _priority: TaskPriority) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.yielded {
            return true;
        }
        inner.yield_limit -= 1;
        if inner.yield_limit <= 0 {
            // Bound synchronous runs; a deterministic stack-depth check is
            // not available, so the budget is randomized.
            inner.yield_limit = sim_random_range(1..150);
            inner.yielded = true;
            return true;
        }
        inner.yielded = sim_random01() < 0.01;
        inner.yielded
    }

    /// Yield point: returns immediately unless the yield budget elapses.
    pub fn yield_now(&self, priority: TaskPriority) -> YieldFuture {
        if self.check_yield(priority) {
            let rebooting = {
                let inner = self.inner.borrow();
                inner.process(inner.current_process).rebooting
            };
            // Rebooting processes must be able to shut down instantly.
            let d = if rebooting { 0.0 } else { 0.001 };
            YieldFuture::Suspend(self.delay(dur(d), priority))
        } else {
            YieldFuture::Ready
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch the earliest task, advancing virtual time to it.
    ///
    /// Returns `true` while more tasks remain and the world has not been
    /// stopped. Tasks owned by a failed process are silently dropped; their
    /// completions never resolve.
    pub fn step(&self) -> bool {
        self.drain_external();
        let mut inner = self.inner.borrow_mut();
        if inner.stopped {
            return false;
        }
        let Some(task) = inner.queue.pop_earliest() else {
            return false;
        };

        debug_assert!(task.time() >= inner.now);
        inner.now = task.time();
        inner.yielded = false;
        inner.tasks_executed += 1;

        let owner = task.owner();
        let owner_failed = inner.processes.get(&owner).is_none_or(|p| p.failed);
        if owner_failed {
            tracing::trace!(process = owner.raw(), "task absorbed by failed process");
            return !inner.queue.is_empty();
        }

        inner.current_process = owner;
        match task.into_payload() {
            TaskPayload::Wake { task_id } => inner.wake_task(task_id),
            TaskPayload::Reboot { kill_type } => Self::apply_reboot(&mut inner, owner, kill_type),
            TaskPayload::SenderRun { conn } => crate::net::sender_run(&mut inner, conn),
            TaskPayload::ReceiverTransit { conn, pos } => {
                crate::net::receiver_transit(&mut inner, conn, pos)
            }
            TaskPayload::ReceiverDeliver { conn, pos } => {
                crate::net::receiver_deliver(&mut inner, conn, pos)
            }
            TaskPayload::IncomingConnection { conn } => {
                crate::net::incoming_connection(&mut inner, owner, conn)
            }
            TaskPayload::LeakCheck { conn } => crate::net::leak_check(&mut inner, conn),
        }

        !inner.queue.is_empty()
    }

    /// Process tasks until the queue drains or [`stop`](Self::stop) is
    /// called.
    pub fn run_until_quiescent(&self) {
        while self.step() {}
    }

    fn apply_reboot(inner: &mut SimInner, p: ProcessId, kt: KillType) {
        let proc = inner.process_mut(p);
        if proc.rebooting {
            return;
        }
        tracing::info!(
            kill_type = ?kt,
            address = %proc.address,
            zone = proc.locality.zone_id.as_deref().unwrap_or("-"),
            "rebooting process"
        );
        proc.rebooting = true;
        let shutdown = proc.shutdown.clone();
        let mut st = shutdown.borrow_mut();
        if st.kill_type.is_none() {
            st.kill_type = Some(kt);
        }
        for waker in st.wakers.drain(..) {
            waker.wake();
        }
    }

    // ------------------------------------------------------------------
    // External threads
    // ------------------------------------------------------------------

    /// Create a completion bound to the current process that an external
    /// OS thread can fire.
    ///
    /// The returned future resumes in the current process's context once
    /// the run loop observes the signal.
    pub fn main_thread_signal<T>(
        &self,
        priority: TaskPriority,
    ) -> (ThreadSignal<T>, ThreadFuture<T>) {
        let mut inner = self.inner.borrow_mut();
        let task_id = inner.alloc_task_id();
        inner.outstanding_externals += 1;
        let cell = Arc::new(Mutex::new(ThreadCell::Empty));
        let signal = ThreadSignal::new(
            cell.clone(),
            inner.external_tx.clone(),
            inner.current_process,
            priority,
            task_id,
        );
        (signal, ThreadFuture::new(self.downgrade(), cell, task_id))
    }

    /// Run `f` on a real OS thread; the result re-enters the simulation
    /// bound to the spawning process.
    pub fn start_thread<T, F>(&self, priority: TaskPriority, f: F) -> ThreadFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (signal, future) = self.main_thread_signal(priority);
        std::thread::spawn(move || signal.send(f()));
        future
    }

    /// Move any completed external-thread signals into the task queue.
    pub(crate) fn drain_external(&self) {
        loop {
            let msg = self.inner.borrow().external_rx.try_recv();
            match msg {
                Ok(wake) => {
                    let mut inner = self.inner.borrow_mut();
                    inner.outstanding_externals = inner.outstanding_externals.saturating_sub(1);
                    inner.schedule(
                        TaskPayload::Wake {
                            task_id: wake.task_id,
                        },
                        Duration::ZERO,
                        wake.priority,
                        wake.process,
                    );
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Block briefly for an outstanding external-thread completion.
    ///
    /// Returns `true` if a completion arrived and was queued.
    pub(crate) fn wait_external(&self, timeout: Duration) -> bool {
        {
            let inner = self.inner.borrow();
            if inner.outstanding_externals == 0 {
                return false;
            }
        }
        let msg = {
            let inner = self.inner.borrow();
            inner.external_rx.recv_timeout(timeout)
        };
        match msg {
            Ok(wake) => {
                let mut inner = self.inner.borrow_mut();
                inner.outstanding_externals = inner.outstanding_externals.saturating_sub(1);
                inner.schedule(
                    TaskPayload::Wake {
                        task_id: wake.task_id,
                    },
                    Duration::ZERO,
                    wake.priority,
                    wake.process,
                );
                true
            }
            Err(_) => false,
        }
    }

    /// Whether external-thread completions are still outstanding.
    pub(crate) fn has_outstanding_externals(&self) -> bool {
        self.inner.borrow().outstanding_externals > 0
    }

    // ------------------------------------------------------------------
    // Process / machine registry
    // ------------------------------------------------------------------

    /// Create a process and bind it to its zone's machine.
    ///
    /// The machine (and its hidden machine process at port 0) is created
    /// on the zone's first process.
    ///
    /// # Panics
    ///
    /// Panics if the locality has no zone id, a sibling process already
    /// uses `port`, or a sibling carries a different zone id.
    #[allow(clippy::too_many_arguments)]
    pub fn new_process(
        &self,
        name: &str,
        ip: Ipv4Addr,
        port: u16,
        locality: LocalityData,
        class: ProcessClass,
        data_folder: &str,
        coord_folder: &str,
    ) -> ProcessId {
        let mut inner = self.inner.borrow_mut();
        let zone = locality
            .zone_id
            .clone()
            .expect("new_process requires a zone id");

        if !inner.machines.contains_key(&zone) {
            inner
                .machines
                .insert(zone.clone(), MachineInfo::new(zone.clone()));
        }

        let sibling_ids: Vec<ProcessId> = inner.machines[&zone].processes.clone();
        for sibling in &sibling_ids {
            let s = inner.process(*sibling);
            assert_eq!(
                s.locality.zone_id.as_deref(),
                Some(zone.as_str()),
                "zone id mismatch on machine {zone}"
            );
            assert_ne!(s.address.port, port, "duplicate port {port} in zone {zone}");
        }

        // Hidden machine process: owns async work on non-durable files so
        // that it survives individual process kills.
        if inner.machines[&zone].machine_process.is_none() {
            let mp_id = ProcessId::from_raw(inner.next_process_id);
            inner.next_process_id += 1;
            let mut mp = ProcessInfo::new(
                "Machine",
                locality.clone(),
                class,
                NetworkAddress::new(ip, 0),
                "",
                "",
            );
            mp.machine_zone = Some(zone.clone());
            inner.processes.insert(mp_id, mp);
            if let Some(machine) = inner.machines.get_mut(&zone) {
                machine.machine_process = Some(mp_id);
            }
        }

        let address = NetworkAddress::new(ip, port);
        let id = ProcessId::from_raw(inner.next_process_id);
        inner.next_process_id += 1;
        let mut info = ProcessInfo::new(name, locality, class, address, data_folder, coord_folder);
        info.machine_zone = Some(zone.clone());
        inner.processes.insert(id, info);
        if let Some(machine) = inner.machines.get_mut(&zone) {
            machine.processes.push(id);
        }
        inner.currently_rebooting.remove(&address);
        inner.address_map.insert(address.normalized(), id);

        tracing::info!(name, address = %address, zone, "new process");
        id
    }

    /// Tear down a failed process: mark it rebooting, detach it from its
    /// machine, and apply an instant kill.
    ///
    /// # Panics
    ///
    /// Panics unless the process has already failed.
    pub fn destroy_process(&self, p: ProcessId) {
        let mut inner = self.inner.borrow_mut();
        let (address, zone) = {
            let proc = inner.process(p);
            assert!(proc.failed, "destroy_process requires a failed process");
            (proc.address, proc.machine_zone.clone())
        };
        tracing::info!(address = %address, "process destroyed");
        inner.currently_rebooting.insert(address, p);
        if let Some(zone) = zone {
            if let Some(machine) = inner.machines.get_mut(&zone) {
                machine.processes.retain(|&q| q != p);
            }
        }
        crate::fault::kill_process_internal(&mut inner, p, KillType::KillInstantly);
    }

    /// Tear down a machine whose processes have all failed.
    ///
    /// # Panics
    ///
    /// Panics if any process on the machine has not failed.
    pub fn destroy_machine(&self, zone_id: &str) {
        let mut inner = self.inner.borrow_mut();
        let Some(machine) = inner.machines.get_mut(zone_id) else {
            return;
        };
        machine.dead = true;
        let processes = machine.processes.clone();
        let machine_process = machine.machine_process;
        for p in processes {
            assert!(
                inner.process(p).failed,
                "destroy_machine requires all processes failed"
            );
        }
        if let Some(mp) = machine_process {
            crate::fault::kill_process_internal(&mut inner, mp, KillType::KillInstantly);
        }
        inner.machines.remove(zone_id);
    }

    /// All registered processes, in zone order then creation order.
    ///
    /// Hidden machine processes are not included.
    pub fn get_all_processes(&self) -> Vec<ProcessId> {
        let inner = self.inner.borrow();
        inner
            .machines
            .values()
            .flat_map(|m| m.processes.iter().copied())
            .collect()
    }

    /// Look up a process by its normalized network address.
    pub fn get_process_by_address(&self, address: NetworkAddress) -> Option<ProcessId> {
        let inner = self.inner.borrow();
        inner.address_map.get(&address.normalized()).copied()
    }

    /// The processes of one zone's machine, in creation order.
    pub fn get_machine_processes(&self, zone_id: &str) -> Vec<ProcessId> {
        let inner = self.inner.borrow();
        inner
            .machines
            .get(zone_id)
            .map(|m| m.processes.clone())
            .unwrap_or_default()
    }

    /// The hidden machine process of a zone, if the machine exists.
    pub fn get_machine_process(&self, zone_id: &str) -> Option<ProcessId> {
        let inner = self.inner.borrow();
        inner.machines.get(zone_id).and_then(|m| m.machine_process)
    }

    /// Whether `address` shares an IP with the current process.
    pub fn is_address_on_this_host(&self, address: NetworkAddress) -> bool {
        let inner = self.inner.borrow();
        address.ip == inner.process(inner.current_process).address.ip
    }

    // ------------------------------------------------------------------
    // Process accessors
    // ------------------------------------------------------------------

    /// The process's network address.
    pub fn process_address(&self, p: ProcessId) -> NetworkAddress {
        self.inner.borrow().process(p).address
    }

    /// The process's locality record.
    pub fn process_locality(&self, p: ProcessId) -> LocalityData {
        self.inner.borrow().process(p).locality.clone()
    }

    /// The process's class.
    pub fn process_class(&self, p: ProcessId) -> ProcessClass {
        self.inner.borrow().process(p).class
    }

    /// The process's name.
    pub fn process_name(&self, p: ProcessId) -> String {
        self.inner.borrow().process(p).name.clone()
    }

    /// The process's data folder.
    pub fn process_data_folder(&self, p: ProcessId) -> String {
        self.inner.borrow().process(p).data_folder.clone()
    }

    /// The process's coordination folder.
    pub fn process_coord_folder(&self, p: ProcessId) -> String {
        self.inner.borrow().process(p).coord_folder.clone()
    }

    /// Whether a destroyed or rebooting process last owned `address`.
    pub fn is_address_rebooting(&self, address: NetworkAddress) -> bool {
        self.inner
            .borrow()
            .currently_rebooting
            .contains_key(&address.normalized())
    }

    /// Whether the process has failed.
    pub fn is_failed(&self, p: ProcessId) -> bool {
        self.inner.borrow().process(p).failed
    }

    /// Whether the process is currently rebooting.
    pub fn is_rebooting(&self, p: ProcessId) -> bool {
        self.inner.borrow().process(p).rebooting
    }

    /// Future resolving with the kill type once the process's shutdown
    /// signal fires.
    pub fn on_shutdown(&self, p: ProcessId) -> ShutdownFuture {
        ShutdownFuture::new(self.inner.borrow().process(p).shutdown.clone())
    }

    /// Attach an opaque singleton to the process.
    pub fn set_process_global<T: Any>(&self, p: ProcessId, key: &'static str, value: Rc<T>) {
        self.inner
            .borrow_mut()
            .process_mut(p)
            .globals
            .insert(key, value);
    }

    /// Fetch a previously attached singleton.
    pub fn process_global<T: Any>(&self, p: ProcessId, key: &'static str) -> Option<Rc<T>> {
        self.inner
            .borrow()
            .process(p)
            .globals
            .get(key)
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    // ------------------------------------------------------------------
    // Chaos switches and metrics
    // ------------------------------------------------------------------

    /// Whether speed-up mode is active (clogging and latency skipped).
    pub fn speed_up_simulation(&self) -> bool {
        self.inner.borrow().speed_up_simulation
    }

    /// Toggle speed-up mode.
    pub fn set_speed_up_simulation(&self, on: bool) {
        self.inner.borrow_mut().speed_up_simulation = on;
    }

    /// Whether random connection failures are being injected.
    pub fn connection_failures_enabled(&self) -> bool {
        self.inner.borrow().enable_connection_failures
    }

    /// Toggle random connection-failure injection.
    ///
    /// The default is a coin flip drawn at world construction.
    pub fn set_connection_failures_enabled(&self, on: bool) {
        self.inner.borrow_mut().enable_connection_failures = on;
    }

    /// Number of tasks dispatched so far.
    pub fn tasks_executed(&self) -> u64 {
        self.inner.borrow().tasks_executed
    }

    /// Number of tasks waiting in the queue.
    pub fn pending_task_count(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Whether any tasks are waiting.
    pub fn has_pending_tasks(&self) -> bool {
        !self.inner.borrow().queue.is_empty()
    }

    /// Number of leaked connections detected by the watchdog.
    pub fn leaked_connection_count(&self) -> u64 {
        self.inner.borrow().leaked_connections
    }

    /// Number of machine/interface kill actions applied so far.
    pub fn killed_machine_count(&self) -> u64 {
        self.inner.borrow().killed_machines
    }

    // ------------------------------------------------------------------
    // Waker plumbing (used by the futures in this module)
    // ------------------------------------------------------------------

    pub(crate) fn take_task_awake(&self, task_id: u64) -> bool {
        self.inner.borrow_mut().awakened.remove(&task_id)
    }

    pub(crate) fn register_task_waker(&self, task_id: u64, waker: Waker) {
        self.inner.borrow_mut().task_wakers.insert(task_id, waker);
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::set_sim_seed;

    fn local_block_on<F: std::future::Future>(future: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, future)
    }

    #[test]
    fn delay_advances_virtual_time() {
        set_sim_seed(1);
        let sim = SimWorld::new();
        let f = sim.delay(Duration::from_millis(250), TaskPriority::DefaultDelay);
        sim.run_until_quiescent();
        local_block_on(async move { f.await }).expect("delay");
        assert_eq!(sim.now(), Duration::from_millis(250));
    }

    #[test]
    fn tasks_on_failed_processes_never_resolve() {
        set_sim_seed(2);
        let sim = SimWorld::new();
        let p = sim.new_process(
            "victim",
            Ipv4Addr::new(10, 0, 0, 1),
            1,
            LocalityData::for_zone("z1"),
            ProcessClass::Storage,
            "",
            "",
        );
        let f = sim.delay_on(p, Duration::from_millis(10), TaskPriority::DefaultDelay);
        sim.kill_process(p, KillType::KillInstantly);
        sim.run_until_quiescent();

        // The completion was absorbed; the future must still be pending.
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, async move {
            tokio::select! {
                biased;
                _ = f => panic!("delay on failed process resolved"),
                _ = tokio::task::yield_now() => {}
            }
        });
    }

    #[test]
    fn on_process_switches_context() {
        set_sim_seed(3);
        let sim = SimWorld::new();
        let p = sim.new_process(
            "a",
            Ipv4Addr::new(10, 0, 0, 1),
            1,
            LocalityData::for_zone("z1"),
            ProcessClass::Storage,
            "",
            "",
        );
        let f = sim.on_process(p, TaskPriority::DefaultDelay);
        sim.run_until_quiescent();
        local_block_on(async move { f.await }).expect("switch");
        assert_eq!(sim.current_process(), p);
    }

    #[test]
    fn start_thread_round_trips_through_queue() {
        set_sim_seed(4);
        let sim = SimWorld::new();
        let fut = sim.start_thread(TaskPriority::DefaultDelay, || 21 * 2);

        // The external thread runs in real time; wait for its signal.
        while !sim.wait_external(Duration::from_secs(5)) {
            if sim.has_pending_tasks() {
                break;
            }
        }
        sim.run_until_quiescent();
        let v = local_block_on(async move { fut.await }).expect("thread result");
        assert_eq!(v, 42);
    }
}
