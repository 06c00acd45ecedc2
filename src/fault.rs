//! The kill/reboot/fault controller.
//!
//! Destructive actions are gated by the configured replication policies:
//! a kill that would leave the cluster unable to satisfy the transaction
//! log or storage policy is downgraded to a reboot-class action, and the
//! downgrade is reported through the returned effective kill type.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::address::NetworkAddress;
use crate::error::SimulationError;
use crate::events::{TaskPayload, TaskPriority};
use crate::locality::{LocalityData, ProcessClass};
use crate::policy::{LocalityGroup, ReplicationPolicy, validate_all_combinations};
use crate::process::ProcessId;
use crate::rng::{random_unique_id, sim_random01, sim_random_range};
use crate::sim::{SimInner, SimWorld};
use std::time::Duration;

/// Kill actions, ordered least to most destructive.
///
/// The discriminants are wire-stable. Hard-kill versus reboot-class is
/// decided by [`KillType::is_hard_kill`], not by ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KillType {
    /// Mark the process failed immediately.
    KillInstantly = 0,
    /// Arm the process's fault-injection predicate.
    InjectFaults = 1,
    /// Reboot one process.
    RebootProcess = 2,
    /// Reboot the machine.
    Reboot = 3,
    /// Reboot the machine and delete its durable state.
    RebootAndDelete = 4,
    /// Reboot one process and delete its durable state.
    RebootProcessAndDelete = 5,
}

impl KillType {
    fn is_destructive(self) -> bool {
        matches!(
            self,
            KillType::KillInstantly
                | KillType::InjectFaults
                | KillType::RebootAndDelete
                | KillType::RebootProcessAndDelete
        )
    }

    /// Hard kills fail the process in place; everything else is a
    /// reboot-class action delivered through the shutdown signal.
    pub fn is_hard_kill(self) -> bool {
        matches!(self, KillType::KillInstantly | KillType::InjectFaults)
    }
}

/// Apply a hard kill to one process.
///
/// # Panics
///
/// Panics for reboot-class kill types; those go through
/// [`SimWorld::reboot_process`].
pub(crate) fn kill_process_internal(inner: &mut SimInner, p: ProcessId, kt: KillType) {
    match kt {
        KillType::KillInstantly => {
            let proc = inner.process_mut(p);
            tracing::warn!(
                name = proc.name,
                address = %proc.address,
                zone = proc.locality.zone_id.as_deref().unwrap_or("-"),
                "fail process"
            );
            proc.failed = true;
        }
        KillType::InjectFaults => {
            let r = random_unique_id().first;
            let p2 = sim_random01();
            let proc = inner.process_mut(p);
            tracing::warn!(
                name = proc.name,
                address = %proc.address,
                zone = proc.locality.zone_id.as_deref().unwrap_or("-"),
                "fault process"
            );
            proc.fault_injection_r = r;
            proc.fault_injection_p1 = 0.1;
            proc.fault_injection_p2 = p2;
        }
        other => panic!("kill_process_internal cannot apply {other:?}"),
    }
}

/// Schedule the reboot sequence on `p` without the protected-address
/// downgrade (callers have already applied it).
pub(crate) fn schedule_reboot(inner: &mut SimInner, p: ProcessId, kt: KillType) {
    assert!(
        matches!(
            kt,
            KillType::RebootProcess
                | KillType::Reboot
                | KillType::RebootAndDelete
                | KillType::RebootProcessAndDelete
        ),
        "reboot requires a reboot-class kill type"
    );
    inner.schedule(
        TaskPayload::Reboot { kill_type: kt },
        Duration::ZERO,
        TaskPriority::DefaultDelay,
        p,
    );
}

impl SimWorld {
    // ------------------------------------------------------------------
    // Policy configuration
    // ------------------------------------------------------------------

    /// Install the transaction-log replication policy.
    pub fn set_tlog_policy(&self, policy: Rc<dyn ReplicationPolicy>) {
        self.inner_mut().tlog_policy = Some(policy);
    }

    /// Install the storage replication policy.
    pub fn set_storage_policy(&self, policy: Rc<dyn ReplicationPolicy>) {
        self.inner_mut().storage_policy = Some(policy);
    }

    /// Configure the transaction-log write anti-quorum.
    pub fn set_tlog_write_anti_quorum(&self, n: usize) {
        self.inner_mut().tlog_write_anti_quorum = n;
    }

    /// Expected number of processes per machine, used by the
    /// partial-reboot guard in [`kill_machine`](Self::kill_machine).
    pub fn set_processes_per_machine(&self, n: usize) {
        self.inner_mut().processes_per_machine = n;
    }

    /// Protect an address: delete-class process reboots against it are
    /// silently downgraded.
    pub fn protect_address(&self, address: NetworkAddress) {
        self.inner_mut()
            .protected_addresses
            .insert(address.normalized());
    }

    // ------------------------------------------------------------------
    // Survivability
    // ------------------------------------------------------------------

    /// Decide whether killing `dead` while `available` survives keeps the
    /// cluster alive, and with which effective kill type.
    ///
    /// Only destructive kinds are evaluated; other kinds pass through
    /// unchanged and survivable.
    ///
    /// # Panics
    ///
    /// Panics if the policies have not been configured.
    pub fn can_kill_processes(
        &self,
        available: &[ProcessId],
        dead: &[ProcessId],
        kt: KillType,
    ) -> (bool, KillType) {
        if !kt.is_destructive() {
            return (true, kt);
        }

        let (tlog, storage, anti_quorum, left_localities, dead_localities) = {
            let inner = self.inner_mut();
            let tlog = inner
                .tlog_policy
                .clone()
                .expect("can_kill_processes requires a tLog policy");
            let storage = inner
                .storage_policy
                .clone()
                .expect("can_kill_processes requires a storage policy");
            let left: Vec<LocalityData> = available
                .iter()
                .map(|&p| inner.process(p).locality.clone())
                .collect();
            let dead: Vec<LocalityData> = dead
                .iter()
                .map(|&p| inner.process(p).locality.clone())
                .collect();
            (tlog, storage, inner.tlog_write_anti_quorum, left, dead)
        };

        let processes_left = LocalityGroup::from_localities(left_localities.clone());
        let processes_dead = LocalityGroup::from_localities(dead_localities);

        let mut new_kt = kt;
        let mut can_survive = true;

        if tlog.validate(&processes_dead) {
            // The dead set alone can hold a full tLog team: data loss.
            new_kt = KillType::Reboot;
            can_survive = false;
            tracing::info!(
                kill_type = ?kt,
                new_kill_type = ?new_kt,
                policy = tlog.info(),
                left = processes_left.len(),
                dead = processes_dead.len(),
                "kill downgraded; tLog policy validates against dead processes"
            );
        } else if storage.validate(&processes_dead) {
            new_kt = KillType::Reboot;
            can_survive = false;
            tracing::info!(
                kill_type = ?kt,
                new_kill_type = ?new_kt,
                policy = storage.info(),
                left = processes_left.len(),
                dead = processes_dead.len(),
                "kill downgraded; storage policy validates against dead processes"
            );
        } else if anti_quorum > 0
            && !validate_all_combinations(&processes_dead, &*tlog, &left_localities, anti_quorum)
        {
            new_kt = KillType::Reboot;
            can_survive = false;
            tracing::info!(
                kill_type = ?kt,
                new_kill_type = ?new_kt,
                anti_quorum,
                "kill downgraded; tLog anti-quorum completes the dead set"
            );
        } else if kt != KillType::RebootAndDelete
            && kt != KillType::RebootProcessAndDelete
            && !tlog.validate(&processes_left)
        {
            new_kt = if sim_random01() < 0.33 {
                KillType::RebootAndDelete
            } else {
                KillType::Reboot
            };
            can_survive = false;
            tracing::info!(
                kill_type = ?kt,
                new_kill_type = ?new_kt,
                policy = tlog.info(),
                "kill downgraded; tLog policy fails against remaining processes"
            );
        } else if kt != KillType::RebootAndDelete
            && kt != KillType::RebootProcessAndDelete
            && !storage.validate(&processes_left)
        {
            new_kt = if sim_random01() < 0.33 {
                KillType::RebootAndDelete
            } else {
                KillType::Reboot
            };
            can_survive = false;
            tracing::info!(
                kill_type = ?kt,
                new_kill_type = ?new_kt,
                policy = storage.info(),
                "kill downgraded; storage policy fails against remaining processes"
            );
        } else {
            tracing::debug!(
                kill_type = ?kt,
                left = processes_left.len(),
                dead = processes_dead.len(),
                "kill survivable"
            );
        }

        (can_survive, new_kt)
    }

    // ------------------------------------------------------------------
    // Kill actions
    // ------------------------------------------------------------------

    /// Hard-kill one process. Reboot-class kinds are ignored here; use
    /// [`reboot_process`](Self::reboot_process).
    pub fn kill_process(&self, p: ProcessId, kt: KillType) {
        if kt.is_hard_kill() {
            let mut inner = self.inner_mut();
            kill_process_internal(&mut inner, p, kt);
            inner.killed_machines += 1;
        }
    }

    /// Hard-kill every process in the zone owning `address`.
    pub fn kill_interface(&self, address: NetworkAddress, kt: KillType) {
        if kt.is_hard_kill() {
            let mut inner = self.inner_mut();
            let Some(&p) = inner.address_map.get(&address.normalized()) else {
                return;
            };
            let Some(zone) = inner.process(p).machine_zone.clone() else {
                return;
            };
            let processes = inner
                .machines
                .get(&zone)
                .map(|m| m.processes.clone())
                .unwrap_or_default();
            for p in processes {
                kill_process_internal(&mut inner, p, kt);
            }
            inner.killed_machines += 1;
        }
    }

    /// Begin a reboot of one process. Protected addresses downgrade
    /// `RebootProcessAndDelete` to `RebootProcess`. Idempotent when the
    /// process is already rebooting.
    pub fn reboot_process(&self, p: ProcessId, kt: KillType) {
        let mut inner = self.inner_mut();
        let kt = if kt == KillType::RebootProcessAndDelete
            && inner.protected_addresses.contains(&inner.process(p).address)
        {
            KillType::RebootProcess
        } else {
            kt
        };
        schedule_reboot(&mut inner, p, kt);
    }

    /// Reboot every process of a zone, or one at random.
    pub fn reboot_process_by_zone(&self, zone_id: &str, all_processes: bool) {
        let mut inner = self.inner_mut();
        let candidates: Vec<ProcessId> = inner
            .machines
            .get(zone_id)
            .map(|m| m.processes.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|&p| !inner.process(p).rebooting)
            .collect();
        if candidates.is_empty() {
            return;
        }
        if all_processes {
            for p in candidates {
                schedule_reboot(&mut inner, p, KillType::RebootProcess);
            }
        } else {
            let pick = candidates[sim_random_range(0..candidates.len())];
            schedule_reboot(&mut inner, pick, KillType::RebootProcess);
        }
    }

    /// Kill or reboot a whole machine.
    ///
    /// Refused in speed-up mode unless forced, and when the machine does
    /// not have all of its processes running (unless the kill is safe).
    /// Returns whether the action was applied.
    pub fn kill_machine(
        &self,
        zone_id: &str,
        kt: KillType,
        kill_is_safe: bool,
        force_kill: bool,
    ) -> bool {
        let kt_orig = kt;
        if kill_is_safe {
            assert_eq!(
                kt,
                KillType::RebootAndDelete,
                "only RebootAndDelete kills can be marked safe"
            );
        }
        if self.speed_up_simulation() && !force_kill {
            return false;
        }

        let mut kt = kt;
        let (machine_processes, processes_on_machine) = {
            let inner = self.inner_mut();
            let processes = inner
                .machines
                .get(zone_id)
                .map(|m| m.processes.clone())
                .unwrap_or_default();
            let mut running = 0;
            for &p in &processes {
                let proc = inner.process(p);
                if inner.protected_addresses.contains(&proc.address) {
                    kt = KillType::Reboot;
                }
                if !proc.rebooting {
                    running += 1;
                }
            }
            (processes, running)
        };

        if kt.is_destructive() {
            let (left, dead) = self.partition_for_zones(&[zone_id.to_string()]);
            let (survives, new_kt) = self.can_kill_processes(&left, &dead, kt);
            kt = new_kt;
            if !survives {
                if kt != KillType::Reboot && !kill_is_safe {
                    kt = KillType::Reboot;
                }
                tracing::info!(
                    zone = zone_id,
                    kill_type = ?kt,
                    orig_kill_type = ?kt_orig,
                    left = left.len(),
                    dead = dead.len(),
                    "changed kill machine"
                );
            } else if matches!(kt, KillType::KillInstantly | KillType::InjectFaults) {
                let mut inner = self.inner_mut();
                if let Some(machine) = inner.machines.get_mut(zone_id) {
                    machine.dead = true;
                }
                tracing::info!(zone = zone_id, kill_type = ?kt, "dead machine");
            }
        }

        let processes_per_machine = self.inner_mut().processes_per_machine;
        if processes_on_machine != processes_per_machine && !kt.is_hard_kill() {
            tracing::warn!(
                zone = zone_id,
                running = processes_on_machine,
                expected = processes_per_machine,
                "aborted reboot; the machine did not have all of its processes running"
            );
            return false;
        }

        tracing::info!(
            zone = zone_id,
            kill_type = ?kt,
            orig_kill_type = ?kt_orig,
            kill_is_safe,
            "kill machine"
        );
        let mut inner = self.inner_mut();
        if kt.is_hard_kill() {
            for &p in &machine_processes {
                if inner.process(p).class != ProcessClass::Tester {
                    kill_process_internal(&mut inner, p, kt);
                }
            }
            inner.killed_machines += 1;
        } else if kt == KillType::Reboot || kill_is_safe {
            for &p in &machine_processes {
                if inner.process(p).class != ProcessClass::Tester {
                    schedule_reboot(&mut inner, p, kt);
                }
            }
        }
        true
    }

    /// Kill or reboot every machine of a datacenter.
    pub fn kill_data_center(&self, dc_id: &str, kt: KillType) {
        let kt_orig = kt;
        let mut kt = kt;

        let mut datacenter_zones: BTreeMap<String, usize> = BTreeMap::new();
        let mut dc_processes = 0;
        {
            let inner = self.inner_mut();
            for machine in inner.machines.values() {
                for &p in &machine.processes {
                    let proc = inner.process(p);
                    if proc.locality.dc_id.as_deref() == Some(dc_id) {
                        if inner.protected_addresses.contains(&proc.address) {
                            kt = KillType::Reboot;
                        }
                        let zone = proc
                            .locality
                            .zone_id
                            .clone()
                            .expect("process without zone id");
                        *datacenter_zones.entry(zone).or_insert(0) += 1;
                        dc_processes += 1;
                    }
                }
            }
        }

        if kt.is_destructive() {
            let zones: Vec<String> = datacenter_zones.keys().cloned().collect();
            let (left, dead) = self.partition_for_zones(&zones);
            let (survives, new_kt) = self.can_kill_processes(&left, &dead, kt);
            kt = new_kt;
            if !survives {
                tracing::warn!(
                    dc = dc_id,
                    kill_type = ?kt_orig,
                    new_kill_type = ?kt,
                    "datacenter kill downgraded"
                );
            } else {
                tracing::info!(
                    dc = dc_id,
                    kill_type = ?kt,
                    zones = datacenter_zones.len(),
                    processes = dc_processes,
                    "dead datacenter"
                );
            }
        }

        tracing::info!(
            dc = dc_id,
            kill_type = ?kt,
            zones = datacenter_zones.len(),
            processes = dc_processes,
            "kill datacenter"
        );
        for zone in datacenter_zones.keys() {
            self.kill_machine(zone, kt, kt == KillType::RebootAndDelete, true);
        }
    }

    /// Partition all non-Tester processes into (left, dead) given the
    /// zones being killed. Already-failed processes and processes on dead
    /// machines count as dead.
    fn partition_for_zones(&self, zones: &[String]) -> (Vec<ProcessId>, Vec<ProcessId>) {
        let inner = self.inner_mut();
        let mut left = Vec::new();
        let mut dead = Vec::new();
        for machine in inner.machines.values() {
            let zone_dying = zones.iter().any(|z| *z == machine.zone_id);
            for &p in &machine.processes {
                let proc = inner.process(p);
                if proc.class == ProcessClass::Tester {
                    continue;
                }
                if proc.failed || machine.dead || zone_dying {
                    dead.push(p);
                } else {
                    left.push(p);
                }
            }
        }
        (left, dead)
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Whether an armed fault should fire at this call site for the
    /// current process.
    ///
    /// The site hash makes eligibility stable per `(line, process seed)`,
    /// so injected faults reproduce across runs of the same seed.
    pub fn should_inject_fault(&self, file: &str, line: u32, error: &SimulationError) -> bool {
        let (p1, p2, r, speed_up) = {
            let inner = self.inner_mut();
            let proc = inner.process(inner.current_process);
            (
                proc.fault_injection_p1,
                proc.fault_injection_p2,
                proc.fault_injection_r,
                inner.speed_up_simulation,
            )
        };
        if p2 <= 0.0 || speed_up {
            return false;
        }
        if sim_random01() >= p2 {
            return false;
        }
        let h1 = (line as u64).wrapping_add(r >> 32) as u32;
        if (h1 as f64) < p1 * u32::MAX as f64 {
            tracing::warn!(file, line, ?error, "fault injected");
            return true;
        }
        false
    }
}
