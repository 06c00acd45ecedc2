//! Physical placement of simulated processes.

use std::fmt;

/// Where a process lives: zone, data hall, datacenter, machine.
///
/// The zone id is the unit of failure for machine kills and is required
/// for every real process. The other fields are optional and consulted by
/// replication policies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalityData {
    /// Failure-domain identifier; groups processes into a machine.
    pub zone_id: Option<String>,
    /// Data-hall identifier within a datacenter.
    pub data_hall_id: Option<String>,
    /// Datacenter identifier.
    pub dc_id: Option<String>,
    /// Physical machine identifier.
    pub machine_id: Option<String>,
}

impl LocalityData {
    /// Locality with only a zone id set.
    pub fn for_zone(zone_id: impl Into<String>) -> Self {
        Self {
            zone_id: Some(zone_id.into()),
            data_hall_id: None,
            dc_id: None,
            machine_id: None,
        }
    }

    /// The value of a named locality attribute, if set.
    pub fn get(&self, attrib: LocalityAttrib) -> Option<&str> {
        match attrib {
            LocalityAttrib::ZoneId => self.zone_id.as_deref(),
            LocalityAttrib::DataHallId => self.data_hall_id.as_deref(),
            LocalityAttrib::DcId => self.dc_id.as_deref(),
            LocalityAttrib::MachineId => self.machine_id.as_deref(),
        }
    }
}

impl fmt::Display for LocalityData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "zone={} hall={} dc={} machine={}",
            self.zone_id.as_deref().unwrap_or("-"),
            self.data_hall_id.as_deref().unwrap_or("-"),
            self.dc_id.as_deref().unwrap_or("-"),
            self.machine_id.as_deref().unwrap_or("-"),
        )
    }
}

/// Named locality attributes, used by replication policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalityAttrib {
    /// The zone id.
    ZoneId,
    /// The data-hall id.
    DataHallId,
    /// The datacenter id.
    DcId,
    /// The machine id.
    MachineId,
}

/// Role tag assigned to a process at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessClass {
    /// Unset; eligible for any role.
    Unset,
    /// Storage server.
    Storage,
    /// Transaction log.
    TLog,
    /// Transaction resolver.
    Resolver,
    /// Cluster controller / master.
    Master,
    /// Test driver process. Excluded from kill-policy accounting and from
    /// machine kills.
    Tester,
}

impl fmt::Display for ProcessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessClass::Unset => "unset",
            ProcessClass::Storage => "storage",
            ProcessClass::TLog => "tlog",
            ProcessClass::Resolver => "resolver",
            ProcessClass::Master => "master",
            ProcessClass::Tester => "tester",
        };
        f.write_str(name)
    }
}
