//! Persistent records managed by the controller: instances, hosts, service
//! offerings and per-host capacity counters.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use fabric_protocol::{HostId, PowerState};

/// Primary key of an instance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Management-server node id owning a piece of work.
pub type NodeId = u64;
pub type ZoneId = u64;
pub type PodId = u64;
pub type ClusterId = u64;
pub type PoolId = u64;
pub type OfferingId = u64;
pub type TemplateId = u64;
pub type AccountId = u64;
pub type NetworkId = u64;

/// Authoritative lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
    Migrating,
    Error,
    Destroyed,
    Expunging,
}

impl State {
    pub const ALL: [State; 8] = [
        State::Stopped,
        State::Starting,
        State::Running,
        State::Stopping,
        State::Migrating,
        State::Error,
        State::Destroyed,
        State::Expunging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Migrating => "migrating",
            State::Error => "error",
            State::Destroyed => "destroyed",
            State::Expunging => "expunging",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        State::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// States an operation is actively driving the instance through.
    pub fn is_transitional(&self) -> bool {
        matches!(self, State::Starting | State::Stopping | State::Migrating)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of VM; selects the guru that finalizes its lifecycle steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    User,
    DomainRouter,
    ConsoleProxy,
    SecondaryStorageVm,
}

impl VmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmType::User => "user",
            VmType::DomainRouter => "domain_router",
            VmType::ConsoleProxy => "console_proxy",
            VmType::SecondaryStorageVm => "secondary_storage_vm",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(VmType::User),
            "domain_router" => Some(VmType::DomainRouter),
            "console_proxy" => Some(VmType::ConsoleProxy),
            "secondary_storage_vm" => Some(VmType::SecondaryStorageVm),
            _ => None,
        }
    }

    pub fn is_system(&self) -> bool {
        !matches!(self, VmType::User)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorType {
    Kvm,
    XenServer,
    VMware,
    Simulator,
}

impl HypervisorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HypervisorType::Kvm => "kvm",
            HypervisorType::XenServer => "xenserver",
            HypervisorType::VMware => "vmware",
            HypervisorType::Simulator => "simulator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "kvm" => Some(HypervisorType::Kvm),
            "xenserver" => Some(HypervisorType::XenServer),
            "vmware" => Some(HypervisorType::VMware),
            "simulator" => Some(HypervisorType::Simulator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Globally unique external reference, stable across retries.
    pub uuid: String,
    pub name: String,
    pub vm_type: VmType,
    pub account_id: AccountId,
    pub state: State,
    pub power_state: PowerState,
    /// Host that produced the last power report.
    pub power_host_id: Option<HostId>,
    pub power_updated_at: u64,
    pub host_id: Option<HostId>,
    pub last_host_id: Option<HostId>,
    pub zone_id: ZoneId,
    pub pod_id: Option<PodId>,
    pub cluster_id: Option<ClusterId>,
    pub offering_id: OfferingId,
    pub template_id: TemplateId,
    pub hypervisor: HypervisorType,
    pub details: BTreeMap<String, String>,
    pub reservation_id: Option<String>,
    /// Bumped on every committed transition; the CAS token.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub removed_at: Option<u64>,
}

impl Instance {
    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: OfferingId,
    pub name: String,
    pub cpus: u32,
    pub cpu_speed_mhz: u32,
    pub memory_mb: u64,
    /// Restart automatically when the host loses the VM.
    pub ha_enabled: bool,
    /// Root disk lives on host-local storage; such VMs cannot live-migrate.
    pub local_storage: bool,
}

impl ServiceOffering {
    pub fn cpu_demand_mhz(&self) -> u64 {
        u64::from(self.cpus) * u64::from(self.cpu_speed_mhz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Up,
    Down,
    Disconnected,
    Maintenance,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Up => "up",
            HostStatus::Down => "down",
            HostStatus::Disconnected => "disconnected",
            HostStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(HostStatus::Up),
            "down" => Some(HostStatus::Down),
            "disconnected" => Some(HostStatus::Disconnected),
            "maintenance" => Some(HostStatus::Maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: HostId,
    pub name: String,
    pub zone_id: ZoneId,
    pub pod_id: PodId,
    pub cluster_id: ClusterId,
    pub hypervisor: HypervisorType,
    pub status: HostStatus,
    pub enabled: bool,
    pub private_ip: String,
    pub cpus: u32,
    pub cpu_speed_mhz: u32,
    pub memory_mb: u64,
}

impl HostRecord {
    pub fn total_cpu_mhz(&self) -> u64 {
        u64::from(self.cpus) * u64::from(self.cpu_speed_mhz)
    }

    /// Eligible to receive new placements.
    pub fn is_available(&self) -> bool {
        self.status == HostStatus::Up && self.enabled
    }
}

/// Which counter a capacity change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityBucket {
    /// Held by instances running (or stopping/migrating away) on the host.
    Used,
    /// Held while an operation is bringing an instance onto the host.
    Reserved,
}

impl CapacityBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityBucket::Used => "used",
            CapacityBucket::Reserved => "reserved",
        }
    }
}

/// Effective ceiling for a checked allocation (totals × over-provisioning).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLimit {
    pub cpu_mhz: u64,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityChange {
    pub host: HostId,
    pub bucket: CapacityBucket,
    pub cpu_mhz: i64,
    pub memory_mb: i64,
    /// When set, a growing change is refused if it would exceed the limit.
    pub limit: Option<CapacityLimit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostCapacity {
    pub used_cpu_mhz: u64,
    pub reserved_cpu_mhz: u64,
    pub used_memory_mb: u64,
    pub reserved_memory_mb: u64,
}

impl HostCapacity {
    pub fn allocated_cpu_mhz(&self) -> u64 {
        self.used_cpu_mhz + self.reserved_cpu_mhz
    }

    pub fn allocated_memory_mb(&self) -> u64 {
        self.used_memory_mb + self.reserved_memory_mb
    }
}

/// Apply a signed delta to a counter, clamping at zero.
pub(crate) fn apply_delta(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.saturating_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}

/// Whether `current + delta` stays within `limit` (shrinking changes always fit).
pub(crate) fn fits(allocated: u64, delta: i64, limit: u64) -> bool {
    delta <= 0 || allocated.saturating_add(delta as u64) <= limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_text_round_trips() {
        for state in State::ALL {
            assert_eq!(State::parse(state.as_str()), Some(state));
        }
        assert!(State::Migrating.is_transitional());
        assert!(!State::Error.is_transitional());
    }

    #[test]
    fn capacity_delta_clamps_at_zero() {
        assert_eq!(apply_delta(10, -20), 0);
        assert_eq!(apply_delta(10, 5), 15);
        assert!(fits(90, 10, 100));
        assert!(!fits(95, 10, 100));
        assert!(fits(500, -10, 100));
    }
}
