use serde::{Deserialize, Serialize};

use crate::{HostId, PowerState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStateReport {
    pub vm_name: String,
    pub power_state: PowerState,
}

impl VmStateReport {
    pub fn new(vm_name: impl Into<String>, power_state: PowerState) -> Self {
        Self {
            vm_name: vm_name.into(),
            power_state,
        }
    }
}

/// Events pushed by host agents on the report channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Agent (re)connected; `report` lists every VM the host knows about.
    Connected {
        host: HostId,
        report: Vec<VmStateReport>,
    },
    /// Heartbeat carrying only the entries that changed since the last one.
    PowerReport {
        host: HostId,
        report: Vec<VmStateReport>,
    },
    Disconnected { host: HostId },
}

impl AgentEvent {
    pub fn host(&self) -> HostId {
        match self {
            AgentEvent::Connected { host, .. }
            | AgentEvent::PowerReport { host, .. }
            | AgentEvent::Disconnected { host } => *host,
        }
    }
}
