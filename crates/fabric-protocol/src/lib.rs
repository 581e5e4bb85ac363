//! Wire types exchanged between the fabric controller and host agents.
//!
//! Commands flow controller → agent over a correlated request/response
//! channel; power-state reports flow agent → controller as [`AgentEvent`]s on
//! a separate event channel.

mod command;
mod report;

pub use command::{
    Answer, CheckVirtualMachineCommand, CommandKind, DiskSpec, FailureReason, HostCommand,
    MigrateCommand, NicSpec, PlugNicCommand, PrepareForMigrationCommand, RebootCommand, Request,
    Response, Seq, StartCommand, StopCommand, UnplugNicCommand, VmSpec,
};
pub use report::{AgentEvent, VmStateReport};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a hypervisor host managed by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// Power state of a VM as last observed by a host agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PowerOn,
    PowerOff,
    PowerUnknown,
    /// The host sent a full report that did not mention the VM.
    PowerReportMissing,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::PowerOn => "power_on",
            PowerState::PowerOff => "power_off",
            PowerState::PowerUnknown => "power_unknown",
            PowerState::PowerReportMissing => "power_report_missing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "power_on" => Some(PowerState::PowerOn),
            "power_off" => Some(PowerState::PowerOff),
            "power_unknown" => Some(PowerState::PowerUnknown),
            "power_report_missing" => Some(PowerState::PowerReportMissing),
            _ => None,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serde helper carrying optional raw bytes as standard base64 text.
pub mod base64_opt {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&BASE64_STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = Option::<String>::deserialize(deserializer)?;
        text.map(|t| {
            BASE64_STANDARD
                .decode(t.as_bytes())
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
