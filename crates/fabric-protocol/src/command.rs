use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{HostId, PowerState};

/// Correlation sequence assigned by the controller to every request.
pub type Seq = u64;

/// Everything an agent needs to materialize a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub uuid: String,
    pub cpus: u32,
    pub cpu_speed_mhz: u32,
    pub memory_mb: u64,
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<NicSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskSpec>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::base64_opt"
    )]
    pub user_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicSpec {
    pub device_id: u32,
    pub network_id: u64,
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub volume_id: u64,
    pub pool_id: u64,
    pub path: String,
    pub size_gb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCommand {
    pub vm: VmSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCommand {
    pub vm_name: String,
    /// Tear down regardless of guest cooperation.
    #[serde(default)]
    pub cleanup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootCommand {
    pub vm_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareForMigrationCommand {
    pub vm: VmSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateCommand {
    pub vm_name: String,
    pub destination: HostId,
    pub destination_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckVirtualMachineCommand {
    pub vm_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlugNicCommand {
    pub vm_name: String,
    pub nic: NicSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnplugNicCommand {
    pub vm_name: String,
    pub nic: NicSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostCommand {
    Start(StartCommand),
    Stop(StopCommand),
    Reboot(RebootCommand),
    PrepareForMigration(PrepareForMigrationCommand),
    Migrate(MigrateCommand),
    CheckVirtualMachine(CheckVirtualMachineCommand),
    PlugNic(PlugNicCommand),
    UnplugNic(UnplugNicCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Start,
    Stop,
    Reboot,
    PrepareForMigration,
    Migrate,
    CheckVirtualMachine,
    PlugNic,
    UnplugNic,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
            CommandKind::Reboot => "reboot",
            CommandKind::PrepareForMigration => "prepare_for_migration",
            CommandKind::Migrate => "migrate",
            CommandKind::CheckVirtualMachine => "check_virtual_machine",
            CommandKind::PlugNic => "plug_nic",
            CommandKind::UnplugNic => "unplug_nic",
        }
    }
}

impl HostCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            HostCommand::Start(_) => CommandKind::Start,
            HostCommand::Stop(_) => CommandKind::Stop,
            HostCommand::Reboot(_) => CommandKind::Reboot,
            HostCommand::PrepareForMigration(_) => CommandKind::PrepareForMigration,
            HostCommand::Migrate(_) => CommandKind::Migrate,
            HostCommand::CheckVirtualMachine(_) => CommandKind::CheckVirtualMachine,
            HostCommand::PlugNic(_) => CommandKind::PlugNic,
            HostCommand::UnplugNic(_) => CommandKind::UnplugNic,
        }
    }

    /// Name of the VM the command targets.
    pub fn vm_name(&self) -> &str {
        match self {
            HostCommand::Start(cmd) => &cmd.vm.name,
            HostCommand::Stop(cmd) => &cmd.vm_name,
            HostCommand::Reboot(cmd) => &cmd.vm_name,
            HostCommand::PrepareForMigration(cmd) => &cmd.vm.name,
            HostCommand::Migrate(cmd) => &cmd.vm_name,
            HostCommand::CheckVirtualMachine(cmd) => &cmd.vm_name,
            HostCommand::PlugNic(cmd) => &cmd.vm_name,
            HostCommand::UnplugNic(cmd) => &cmd.vm_name,
        }
    }
}

/// Why an agent refused or failed a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InsufficientCapacity,
    ResourceUnavailable,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Filled by CheckVirtualMachine and Stop answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,
}

impl Answer {
    pub fn ok() -> Self {
        Self {
            result: true,
            details: None,
            failure: None,
            power_state: None,
        }
    }

    pub fn failed(reason: FailureReason, details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: Some(details.into()),
            failure: Some(reason),
            power_state: None,
        }
    }

    pub fn with_power_state(mut self, state: PowerState) -> Self {
        self.power_state = Some(state);
        self
    }

    pub fn details_or_default(&self) -> &str {
        self.details.as_deref().unwrap_or("no details")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub seq: Seq,
    pub host: HostId,
    pub command: HostCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub seq: Seq,
    pub answer: Answer,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec {
            name: "i-2-10-VM".into(),
            uuid: "0f6c".into(),
            cpus: 2,
            cpu_speed_mhz: 1000,
            memory_mb: 2048,
            template: "tmpl-centos".into(),
            nics: vec![],
            disks: vec![],
            user_data: Some(b"#cloud-config".to_vec()),
            details: BTreeMap::new(),
        }
    }

    #[test]
    fn commands_are_tagged_by_kind() {
        let cmd = HostCommand::Stop(StopCommand {
            vm_name: "i-2-10-VM".into(),
            cleanup: true,
        });
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["kind"], "stop");
        assert_eq!(json["vm_name"], "i-2-10-VM");
        assert_eq!(cmd.kind().as_str(), "stop");
    }

    #[test]
    fn user_data_travels_as_base64() {
        let cmd = HostCommand::Start(StartCommand { vm: spec() });
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["vm"]["user_data"], "I2Nsb3VkLWNvbmZpZw==");

        let decoded: HostCommand = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.vm_name(), "i-2-10-VM");
    }

    #[test]
    fn failed_answer_carries_reason() {
        let answer = Answer::failed(FailureReason::InsufficientCapacity, "no memory");
        assert!(!answer.result);
        assert_eq!(answer.failure, Some(FailureReason::InsufficientCapacity));
        assert_eq!(answer.details_or_default(), "no memory");
        assert_eq!(Answer::ok().details_or_default(), "no details");
    }
}
