//! In-process stand-in for a fleet of host agents.
//!
//! [`SimulatedFleet`] answers commands from per-host VM tables and pushes
//! [`AgentEvent`]s on its report channel. Faults can be injected per host
//! and, optionally, per command kind. Used by the daemon's dev mode and by
//! the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use fabric_protocol::{
    AgentEvent, Answer, CommandKind, FailureReason, HostCommand, HostId, PowerState, Request,
    Response, VmStateReport,
};

use crate::channel::{ChannelError, HostTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The agent is not connected.
    Unavailable,
    /// The agent answers with a failure and does nothing.
    Reject(FailureReason),
    /// The agent never answers.
    Hang,
    /// The agent carries the command out, but the answer is lost.
    Timeout,
    /// Migrate is acknowledged but the VM never shows up on the destination.
    LoseVm,
}

#[derive(Default)]
struct Fleet {
    hosts: BTreeMap<HostId, BTreeMap<String, PowerState>>,
    faults: HashMap<(HostId, Option<CommandKind>), Fault>,
    log: Vec<(HostId, HostCommand)>,
}

impl Fleet {
    fn fault_for(&self, host: HostId, kind: CommandKind) -> Option<Fault> {
        self.faults
            .get(&(host, Some(kind)))
            .or_else(|| self.faults.get(&(host, None)))
            .copied()
    }

    fn report(&self, host: HostId) -> Vec<VmStateReport> {
        self.hosts
            .get(&host)
            .map(|vms| {
                vms.iter()
                    .map(|(name, power)| VmStateReport::new(name.clone(), *power))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn execute(&mut self, host: HostId, command: &HostCommand, lose_vm: bool) -> Answer {
        match command {
            HostCommand::Start(cmd) => {
                self.vms(host).insert(cmd.vm.name.clone(), PowerState::PowerOn);
                Answer::ok().with_power_state(PowerState::PowerOn)
            }
            HostCommand::Stop(cmd) => {
                self.vms(host).remove(&cmd.vm_name);
                Answer::ok().with_power_state(PowerState::PowerOff)
            }
            HostCommand::Reboot(cmd) => match self.vms(host).get(&cmd.vm_name) {
                Some(PowerState::PowerOn) => Answer::ok().with_power_state(PowerState::PowerOn),
                _ => Answer::failed(FailureReason::Other, format!("{} is not running", cmd.vm_name)),
            },
            HostCommand::PrepareForMigration(_) => Answer::ok(),
            HostCommand::Migrate(cmd) => {
                let Some(power) = self.vms(host).remove(&cmd.vm_name) else {
                    return Answer::failed(
                        FailureReason::Other,
                        format!("{} is not on {host}", cmd.vm_name),
                    );
                };
                if !self.hosts.contains_key(&cmd.destination) {
                    self.vms(host).insert(cmd.vm_name.clone(), power);
                    return Answer::failed(
                        FailureReason::ResourceUnavailable,
                        format!("{} unreachable", cmd.destination),
                    );
                }
                if !lose_vm {
                    self.vms(cmd.destination).insert(cmd.vm_name.clone(), power);
                }
                Answer::ok()
            }
            HostCommand::CheckVirtualMachine(cmd) => match self.vms(host).get(&cmd.vm_name) {
                Some(power) => Answer::ok().with_power_state(*power),
                None => Answer::failed(FailureReason::Other, format!("{} not found", cmd.vm_name))
                    .with_power_state(PowerState::PowerReportMissing),
            },
            HostCommand::PlugNic(_) | HostCommand::UnplugNic(_) => {
                if self.vms(host).contains_key(command.vm_name()) {
                    Answer::ok()
                } else {
                    Answer::failed(
                        FailureReason::Other,
                        format!("{} not found", command.vm_name()),
                    )
                }
            }
        }
    }

    fn vms(&mut self, host: HostId) -> &mut BTreeMap<String, PowerState> {
        self.hosts.entry(host).or_default()
    }
}

pub struct SimulatedFleet {
    inner: Mutex<Fleet>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl SimulatedFleet {
    /// A fleet with no hosts, and the receiving end of its report channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let fleet = Self {
            inner: Mutex::new(Fleet::default()),
            events,
        };
        (fleet, rx)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Fleet) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn add_host(&self, host: HostId) {
        self.with(|f| {
            f.hosts.entry(host).or_default();
        });
    }

    /// Inject `fault` for `kind` on `host`, or for every command when `kind`
    /// is `None`. Stays until cleared.
    pub fn fail(&self, host: HostId, kind: Option<CommandKind>, fault: Fault) {
        self.with(|f| {
            f.faults.insert((host, kind), fault);
        });
    }

    pub fn clear_faults(&self) {
        self.with(|f| f.faults.clear());
    }

    /// Put a VM on a host behind the controller's back.
    pub fn place_vm(&self, host: HostId, name: &str, power: PowerState) {
        self.with(|f| {
            f.vms(host).insert(name.to_string(), power);
        });
    }

    pub fn remove_vm(&self, host: HostId, name: &str) {
        self.with(|f| {
            f.vms(host).remove(name);
        });
    }

    pub fn vms(&self, host: HostId) -> Vec<String> {
        self.with(|f| {
            f.hosts
                .get(&host)
                .map(|vms| vms.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn power_of(&self, host: HostId, name: &str) -> Option<PowerState> {
        self.with(|f| f.hosts.get(&host).and_then(|vms| vms.get(name)).copied())
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<(HostId, HostCommand)> {
        self.with(|f| f.log.clone())
    }

    pub fn count(&self, kind: CommandKind) -> usize {
        self.with(|f| f.log.iter().filter(|(_, c)| c.kind() == kind).count())
    }

    /// Agent (re)connects and sends its full report.
    pub fn connect(&self, host: HostId) {
        let report = self.with(|f| {
            f.hosts.entry(host).or_default();
            f.report(host)
        });
        self.emit(AgentEvent::Connected { host, report });
    }

    pub fn heartbeat(&self, host: HostId) {
        let report = self.with(|f| f.report(host));
        self.emit(AgentEvent::PowerReport { host, report });
    }

    pub fn disconnect(&self, host: HostId) {
        self.emit(AgentEvent::Disconnected { host });
    }

    fn emit(&self, event: AgentEvent) {
        if self.events.send(event).is_err() {
            debug!("no listener for simulated agent events");
        }
    }
}

#[async_trait]
impl HostTransport for SimulatedFleet {
    async fn send(&self, request: Request) -> Result<Response, ChannelError> {
        let host = request.host;
        let kind = request.command.kind();
        let outcome = self.with(|f| {
            f.log.push((host, request.command.clone()));
            if !f.hosts.contains_key(&host) {
                return Err(Fault::Unavailable);
            }
            match f.fault_for(host, kind) {
                None => Ok(f.execute(host, &request.command, false)),
                Some(Fault::LoseVm) => Ok(f.execute(host, &request.command, true)),
                Some(Fault::Reject(reason)) => {
                    Ok(Answer::failed(reason, format!("{} rejected by simulator", kind.as_str())))
                }
                Some(Fault::Timeout) => {
                    f.execute(host, &request.command, false);
                    Err(Fault::Timeout)
                }
                Some(fault @ (Fault::Unavailable | Fault::Hang)) => Err(fault),
            }
        });
        match outcome {
            Ok(answer) => Ok(Response {
                seq: request.seq,
                answer,
            }),
            Err(Fault::Unavailable) => Err(ChannelError::AgentUnavailable {
                host,
                reason: "not connected".into(),
            }),
            Err(Fault::Timeout) => Err(ChannelError::OperationTimedOut {
                host,
                command: kind.as_str(),
                is_active: true,
            }),
            Err(_) => std::future::pending().await,
        }
    }
}
