//! Follow-up work for operations whose outcome is unknown or that were
//! abandoned by a crashed node.
//!
//! The orchestrator and the sync engine only enqueue [`RecoveryTask`]s; the
//! daemon drains the queue into [`RecoveryWorker::handle`] so that no
//! lifecycle call ever blocks on recovery of another.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fabric_protocol::{CheckVirtualMachineCommand, HostCommand};

use crate::error::OrchestratorResult;
use crate::ledger::WorkItem;
use crate::model::{HostId, InstanceId, PowerState, State};
use crate::orchestrator::Orchestrator;
use crate::state::{Event, next_state};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryTask {
    /// Bring an instance whose start was interrupted (or that HA lost) back
    /// to `Running`.
    Restart { instance: InstanceId },
    /// Take an instance down wherever it might be running.
    ForceStop {
        instance: InstanceId,
        host: Option<HostId>,
    },
    /// Find out which side of an interrupted migration the VM ended on.
    RetryMigration {
        instance: InstanceId,
        source: Option<HostId>,
        destination: Option<HostId>,
    },
    /// Ask the hosts and align the recorded state with what they say.
    CheckState { instance: InstanceId },
}

impl RecoveryTask {
    pub fn instance(&self) -> InstanceId {
        match self {
            RecoveryTask::Restart { instance }
            | RecoveryTask::ForceStop { instance, .. }
            | RecoveryTask::RetryMigration { instance, .. }
            | RecoveryTask::CheckState { instance } => *instance,
        }
    }

    /// Policy for a work item its owner never finished.
    pub fn for_abandoned(item: &WorkItem, recorded_host: Option<HostId>) -> Self {
        let instance = item.instance_id;
        let acted_on = match item.resource_type.as_deref() {
            Some("host") => item.resource_id.map(HostId),
            _ => None,
        };
        match item.target_state {
            State::Starting => RecoveryTask::Restart { instance },
            State::Stopping => RecoveryTask::ForceStop {
                instance,
                host: recorded_host.or(acted_on),
            },
            State::Migrating => RecoveryTask::RetryMigration {
                instance,
                source: recorded_host,
                destination: acted_on,
            },
            _ => RecoveryTask::CheckState { instance },
        }
    }
}

/// Sending half of the recovery queue.
#[derive(Clone)]
pub struct RecoveryQueue {
    tx: mpsc::UnboundedSender<RecoveryTask>,
}

impl RecoveryQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RecoveryTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn schedule(&self, task: RecoveryTask) {
        debug!(?task, "recovery scheduled");
        if self.tx.send(task).is_err() {
            warn!("recovery queue closed; task dropped");
        }
    }
}

/// Where a check found the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Located {
    Running(HostId),
    /// Every candidate host answered and none has it.
    Absent,
    /// Some host could not be asked; nothing was changed.
    Unknown,
    /// Another operation is live on the instance.
    Busy,
}

pub struct RecoveryWorker {
    orchestrator: Arc<Orchestrator>,
}

impl RecoveryWorker {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Cancel every item this node left unfinished and schedule the policy
    /// for each. Returns how many were handed off.
    pub fn hand_off(&self) -> OrchestratorResult<usize> {
        let orch = &self.orchestrator;
        let outstanding = orch.ledger.outstanding_for_node()?;
        let mut handed = 0;
        for mut item in outstanding {
            let recorded_host = orch
                .store
                .instance(item.instance_id)?
                .and_then(|vm| vm.host_id);
            let task = RecoveryTask::for_abandoned(&item, recorded_host);
            if let Err(err) = orch.ledger.cancel(&mut item) {
                warn!(work = %item.id, error = %err, "could not cancel abandoned work");
                continue;
            }
            info!(
                instance = %item.instance_id,
                work = %item.id,
                kind = %item.work_type,
                ?task,
                "handing off abandoned work"
            );
            orch.recovery.schedule(task);
            handed += 1;
        }
        Ok(handed)
    }

    pub async fn handle(&self, task: RecoveryTask) -> OrchestratorResult<()> {
        let orch = &self.orchestrator;
        let id = task.instance();
        let vm = match orch.store.instance(id)? {
            Some(vm) if !vm.is_removed() => vm,
            _ => {
                debug!(instance = %id, "recovery target gone");
                return Ok(());
            }
        };
        match task {
            RecoveryTask::Restart { .. } => match vm.state {
                State::Running => debug!(instance = %id, "already running; restart skipped"),
                State::Stopped => {
                    orch.start(id, None).await?;
                }
                state if state.is_transitional() => {
                    if orch.ledger.has_live_work(id)? {
                        debug!(instance = %id, "restart deferred; work in flight");
                        return Ok(());
                    }
                    orch.stop(id, true).await?;
                    orch.start(id, None).await?;
                }
                state => info!(instance = %id, %state, "restart not applicable"),
            },
            RecoveryTask::ForceStop { host, .. } => {
                if vm.state == State::Stopped {
                    if let Some(host) = host {
                        orch.cleanup_on_host(host, &vm.name).await;
                    }
                } else {
                    orch.stop(id, true).await?;
                }
            }
            RecoveryTask::RetryMigration {
                source,
                destination,
                ..
            } => {
                let candidates: Vec<HostId> = destination.into_iter().chain(source).collect();
                let located = self.check_state(id, &candidates).await?;
                self.finish_migration(id, located, source, destination).await;
            }
            RecoveryTask::CheckState { .. } => {
                self.check_state(id, &[]).await?;
            }
        }
        Ok(())
    }

    async fn finish_migration(
        &self,
        id: InstanceId,
        located: Located,
        source: Option<HostId>,
        destination: Option<HostId>,
    ) {
        let orch = &self.orchestrator;
        let (Some(source), Some(dest)) = (source, destination) else {
            return;
        };
        match located {
            Located::Running(host) if host == dest => {
                if let Err(err) = orch.networks.commit_migration(id, source, dest).await {
                    warn!(instance = %id, error = %err, "network migration commit failed");
                }
                if let Err(err) = orch.volumes.release(id, source).await {
                    warn!(instance = %id, error = %err, "source volume release failed");
                }
            }
            Located::Running(_) | Located::Absent => {
                if let Err(err) = orch.networks.rollback_migration(id, dest).await {
                    warn!(instance = %id, error = %err, "network migration rollback failed");
                }
            }
            Located::Unknown | Located::Busy => {}
        }
    }

    /// Ask `candidates` (or the recorded and previous hosts) about the
    /// instance and apply what they say.
    pub(crate) async fn check_state(
        &self,
        id: InstanceId,
        candidates: &[HostId],
    ) -> OrchestratorResult<Located> {
        let orch = &self.orchestrator;
        if orch.ledger.has_live_work(id)? {
            debug!(instance = %id, "state check deferred; work in flight");
            return Ok(Located::Busy);
        }
        orch.abandon_stale_work(id)?;
        let vm = orch.load(id)?;

        let mut hosts: Vec<HostId> = candidates.to_vec();
        if hosts.is_empty() {
            hosts.extend(vm.host_id);
            hosts.extend(vm.last_host_id.filter(|h| Some(*h) != vm.host_id));
        }

        let mut unreachable = false;
        let mut found = None;
        for host in hosts {
            let check = HostCommand::CheckVirtualMachine(CheckVirtualMachineCommand {
                vm_name: vm.name.clone(),
            });
            match orch.channel.send(host, check).await {
                Ok(answer) if answer.result && answer.power_state == Some(PowerState::PowerOn) => {
                    found = Some(host);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(instance = %id, %host, error = %err, "state check could not reach host");
                    unreachable = true;
                }
            }
        }

        let located = match found {
            Some(host) => {
                if vm.state == State::Running && vm.host_id == Some(host) {
                    debug!(instance = %id, %host, "state check confirms running");
                } else {
                    let event = if vm.host_id != Some(host)
                        && next_state(vm.state, Event::AgentReportMigrated).is_some()
                    {
                        Event::AgentReportMigrated
                    } else {
                        Event::AgentReportRunning
                    };
                    if next_state(vm.state, event).is_some() {
                        orch.machine.transition(&vm, event, Some(host), None)?;
                        info!(instance = %id, %host, from = %vm.state, "state check found instance running");
                    }
                }
                orch.record_power(id, PowerState::PowerOn, Some(host));
                Located::Running(host)
            }
            None if unreachable => Located::Unknown,
            None => {
                if next_state(vm.state, Event::AgentReportStopped).is_some()
                    && vm.state != State::Stopped
                {
                    orch.machine
                        .transition(&vm, Event::AgentReportStopped, None, None)?;
                    orch.release_resources(id, vm.host_id).await;
                    info!(instance = %id, from = %vm.state, "state check found instance stopped");
                }
                orch.record_power(id, PowerState::PowerOff, None);
                Located::Absent
            }
        };
        Ok(located)
    }
}
