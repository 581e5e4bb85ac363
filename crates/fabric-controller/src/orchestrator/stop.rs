use tracing::{debug, info, warn};

use fabric_protocol::{Answer, HostCommand, RebootCommand, StopCommand};

use super::{Orchestrator, still_owned};
use crate::channel::ChannelError;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ledger::{Step, WorkItem, WorkType};
use crate::model::{Instance, InstanceId, PowerState, State};
use crate::recovery::RecoveryTask;
use crate::state::{Event, next_state};

impl Orchestrator {
    /// Stop an instance. Returns false when the host refused a non-forced
    /// stop; the instance is then back in `Running`.
    ///
    /// `forced` abandons any operation in flight on the instance, tolerates
    /// an unreachable host, and releases resources regardless.
    pub async fn stop(&self, id: InstanceId, forced: bool) -> OrchestratorResult<bool> {
        let vm = self.load(id)?;
        if vm.state == State::Stopped {
            return Ok(true);
        }
        let mut work = if forced {
            self.take_over(id, WorkType::Stop, State::Stopping)?
        } else {
            self.acquire_work(id, WorkType::Stop, State::Stopping).await?
        };
        let result = self.stop_owned(id, forced, &mut work).await;
        self.settle(&mut work);
        result
    }

    /// Cancel whatever holds the instance and take the lock.
    fn take_over(
        &self,
        id: InstanceId,
        work_type: WorkType,
        target: State,
    ) -> OrchestratorResult<WorkItem> {
        if let Some(mut existing) = self.ledger.active(id)? {
            warn!(
                instance = %id,
                work = %existing.id,
                kind = %existing.work_type,
                "forced operation abandons active work"
            );
            self.settle(&mut existing);
        }
        Ok(self.ledger.acquire(id, work_type, target)?)
    }

    async fn stop_owned(
        &self,
        id: InstanceId,
        forced: bool,
        work: &mut WorkItem,
    ) -> OrchestratorResult<bool> {
        let vm = self.load(id)?;
        if vm.state == State::Stopped {
            self.complete(work)?;
            return Ok(true);
        }
        let stopping = self
            .machine
            .transition(&vm, Event::StopRequested, None, Some(&still_owned(work)))?;
        info!(instance = %id, forced, host = ?stopping.host_id, "stopping instance");

        let mut answer: Option<Answer> = None;
        if let Some(host) = stopping.host_id {
            self.ledger.advance(work, Step::Starting)?;
            let command = HostCommand::Stop(StopCommand {
                vm_name: stopping.name.clone(),
                cleanup: forced,
            });
            match self.channel.send(host, command).await {
                Ok(reply) if reply.result => answer = Some(reply),
                Ok(reply) if forced => {
                    warn!(instance = %id, %host, details = reply.details_or_default(), "stop refused; forcing");
                    answer = Some(reply);
                }
                Ok(reply) => {
                    warn!(instance = %id, %host, details = reply.details_or_default(), "stop refused");
                    self.restore_running(&stopping, work);
                    return Ok(false);
                }
                Err(ChannelError::OperationTimedOut {
                    host,
                    command,
                    is_active: true,
                }) if !forced => {
                    warn!(instance = %id, %host, "stop outcome unknown; scheduling state check");
                    self.recovery.schedule(RecoveryTask::CheckState { instance: id });
                    return Err(OrchestratorError::OperationTimedOut { host, command });
                }
                Err(err) if forced => {
                    warn!(instance = %id, %host, error = %err, "host unreachable; completing forced stop");
                }
                Err(err) => {
                    self.restore_running(&stopping, work);
                    return Err(err.into());
                }
            }
        }

        self.ledger.advance(work, Step::Started)?;
        self.gurus
            .get(stopping.vm_type)?
            .finalize_stop(&stopping, answer.as_ref());
        self.release_resources(id, stopping.host_id).await;
        self.machine.transition(
            &stopping,
            Event::OperationSucceeded,
            None,
            Some(&still_owned(work)),
        )?;
        self.record_power(id, PowerState::PowerOff, stopping.host_id);
        self.complete(work)?;
        info!(instance = %id, "instance stopped");
        Ok(true)
    }

    fn restore_running(&self, stopping: &Instance, work: &WorkItem) {
        if let Err(err) =
            self.machine
                .transition(stopping, Event::OperationFailed, None, Some(&still_owned(work)))
        {
            warn!(instance = %stopping.id, error = %err, "could not restore running state");
        }
    }

    /// Reboot a running instance in place.
    pub async fn reboot(&self, id: InstanceId) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        if next_state(vm.state, Event::RebootRequested).is_none() {
            return Err(OrchestratorError::NoTransition {
                instance: id,
                state: vm.state,
                event: Event::RebootRequested,
            });
        }
        let mut work = self.acquire_work(id, WorkType::Reboot, State::Running).await?;
        let result = self.reboot_owned(id, &mut work).await;
        self.settle(&mut work);
        result
    }

    async fn reboot_owned(&self, id: InstanceId, work: &mut WorkItem) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        let vm = self
            .machine
            .transition(&vm, Event::RebootRequested, None, Some(&still_owned(work)))?;
        let host = vm.host_id.ok_or_else(|| {
            OrchestratorError::Fatal(format!("running instance {id} has no host"))
        })?;
        self.ledger.advance(work, Step::Starting)?;
        let command = HostCommand::Reboot(RebootCommand {
            vm_name: vm.name.clone(),
        });
        let answer = match self.channel.send(host, command).await {
            Ok(answer) => answer,
            Err(ChannelError::OperationTimedOut {
                host,
                command,
                is_active: true,
            }) => {
                warn!(instance = %id, %host, "reboot outcome unknown; scheduling state check");
                self.recovery.schedule(RecoveryTask::CheckState { instance: id });
                return Err(OrchestratorError::OperationTimedOut { host, command });
            }
            Err(err) => return Err(err.into()),
        };
        if !answer.result {
            return Err(OrchestratorError::ResourceUnavailable(format!(
                "{host} refused reboot: {}",
                answer.details_or_default()
            )));
        }
        self.ledger.advance(work, Step::Started)?;
        self.record_power(id, PowerState::PowerOn, Some(host));
        self.complete(work)?;
        debug!(instance = %id, %host, "instance rebooted");
        Ok(vm)
    }
}
