use tracing::{debug, info, warn};

use fabric_protocol::{Answer, FailureReason, HostCommand, StartCommand};

use super::{Orchestrator, still_owned, step_update};
use crate::channel::ChannelError;
use crate::error::{ErrorKind, OrchestratorError, OrchestratorResult};
use crate::ledger::{LedgerError, Step, WorkItem, WorkType};
use crate::model::{HostId, Instance, InstanceId, PowerState, State};
use crate::planner::{DeploymentPlan, Destination, ExcludeList};
use crate::profile::VmProfile;
use crate::recovery::RecoveryTask;
use crate::services::ServiceError;
use crate::state::{Event, ListenerError, TransitionError};

/// How one placement attempt ended.
enum AttemptError {
    /// The destination could not take the instance; another host may.
    Retry(OrchestratorError),
    /// Start was sent and never answered; the host may still be booting it.
    Indeterminate { host: HostId, command: &'static str },
    /// Another operation took the instance over.
    Lost(OrchestratorError),
    Fatal(OrchestratorError),
}

impl From<TransitionError> for AttemptError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Vetoed {
                source: ListenerError::InsufficientCapacity { .. },
                ..
            } => AttemptError::Retry(err.into()),
            TransitionError::Stale { .. } | TransitionError::WorkInactive { .. } => {
                AttemptError::Lost(err.into())
            }
            other => AttemptError::Fatal(other.into()),
        }
    }
}

impl From<LedgerError> for AttemptError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotActive(ref id) => AttemptError::Lost(OrchestratorError::Fatal(
                format!("work {id} was abandoned mid-start"),
            )),
            other => AttemptError::Fatal(other.into()),
        }
    }
}

impl From<ServiceError> for AttemptError {
    fn from(err: ServiceError) -> Self {
        if err.is_retryable() {
            AttemptError::Retry(err.into())
        } else {
            AttemptError::Fatal(err.into())
        }
    }
}

fn refused(host: HostId, answer: &Answer) -> OrchestratorError {
    match answer.failure {
        Some(FailureReason::InsufficientCapacity) => OrchestratorError::ResourceUnavailable(
            format!("{host} lacks capacity: {}", answer.details_or_default()),
        ),
        _ => OrchestratorError::ResourceUnavailable(format!(
            "{host} refused start: {}",
            answer.details_or_default()
        )),
    }
}

impl Orchestrator {
    /// Place and boot an instance. Starting a running instance is a no-op.
    pub async fn start(
        &self,
        id: InstanceId,
        host_override: Option<HostId>,
    ) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        if vm.state == State::Running {
            debug!(instance = %id, "already running");
            return Ok(vm);
        }
        let mut work = self.acquire_work(id, WorkType::Start, State::Starting).await?;
        let result = self.start_owned(id, host_override, &mut work).await;
        if let Err(err) = &result {
            if !matches!(err.kind(), ErrorKind::Indeterminate | ErrorKind::Concurrency) {
                self.abort_start(id, &work);
            }
        }
        self.settle(&mut work);
        result
    }

    async fn start_owned(
        &self,
        id: InstanceId,
        host_override: Option<HostId>,
        work: &mut WorkItem,
    ) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        match vm.state {
            State::Running => {
                self.complete(work)?;
                return Ok(vm);
            }
            state if state.is_transitional() => {
                return Err(OrchestratorError::concurrency(
                    id,
                    format!("instance is {state}"),
                ));
            }
            _ => {}
        }
        let vm = self
            .machine
            .transition(&vm, Event::StartRequested, None, Some(&still_owned(work)))?;
        info!(instance = %id, name = %vm.name, "starting instance");

        let mut plan = DeploymentPlan::zone(vm.zone_id);
        plan.host_id = host_override;
        let mut fallback = None;
        if let Some(root) = self.volumes.root_volume(id).await? {
            if root.ready && root.pool_id.is_some() {
                fallback = Some(plan.clone());
                plan.pod_id = root.pod_id;
                plan.cluster_id = root.cluster_id;
                plan.pool_id = root.pool_id;
                debug!(instance = %id, pool = ?root.pool_id, "plan narrowed to root volume");
            }
        }

        let budget = self.config.start_retry + 1;
        let mut attempts_left = budget;
        let mut avoid = ExcludeList::new();
        let mut current = vm;
        let mut last_failure = String::from("no host has room");
        loop {
            let profile = self.profile_for(&current)?;
            let dest = if attempts_left == 0 {
                None
            } else {
                self.planners.plan(&profile, &plan, &avoid)?
            };
            let Some(dest) = dest else {
                if let Some(wide) = fallback.take() {
                    info!(instance = %id, "no destination near the root volume; widening plan");
                    plan = wide;
                    attempts_left = budget;
                    continue;
                }
                break;
            };
            attempts_left -= 1;
            avoid.add_host(dest.host_id());

            match self.start_attempt(&current, profile, &dest, work).await {
                Ok(running) => return Ok(running),
                Err(AttemptError::Retry(err)) => {
                    warn!(
                        instance = %id,
                        host = %dest.host_id(),
                        attempts_left,
                        error = %err,
                        "start attempt failed"
                    );
                    last_failure = err.to_string();
                    self.release_resources(id, Some(dest.host_id())).await;
                    self.ledger.rollback(work)?;
                    current = self.load(id)?;
                }
                Err(AttemptError::Indeterminate { host, command }) => {
                    warn!(instance = %id, %host, "start outcome unknown; scheduling forced stop");
                    self.recovery.schedule(RecoveryTask::ForceStop {
                        instance: id,
                        host: Some(host),
                    });
                    return Err(OrchestratorError::OperationTimedOut { host, command });
                }
                Err(AttemptError::Lost(err)) => {
                    warn!(instance = %id, error = %err, "start superseded by another operation");
                    self.release_resources(id, Some(dest.host_id())).await;
                    return Err(OrchestratorError::concurrency(id, err.to_string()));
                }
                Err(AttemptError::Fatal(err)) => {
                    self.release_resources(id, Some(dest.host_id())).await;
                    return Err(err);
                }
            }
        }
        Err(OrchestratorError::InsufficientCapacity {
            instance: id,
            detail: last_failure,
        })
    }

    /// One destination: move the reservation there, prepare, boot, confirm.
    async fn start_attempt(
        &self,
        vm: &Instance,
        mut profile: VmProfile,
        dest: &Destination,
        work: &mut WorkItem,
    ) -> Result<Instance, AttemptError> {
        let host = dest.host_id();
        let guru = self
            .gurus
            .get(vm.vm_type)
            .map_err(|e| AttemptError::Fatal(e.into()))?;

        // A new attempt restarts the item at Prepare.
        let vm = self.machine.transition(
            vm,
            Event::OperationRetry,
            Some(host),
            Some(&step_update(work, Step::Prepare)),
        )?;
        work.step = Step::Prepare;
        profile.instance = vm.clone();

        profile.nics = self.networks.prepare(&profile, dest).await?;
        profile.disks = self.volumes.prepare(&profile, dest).await?;
        guru.finalize_deployment(&mut profile, dest)
            .map_err(|e| AttemptError::Fatal(e.into()))?;

        self.ledger.advance(work, Step::Starting)?;
        self.ledger.attach_resource(work, "host", host.0)?;
        debug!(instance = %vm.id, %host, "sending start");
        let command = HostCommand::Start(StartCommand {
            vm: profile.to_spec(),
        });
        let answer = match self.channel.send(host, command).await {
            Ok(answer) => answer,
            Err(ChannelError::OperationTimedOut {
                host,
                command,
                is_active: true,
            }) => return Err(AttemptError::Indeterminate { host, command }),
            Err(err) => return Err(AttemptError::Retry(err.into())),
        };
        if !answer.result {
            return Err(AttemptError::Retry(refused(host, &answer)));
        }

        self.ledger.advance(work, Step::Started)?;
        if let Err(err) = guru.finalize_start(&profile, dest, &answer) {
            // It is up over there; take it down before trying elsewhere.
            self.cleanup_on_host(host, &vm.name).await;
            return Err(AttemptError::Retry(err.into()));
        }

        let running = self.machine.transition(
            &vm,
            Event::OperationSucceeded,
            Some(host),
            Some(&still_owned(work)),
        )?;
        let power = answer.power_state.unwrap_or(PowerState::PowerOn);
        self.record_power(vm.id, power, Some(host));
        self.complete(work).map_err(AttemptError::Lost)?;
        info!(instance = %vm.id, %host, "instance running");
        Ok(running)
    }

    /// Leave a failed start in `Stopped`; any reservation goes with it.
    fn abort_start(&self, id: InstanceId, work: &WorkItem) {
        let vm = match self.store.instance(id) {
            Ok(Some(vm)) => vm,
            Ok(None) => return,
            Err(err) => {
                warn!(instance = %id, error = %err, "could not reload failed start");
                return;
            }
        };
        if vm.state != State::Starting {
            return;
        }
        match self
            .machine
            .transition(&vm, Event::OperationFailed, None, Some(&still_owned(work)))
        {
            Ok(_) => info!(instance = %id, "start failed; instance stopped"),
            Err(err) => warn!(instance = %id, error = %err, "could not unwind failed start"),
        }
    }
}
