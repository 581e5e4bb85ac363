use tracing::{debug, info, warn};

use fabric_protocol::{
    CheckVirtualMachineCommand, CommandKind, HostCommand, MigrateCommand,
    PrepareForMigrationCommand,
};

use super::{Orchestrator, still_owned};
use crate::capacity::Demand;
use crate::channel::ChannelError;
use crate::error::{ErrorKind, OrchestratorError, OrchestratorResult};
use crate::ledger::{Step, WorkItem, WorkType};
use crate::model::{HostId, Instance, InstanceId, PowerState, State};
use crate::planner::{DeploymentPlan, Destination, ExcludeList};
use crate::profile::VmProfile;
use crate::recovery::RecoveryTask;
use crate::state::{Event, next_state};

impl Orchestrator {
    /// Live-migrate a running instance to `destination`.
    ///
    /// The destination's capacity is reserved for the duration. On failure
    /// the instance stays `Running` on its source, unless the destination
    /// acknowledged the move but then does not have the VM, in which case
    /// both hosts are cleaned and the instance ends `Stopped`.
    pub async fn migrate(&self, id: InstanceId, destination: HostId) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        if next_state(vm.state, Event::MigrationRequested).is_none() {
            return Err(OrchestratorError::NoTransition {
                instance: id,
                state: vm.state,
                event: Event::MigrationRequested,
            });
        }
        let mut work = self.acquire_work(id, WorkType::Migrate, State::Migrating).await?;
        let result = self.migrate_owned(id, destination, &mut work).await;
        self.settle(&mut work);
        result
    }

    async fn migrate_owned(
        &self,
        id: InstanceId,
        destination: HostId,
        work: &mut WorkItem,
    ) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        if vm.state != State::Running {
            return Err(OrchestratorError::NoTransition {
                instance: id,
                state: vm.state,
                event: Event::MigrationRequested,
            });
        }
        let source = vm
            .host_id
            .ok_or_else(|| OrchestratorError::Fatal(format!("running instance {id} has no host")))?;
        let dest = self.check_migration(&vm, source, destination)?;
        let profile = self.profile_for(&vm)?;
        let demand = profile.demand();
        if !self.capacity.reserve(destination, demand)? {
            return Err(OrchestratorError::InsufficientCapacity {
                instance: id,
                detail: format!(
                    "{destination} cannot fit {} MHz / {} MB",
                    demand.cpu_mhz, demand.memory_mb
                ),
            });
        }
        let result = self.migrate_reserved(vm, source, &dest, profile, work).await;
        self.drop_reservation(destination, demand);
        result
    }

    fn drop_reservation(&self, host: HostId, demand: Demand) {
        if let Err(err) = self.capacity.release_reservation(host, demand) {
            warn!(%host, error = %err, "could not release migration reservation");
        }
    }

    /// Hypervisor family, storage locality and destination health.
    fn check_migration(
        &self,
        vm: &Instance,
        source: HostId,
        destination: HostId,
    ) -> OrchestratorResult<Destination> {
        if source == destination {
            return Err(OrchestratorError::InvalidRequest(format!(
                "instance {} is already on {destination}",
                vm.id
            )));
        }
        let host = self.store.host(destination)?.ok_or_else(|| {
            OrchestratorError::InvalidRequest(format!("{destination} does not exist"))
        })?;
        if !host.is_available() {
            return Err(OrchestratorError::ResourceUnavailable(format!(
                "{destination} is {}",
                host.status.as_str()
            )));
        }
        if host.hypervisor != vm.hypervisor {
            return Err(OrchestratorError::InvalidRequest(format!(
                "{destination} runs {}, instance needs {}",
                host.hypervisor.as_str(),
                vm.hypervisor.as_str()
            )));
        }
        if self.offering_of(vm)?.local_storage {
            return Err(OrchestratorError::InvalidRequest(format!(
                "instance {} uses local storage and cannot live-migrate",
                vm.id
            )));
        }
        Ok(Destination {
            host,
            pool_id: None,
        })
    }

    async fn migrate_reserved(
        &self,
        vm: Instance,
        source: HostId,
        dest: &Destination,
        profile: VmProfile,
        work: &mut WorkItem,
    ) -> OrchestratorResult<Instance> {
        let id = vm.id;
        let target = dest.host_id();

        self.networks.prepare_migration(&profile, dest).await?;
        let prepare = HostCommand::PrepareForMigration(PrepareForMigrationCommand {
            vm: profile.to_spec(),
        });
        let refusal = match self.channel.send(target, prepare).await {
            Ok(answer) if answer.result => None,
            Ok(answer) => Some(OrchestratorError::ResourceUnavailable(format!(
                "{target} refused to prepare: {}",
                answer.details_or_default()
            ))),
            Err(err) => Some(err.into()),
        };
        if let Some(err) = refusal {
            self.rollback_network(id, target).await;
            return Err(err);
        }

        let migrating = match self.machine.transition(
            &vm,
            Event::MigrationRequested,
            None,
            Some(&still_owned(work)),
        ) {
            Ok(migrating) => migrating,
            Err(err) => {
                self.cleanup_on_host(target, &vm.name).await;
                self.rollback_network(id, target).await;
                return Err(err.into());
            }
        };
        self.ledger.advance(work, Step::Migrating)?;
        self.ledger.attach_resource(work, "host", target.0)?;
        info!(instance = %id, %source, destination = %target, "migrating instance");

        let command = HostCommand::Migrate(MigrateCommand {
            vm_name: vm.name.clone(),
            destination: target,
            destination_ip: dest.host.private_ip.clone(),
        });
        let failure = match self.channel.send(source, command).await {
            Ok(answer) if answer.result => None,
            Ok(answer) => Some(answer.details_or_default().to_string()),
            Err(ChannelError::OperationTimedOut {
                host,
                command,
                is_active: true,
            }) => {
                warn!(instance = %id, "migration outcome unknown; scheduling retry check");
                self.recovery.schedule(RecoveryTask::RetryMigration {
                    instance: id,
                    source: Some(source),
                    destination: Some(target),
                });
                return Err(OrchestratorError::OperationTimedOut { host, command });
            }
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = failure {
            self.cleanup_on_host(target, &vm.name).await;
            self.rollback_network(id, target).await;
            if let Err(err) = self.machine.transition(
                &migrating,
                Event::OperationFailed,
                None,
                Some(&still_owned(work)),
            ) {
                warn!(instance = %id, error = %err, "could not restore source after failed migration");
            }
            return Err(OrchestratorError::ResourceUnavailable(format!(
                "migration to {target} failed: {reason}"
            )));
        }

        let arrived = match self.arrived(target, &vm.name).await {
            Ok(arrived) => arrived,
            Err(err) => {
                warn!(instance = %id, destination = %target, error = %err, "migration outcome unknown; scheduling retry check");
                self.recovery.schedule(RecoveryTask::RetryMigration {
                    instance: id,
                    source: Some(source),
                    destination: Some(target),
                });
                return Err(OrchestratorError::OperationTimedOut {
                    host: target,
                    command: CommandKind::CheckVirtualMachine.as_str(),
                });
            }
        };
        if !arrived {
            warn!(instance = %id, destination = %target, "instance missing on destination after migration");
            self.cleanup_on_host(target, &vm.name).await;
            self.cleanup_on_host(source, &vm.name).await;
            self.rollback_network(id, target).await;
            self.release_resources(id, Some(source)).await;
            match self.machine.transition(
                &migrating,
                Event::AgentReportStopped,
                None,
                Some(&still_owned(work)),
            ) {
                Ok(_) => self.record_power(id, PowerState::PowerOff, None),
                Err(err) => warn!(instance = %id, error = %err, "could not record lost instance"),
            }
            return Err(OrchestratorError::ResourceUnavailable(format!(
                "instance {id} not found on {target} after migration"
            )));
        }

        self.ledger.advance(work, Step::Started)?;
        let running = self.machine.transition(
            &migrating,
            Event::OperationSucceeded,
            Some(target),
            Some(&still_owned(work)),
        )?;
        if let Err(err) = self.networks.commit_migration(id, source, target).await {
            warn!(instance = %id, error = %err, "network migration commit failed");
        }
        if let Err(err) = self.volumes.release(id, source).await {
            warn!(instance = %id, error = %err, "source volume release failed");
        }
        self.record_power(id, PowerState::PowerOn, Some(target));
        self.complete(work)?;
        info!(instance = %id, host = %target, "migration complete");
        Ok(running)
    }

    /// Whether `host` reports `vm_name` powered on. An error means the host
    /// could not be asked, not that the VM is gone.
    async fn arrived(&self, host: HostId, vm_name: &str) -> Result<bool, ChannelError> {
        let check = HostCommand::CheckVirtualMachine(CheckVirtualMachineCommand {
            vm_name: vm_name.to_string(),
        });
        let answer = self.channel.send(host, check).await?;
        debug!(%host, result = answer.result, power = ?answer.power_state, "verification check answered");
        Ok(answer.result && answer.power_state == Some(PowerState::PowerOn))
    }

    async fn rollback_network(&self, id: InstanceId, target: HostId) {
        if let Err(err) = self.networks.rollback_migration(id, target).await {
            warn!(instance = %id, error = %err, "network migration rollback failed");
        }
    }

    /// Move a running instance off `source` to wherever the planner chain
    /// finds room, trying up to the start retry budget of candidates.
    pub async fn migrate_away(&self, id: InstanceId, source: HostId) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        if vm.host_id != Some(source) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "instance {id} is not on {source}"
            )));
        }
        let profile = self.profile_for(&vm)?;
        let plan = DeploymentPlan::zone(vm.zone_id);
        let mut avoid = ExcludeList::new();
        avoid.add_host(source);

        let mut last_failure = None;
        for _ in 0..=self.config.start_retry {
            let Some(dest) = self.planners.plan(&profile, &plan, &avoid)? else {
                break;
            };
            avoid.add_host(dest.host_id());
            match self.migrate(id, dest.host_id()).await {
                Ok(moved) => return Ok(moved),
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ResourceUnavailable | ErrorKind::InsufficientCapacity
                    ) =>
                {
                    warn!(instance = %id, host = %dest.host_id(), error = %err, "evacuation candidate failed");
                    last_failure = Some(err.to_string());
                }
                Err(err) => return Err(err),
            }
        }
        Err(OrchestratorError::InsufficientCapacity {
            instance: id,
            detail: last_failure.unwrap_or_else(|| format!("no destination outside {source}")),
        })
    }
}
