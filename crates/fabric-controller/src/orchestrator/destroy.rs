use tracing::{info, warn};

use super::{Orchestrator, still_owned};
use crate::capacity::Demand;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ledger::{WorkItem, WorkType};
use crate::model::{Instance, InstanceId, State};
use crate::state::{Event, next_state};

impl Orchestrator {
    /// Mark an instance destroyed. A running instance is stopped first; the
    /// row and its volumes survive until expunge so it can be recovered.
    pub async fn destroy(&self, id: InstanceId) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        match vm.state {
            State::Destroyed => return Ok(vm),
            State::Running | State::Starting | State::Stopping | State::Migrating => {
                if !self.stop(id, self.config.destroy_forces_stop).await? {
                    return Err(OrchestratorError::ResourceUnavailable(format!(
                        "instance {id} could not be stopped for destroy"
                    )));
                }
            }
            _ => {}
        }
        let mut work = self
            .acquire_work(id, WorkType::Destroy, State::Destroyed)
            .await?;
        let result = self.destroy_owned(id, &mut work).await;
        self.settle(&mut work);
        result
    }

    async fn destroy_owned(&self, id: InstanceId, work: &mut WorkItem) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        if vm.state == State::Destroyed {
            self.complete(work)?;
            return Ok(vm);
        }
        let destroyed = self
            .machine
            .transition(&vm, Event::DestroyRequested, None, Some(&still_owned(work)))?;
        if let Err(err) = self.volumes.destroy(id).await {
            warn!(instance = %id, error = %err, "volume destroy failed");
        }
        if let Err(err) = self.networks.release(id).await {
            warn!(instance = %id, error = %err, "network release failed");
        }
        self.complete(work)?;
        info!(instance = %id, "instance destroyed");
        Ok(destroyed)
    }

    /// Permanently remove a destroyed instance. Returns true once the row is
    /// gone; expunging an already removed instance is a no-op.
    ///
    /// A storage failure leaves the instance in `Expunging` so the call can
    /// be repeated.
    pub async fn expunge(&self, id: InstanceId) -> OrchestratorResult<bool> {
        let vm = match self.store.instance(id)? {
            Some(vm) if vm.is_removed() => return Ok(true),
            Some(vm) => vm,
            None => return Err(OrchestratorError::NotFound(id)),
        };
        if !matches!(vm.state, State::Destroyed | State::Expunging) {
            return Err(OrchestratorError::NoTransition {
                instance: id,
                state: vm.state,
                event: Event::ExpungeOperation,
            });
        }
        let mut work = self
            .acquire_work(id, WorkType::Expunge, State::Expunging)
            .await?;
        let result = self.expunge_owned(id, &mut work).await;
        self.settle(&mut work);
        if result.is_ok() {
            if let Err(err) = self.ledger.purge_instance(id) {
                warn!(instance = %id, error = %err, "could not purge work history");
            }
        }
        result
    }

    async fn expunge_owned(&self, id: InstanceId, work: &mut WorkItem) -> OrchestratorResult<bool> {
        let vm = self.load(id)?;
        let expunging = self
            .machine
            .transition(&vm, Event::ExpungeOperation, None, Some(&still_owned(work)))?;

        if let Err(err) = self.networks.cleanup_nics(id).await {
            warn!(instance = %id, error = %err, "nic cleanup failed");
        }
        if let Err(err) = self.volumes.expunge(id).await {
            warn!(instance = %id, error = %err, "volume expunge failed; instance left expunging");
            if let Err(e) = self.machine.transition(
                &expunging,
                Event::OperationFailed,
                None,
                Some(&still_owned(work)),
            ) {
                warn!(instance = %id, error = %e, "could not record failed expunge");
            }
            return Err(err.into());
        }
        self.gurus.get(expunging.vm_type)?.finalize_expunge(&expunging)?;

        let offering = self.offering_of(&expunging)?;
        self.limits
            .release(expunging.account_id, Demand::from(&offering));
        self.store.mark_removed(id, self.clock.now_ms())?;
        self.complete(work)?;
        info!(instance = %id, name = %expunging.name, "instance expunged");
        Ok(true)
    }

    /// Bring a destroyed (or errored) instance back to `Stopped` with its
    /// volumes.
    pub async fn recover(&self, id: InstanceId) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        if next_state(vm.state, Event::RecoveryRequested).is_none() {
            return Err(OrchestratorError::NoTransition {
                instance: id,
                state: vm.state,
                event: Event::RecoveryRequested,
            });
        }
        let mut work = self
            .acquire_work(id, WorkType::Recover, State::Stopped)
            .await?;
        let result = self.recover_owned(id, &mut work).await;
        self.settle(&mut work);
        result
    }

    async fn recover_owned(&self, id: InstanceId, work: &mut WorkItem) -> OrchestratorResult<Instance> {
        let vm = self.load(id)?;
        let stopped = self
            .machine
            .transition(&vm, Event::RecoveryRequested, None, Some(&still_owned(work)))?;
        if vm.state == State::Destroyed {
            self.volumes.recover(id).await?;
        }
        self.complete(work)?;
        info!(instance = %id, "instance recovered");
        Ok(stopped)
    }
}
