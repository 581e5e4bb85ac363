use tracing::{info, warn};

use fabric_protocol::{HostCommand, NicSpec, PlugNicCommand, UnplugNicCommand};

use super::Orchestrator;
use crate::channel::ChannelError;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ledger::{WorkItem, WorkType};
use crate::model::{Instance, InstanceId, NetworkId, State};

impl Orchestrator {
    /// Attach the instance to `network`. A running instance gets the NIC
    /// hot-plugged; a stopped one picks it up on its next start.
    pub async fn add_nic(&self, id: InstanceId, network: NetworkId) -> OrchestratorResult<NicSpec> {
        let vm = self.load(id)?;
        let target = settled_state(&vm)?;
        let mut work = self.acquire_work(id, WorkType::Nic, target).await?;
        let result = self.add_nic_owned(id, network, &mut work).await;
        self.settle(&mut work);
        result
    }

    async fn add_nic_owned(
        &self,
        id: InstanceId,
        network: NetworkId,
        work: &mut WorkItem,
    ) -> OrchestratorResult<NicSpec> {
        let vm = self.load(id)?;
        settled_state(&vm)?;
        if self.networks.nics(id).await?.iter().any(|n| n.network_id == network) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "instance {id} is already on network {network}"
            )));
        }
        let nic = self.networks.add_nic(&vm, network).await?;
        let Some(host) = vm.host_id.filter(|_| vm.state == State::Running) else {
            self.complete(work)?;
            return Ok(nic);
        };

        let command = HostCommand::PlugNic(PlugNicCommand {
            vm_name: vm.name.clone(),
            nic: nic.clone(),
        });
        let failure = match self.channel.send(host, command).await {
            Ok(answer) if answer.result => None,
            Ok(answer) => Some(OrchestratorError::ResourceUnavailable(format!(
                "{host} refused nic on network {network}: {}",
                answer.details_or_default()
            ))),
            Err(ChannelError::OperationTimedOut {
                host,
                command,
                is_active: true,
            }) => {
                // The host may have plugged it; keep the record.
                warn!(instance = %id, %host, network, "nic plug outcome unknown");
                return Err(OrchestratorError::OperationTimedOut { host, command });
            }
            Err(err) => Some(err.into()),
        };
        if let Some(err) = failure {
            if let Err(undo) = self.networks.remove_nic(id, network).await {
                warn!(instance = %id, network, error = %undo, "could not drop refused nic");
            }
            return Err(err);
        }
        self.complete(work)?;
        info!(instance = %id, %host, network, device = nic.device_id, "nic plugged");
        Ok(nic)
    }

    /// Detach the instance from `network`. Returns false when it had no NIC
    /// there.
    pub async fn remove_nic(&self, id: InstanceId, network: NetworkId) -> OrchestratorResult<bool> {
        let vm = self.load(id)?;
        let target = settled_state(&vm)?;
        let mut work = self.acquire_work(id, WorkType::Nic, target).await?;
        let result = self.remove_nic_owned(id, network, &mut work).await;
        self.settle(&mut work);
        result
    }

    async fn remove_nic_owned(
        &self,
        id: InstanceId,
        network: NetworkId,
        work: &mut WorkItem,
    ) -> OrchestratorResult<bool> {
        let vm = self.load(id)?;
        settled_state(&vm)?;
        let Some(nic) = self
            .networks
            .nics(id)
            .await?
            .into_iter()
            .find(|n| n.network_id == network)
        else {
            self.complete(work)?;
            return Ok(false);
        };

        if let Some(host) = vm.host_id.filter(|_| vm.state == State::Running) {
            let command = HostCommand::UnplugNic(UnplugNicCommand {
                vm_name: vm.name.clone(),
                nic,
            });
            let answer = self.channel.send(host, command).await?;
            if !answer.result {
                return Err(OrchestratorError::ResourceUnavailable(format!(
                    "{host} refused to unplug network {network}: {}",
                    answer.details_or_default()
                )));
            }
            info!(instance = %id, %host, network, "nic unplugged");
        }
        self.networks.remove_nic(id, network).await?;
        self.complete(work)?;
        Ok(true)
    }
}

/// NICs change only on an instance that is running or stopped.
fn settled_state(vm: &Instance) -> OrchestratorResult<State> {
    match vm.state {
        State::Running | State::Stopped => Ok(vm.state),
        state if state.is_transitional() => Err(OrchestratorError::concurrency(
            vm.id,
            format!("instance is {state}"),
        )),
        state => Err(OrchestratorError::InvalidRequest(format!(
            "instance {} is {state}; nics cannot change",
            vm.id
        ))),
    }
}
