//! Lifecycle orchestration.
//!
//! [`Orchestrator`] drives instances through allocate, start, stop, reboot,
//! migrate, destroy, expunge and recover, and hot-plugs NICs. Every
//! operation holds the work lock on its instance for its whole duration,
//! moves state only through the [`StateMachine`], and leaves the instance in
//! a well-defined state on every exit path. Outcomes it cannot decide (a
//! command that timed out while the host may still be executing it) go to
//! the recovery queue instead of being guessed.

mod destroy;
mod migrate;
mod nic;
mod start;
mod stop;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fabric_protocol::{HostCommand, StopCommand};

use crate::capacity::{CapacityManager, Demand};
use crate::channel::{HostChannel, HostTransport};
use crate::clock::{Clock, SystemClock};
use crate::config::ControllerConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::guru::GuruRegistry;
use crate::ledger::{LedgerError, Step, WorkItem, WorkLedger, WorkType};
use crate::model::{
    AccountId, HostId, HypervisorType, Instance, InstanceId, NetworkId, OfferingId, PowerState,
    ServiceOffering, State, TemplateId, VmType, ZoneId,
};
use crate::planner::{DeploymentPlanner, ExplicitHostPlanner, FirstFitPlanner, PlannerChain};
use crate::profile::VmProfile;
use crate::recovery::{RecoveryQueue, RecoveryTask};
use crate::services::{
    MemLimits, MemNetworks, MemVolumes, NetworkService, ResourceLimiter, VolumeService,
};
use crate::state::{Event, StateListener, StateMachine};
use crate::store::{DynStore, StoreError, WorkStepUpdate};
use crate::usage::{UsageEvent, UsageEventType, UsageListener, UsageLog, UsageRecorder};

/// Parameters of a new instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateRequest {
    /// External reference. Repeating a request with the same uuid returns the
    /// instance created the first time.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default = "default_vm_type")]
    pub vm_type: VmType,
    pub account_id: AccountId,
    pub zone_id: ZoneId,
    pub offering_id: OfferingId,
    pub template_id: TemplateId,
    pub hypervisor: HypervisorType,
    #[serde(default = "default_root_disk_gb")]
    pub root_disk_gb: u64,
    #[serde(default)]
    pub networks: Vec<NetworkId>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

fn default_vm_type() -> VmType {
    VmType::User
}

fn default_root_disk_gb() -> u64 {
    20
}

impl AllocateRequest {
    pub fn new(
        account_id: AccountId,
        zone_id: ZoneId,
        offering_id: OfferingId,
        template_id: TemplateId,
        hypervisor: HypervisorType,
    ) -> Self {
        Self {
            uuid: None,
            vm_type: VmType::User,
            account_id,
            zone_id,
            offering_id,
            template_id,
            hypervisor,
            root_disk_gb: default_root_disk_gb(),
            networks: Vec::new(),
            details: BTreeMap::new(),
        }
    }
}

fn instance_name(vm_type: VmType, account: AccountId, id: InstanceId) -> String {
    match vm_type {
        VmType::User => format!("i-{account}-{id}-VM"),
        VmType::DomainRouter => format!("r-{id}-VM"),
        VmType::ConsoleProxy => format!("v-{id}-VM"),
        VmType::SecondaryStorageVm => format!("s-{id}-VM"),
    }
}

/// Wires the orchestrator's collaborators. Anything not supplied gets the
/// in-memory implementation.
pub struct OrchestratorBuilder {
    store: DynStore,
    transport: Arc<dyn HostTransport>,
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    volumes: Arc<dyn VolumeService>,
    networks: Arc<dyn NetworkService>,
    limits: Arc<dyn ResourceLimiter>,
    usage: Arc<dyn UsageRecorder>,
    gurus: GuruRegistry,
    planners: Vec<Arc<dyn DeploymentPlanner>>,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn volumes(mut self, volumes: Arc<dyn VolumeService>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn networks(mut self, networks: Arc<dyn NetworkService>) -> Self {
        self.networks = networks;
        self
    }

    pub fn limits(mut self, limits: Arc<dyn ResourceLimiter>) -> Self {
        self.limits = limits;
        self
    }

    pub fn usage(mut self, usage: Arc<dyn UsageRecorder>) -> Self {
        self.usage = usage;
        self
    }

    pub fn gurus(mut self, gurus: GuruRegistry) -> Self {
        self.gurus = gurus;
        self
    }

    /// Add a planner consulted after the explicit-host planner and before
    /// first-fit.
    pub fn planner(mut self, planner: Arc<dyn DeploymentPlanner>) -> Self {
        self.planners.push(planner);
        self
    }

    /// Extra state listener, run after capacity and usage.
    pub fn listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the orchestrator and hand back the receiving end of its
    /// recovery queue.
    pub fn build(self) -> (Orchestrator, mpsc::UnboundedReceiver<RecoveryTask>) {
        let capacity = Arc::new(CapacityManager::new(self.store.clone(), &self.config.planner));

        let mut machine = StateMachine::new(self.store.clone(), self.clock.clone())
            .with_listener(capacity.clone())
            .with_listener(Arc::new(UsageListener::new(self.usage.clone())));
        for listener in self.listeners {
            machine = machine.with_listener(listener);
        }

        let mut planners: Vec<Arc<dyn DeploymentPlanner>> = vec![Arc::new(
            ExplicitHostPlanner::new(self.store.clone(), capacity.clone()),
        )];
        planners.extend(self.planners);
        planners.push(Arc::new(FirstFitPlanner::new(
            self.store.clone(),
            capacity.clone(),
            self.config.planner.host_ordering,
        )));

        let ledger = Arc::new(WorkLedger::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.node_id,
            self.config.ledger.clone(),
        ));
        let (recovery, recovery_rx) = RecoveryQueue::new();

        let orchestrator = Orchestrator {
            channel: HostChannel::new(self.transport, self.config.channel.clone()),
            store: self.store,
            clock: self.clock,
            config: self.config,
            ledger,
            machine,
            planners: PlannerChain::new(planners),
            capacity,
            gurus: self.gurus,
            volumes: self.volumes,
            networks: self.networks,
            limits: self.limits,
            usage: self.usage,
            recovery,
        };
        (orchestrator, recovery_rx)
    }
}

pub struct Orchestrator {
    pub(crate) store: DynStore,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: ControllerConfig,
    pub(crate) ledger: Arc<WorkLedger>,
    pub(crate) machine: StateMachine,
    pub(crate) channel: HostChannel,
    pub(crate) planners: PlannerChain,
    pub(crate) capacity: Arc<CapacityManager>,
    pub(crate) gurus: GuruRegistry,
    pub(crate) volumes: Arc<dyn VolumeService>,
    pub(crate) networks: Arc<dyn NetworkService>,
    pub(crate) limits: Arc<dyn ResourceLimiter>,
    pub(crate) usage: Arc<dyn UsageRecorder>,
    pub(crate) recovery: RecoveryQueue,
}

impl Orchestrator {
    pub fn builder(store: DynStore, transport: Arc<dyn HostTransport>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            transport,
            config: ControllerConfig::default(),
            clock: Arc::new(SystemClock),
            volumes: Arc::new(MemVolumes::new()),
            networks: Arc::new(MemNetworks::new()),
            limits: Arc::new(MemLimits::default()),
            usage: Arc::new(UsageLog::new()),
            gurus: GuruRegistry::standard(),
            planners: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<WorkLedger> {
        &self.ledger
    }

    pub fn capacity(&self) -> &Arc<CapacityManager> {
        &self.capacity
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn recovery_queue(&self) -> &RecoveryQueue {
        &self.recovery
    }

    /// Current row of a non-removed instance.
    pub fn instance(&self, id: InstanceId) -> OrchestratorResult<Instance> {
        self.load(id)
    }

    /// Persist a new instance in `Stopped` and allocate its placeholder
    /// root volume and NICs. No host is contacted.
    pub async fn allocate(&self, request: AllocateRequest) -> OrchestratorResult<InstanceId> {
        if let Some(uuid) = request.uuid.as_deref() {
            if let Some(existing) = self.store.instance_by_uuid(uuid)? {
                debug!(instance = %existing.id, uuid, "allocate replayed");
                return Ok(existing.id);
            }
        }
        let offering = self.store.offering(request.offering_id)?.ok_or_else(|| {
            OrchestratorError::InvalidRequest(format!(
                "service offering {} not found",
                request.offering_id
            ))
        })?;
        let demand = Demand::from(&offering);
        self.limits.reserve(request.account_id, demand)?;

        let instance = match self.persist_new(&request) {
            Ok(instance) => instance,
            Err(StoreError::Duplicate { .. }) => {
                // Lost a race with a replay of the same request.
                self.limits.release(request.account_id, demand);
                let uuid = request.uuid.as_deref().unwrap_or_default();
                return match self.store.instance_by_uuid(uuid)? {
                    Some(existing) => Ok(existing.id),
                    None => Err(StoreError::not_found("instance", uuid).into()),
                };
            }
            Err(err) => {
                self.limits.release(request.account_id, demand);
                return Err(err.into());
            }
        };
        self.record_usage(UsageEventType::Create, &instance);

        if let Err(err) = self.allocate_resources(&instance, &request).await {
            warn!(instance = %instance.id, error = %err, "resource allocation failed");
            if let Err(e) = self
                .machine
                .transition(&instance, Event::OperationFailed, None, None)
            {
                warn!(instance = %instance.id, error = %e, "could not mark instance as failed");
            }
            return Err(err);
        }
        info!(
            instance = %instance.id,
            name = %instance.name,
            account = request.account_id,
            "instance allocated"
        );
        Ok(instance.id)
    }

    fn persist_new(&self, request: &AllocateRequest) -> Result<Instance, StoreError> {
        let id = self.store.next_instance_id()?;
        let now = self.clock.now_ms();
        let instance = Instance {
            id,
            uuid: request
                .uuid
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: instance_name(request.vm_type, request.account_id, id),
            vm_type: request.vm_type,
            account_id: request.account_id,
            state: State::Stopped,
            power_state: PowerState::PowerOff,
            power_host_id: None,
            power_updated_at: now,
            host_id: None,
            last_host_id: None,
            zone_id: request.zone_id,
            pod_id: None,
            cluster_id: None,
            offering_id: request.offering_id,
            template_id: request.template_id,
            hypervisor: request.hypervisor,
            details: request.details.clone(),
            reservation_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
            removed_at: None,
        };
        self.store.insert_instance(&instance)?;
        Ok(instance)
    }

    async fn allocate_resources(
        &self,
        instance: &Instance,
        request: &AllocateRequest,
    ) -> OrchestratorResult<()> {
        self.volumes
            .allocate_root(instance, request.root_disk_gb)
            .await?;
        self.networks
            .allocate_nics(instance, &request.networks)
            .await?;
        Ok(())
    }

    pub(crate) fn load(&self, id: InstanceId) -> OrchestratorResult<Instance> {
        match self.store.instance(id)? {
            Some(instance) if !instance.is_removed() => Ok(instance),
            _ => Err(OrchestratorError::NotFound(id)),
        }
    }

    pub(crate) fn offering_of(&self, instance: &Instance) -> OrchestratorResult<ServiceOffering> {
        self.store.offering(instance.offering_id)?.ok_or_else(|| {
            OrchestratorError::Fatal(format!(
                "offering {} of instance {} not found",
                instance.offering_id, instance.id
            ))
        })
    }

    /// Fresh profile with the type-specific parts filled in.
    pub(crate) fn profile_for(&self, instance: &Instance) -> OrchestratorResult<VmProfile> {
        let mut profile = VmProfile::new(instance.clone(), self.offering_of(instance)?);
        self.gurus.get(instance.vm_type)?.finalize_profile(&mut profile)?;
        Ok(profile)
    }

    async fn acquire_work(
        &self,
        id: InstanceId,
        work_type: WorkType,
        target: State,
    ) -> OrchestratorResult<WorkItem> {
        match self.ledger.acquire_or_wait(id, work_type, target).await {
            Ok(item) => Ok(item),
            Err(err @ LedgerError::Busy { .. }) => {
                info!(instance = %id, %work_type, error = %err, "gave up waiting for conflicting work");
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Cancel whatever is still active on the item. Called on every exit
    /// path; a no-op once the item is done.
    fn settle(&self, work: &mut WorkItem) {
        if !work.is_active() {
            return;
        }
        match self.ledger.cancel(work) {
            Ok(()) => debug!(instance = %work.instance_id, work = %work.id, "work cancelled"),
            Err(LedgerError::NotActive(_)) => {
                debug!(work = %work.id, "work already taken over");
            }
            Err(err) => warn!(work = %work.id, error = %err, "could not cancel work"),
        }
    }

    /// Cancel an active item that has stopped making progress.
    pub(crate) fn abandon_stale_work(&self, id: InstanceId) -> OrchestratorResult<()> {
        if let Some(mut stale) = self.ledger.active(id)? {
            let timeout = self.ledger.config().inactivity_timeout;
            if stale.is_stale(self.clock.now_ms(), timeout) {
                warn!(instance = %id, work = %stale.id, kind = %stale.work_type, "abandoning stale work");
                self.settle(&mut stale);
            }
        }
        Ok(())
    }

    fn complete(&self, work: &mut WorkItem) -> OrchestratorResult<()> {
        self.ledger.complete(work).map_err(|err| match err {
            LedgerError::NotActive(_) => OrchestratorError::concurrency(
                work.instance_id,
                format!("work {} was taken over before it completed", work.id),
            ),
            other => other.into(),
        })
    }

    pub(crate) fn record_power(&self, id: InstanceId, power: PowerState, host: Option<HostId>) {
        if let Err(err) = self
            .store
            .record_power_state(id, power, host, self.clock.now_ms())
        {
            warn!(instance = %id, error = %err, "could not record power state");
        }
    }

    fn record_usage(&self, kind: UsageEventType, instance: &Instance) {
        if let Err(err) = self.usage.record(UsageEvent::for_instance(kind, instance)) {
            warn!(instance = %instance.id, error = %err, "usage event dropped");
        }
    }

    /// Undo per-attempt network and storage preparation on `host`.
    pub(crate) async fn release_resources(&self, id: InstanceId, host: Option<HostId>) {
        if let Err(err) = self.networks.release(id).await {
            warn!(instance = %id, error = %err, "network release failed");
        }
        if let Some(host) = host {
            if let Err(err) = self.volumes.release(id, host).await {
                warn!(instance = %id, %host, error = %err, "volume release failed");
            }
        }
    }

    /// Best-effort teardown of `vm_name` on `host`.
    pub(crate) async fn cleanup_on_host(&self, host: HostId, vm_name: &str) {
        let command = HostCommand::Stop(StopCommand {
            vm_name: vm_name.to_string(),
            cleanup: true,
        });
        match self.channel.send(host, command).await {
            Ok(answer) if answer.result => debug!(%host, vm = vm_name, "cleanup stop sent"),
            Ok(answer) => warn!(
                %host,
                vm = vm_name,
                details = answer.details_or_default(),
                "cleanup stop refused"
            ),
            Err(err) => warn!(%host, vm = vm_name, error = %err, "cleanup stop failed"),
        }
    }
}

fn step_update(work: &WorkItem, step: Step) -> WorkStepUpdate {
    WorkStepUpdate {
        work_id: work.id.clone(),
        step,
    }
}

/// Verify-only update: commit only while the item is still active.
fn still_owned(work: &WorkItem) -> WorkStepUpdate {
    step_update(work, work.step)
}
