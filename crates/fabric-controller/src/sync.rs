//! Reconciliation of recorded instance state with agent power reports.
//!
//! A (re)connecting agent sends a full report, which is compared against
//! every instance recorded on that host; heartbeats carry only changed
//! entries. [`reconcile`] decides what each observation means and the
//! [`SyncEngine`] applies it. Anything that needs a lifecycle operation is
//! handed to the recovery queue rather than run inline.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use fabric_protocol::{AgentEvent, VmStateReport};

use crate::error::OrchestratorResult;
use crate::model::{HostId, HostStatus, Instance, PowerState, State};
use crate::orchestrator::Orchestrator;
use crate::recovery::RecoveryTask;
use crate::state::{Event, TransitionError};

/// What a host said about one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    On,
    Off,
    /// Full report from the recorded host without the VM.
    Missing,
}

impl Observed {
    fn from_power(power: PowerState) -> Option<Self> {
        match power {
            PowerState::PowerOn => Some(Observed::On),
            PowerState::PowerOff => Some(Observed::Off),
            PowerState::PowerReportMissing => Some(Observed::Missing),
            PowerState::PowerUnknown => None,
        }
    }

    fn power(&self) -> PowerState {
        match self {
            Observed::On => PowerState::PowerOn,
            Observed::Off => PowerState::PowerOff,
            Observed::Missing => PowerState::PowerReportMissing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    None,
    /// An operation is in flight; it will settle the state itself.
    Defer,
    Transition { event: Event, host: Option<HostId> },
    /// Record the stop, then schedule an HA restart.
    RestartAfterStop,
    ForceCompleteStop,
    RetryMigration,
    /// Tear the VM down on the reporting host.
    CleanupOnHost,
}

/// Decide the reaction to `observed` from `reporter` for the recorded
/// instance (`None` for a VM name the fleet does not know).
pub fn reconcile(
    recorded: Option<&Instance>,
    reporter: HostId,
    observed: Observed,
    live_work: bool,
    ha: bool,
) -> SyncAction {
    let Some(vm) = recorded else {
        return match observed {
            Observed::Missing => SyncAction::None,
            _ => SyncAction::CleanupOnHost,
        };
    };
    let state = if vm.is_removed() {
        State::Expunging
    } else {
        vm.state
    };
    let same_host = vm.host_id == Some(reporter);
    let running_here = |event| SyncAction::Transition {
        event,
        host: Some(reporter),
    };

    match (state, observed) {
        (State::Destroyed | State::Expunging, Observed::Missing) => SyncAction::None,
        (State::Destroyed | State::Expunging, _) => SyncAction::CleanupOnHost,

        (State::Error, Observed::On) => running_here(Event::FollowAgentPowerOnReport),
        (State::Error, _) => SyncAction::None,

        (State::Stopped, Observed::On) if live_work => SyncAction::Defer,
        (State::Stopped, Observed::On) => running_here(Event::FollowAgentPowerOnReport),
        (State::Stopped, Observed::Off) if live_work => SyncAction::Defer,
        (State::Stopped, Observed::Off) => SyncAction::CleanupOnHost,
        (State::Stopped, Observed::Missing) => SyncAction::None,

        // A leftover copy on a host the instance does not live on.
        (State::Starting | State::Running | State::Stopping, Observed::Off) if !same_host => {
            SyncAction::CleanupOnHost
        }

        (State::Starting, Observed::On) if !same_host => running_here(Event::AgentReportMigrated),
        (State::Starting, _) if live_work => SyncAction::Defer,
        (State::Starting, Observed::On) => running_here(Event::AgentReportRunning),
        (State::Starting, _) => SyncAction::Transition {
            event: Event::AgentReportStopped,
            host: None,
        },

        (State::Running, Observed::On) if same_host => SyncAction::None,
        (State::Running, Observed::On) => running_here(Event::AgentReportMigrated),
        (State::Running, _) if live_work => SyncAction::Defer,
        (State::Running, _) if ha => SyncAction::RestartAfterStop,
        (State::Running, _) => SyncAction::Transition {
            event: Event::FollowAgentPowerOffReport,
            host: None,
        },

        (State::Stopping, Observed::On) if !same_host => running_here(Event::AgentReportRunning),
        (State::Stopping, _) if live_work => SyncAction::Defer,
        (State::Stopping, Observed::On) => running_here(Event::AgentReportRunning),
        (State::Stopping, _) => SyncAction::ForceCompleteStop,

        (State::Migrating, _) if live_work => SyncAction::Defer,
        (State::Migrating, Observed::On) if same_host => running_here(Event::AgentReportRunning),
        (State::Migrating, Observed::On) => running_here(Event::AgentReportMigrated),
        (State::Migrating, _) => SyncAction::RetryMigration,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub vm_name: String,
    pub action: SyncAction,
}

pub struct SyncEngine {
    orchestrator: Arc<Orchestrator>,
}

impl SyncEngine {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn handle_event(&self, event: AgentEvent) -> OrchestratorResult<Vec<SyncOutcome>> {
        match event {
            AgentEvent::Connected { host, report } => {
                self.set_status(host, HostStatus::Up)?;
                self.full_sync(host, &report).await
            }
            AgentEvent::PowerReport { host, report } => self.delta_sync(host, &report).await,
            AgentEvent::Disconnected { host } => {
                self.set_status(host, HostStatus::Disconnected)?;
                Ok(Vec::new())
            }
        }
    }

    fn set_status(&self, host: HostId, status: HostStatus) -> OrchestratorResult<()> {
        if self.orchestrator.store.set_host_status(host, status)? {
            info!(%host, status = status.as_str(), "host status changed");
        } else {
            debug!(%host, "status change for unknown host ignored");
        }
        Ok(())
    }

    /// Compare a complete report against everything recorded on `host`.
    pub async fn full_sync(
        &self,
        host: HostId,
        report: &[VmStateReport],
    ) -> OrchestratorResult<Vec<SyncOutcome>> {
        let mut outcomes = self.delta_sync(host, report).await?;
        let reported: HashSet<&str> = report.iter().map(|r| r.vm_name.as_str()).collect();
        for vm in self.orchestrator.store.instances_on_host(host)? {
            if reported.contains(vm.name.as_str()) {
                continue;
            }
            let name = vm.name.clone();
            let action = self.apply(host, &name, Some(vm), Observed::Missing).await?;
            outcomes.push(SyncOutcome {
                vm_name: name,
                action,
            });
        }
        debug!(%host, entries = report.len(), "full sync done");
        Ok(outcomes)
    }

    pub async fn delta_sync(
        &self,
        host: HostId,
        report: &[VmStateReport],
    ) -> OrchestratorResult<Vec<SyncOutcome>> {
        let mut outcomes = Vec::with_capacity(report.len());
        for entry in report {
            let Some(observed) = Observed::from_power(entry.power_state) else {
                continue;
            };
            let recorded = self.orchestrator.store.instance_by_name(&entry.vm_name)?;
            let action = self.apply(host, &entry.vm_name, recorded, observed).await?;
            outcomes.push(SyncOutcome {
                vm_name: entry.vm_name.clone(),
                action,
            });
        }
        Ok(outcomes)
    }

    async fn apply(
        &self,
        reporter: HostId,
        vm_name: &str,
        recorded: Option<Instance>,
        observed: Observed,
    ) -> OrchestratorResult<SyncAction> {
        let orch = &self.orchestrator;
        let (live_work, ha) = match &recorded {
            Some(vm) if !vm.is_removed() => {
                let ha = orch.config.ha_enabled
                    && orch.offering_of(vm).map(|o| o.ha_enabled).unwrap_or(false);
                (orch.ledger.has_live_work(vm.id)?, ha)
            }
            _ => (false, false),
        };
        let action = reconcile(recorded.as_ref(), reporter, observed, live_work, ha);

        if let Some(vm) = recorded.as_ref().filter(|vm| !vm.is_removed()) {
            let foreign_off = observed == Observed::Off && vm.host_id != Some(reporter);
            if !foreign_off {
                let power_host = (observed == Observed::On).then_some(reporter);
                orch.record_power(vm.id, observed.power(), power_host);
            }
        }
        if action != SyncAction::None {
            debug!(host = %reporter, vm = vm_name, ?observed, ?action, "sync");
        }

        match (&action, recorded) {
            (SyncAction::None | SyncAction::Defer, _) => {}
            (SyncAction::CleanupOnHost, recorded) => {
                if recorded.is_none() {
                    warn!(host = %reporter, vm = vm_name, "alien vm reported; stopping it");
                }
                orch.cleanup_on_host(reporter, vm_name).await;
            }
            (_, None) => {}
            (SyncAction::Transition { event, host }, Some(vm)) => {
                self.follow(&vm, *event, *host).await?;
            }
            (SyncAction::RestartAfterStop, Some(vm)) => {
                if self
                    .follow(&vm, Event::FollowAgentPowerOffReport, None)
                    .await?
                {
                    info!(instance = %vm.id, host = %reporter, "instance lost; scheduling HA restart");
                    orch.recovery
                        .schedule(RecoveryTask::Restart { instance: vm.id });
                }
            }
            (SyncAction::ForceCompleteStop, Some(vm)) => {
                self.follow(&vm, Event::AgentReportStopped, None).await?;
            }
            (SyncAction::RetryMigration, Some(vm)) => {
                let destination = orch.ledger.active(vm.id)?.and_then(|w| {
                    (w.resource_type.as_deref() == Some("host"))
                        .then_some(w.resource_id.map(HostId))
                        .flatten()
                });
                orch.recovery.schedule(RecoveryTask::RetryMigration {
                    instance: vm.id,
                    source: vm.host_id,
                    destination,
                });
            }
        }
        Ok(action)
    }

    /// Apply a report-driven transition. Returns whether it committed; a
    /// concurrent writer winning is not an error.
    async fn follow(
        &self,
        vm: &Instance,
        event: Event,
        host: Option<HostId>,
    ) -> OrchestratorResult<bool> {
        let orch = &self.orchestrator;
        orch.abandon_stale_work(vm.id)?;
        match orch.machine.transition(vm, event, host, None) {
            Ok(next) => {
                info!(instance = %vm.id, from = %vm.state, to = %next.state, %event, "state follows agent report");
                if next.state == State::Stopped {
                    orch.release_resources(vm.id, vm.host_id).await;
                }
                Ok(true)
            }
            Err(TransitionError::Stale { .. }) => {
                debug!(instance = %vm.id, %event, "instance changed meanwhile; report skipped");
                Ok(false)
            }
            Err(err @ TransitionError::NoTransition { .. }) => {
                warn!(instance = %vm.id, error = %err, "report does not apply");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Queue a state check for every instance stuck in a transitional state
    /// with nobody working on it. Returns how many were queued.
    pub fn scan_stuck(&self) -> OrchestratorResult<usize> {
        let orch = &self.orchestrator;
        let cutoff = orch
            .clock
            .now_ms()
            .saturating_sub(orch.config.sync.stuck_timeout.as_millis() as u64);
        let mut queued = 0;
        for vm in orch
            .store
            .instances_in_states(&[State::Starting, State::Stopping, State::Migrating])?
        {
            if vm.updated_at > cutoff || orch.ledger.has_live_work(vm.id)? {
                continue;
            }
            warn!(instance = %vm.id, state = %vm.state, "instance stuck in transition");
            orch.recovery
                .schedule(RecoveryTask::CheckState { instance: vm.id });
            queued += 1;
        }
        Ok(queued)
    }
}
