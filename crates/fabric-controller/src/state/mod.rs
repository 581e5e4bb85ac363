//! Lifecycle state machine.
//!
//! The transition table is the single authority on which `(state, event)`
//! pairs are legal. [`StateMachine::transition`] computes the next row
//! (including host bookkeeping), runs listener hooks, and persists with a
//! compare-and-swap on `(state, version)` so that of two racing callers one
//! commits and the other sees [`TransitionError::Stale`].

mod listener;

pub use listener::{ListenerError, StateListener, TransitionRecord};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::model::{HostId, Instance, InstanceId, State};
use crate::store::{CommitOutcome, DynStore, StoreError, WorkStepUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    StartRequested,
    StopRequested,
    RebootRequested,
    MigrationRequested,
    DestroyRequested,
    RecoveryRequested,
    ExpungeOperation,
    OperationRetry,
    OperationSucceeded,
    OperationFailed,
    OperationFailedToError,
    /// Answer to a command the controller sent says the VM is running.
    AgentReportRunning,
    AgentReportStopped,
    /// The VM turned up running on a host other than the recorded one.
    AgentReportMigrated,
    /// Unsolicited power report from sync.
    FollowAgentPowerOnReport,
    FollowAgentPowerOffReport,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::StartRequested => "start_requested",
            Event::StopRequested => "stop_requested",
            Event::RebootRequested => "reboot_requested",
            Event::MigrationRequested => "migration_requested",
            Event::DestroyRequested => "destroy_requested",
            Event::RecoveryRequested => "recovery_requested",
            Event::ExpungeOperation => "expunge_operation",
            Event::OperationRetry => "operation_retry",
            Event::OperationSucceeded => "operation_succeeded",
            Event::OperationFailed => "operation_failed",
            Event::OperationFailedToError => "operation_failed_to_error",
            Event::AgentReportRunning => "agent_report_running",
            Event::AgentReportStopped => "agent_report_stopped",
            Event::AgentReportMigrated => "agent_report_migrated",
            Event::FollowAgentPowerOnReport => "follow_agent_power_on_report",
            Event::FollowAgentPowerOffReport => "follow_agent_power_off_report",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use Event::*;
use State::*;

const TRANSITIONS: &[(State, Event, State)] = &[
    (Stopped, StartRequested, Starting),
    (Stopped, DestroyRequested, Destroyed),
    (Stopped, OperationFailed, Error),
    (Stopped, AgentReportStopped, Stopped),
    (Stopped, AgentReportRunning, Running),
    (Stopped, FollowAgentPowerOnReport, Running),
    (Stopped, FollowAgentPowerOffReport, Stopped),
    (Starting, OperationRetry, Starting),
    (Starting, OperationSucceeded, Running),
    (Starting, OperationFailed, Stopped),
    (Starting, OperationFailedToError, Error),
    (Starting, StopRequested, Stopping),
    (Starting, AgentReportRunning, Running),
    (Starting, AgentReportStopped, Stopped),
    (Starting, AgentReportMigrated, Running),
    (Starting, FollowAgentPowerOnReport, Running),
    (Starting, FollowAgentPowerOffReport, Stopped),
    (Running, MigrationRequested, Migrating),
    (Running, StopRequested, Stopping),
    (Running, RebootRequested, Running),
    (Running, OperationSucceeded, Running),
    (Running, AgentReportRunning, Running),
    (Running, AgentReportStopped, Stopped),
    (Running, AgentReportMigrated, Running),
    (Running, FollowAgentPowerOnReport, Running),
    (Running, FollowAgentPowerOffReport, Stopped),
    (Migrating, OperationSucceeded, Running),
    (Migrating, OperationFailed, Running),
    (Migrating, StopRequested, Stopping),
    (Migrating, AgentReportRunning, Running),
    (Migrating, AgentReportStopped, Stopped),
    (Migrating, AgentReportMigrated, Running),
    (Migrating, FollowAgentPowerOnReport, Running),
    (Migrating, FollowAgentPowerOffReport, Stopped),
    (Stopping, OperationSucceeded, Stopped),
    (Stopping, OperationFailed, Running),
    (Stopping, StopRequested, Stopping),
    (Stopping, AgentReportRunning, Running),
    (Stopping, AgentReportStopped, Stopped),
    (Stopping, FollowAgentPowerOnReport, Running),
    (Stopping, FollowAgentPowerOffReport, Stopped),
    (Destroyed, RecoveryRequested, Stopped),
    (Destroyed, ExpungeOperation, Expunging),
    (Expunging, ExpungeOperation, Expunging),
    (Expunging, OperationFailed, Expunging),
    (Error, DestroyRequested, Destroyed),
    (Error, RecoveryRequested, Stopped),
    (Error, AgentReportStopped, Stopped),
    (Error, AgentReportRunning, Running),
    (Error, FollowAgentPowerOnReport, Running),
    (Error, FollowAgentPowerOffReport, Stopped),
];

/// Next state for `(from, event)`, if the table defines one.
pub fn next_state(from: State, event: Event) -> Option<State> {
    TRANSITIONS
        .iter()
        .find(|(f, e, _)| *f == from && *e == event)
        .map(|(_, _, to)| *to)
}

/// Events accepted in `state`.
pub fn possible_events(state: State) -> Vec<Event> {
    TRANSITIONS
        .iter()
        .filter(|(f, _, _)| *f == state)
        .map(|(_, e, _)| *e)
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("instance {instance}: no transition from {from} on {event}")]
    NoTransition {
        instance: InstanceId,
        from: State,
        event: Event,
    },
    #[error("instance {instance} is no longer {expected}")]
    Stale { instance: InstanceId, expected: State },
    #[error("transition vetoed by {listener}: {source}")]
    Vetoed {
        listener: &'static str,
        #[source]
        source: ListenerError,
    },
    #[error("work item {work_id} for instance {instance} is no longer active")]
    WorkInactive { instance: InstanceId, work_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct StateMachine {
    store: DynStore,
    clock: Arc<dyn Clock>,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl StateMachine {
    pub fn new(store: DynStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Apply `event` to `instance` as last read by the caller.
    ///
    /// `target_host` is the host the instance is moving onto (start, retry,
    /// migration success, host correction). `work` moves the caller's work
    /// item in the same atomic write and fails the transition if that item
    /// was abandoned meanwhile. Returns the committed row.
    pub fn transition(
        &self,
        instance: &Instance,
        event: Event,
        target_host: Option<HostId>,
        work: Option<&WorkStepUpdate>,
    ) -> Result<Instance, TransitionError> {
        let to = next_state(instance.state, event).ok_or(TransitionError::NoTransition {
            instance: instance.id,
            from: instance.state,
            event,
        })?;
        let next = self.next_row(instance, to, target_host)?;
        let change = TransitionRecord {
            event,
            before: instance,
            after: &next,
        };

        let mut notified: Vec<&Arc<dyn StateListener>> = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            if let Err(source) = listener.pre_transition(&change) {
                self.notify_post(&notified, &change, false);
                debug!(
                    instance = %instance.id,
                    %event,
                    listener = listener.name(),
                    error = %source,
                    "transition vetoed"
                );
                return Err(TransitionError::Vetoed {
                    listener: listener.name(),
                    source,
                });
            }
            notified.push(listener);
        }

        let outcome = match self
            .store
            .commit_transition(&next, instance.state, instance.version, work)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.notify_post(&notified, &change, false);
                return Err(err.into());
            }
        };
        let committed = outcome == CommitOutcome::Committed;
        self.notify_post(&notified, &change, committed);

        match outcome {
            CommitOutcome::Committed => {
                debug!(
                    instance = %instance.id,
                    from = %instance.state,
                    to = %to,
                    %event,
                    host = ?next.host_id,
                    "state transition"
                );
                Ok(next)
            }
            CommitOutcome::Stale => Err(TransitionError::Stale {
                instance: instance.id,
                expected: instance.state,
            }),
            CommitOutcome::WorkInactive => Err(TransitionError::WorkInactive {
                instance: instance.id,
                work_id: work.map(|w| w.work_id.clone()).unwrap_or_default(),
            }),
        }
    }

    fn next_row(
        &self,
        current: &Instance,
        to: State,
        target_host: Option<HostId>,
    ) -> Result<Instance, StoreError> {
        let mut next = current.clone();
        next.state = to;
        next.version = current.version + 1;
        next.updated_at = self.clock.now_ms();
        match to {
            Starting => next.host_id = target_host.or(current.host_id),
            Running => {
                if target_host.is_some() {
                    next.host_id = target_host;
                }
            }
            Stopping | Migrating => {}
            Stopped | Error | Destroyed | Expunging => next.host_id = None,
        }
        if next.host_id != current.host_id && current.host_id.is_some() {
            next.last_host_id = current.host_id;
        }
        if let Some(host) = next.host_id.filter(|h| Some(*h) != current.host_id) {
            if let Some(record) = self.store.host(host)? {
                next.pod_id = Some(record.pod_id);
                next.cluster_id = Some(record.cluster_id);
            }
        }
        Ok(next)
    }

    fn notify_post(
        &self,
        listeners: &[&Arc<dyn StateListener>],
        change: &TransitionRecord<'_>,
        committed: bool,
    ) {
        for listener in listeners {
            if let Err(err) = listener.post_transition(change, committed) {
                warn!(
                    instance = %change.before.id,
                    event = %change.event,
                    listener = listener.name(),
                    committed,
                    error = %err,
                    "post-transition listener failed"
                );
            }
        }
    }
}
