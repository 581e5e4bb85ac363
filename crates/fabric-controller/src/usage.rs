//! Usage events emitted for billing consumers.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{HostId, Instance, InstanceId, OfferingId, State, TemplateId, ZoneId};
use crate::state::{Event, ListenerError, StateListener, TransitionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventType {
    Create,
    Start,
    Stop,
    Migrate,
    Destroy,
    Recover,
    Expunge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_type: UsageEventType,
    pub instance: InstanceId,
    pub instance_name: String,
    pub zone_id: ZoneId,
    pub offering_id: OfferingId,
    pub template_id: TemplateId,
    pub host: Option<HostId>,
}

impl UsageEvent {
    pub fn for_instance(event_type: UsageEventType, instance: &Instance) -> Self {
        Self {
            event_type,
            instance: instance.id,
            instance_name: instance.name.clone(),
            zone_id: instance.zone_id,
            offering_id: instance.offering_id,
            template_id: instance.template_id,
            host: instance.host_id,
        }
    }
}

pub trait UsageRecorder: Send + Sync {
    fn record(&self, event: UsageEvent) -> Result<(), String>;
}

/// Keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct UsageLog {
    events: Arc<Mutex<Vec<UsageEvent>>>,
}

impl UsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, event_type: UsageEventType) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl UsageRecorder for UsageLog {
    fn record(&self, event: UsageEvent) -> Result<(), String> {
        debug!(instance = %event.instance, kind = ?event.event_type, "usage event");
        self.events
            .lock()
            .map_err(|_| "usage log poisoned".to_string())?
            .push(event);
        Ok(())
    }
}

/// Which usage event, if any, a committed transition produces.
fn usage_for(change: &TransitionRecord<'_>) -> Option<UsageEventType> {
    let (from, to) = (change.from_state(), change.to_state());
    match (from, to) {
        (State::Starting, State::Running) => Some(UsageEventType::Start),
        (State::Stopped | State::Error, State::Running) => Some(UsageEventType::Start),
        (State::Running | State::Stopping | State::Migrating, State::Stopped) => {
            Some(UsageEventType::Stop)
        }
        (State::Migrating, State::Running) | (State::Running, State::Running)
            if change.before.host_id != change.after.host_id
                && change.event != Event::RebootRequested =>
        {
            Some(UsageEventType::Migrate)
        }
        (_, State::Destroyed) if from != State::Destroyed => Some(UsageEventType::Destroy),
        (State::Destroyed, State::Stopped) => Some(UsageEventType::Recover),
        (State::Destroyed, State::Expunging) => Some(UsageEventType::Expunge),
        _ => None,
    }
}

pub struct UsageListener {
    recorder: Arc<dyn UsageRecorder>,
}

impl UsageListener {
    pub fn new(recorder: Arc<dyn UsageRecorder>) -> Self {
        Self { recorder }
    }
}

impl StateListener for UsageListener {
    fn name(&self) -> &'static str {
        "usage"
    }

    fn post_transition(
        &self,
        change: &TransitionRecord<'_>,
        committed: bool,
    ) -> Result<(), ListenerError> {
        if !committed {
            return Ok(());
        }
        let Some(kind) = usage_for(change) else {
            return Ok(());
        };
        self.recorder
            .record(UsageEvent::for_instance(kind, change.after))
            .map_err(ListenerError::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    fn record(before: &Instance, after: &Instance, event: Event) -> Option<UsageEventType> {
        usage_for(&TransitionRecord {
            event,
            before,
            after,
        })
    }

    #[test]
    fn maps_transitions_to_usage() {
        let mut stopped = contract::instance(1, "u");
        let mut running = stopped.clone();
        running.state = State::Running;
        running.host_id = Some(HostId(1));
        let mut starting = running.clone();
        starting.state = State::Starting;
        let mut moved = running.clone();
        moved.host_id = Some(HostId(2));
        let mut migrating = running.clone();
        migrating.state = State::Migrating;

        assert_eq!(
            record(&starting, &running, Event::OperationSucceeded),
            Some(UsageEventType::Start)
        );
        assert_eq!(
            record(&migrating, &moved, Event::OperationSucceeded),
            Some(UsageEventType::Migrate)
        );
        assert_eq!(record(&running, &running, Event::RebootRequested), None);
        assert_eq!(
            record(&running, &stopped, Event::FollowAgentPowerOffReport),
            Some(UsageEventType::Stop)
        );
        stopped.state = State::Destroyed;
        let mut recovered = stopped.clone();
        recovered.state = State::Stopped;
        assert_eq!(
            record(&stopped, &recovered, Event::RecoveryRequested),
            Some(UsageEventType::Recover)
        );
    }

    #[test]
    fn listener_ignores_uncommitted() {
        let log = UsageLog::new();
        let listener = UsageListener::new(Arc::new(log.clone()));
        let starting = {
            let mut vm = contract::instance(1, "u");
            vm.state = State::Starting;
            vm
        };
        let running = {
            let mut vm = starting.clone();
            vm.state = State::Running;
            vm
        };
        let change = TransitionRecord {
            event: Event::OperationSucceeded,
            before: &starting,
            after: &running,
        };
        listener.post_transition(&change, false).unwrap();
        assert!(log.events().is_empty());
        listener.post_transition(&change, true).unwrap();
        assert_eq!(log.count(UsageEventType::Start), 1);
    }
}
