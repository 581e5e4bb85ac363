//! Work ledger: durable markers for in-flight lifecycle operations.
//!
//! Every lifecycle call holds exactly one active [`WorkItem`] for its
//! instance. The row doubles as the mutual-exclusion lock (acquire fails
//! while another active item exists) and as the crash-recovery record (a
//! restarted node finds its unfinished items via [`WorkLedger::outstanding_for_node`]).
//!
//! Waiting for a conflicting item uses an in-process [`Notify`] that fires
//! whenever an item finishes, plus a bounded poll for items owned by other
//! nodes, which only become visible through the store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::model::{InstanceId, NodeId, State};
use crate::store::{AcquireOutcome, FleetStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    Start,
    Stop,
    Reboot,
    Migrate,
    Destroy,
    Expunge,
    Recover,
    /// NIC added to or removed from an instance.
    Nic,
}

impl WorkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::Start => "start",
            WorkType::Stop => "stop",
            WorkType::Reboot => "reboot",
            WorkType::Migrate => "migrate",
            WorkType::Destroy => "destroy",
            WorkType::Expunge => "expunge",
            WorkType::Recover => "recover",
            WorkType::Nic => "nic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(WorkType::Start),
            "stop" => Some(WorkType::Stop),
            "reboot" => Some(WorkType::Reboot),
            "migrate" => Some(WorkType::Migrate),
            "destroy" => Some(WorkType::Destroy),
            "expunge" => Some(WorkType::Expunge),
            "recover" => Some(WorkType::Recover),
            "nic" => Some(WorkType::Nic),
            _ => None,
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress marker of a work item.
///
/// Happy path: `Prepare → Starting → Started → Release → Done`. Migrations
/// use `Migrating` in place of `Starting`. `Done` and `Cancelled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Prepare,
    Starting,
    Migrating,
    Started,
    Release,
    Done,
    Cancelled,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Prepare => "prepare",
            Step::Starting => "starting",
            Step::Migrating => "migrating",
            Step::Started => "started",
            Step::Release => "release",
            Step::Done => "done",
            Step::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "prepare" => Some(Step::Prepare),
            "starting" => Some(Step::Starting),
            "migrating" => Some(Step::Migrating),
            "started" => Some(Step::Started),
            "release" => Some(Step::Release),
            "done" => Some(Step::Done),
            "cancelled" => Some(Step::Cancelled),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Step::Prepare => 0,
            Step::Starting | Step::Migrating => 1,
            Step::Started => 2,
            Step::Release => 3,
            Step::Done | Step::Cancelled => 4,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Step::Done | Step::Cancelled)
    }

    /// Step a failed attempt resumes from.
    pub fn previous(&self) -> Step {
        match self {
            Step::Starting | Step::Migrating => Step::Prepare,
            Step::Started => Step::Starting,
            Step::Release => Step::Started,
            other => *other,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub node_id: NodeId,
    pub instance_id: InstanceId,
    pub work_type: WorkType,
    /// State the operation drives the instance toward.
    pub target_state: State,
    pub step: Step,
    pub created_at: u64,
    pub updated_at: u64,
    pub resource_id: Option<u64>,
    pub resource_type: Option<String>,
}

impl WorkItem {
    pub fn is_active(&self) -> bool {
        !self.step.is_finished()
    }

    /// Inactive for longer than `timeout` as of `now_ms`.
    pub fn is_stale(&self, now_ms: u64, timeout: Duration) -> bool {
        self.updated_at.saturating_add(timeout.as_millis() as u64) < now_ms
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("instance {instance} is busy with {work_type} work {work_id} at step {step}")]
    Busy {
        instance: InstanceId,
        work_id: String,
        work_type: WorkType,
        step: Step,
    },
    #[error("work item {0} is no longer active")]
    NotActive(String),
    #[error("work item {id} cannot move from {from} to {to}")]
    StepRegression { id: String, from: Step, to: Step },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    fn busy(existing: &WorkItem) -> Self {
        LedgerError::Busy {
            instance: existing.instance_id,
            work_id: existing.id.clone(),
            work_type: existing.work_type,
            step: existing.step,
        }
    }
}

pub struct WorkLedger {
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    node_id: NodeId,
    config: LedgerConfig,
    settled: Notify,
}

impl WorkLedger {
    pub fn new(
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        node_id: NodeId,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            node_id,
            config,
            settled: Notify::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Try once to take the work lock for `instance`.
    ///
    /// An existing active item that has been inactive longer than the
    /// inactivity timeout is cancelled and replaced.
    pub fn acquire(
        &self,
        instance: InstanceId,
        work_type: WorkType,
        target_state: State,
    ) -> Result<WorkItem, LedgerError> {
        let now = self.clock.now_ms();
        let item = WorkItem {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: self.node_id,
            instance_id: instance,
            work_type,
            target_state,
            step: Step::Prepare,
            created_at: now,
            updated_at: now,
            resource_id: None,
            resource_type: None,
        };
        let stale_before = now.saturating_sub(self.config.inactivity_timeout.as_millis() as u64);
        match self.store.try_acquire_work(&item, stale_before, now)? {
            AcquireOutcome::Acquired { abandoned } => {
                if let Some(old) = abandoned {
                    warn!(
                        instance = %instance,
                        abandoned = %old.id,
                        owner = old.node_id,
                        step = %old.step,
                        "abandoned stale work item"
                    );
                }
                debug!(instance = %instance, work = %item.id, %work_type, "work acquired");
                Ok(item)
            }
            AcquireOutcome::Busy(existing) => Err(LedgerError::busy(&existing)),
        }
    }

    /// Acquire, waiting up to `wait_timeout` for a conflicting item to finish.
    pub async fn acquire_or_wait(
        &self,
        instance: InstanceId,
        work_type: WorkType,
        target_state: State,
    ) -> Result<WorkItem, LedgerError> {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            match self.acquire(instance, work_type, target_state) {
                Err(LedgerError::Busy { .. }) if Instant::now() < deadline => {
                    self.wait_settled(deadline).await;
                }
                other => return other,
            }
        }
    }

    /// Park until some work item finishes on this node, the poll interval
    /// elapses, or `deadline` passes.
    pub async fn wait_settled(&self, deadline: Instant) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let nap = self.config.poll_interval.min(deadline - now);
        tokio::select! {
            _ = self.settled.notified() => {}
            _ = tokio::time::sleep(nap) => {}
        }
    }

    /// Move `item` forward; moving backwards is refused (see [`Self::rollback`]).
    pub fn advance(&self, item: &mut WorkItem, step: Step) -> Result<(), LedgerError> {
        if step.rank() < item.step.rank() {
            return Err(LedgerError::StepRegression {
                id: item.id.clone(),
                from: item.step,
                to: step,
            });
        }
        self.write_step(item, step)
    }

    /// Reset the step one position so a retry resumes from a correct point.
    pub fn rollback(&self, item: &mut WorkItem) -> Result<(), LedgerError> {
        let previous = item.step.previous();
        if previous == item.step {
            return Ok(());
        }
        self.write_step(item, previous)
    }

    pub fn complete(&self, item: &mut WorkItem) -> Result<(), LedgerError> {
        self.finish(item, Step::Done)
    }

    pub fn cancel(&self, item: &mut WorkItem) -> Result<(), LedgerError> {
        self.finish(item, Step::Cancelled)
    }

    fn finish(&self, item: &mut WorkItem, step: Step) -> Result<(), LedgerError> {
        let res = self.write_step(item, step);
        self.settled.notify_waiters();
        res
    }

    fn write_step(&self, item: &mut WorkItem, step: Step) -> Result<(), LedgerError> {
        let now = self.clock.now_ms();
        if !self.store.update_work_step(&item.id, step, now)? {
            return Err(LedgerError::NotActive(item.id.clone()));
        }
        item.step = step;
        item.updated_at = now;
        Ok(())
    }

    /// Record the resource (volume, NIC, host) the item is currently acting on.
    pub fn attach_resource(
        &self,
        item: &mut WorkItem,
        resource_type: &str,
        resource_id: u64,
    ) -> Result<(), LedgerError> {
        if !self
            .store
            .set_work_resource(&item.id, resource_type, resource_id, self.clock.now_ms())?
        {
            return Err(LedgerError::NotActive(item.id.clone()));
        }
        item.resource_type = Some(resource_type.to_string());
        item.resource_id = Some(resource_id);
        Ok(())
    }

    pub fn active(&self, instance: InstanceId) -> Result<Option<WorkItem>, LedgerError> {
        Ok(self.store.active_work(instance)?)
    }

    /// Active and not yet past the inactivity timeout.
    pub fn has_live_work(&self, instance: InstanceId) -> Result<bool, LedgerError> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .active_work(instance)?
            .is_some_and(|w| !w.is_stale(now, self.config.inactivity_timeout)))
    }

    pub fn find_outstanding(
        &self,
        instance: InstanceId,
        target_state: State,
    ) -> Result<Option<WorkItem>, LedgerError> {
        Ok(self.store.find_outstanding(instance, target_state)?)
    }

    pub fn outstanding_for_node(&self) -> Result<Vec<WorkItem>, LedgerError> {
        Ok(self.store.outstanding_work(Some(self.node_id))?)
    }

    pub fn work_item(&self, id: &str) -> Result<Option<WorkItem>, LedgerError> {
        Ok(self.store.work_item(id)?)
    }

    /// Reap finished items older than `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize, LedgerError> {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(max_age.as_millis() as u64);
        let removed = self.store.purge_finished_work(cutoff)?;
        if removed > 0 {
            info!(removed, "reaped finished work items");
        }
        Ok(removed)
    }

    /// Drop every ledger row for an expunged instance.
    pub fn purge_instance(&self, instance: InstanceId) -> Result<usize, LedgerError> {
        let removed = self.store.purge_instance_work(instance)?;
        self.settled.notify_waiters();
        Ok(removed)
    }
}
