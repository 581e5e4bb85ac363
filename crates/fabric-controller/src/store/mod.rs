//! Persistence for instances, work items, hosts, offerings and capacity,
//! plus in-memory and SQLite backends.
//!
//! Every write that other components race on is conditional: instance
//! transitions compare `(state, version)`, work acquisition refuses while a
//! live item exists, and checked capacity adjustments refuse to exceed the
//! supplied limit. Backends make each call atomic.

mod mem;
mod sqlite;

pub use mem::MemStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ledger::{Step, WorkItem};
use crate::model::{
    CapacityChange, HostCapacity, HostId, HostRecord, HostStatus, Instance, InstanceId, NodeId,
    OfferingId, PowerState, ServiceOffering, State, ZoneId,
};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynStore = Arc<dyn FleetStore>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} '{key}' already exists")]
    Duplicate { kind: &'static str, key: String },
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },
    #[error("corrupt {column} value '{value}'")]
    Corrupt { column: &'static str, value: String },
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

/// Work-step write performed atomically with an instance transition.
#[derive(Debug, Clone)]
pub struct WorkStepUpdate {
    pub work_id: String,
    pub step: Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Row no longer matches the expected `(state, version)`.
    Stale,
    /// The accompanying work item was finished or abandoned meanwhile.
    WorkInactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Inserted; `abandoned` is a stale item that was cancelled to make room.
    Acquired { abandoned: Option<WorkItem> },
    Busy(WorkItem),
}

pub trait FleetStore: Send + Sync {
    // Instances.
    fn next_instance_id(&self) -> StoreResult<InstanceId>;
    /// Fails with [`StoreError::Duplicate`] when the uuid is taken.
    fn insert_instance(&self, instance: &Instance) -> StoreResult<()>;
    fn instance(&self, id: InstanceId) -> StoreResult<Option<Instance>>;
    fn instance_by_uuid(&self, uuid: &str) -> StoreResult<Option<Instance>>;
    fn instance_by_name(&self, name: &str) -> StoreResult<Option<Instance>>;
    /// Non-removed instances whose `host_id` is `host`.
    fn instances_on_host(&self, host: HostId) -> StoreResult<Vec<Instance>>;
    /// Non-removed instances in any of `states`, ordered by id.
    fn instances_in_states(&self, states: &[State]) -> StoreResult<Vec<Instance>>;

    /// Compare-and-swap the lifecycle columns (`state`, `host_id`,
    /// `last_host_id`, `pod_id`, `cluster_id`, `version`, `updated_at`) of
    /// `next` against the expected state and version, optionally moving a
    /// still-active work item to a new step in the same atomic write.
    fn commit_transition(
        &self,
        next: &Instance,
        expected_state: State,
        expected_version: u64,
        work: Option<&WorkStepUpdate>,
    ) -> StoreResult<CommitOutcome>;

    /// Record the latest observed power state. Does not bump `version`.
    fn record_power_state(
        &self,
        id: InstanceId,
        power: PowerState,
        host: Option<HostId>,
        now: u64,
    ) -> StoreResult<bool>;
    fn set_details(&self, id: InstanceId, details: &BTreeMap<String, String>) -> StoreResult<()>;
    fn mark_removed(&self, id: InstanceId, now: u64) -> StoreResult<()>;

    // Work ledger.
    fn try_acquire_work(
        &self,
        item: &WorkItem,
        stale_before: u64,
        now: u64,
    ) -> StoreResult<AcquireOutcome>;
    fn work_item(&self, id: &str) -> StoreResult<Option<WorkItem>>;
    /// Moves an active item; returns false when the item is finished or gone.
    fn update_work_step(&self, id: &str, step: Step, now: u64) -> StoreResult<bool>;
    fn set_work_resource(
        &self,
        id: &str,
        resource_type: &str,
        resource_id: u64,
        now: u64,
    ) -> StoreResult<bool>;
    fn active_work(&self, instance: InstanceId) -> StoreResult<Option<WorkItem>>;
    fn find_outstanding(
        &self,
        instance: InstanceId,
        target_state: State,
    ) -> StoreResult<Option<WorkItem>>;
    /// Active items, optionally restricted to one owning node.
    fn outstanding_work(&self, node: Option<NodeId>) -> StoreResult<Vec<WorkItem>>;
    fn purge_finished_work(&self, older_than: u64) -> StoreResult<usize>;
    fn purge_instance_work(&self, instance: InstanceId) -> StoreResult<usize>;

    // Hosts and offerings.
    fn upsert_host(&self, host: &HostRecord) -> StoreResult<()>;
    fn host(&self, id: HostId) -> StoreResult<Option<HostRecord>>;
    fn hosts_in_zone(&self, zone: ZoneId) -> StoreResult<Vec<HostRecord>>;
    fn list_hosts(&self) -> StoreResult<Vec<HostRecord>>;
    fn set_host_status(&self, id: HostId, status: HostStatus) -> StoreResult<bool>;
    fn upsert_offering(&self, offering: &ServiceOffering) -> StoreResult<()>;
    fn offering(&self, id: OfferingId) -> StoreResult<Option<ServiceOffering>>;

    // Capacity.
    fn capacity(&self, host: HostId) -> StoreResult<HostCapacity>;
    /// Apply both CPU and memory deltas or neither. With a limit, returns
    /// false (and changes nothing) when growth would exceed it.
    fn adjust_capacity(&self, change: &CapacityChange) -> StoreResult<bool>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behavior every backend must share.

    use super::*;
    use crate::ledger::WorkType;
    use crate::model::{CapacityBucket, CapacityLimit, HypervisorType, VmType};

    pub fn instance(id: u64, uuid: &str) -> Instance {
        Instance {
            id: InstanceId(id),
            uuid: uuid.to_string(),
            name: format!("i-2-{id}-VM"),
            vm_type: VmType::User,
            account_id: 2,
            state: State::Stopped,
            power_state: PowerState::PowerOff,
            power_host_id: None,
            power_updated_at: 0,
            host_id: None,
            last_host_id: None,
            zone_id: 1,
            pod_id: None,
            cluster_id: None,
            offering_id: 1,
            template_id: 1,
            hypervisor: HypervisorType::Simulator,
            details: BTreeMap::from([("key".to_string(), "value".to_string())]),
            reservation_id: None,
            version: 0,
            created_at: 10,
            updated_at: 10,
            removed_at: None,
        }
    }

    fn work(id: &str, instance: u64, now: u64) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            node_id: 1,
            instance_id: InstanceId(instance),
            work_type: WorkType::Start,
            target_state: State::Running,
            step: Step::Prepare,
            created_at: now,
            updated_at: now,
            resource_id: None,
            resource_type: None,
        }
    }

    fn host(id: u64) -> HostRecord {
        HostRecord {
            id: HostId(id),
            name: format!("h{id}"),
            zone_id: 1,
            pod_id: 1,
            cluster_id: 1,
            hypervisor: HypervisorType::Simulator,
            status: HostStatus::Up,
            enabled: true,
            private_ip: format!("10.0.0.{id}"),
            cpus: 4,
            cpu_speed_mhz: 1000,
            memory_mb: 4096,
        }
    }

    pub fn instance_round_trip(store: &dyn FleetStore) {
        let id = store.next_instance_id().unwrap();
        let vm = instance(id.0, "uuid-a");
        store.insert_instance(&vm).unwrap();
        assert_eq!(store.instance(id).unwrap(), Some(vm.clone()));
        assert_eq!(store.instance_by_uuid("uuid-a").unwrap(), Some(vm.clone()));
        assert_eq!(store.instance_by_name(&vm.name).unwrap(), Some(vm.clone()));
        assert!(matches!(
            store.insert_instance(&instance(id.0 + 1, "uuid-a")),
            Err(StoreError::Duplicate { .. })
        ));
        assert!(store.next_instance_id().unwrap() > id);
    }

    pub fn cas_rejects_stale_writer(store: &dyn FleetStore) {
        let vm = instance(1, "uuid-cas");
        store.insert_instance(&vm).unwrap();

        let mut next = vm.clone();
        next.state = State::Starting;
        next.host_id = Some(HostId(3));
        next.version = 1;
        assert_eq!(
            store
                .commit_transition(&next, State::Stopped, 0, None)
                .unwrap(),
            CommitOutcome::Committed
        );

        // Same expectations again: the row has moved on.
        let mut racer = vm.clone();
        racer.state = State::Destroyed;
        racer.version = 1;
        assert_eq!(
            store
                .commit_transition(&racer, State::Stopped, 0, None)
                .unwrap(),
            CommitOutcome::Stale
        );
        let row = store.instance(vm.id).unwrap().unwrap();
        assert_eq!(row.state, State::Starting);
        assert_eq!(row.host_id, Some(HostId(3)));
        assert_eq!(row.version, 1);
        assert_eq!(store.instances_on_host(HostId(3)).unwrap().len(), 1);
    }

    pub fn commit_checks_work_is_active(store: &dyn FleetStore) {
        let vm = instance(1, "uuid-w");
        store.insert_instance(&vm).unwrap();
        let item = work("w1", 1, 100);
        store.try_acquire_work(&item, 0, 100).unwrap();

        let mut next = vm.clone();
        next.state = State::Starting;
        next.version = 1;
        let update = WorkStepUpdate {
            work_id: "w1".into(),
            step: Step::Starting,
        };
        assert_eq!(
            store
                .commit_transition(&next, State::Stopped, 0, Some(&update))
                .unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(store.work_item("w1").unwrap().unwrap().step, Step::Starting);

        assert!(store.update_work_step("w1", Step::Cancelled, 200).unwrap());
        let mut after = next.clone();
        after.state = State::Running;
        after.version = 2;
        assert_eq!(
            store
                .commit_transition(&after, State::Starting, 1, Some(&update))
                .unwrap(),
            CommitOutcome::WorkInactive
        );
        assert_eq!(store.instance(vm.id).unwrap().unwrap().state, State::Starting);
    }

    pub fn work_acquire_is_exclusive(store: &dyn FleetStore) {
        let first = work("a", 5, 100);
        assert_eq!(
            store.try_acquire_work(&first, 50, 100).unwrap(),
            AcquireOutcome::Acquired { abandoned: None }
        );
        let second = work("b", 5, 110);
        match store.try_acquire_work(&second, 50, 110).unwrap() {
            AcquireOutcome::Busy(existing) => assert_eq!(existing.id, "a"),
            other => panic!("expected busy, got {other:?}"),
        }
        // Once `a` is older than the stale cutoff it is cancelled and replaced.
        match store.try_acquire_work(&second, 101, 200).unwrap() {
            AcquireOutcome::Acquired { abandoned: Some(old) } => assert_eq!(old.id, "a"),
            other => panic!("expected takeover, got {other:?}"),
        }
        assert_eq!(store.work_item("a").unwrap().unwrap().step, Step::Cancelled);
        assert_eq!(store.active_work(InstanceId(5)).unwrap().unwrap().id, "b");
        assert_eq!(
            store
                .find_outstanding(InstanceId(5), State::Running)
                .unwrap()
                .unwrap()
                .id,
            "b"
        );
        assert!(store
            .find_outstanding(InstanceId(5), State::Stopped)
            .unwrap()
            .is_none());
        assert!(store.set_work_resource("b", "host", 9, 210).unwrap());
        let b = store.work_item("b").unwrap().unwrap();
        assert_eq!(b.resource_id, Some(9));
        assert_eq!(b.resource_type.as_deref(), Some("host"));
        assert_eq!(store.outstanding_work(Some(1)).unwrap().len(), 1);
        assert!(store.outstanding_work(Some(2)).unwrap().is_empty());

        assert!(store.update_work_step("b", Step::Done, 300).unwrap());
        assert!(!store.update_work_step("b", Step::Started, 301).unwrap());
        assert_eq!(store.purge_finished_work(250).unwrap(), 1);
        assert_eq!(store.purge_instance_work(InstanceId(5)).unwrap(), 1);
        assert!(store.work_item("b").unwrap().is_none());
    }

    pub fn capacity_is_checked(store: &dyn FleetStore) {
        store.upsert_host(&host(1)).unwrap();
        let limit = CapacityLimit {
            cpu_mhz: 4000,
            memory_mb: 4096,
        };
        let reserve = CapacityChange {
            host: HostId(1),
            bucket: CapacityBucket::Reserved,
            cpu_mhz: 3000,
            memory_mb: 1024,
            limit: Some(limit),
        };
        assert!(store.adjust_capacity(&reserve).unwrap());
        // CPU would overflow: neither counter moves.
        assert!(!store.adjust_capacity(&reserve).unwrap());
        let cap = store.capacity(HostId(1)).unwrap();
        assert_eq!(cap.reserved_cpu_mhz, 3000);
        assert_eq!(cap.reserved_memory_mb, 1024);

        let release = CapacityChange {
            cpu_mhz: -3000,
            memory_mb: -1024,
            limit: None,
            ..reserve
        };
        assert!(store.adjust_capacity(&release).unwrap());
        let used = CapacityChange {
            bucket: CapacityBucket::Used,
            cpu_mhz: 1000,
            memory_mb: 512,
            limit: None,
            ..reserve
        };
        assert!(store.adjust_capacity(&used).unwrap());
        let cap = store.capacity(HostId(1)).unwrap();
        assert_eq!(cap, HostCapacity {
            used_cpu_mhz: 1000,
            reserved_cpu_mhz: 0,
            used_memory_mb: 512,
            reserved_memory_mb: 0,
        });
    }

    pub fn hosts_and_power(store: &dyn FleetStore) {
        store.upsert_host(&host(1)).unwrap();
        store.upsert_host(&host(2)).unwrap();
        assert_eq!(store.hosts_in_zone(1).unwrap().len(), 2);
        assert!(store.set_host_status(HostId(2), HostStatus::Disconnected).unwrap());
        assert_eq!(
            store.host(HostId(2)).unwrap().unwrap().status,
            HostStatus::Disconnected
        );
        assert!(!store.set_host_status(HostId(9), HostStatus::Up).unwrap());

        let vm = instance(1, "uuid-p");
        store.insert_instance(&vm).unwrap();
        assert!(store
            .record_power_state(vm.id, PowerState::PowerOn, Some(HostId(1)), 500)
            .unwrap());
        let row = store.instance(vm.id).unwrap().unwrap();
        assert_eq!(row.power_state, PowerState::PowerOn);
        assert_eq!(row.power_host_id, Some(HostId(1)));
        assert_eq!(row.version, 0);

        store.set_details(vm.id, &BTreeMap::new()).unwrap();
        store.mark_removed(vm.id, 600).unwrap();
        assert!(store.instance(vm.id).unwrap().unwrap().is_removed());
        assert!(store.instances_in_states(&State::ALL).unwrap().is_empty());
    }

    pub fn run_all(make: impl Fn() -> Box<dyn FleetStore>) {
        instance_round_trip(make().as_ref());
        cas_rejects_stale_writer(make().as_ref());
        commit_checks_work_is_active(make().as_ref());
        work_acquire_is_exclusive(make().as_ref());
        capacity_is_checked(make().as_ref());
        hosts_and_power(make().as_ref());
    }
}
