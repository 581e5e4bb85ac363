use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{
    AcquireOutcome, CommitOutcome, FleetStore, StoreError, StoreResult, WorkStepUpdate,
};
use crate::ledger::{Step, WorkItem};
use crate::model::{
    CapacityBucket, CapacityChange, HostCapacity, HostId, HostRecord, HostStatus, Instance,
    InstanceId, NodeId, OfferingId, PowerState, ServiceOffering, State, ZoneId, apply_delta, fits,
};

#[derive(Default)]
struct Tables {
    next_id: u64,
    instances: BTreeMap<InstanceId, Instance>,
    work: HashMap<String, WorkItem>,
    hosts: BTreeMap<HostId, HostRecord>,
    offerings: HashMap<OfferingId, ServiceOffering>,
}

/// Per-host counters for one resource type: `(used, reserved)`.
type Counters = HashMap<HostId, (u64, u64)>;

/// Process-local store. CPU and memory counters sit behind separate locks,
/// always taken CPU first.
#[derive(Clone, Default)]
pub struct MemStore {
    tables: Arc<RwLock<Tables>>,
    cpu: Arc<Mutex<Counters>>,
    memory: Arc<Mutex<Counters>>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (instances, work) = self
            .tables
            .read()
            .map(|t| (t.instances.len(), t.work.len()))
            .unwrap_or_default();
        f.debug_struct("MemStore")
            .field("instances", &instances)
            .field("work", &work)
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }

    fn lock(counters: &Mutex<Counters>) -> StoreResult<MutexGuard<'_, Counters>> {
        counters.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn live(instance: &Instance) -> bool {
    !instance.is_removed()
}

fn active_for(tables: &Tables, instance: InstanceId) -> Option<&WorkItem> {
    tables
        .work
        .values()
        .filter(|w| w.instance_id == instance && w.is_active())
        .max_by_key(|w| w.created_at)
}

fn bucket_mut(entry: &mut (u64, u64), bucket: CapacityBucket) -> &mut u64 {
    match bucket {
        CapacityBucket::Used => &mut entry.0,
        CapacityBucket::Reserved => &mut entry.1,
    }
}

impl FleetStore for MemStore {
    fn next_instance_id(&self) -> StoreResult<InstanceId> {
        let mut t = self.write()?;
        let floor = t.instances.keys().next_back().map(|id| id.0).unwrap_or(0);
        t.next_id = t.next_id.max(floor) + 1;
        Ok(InstanceId(t.next_id))
    }

    fn insert_instance(&self, instance: &Instance) -> StoreResult<()> {
        let mut t = self.write()?;
        if t.instances.values().any(|i| i.uuid == instance.uuid) {
            return Err(StoreError::Duplicate {
                kind: "instance",
                key: instance.uuid.clone(),
            });
        }
        if t.instances.contains_key(&instance.id) {
            return Err(StoreError::Duplicate {
                kind: "instance",
                key: instance.id.to_string(),
            });
        }
        t.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    fn instance(&self, id: InstanceId) -> StoreResult<Option<Instance>> {
        Ok(self.read()?.instances.get(&id).cloned())
    }

    fn instance_by_uuid(&self, uuid: &str) -> StoreResult<Option<Instance>> {
        Ok(self
            .read()?
            .instances
            .values()
            .find(|i| i.uuid == uuid)
            .cloned())
    }

    fn instance_by_name(&self, name: &str) -> StoreResult<Option<Instance>> {
        Ok(self
            .read()?
            .instances
            .values()
            .find(|i| i.name == name && live(i))
            .cloned())
    }

    fn instances_on_host(&self, host: HostId) -> StoreResult<Vec<Instance>> {
        Ok(self
            .read()?
            .instances
            .values()
            .filter(|i| live(i) && i.host_id == Some(host))
            .cloned()
            .collect())
    }

    fn instances_in_states(&self, states: &[State]) -> StoreResult<Vec<Instance>> {
        Ok(self
            .read()?
            .instances
            .values()
            .filter(|i| live(i) && states.contains(&i.state))
            .cloned()
            .collect())
    }

    fn commit_transition(
        &self,
        next: &Instance,
        expected_state: State,
        expected_version: u64,
        work: Option<&WorkStepUpdate>,
    ) -> StoreResult<CommitOutcome> {
        let mut t = self.write()?;
        let Some(current) = t.instances.get(&next.id) else {
            return Err(StoreError::not_found("instance", next.id));
        };
        if current.state != expected_state || current.version != expected_version {
            return Ok(CommitOutcome::Stale);
        }
        if let Some(update) = work {
            match t.work.get(&update.work_id) {
                Some(item) if item.is_active() => {}
                _ => return Ok(CommitOutcome::WorkInactive),
            }
        }

        let now = next.updated_at;
        if let Some(row) = t.instances.get_mut(&next.id) {
            row.state = next.state;
            row.host_id = next.host_id;
            row.last_host_id = next.last_host_id;
            row.pod_id = next.pod_id;
            row.cluster_id = next.cluster_id;
            row.version = next.version;
            row.updated_at = next.updated_at;
        }
        if let Some(update) = work {
            if let Some(item) = t.work.get_mut(&update.work_id) {
                item.step = update.step;
                item.updated_at = now;
            }
        }
        Ok(CommitOutcome::Committed)
    }

    fn record_power_state(
        &self,
        id: InstanceId,
        power: PowerState,
        host: Option<HostId>,
        now: u64,
    ) -> StoreResult<bool> {
        let mut t = self.write()?;
        let Some(row) = t.instances.get_mut(&id) else {
            return Ok(false);
        };
        row.power_state = power;
        row.power_host_id = host;
        row.power_updated_at = now;
        Ok(true)
    }

    fn set_details(&self, id: InstanceId, details: &BTreeMap<String, String>) -> StoreResult<()> {
        let mut t = self.write()?;
        let row = t
            .instances
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("instance", id))?;
        row.details = details.clone();
        Ok(())
    }

    fn mark_removed(&self, id: InstanceId, now: u64) -> StoreResult<()> {
        let mut t = self.write()?;
        let row = t
            .instances
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("instance", id))?;
        row.removed_at = Some(now);
        Ok(())
    }

    fn try_acquire_work(
        &self,
        item: &WorkItem,
        stale_before: u64,
        now: u64,
    ) -> StoreResult<AcquireOutcome> {
        let mut t = self.write()?;
        let existing = active_for(&t, item.instance_id).cloned();
        let abandoned = match existing {
            Some(old) if old.updated_at >= stale_before => return Ok(AcquireOutcome::Busy(old)),
            Some(old) => {
                if let Some(row) = t.work.get_mut(&old.id) {
                    row.step = Step::Cancelled;
                    row.updated_at = now;
                }
                Some(old)
            }
            None => None,
        };
        if t.work.contains_key(&item.id) {
            return Err(StoreError::Duplicate {
                kind: "work item",
                key: item.id.clone(),
            });
        }
        t.work.insert(item.id.clone(), item.clone());
        Ok(AcquireOutcome::Acquired { abandoned })
    }

    fn work_item(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        Ok(self.read()?.work.get(id).cloned())
    }

    fn update_work_step(&self, id: &str, step: Step, now: u64) -> StoreResult<bool> {
        let mut t = self.write()?;
        match t.work.get_mut(id) {
            Some(item) if item.is_active() => {
                item.step = step;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_work_resource(
        &self,
        id: &str,
        resource_type: &str,
        resource_id: u64,
        now: u64,
    ) -> StoreResult<bool> {
        let mut t = self.write()?;
        match t.work.get_mut(id) {
            Some(item) if item.is_active() => {
                item.resource_type = Some(resource_type.to_string());
                item.resource_id = Some(resource_id);
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn active_work(&self, instance: InstanceId) -> StoreResult<Option<WorkItem>> {
        Ok(active_for(&*self.read()?, instance).cloned())
    }

    fn find_outstanding(
        &self,
        instance: InstanceId,
        target_state: State,
    ) -> StoreResult<Option<WorkItem>> {
        Ok(active_for(&*self.read()?, instance)
            .filter(|w| w.target_state == target_state)
            .cloned())
    }

    fn outstanding_work(&self, node: Option<NodeId>) -> StoreResult<Vec<WorkItem>> {
        let t = self.read()?;
        let mut items: Vec<WorkItem> = t
            .work
            .values()
            .filter(|w| w.is_active() && node.is_none_or(|n| w.node_id == n))
            .cloned()
            .collect();
        items.sort_by_key(|w| (w.created_at, w.instance_id));
        Ok(items)
    }

    fn purge_finished_work(&self, older_than: u64) -> StoreResult<usize> {
        let mut t = self.write()?;
        let before = t.work.len();
        t.work
            .retain(|_, w| w.is_active() || w.updated_at >= older_than);
        Ok(before - t.work.len())
    }

    fn purge_instance_work(&self, instance: InstanceId) -> StoreResult<usize> {
        let mut t = self.write()?;
        let before = t.work.len();
        t.work.retain(|_, w| w.instance_id != instance);
        Ok(before - t.work.len())
    }

    fn upsert_host(&self, host: &HostRecord) -> StoreResult<()> {
        self.write()?.hosts.insert(host.id, host.clone());
        Ok(())
    }

    fn host(&self, id: HostId) -> StoreResult<Option<HostRecord>> {
        Ok(self.read()?.hosts.get(&id).cloned())
    }

    fn hosts_in_zone(&self, zone: ZoneId) -> StoreResult<Vec<HostRecord>> {
        Ok(self
            .read()?
            .hosts
            .values()
            .filter(|h| h.zone_id == zone)
            .cloned()
            .collect())
    }

    fn list_hosts(&self) -> StoreResult<Vec<HostRecord>> {
        Ok(self.read()?.hosts.values().cloned().collect())
    }

    fn set_host_status(&self, id: HostId, status: HostStatus) -> StoreResult<bool> {
        let mut t = self.write()?;
        match t.hosts.get_mut(&id) {
            Some(host) => {
                host.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn upsert_offering(&self, offering: &ServiceOffering) -> StoreResult<()> {
        self.write()?.offerings.insert(offering.id, offering.clone());
        Ok(())
    }

    fn offering(&self, id: OfferingId) -> StoreResult<Option<ServiceOffering>> {
        Ok(self.read()?.offerings.get(&id).cloned())
    }

    fn capacity(&self, host: HostId) -> StoreResult<HostCapacity> {
        let cpu = Self::lock(&self.cpu)?;
        let memory = Self::lock(&self.memory)?;
        let (used_cpu_mhz, reserved_cpu_mhz) = cpu.get(&host).copied().unwrap_or_default();
        let (used_memory_mb, reserved_memory_mb) = memory.get(&host).copied().unwrap_or_default();
        Ok(HostCapacity {
            used_cpu_mhz,
            reserved_cpu_mhz,
            used_memory_mb,
            reserved_memory_mb,
        })
    }

    fn adjust_capacity(&self, change: &CapacityChange) -> StoreResult<bool> {
        let mut cpu = Self::lock(&self.cpu)?;
        let mut memory = Self::lock(&self.memory)?;
        if let Some(limit) = change.limit {
            let (cu, cr) = cpu.get(&change.host).copied().unwrap_or_default();
            let (mu, mr) = memory.get(&change.host).copied().unwrap_or_default();
            if !fits(cu + cr, change.cpu_mhz, limit.cpu_mhz)
                || !fits(mu + mr, change.memory_mb, limit.memory_mb)
            {
                return Ok(false);
            }
        }
        let c = bucket_mut(cpu.entry(change.host).or_default(), change.bucket);
        *c = apply_delta(*c, change.cpu_mhz);
        let m = bucket_mut(memory.entry(change.host).or_default(), change.bucket);
        *m = apply_delta(*m, change.memory_mb);
        Ok(true)
    }
}
