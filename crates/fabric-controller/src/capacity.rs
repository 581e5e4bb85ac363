//! Per-host capacity accounting.
//!
//! An instance in `Starting` on a host holds *reserved* capacity there;
//! `Running`, `Stopping` and `Migrating` hold *used* capacity. The
//! [`CapacityManager`] listener moves the charge on every transition: the
//! reservation is taken, checked against host totals × over-provisioning,
//! in the pre hook (so an overcommitted host vetoes the transition), and
//! everything else is settled in the post hook once the write is known to
//! have landed. Migrations additionally hold an explicit reservation on the
//! destination for their duration.

use tracing::debug;

use crate::config::PlannerConfig;
use crate::model::{
    CapacityBucket, CapacityChange, CapacityLimit, HostCapacity, HostId, HostRecord, Instance,
    ServiceOffering, State,
};
use crate::state::{ListenerError, StateListener, TransitionRecord};
use crate::store::{DynStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand {
    pub cpu_mhz: u64,
    pub memory_mb: u64,
}

impl From<&ServiceOffering> for Demand {
    fn from(offering: &ServiceOffering) -> Self {
        Self {
            cpu_mhz: offering.cpu_demand_mhz(),
            memory_mb: offering.memory_mb,
        }
    }
}

/// Where and how an instance in a given row is charged.
fn charge_of(instance: &Instance) -> Option<(HostId, CapacityBucket)> {
    let host = instance.host_id?;
    match instance.state {
        State::Starting => Some((host, CapacityBucket::Reserved)),
        State::Running | State::Stopping | State::Migrating => Some((host, CapacityBucket::Used)),
        _ => None,
    }
}

pub struct CapacityManager {
    store: DynStore,
    cpu_overprovisioning: f64,
    memory_overprovisioning: f64,
}

impl CapacityManager {
    pub fn new(store: DynStore, config: &PlannerConfig) -> Self {
        Self {
            store,
            cpu_overprovisioning: config.cpu_overprovisioning,
            memory_overprovisioning: config.memory_overprovisioning,
        }
    }

    /// Effective ceiling of `host`.
    pub fn limit(&self, host: &HostRecord) -> CapacityLimit {
        CapacityLimit {
            cpu_mhz: (host.total_cpu_mhz() as f64 * self.cpu_overprovisioning) as u64,
            memory_mb: (host.memory_mb as f64 * self.memory_overprovisioning) as u64,
        }
    }

    pub fn usage(&self, host: HostId) -> Result<HostCapacity, StoreError> {
        self.store.capacity(host)
    }

    /// Whether `demand` fits on `host` on top of what is already allocated.
    pub fn has_room(&self, host: &HostRecord, demand: Demand) -> Result<bool, StoreError> {
        let limit = self.limit(host);
        let usage = self.store.capacity(host.id)?;
        Ok(usage.allocated_cpu_mhz() + demand.cpu_mhz <= limit.cpu_mhz
            && usage.allocated_memory_mb() + demand.memory_mb <= limit.memory_mb)
    }

    /// Take a checked reservation; false when the host lacks room.
    pub fn reserve(&self, host: HostId, demand: Demand) -> Result<bool, StoreError> {
        let record = self
            .store
            .host(host)?
            .ok_or_else(|| StoreError::not_found("host", host))?;
        self.store.adjust_capacity(&CapacityChange {
            host,
            bucket: CapacityBucket::Reserved,
            cpu_mhz: demand.cpu_mhz as i64,
            memory_mb: demand.memory_mb as i64,
            limit: Some(self.limit(&record)),
        })
    }

    pub fn release_reservation(&self, host: HostId, demand: Demand) -> Result<(), StoreError> {
        self.shift(host, CapacityBucket::Reserved, demand, -1)
    }

    fn shift(
        &self,
        host: HostId,
        bucket: CapacityBucket,
        demand: Demand,
        sign: i64,
    ) -> Result<(), StoreError> {
        self.store.adjust_capacity(&CapacityChange {
            host,
            bucket,
            cpu_mhz: sign * demand.cpu_mhz as i64,
            memory_mb: sign * demand.memory_mb as i64,
            limit: None,
        })?;
        Ok(())
    }

    fn demand_of(&self, instance: &Instance) -> Result<Demand, ListenerError> {
        let offering = self
            .store
            .offering(instance.offering_id)
            .map_err(|e| ListenerError::Failed(e.to_string()))?
            .ok_or_else(|| {
                ListenerError::Failed(format!("offering {} not found", instance.offering_id))
            })?;
        Ok(Demand::from(&offering))
    }
}

fn failed(err: StoreError) -> ListenerError {
    ListenerError::Failed(err.to_string())
}

impl StateListener for CapacityManager {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn pre_transition(&self, change: &TransitionRecord<'_>) -> Result<(), ListenerError> {
        let old = charge_of(change.before);
        let new = charge_of(change.after);
        let Some((host, CapacityBucket::Reserved)) = new else {
            return Ok(());
        };
        if old == new {
            return Ok(());
        }
        let demand = self.demand_of(change.after)?;
        if self.reserve(host, demand).map_err(failed)? {
            debug!(instance = %change.after.id, %host, "capacity reserved");
            Ok(())
        } else {
            Err(ListenerError::InsufficientCapacity {
                host,
                detail: format!(
                    "needs {} MHz / {} MB",
                    demand.cpu_mhz, demand.memory_mb
                ),
            })
        }
    }

    fn post_transition(
        &self,
        change: &TransitionRecord<'_>,
        committed: bool,
    ) -> Result<(), ListenerError> {
        let old = charge_of(change.before);
        let new = charge_of(change.after);
        if old == new {
            return Ok(());
        }
        let demand = self.demand_of(change.after)?;
        let pre_reserved = match new {
            Some((host, CapacityBucket::Reserved)) => Some(host),
            _ => None,
        };
        if !committed {
            if let Some(host) = pre_reserved {
                self.release_reservation(host, demand).map_err(failed)?;
            }
            return Ok(());
        }
        if let Some((host, bucket)) = old {
            self.shift(host, bucket, demand, -1).map_err(failed)?;
        }
        if let Some((host, CapacityBucket::Used)) = new {
            self.shift(host, CapacityBucket::Used, demand, 1).map_err(failed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::model::{HostStatus, HypervisorType};
    use crate::state::{Event, StateMachine, TransitionError};
    use crate::store::{FleetStore, MemStore, contract};

    fn setup() -> (StateMachine, Arc<MemStore>, Arc<CapacityManager>) {
        let store = Arc::new(MemStore::new());
        for id in [1, 2] {
            store
                .upsert_host(&HostRecord {
                    id: HostId(id),
                    name: format!("h{id}"),
                    zone_id: 1,
                    pod_id: 1,
                    cluster_id: 1,
                    hypervisor: HypervisorType::Simulator,
                    status: HostStatus::Up,
                    enabled: true,
                    private_ip: format!("10.0.0.{id}"),
                    cpus: 2,
                    cpu_speed_mhz: 1000,
                    memory_mb: 2048,
                })
                .unwrap();
        }
        store
            .upsert_offering(&ServiceOffering {
                id: 1,
                name: "small".into(),
                cpus: 1,
                cpu_speed_mhz: 1500,
                memory_mb: 1024,
                ha_enabled: true,
                local_storage: false,
            })
            .unwrap();
        let capacity = Arc::new(CapacityManager::new(store.clone(), &PlannerConfig::default()));
        let machine = StateMachine::new(store.clone(), Arc::new(ManualClock::new(1)))
            .with_listener(capacity.clone());
        (machine, store, capacity)
    }

    #[test]
    fn charge_follows_the_instance_through_its_lifecycle() {
        let (machine, store, capacity) = setup();
        let vm = contract::instance(1, "u1");
        store.insert_instance(&vm).unwrap();

        let vm = machine
            .transition(&vm, Event::StartRequested, Some(HostId(1)), None)
            .unwrap();
        let usage = capacity.usage(HostId(1)).unwrap();
        assert_eq!((usage.reserved_cpu_mhz, usage.used_cpu_mhz), (1500, 0));

        let vm = machine
            .transition(&vm, Event::OperationSucceeded, None, None)
            .unwrap();
        let usage = capacity.usage(HostId(1)).unwrap();
        assert_eq!((usage.reserved_cpu_mhz, usage.used_cpu_mhz), (0, 1500));
        assert_eq!(usage.used_memory_mb, 1024);

        let vm = machine
            .transition(&vm, Event::StopRequested, None, None)
            .unwrap();
        machine
            .transition(&vm, Event::OperationSucceeded, None, None)
            .unwrap();
        assert_eq!(capacity.usage(HostId(1)).unwrap(), HostCapacity::default());
    }

    #[test]
    fn full_host_vetoes_start() {
        let (machine, store, capacity) = setup();
        let a = contract::instance(1, "a");
        let b = contract::instance(2, "b");
        store.insert_instance(&a).unwrap();
        store.insert_instance(&b).unwrap();
        machine
            .transition(&a, Event::StartRequested, Some(HostId(1)), None)
            .unwrap();
        let err = machine
            .transition(&b, Event::StartRequested, Some(HostId(1)), None)
            .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Vetoed {
                source: ListenerError::InsufficientCapacity { .. },
                ..
            }
        ));
        assert_eq!(capacity.usage(HostId(1)).unwrap().reserved_cpu_mhz, 1500);
        machine
            .transition(&b, Event::StartRequested, Some(HostId(2)), None)
            .unwrap();
    }

    #[test]
    fn retry_moves_reservation_and_stale_commit_undoes_it() {
        let (machine, store, capacity) = setup();
        let vm = contract::instance(1, "u1");
        store.insert_instance(&vm).unwrap();
        let starting = machine
            .transition(&vm, Event::StartRequested, Some(HostId(1)), None)
            .unwrap();
        let retried = machine
            .transition(&starting, Event::OperationRetry, Some(HostId(2)), None)
            .unwrap();
        assert_eq!(capacity.usage(HostId(1)).unwrap(), HostCapacity::default());
        assert_eq!(capacity.usage(HostId(2)).unwrap().reserved_memory_mb, 1024);

        // Writing from an outdated row loses the CAS; its pre-reservation is returned.
        let err = machine
            .transition(&vm, Event::StartRequested, Some(HostId(1)), None)
            .unwrap_err();
        assert!(matches!(err, TransitionError::Stale { .. }));
        assert_eq!(capacity.usage(HostId(1)).unwrap(), HostCapacity::default());

        machine
            .transition(&retried, Event::OperationFailed, None, None)
            .unwrap();
        assert_eq!(capacity.usage(HostId(2)).unwrap(), HostCapacity::default());
    }

    #[test]
    fn explicit_reservation_respects_overprovisioning() {
        let (_machine, store, _) = setup();
        let generous = CapacityManager::new(
            store.clone(),
            &PlannerConfig {
                cpu_overprovisioning: 2.0,
                ..PlannerConfig::default()
            },
        );
        let demand = Demand {
            cpu_mhz: 3000,
            memory_mb: 512,
        };
        assert!(generous.reserve(HostId(1), demand).unwrap());
        assert!(!generous.reserve(HostId(1), demand).unwrap());
        generous.release_reservation(HostId(1), demand).unwrap();
        assert_eq!(generous.usage(HostId(1)).unwrap(), HostCapacity::default());
    }
}
