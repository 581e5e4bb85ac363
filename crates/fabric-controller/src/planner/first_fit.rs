use std::cmp::Reverse;
use std::sync::Arc;

use super::{DeploymentPlan, DeploymentPlanner, Destination, ExcludeList, PlannerError};
use crate::capacity::CapacityManager;
use crate::config::HostOrdering;
use crate::model::HostRecord;
use crate::profile::VmProfile;
use crate::store::DynStore;

/// Scans the zone's hosts in the configured order and returns the first
/// one that is up, matches the hypervisor and plan constraints, is not
/// excluded, and has room for the offering.
pub struct FirstFitPlanner {
    store: DynStore,
    capacity: Arc<CapacityManager>,
    ordering: HostOrdering,
}

impl FirstFitPlanner {
    pub fn new(store: DynStore, capacity: Arc<CapacityManager>, ordering: HostOrdering) -> Self {
        Self {
            store,
            capacity,
            ordering,
        }
    }

    fn order(&self, profile: &VmProfile, hosts: &mut [HostRecord]) -> Result<(), PlannerError> {
        hosts.sort_by_key(|h| h.id);
        match self.ordering {
            HostOrdering::FirstFit => {}
            HostOrdering::LastHostFirst => {
                if let Some(last) = profile.instance.last_host_id {
                    hosts.sort_by_key(|h| h.id != last);
                }
            }
            HostOrdering::LeastLoaded => {
                let mut keyed = Vec::with_capacity(hosts.len());
                for h in hosts.iter() {
                    let usage = self.capacity.usage(h.id)?;
                    let free = self
                        .capacity
                        .limit(h)
                        .memory_mb
                        .saturating_sub(usage.allocated_memory_mb());
                    keyed.push((h.id, free));
                }
                hosts.sort_by_key(|h| {
                    let free = keyed
                        .iter()
                        .find(|(id, _)| *id == h.id)
                        .map(|(_, f)| *f)
                        .unwrap_or(0);
                    Reverse(free)
                });
            }
        }
        Ok(())
    }
}

impl DeploymentPlanner for FirstFitPlanner {
    fn name(&self) -> &'static str {
        "first-fit"
    }

    fn can_handle(&self, _profile: &VmProfile, plan: &DeploymentPlan, _avoid: &ExcludeList) -> bool {
        plan.host_id.is_none()
    }

    fn plan(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Option<Destination>, PlannerError> {
        if plan.pool_id.is_some_and(|p| avoid.avoids_pool(p)) {
            return Ok(None);
        }
        let mut hosts: Vec<HostRecord> = self
            .store
            .hosts_in_zone(plan.zone_id)?
            .into_iter()
            .filter(|h| {
                h.is_available()
                    && plan.admits(h)
                    && !avoid.should_avoid(h)
                    && h.hypervisor == profile.instance.hypervisor
            })
            .collect();
        self.order(profile, &mut hosts)?;

        let demand = profile.demand();
        for host in hosts {
            if self.capacity.has_room(&host, demand)? {
                return Ok(Some(Destination {
                    host,
                    pool_id: plan.pool_id,
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::Demand;
    use crate::config::PlannerConfig;
    use crate::model::{HostId, HostStatus, HypervisorType};
    use crate::planner::fixtures;
    use crate::store::FleetStore;

    fn planner(hosts: &[HostRecord], ordering: HostOrdering) -> (FirstFitPlanner, Arc<CapacityManager>) {
        let store = fixtures::store(hosts);
        let capacity = Arc::new(CapacityManager::new(store.clone(), &PlannerConfig::default()));
        (
            FirstFitPlanner::new(store, capacity.clone(), ordering),
            capacity,
        )
    }

    #[test]
    fn skips_excluded_down_full_and_foreign_hosts() {
        let mut down = fixtures::host(1, 1, 1);
        down.status = HostStatus::Down;
        let mut xen = fixtures::host(2, 1, 1);
        xen.hypervisor = HypervisorType::XenServer;
        let full = fixtures::host(3, 1, 1);
        let excluded = fixtures::host(4, 1, 1);
        let good = fixtures::host(5, 1, 1);
        let (planner, capacity) = planner(
            &[down, xen, full, excluded, good],
            HostOrdering::FirstFit,
        );
        assert!(capacity
            .reserve(
                HostId(3),
                Demand {
                    cpu_mhz: 1500,
                    memory_mb: 0
                }
            )
            .unwrap());

        let mut avoid = ExcludeList::new();
        avoid.add_host(HostId(4));
        let dest = planner
            .plan(&fixtures::profile(), &DeploymentPlan::zone(1), &avoid)
            .unwrap()
            .unwrap();
        assert_eq!(dest.host_id(), HostId(5));

        avoid.add_host(HostId(5));
        assert!(planner
            .plan(&fixtures::profile(), &DeploymentPlan::zone(1), &avoid)
            .unwrap()
            .is_none());
    }

    #[test]
    fn last_host_is_preferred() {
        let (planner, _) = planner(
            &[fixtures::host(1, 1, 1), fixtures::host(2, 1, 1)],
            HostOrdering::LastHostFirst,
        );
        let mut profile = fixtures::profile();
        profile.instance.last_host_id = Some(HostId(2));
        let dest = planner
            .plan(&profile, &DeploymentPlan::zone(1), &ExcludeList::new())
            .unwrap()
            .unwrap();
        assert_eq!(dest.host_id(), HostId(2));
    }

    #[test]
    fn least_loaded_prefers_free_memory() {
        let (planner, capacity) = planner(
            &[fixtures::host(1, 1, 1), fixtures::host(2, 1, 1)],
            HostOrdering::LeastLoaded,
        );
        capacity
            .reserve(
                HostId(1),
                Demand {
                    cpu_mhz: 0,
                    memory_mb: 512,
                },
            )
            .unwrap();
        let dest = planner
            .plan(&fixtures::profile(), &DeploymentPlan::zone(1), &ExcludeList::new())
            .unwrap()
            .unwrap();
        assert_eq!(dest.host_id(), HostId(2));
    }

    #[test]
    fn narrowed_plan_stays_in_cluster() {
        let (planner, _) = planner(
            &[fixtures::host(1, 1, 1), fixtures::host(2, 1, 2)],
            HostOrdering::FirstFit,
        );
        let mut plan = DeploymentPlan::zone(1);
        plan.cluster_id = Some(2);
        plan.pool_id = Some(8);
        let dest = planner
            .plan(&fixtures::profile(), &plan, &ExcludeList::new())
            .unwrap()
            .unwrap();
        assert_eq!(dest.host_id(), HostId(2));
        assert_eq!(dest.pool_id, Some(8));

        let mut avoid = ExcludeList::new();
        avoid.add_pool(8);
        assert!(planner.plan(&fixtures::profile(), &plan, &avoid).unwrap().is_none());
    }

    #[test]
    fn store_reads_follow_host_status() {
        let store = fixtures::store(&[fixtures::host(1, 1, 1)]);
        let capacity = Arc::new(CapacityManager::new(store.clone(), &PlannerConfig::default()));
        let planner = FirstFitPlanner::new(store.clone(), capacity, HostOrdering::FirstFit);
        store.set_host_status(HostId(1), HostStatus::Disconnected).unwrap();
        assert!(planner
            .plan(&fixtures::profile(), &DeploymentPlan::zone(1), &ExcludeList::new())
            .unwrap()
            .is_none());
    }
}
