//! Placement: turn a [`DeploymentPlan`] plus an [`ExcludeList`] into a
//! concrete [`Destination`].
//!
//! The chain walks its planners in order. A planner that declines
//! (`can_handle` is false) is skipped; one that accepts but finds nothing
//! passes the request on to the next. The caller owns the exclusion list
//! and grows it between attempts.

mod explicit;
mod first_fit;

pub use explicit::ExplicitHostPlanner;
pub use first_fit::FirstFitPlanner;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::model::{ClusterId, HostId, HostRecord, PodId, PoolId, ZoneId};
use crate::profile::VmProfile;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPlan {
    pub zone_id: ZoneId,
    pub pod_id: Option<PodId>,
    pub cluster_id: Option<ClusterId>,
    pub host_id: Option<HostId>,
    pub pool_id: Option<PoolId>,
}

impl DeploymentPlan {
    pub fn zone(zone_id: ZoneId) -> Self {
        Self {
            zone_id,
            pod_id: None,
            cluster_id: None,
            host_id: None,
            pool_id: None,
        }
    }

    pub fn is_narrowed(&self) -> bool {
        self.pod_id.is_some() || self.cluster_id.is_some() || self.pool_id.is_some()
    }

    /// Whether `host` satisfies the plan's pod/cluster constraints.
    pub fn admits(&self, host: &HostRecord) -> bool {
        host.zone_id == self.zone_id
            && self.pod_id.is_none_or(|p| p == host.pod_id)
            && self.cluster_id.is_none_or(|c| c == host.cluster_id)
            && self.host_id.is_none_or(|h| h == host.id)
    }
}

/// Hosts, pods, clusters and pools already tried and rejected. Only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeList {
    hosts: BTreeSet<HostId>,
    pods: BTreeSet<PodId>,
    clusters: BTreeSet<ClusterId>,
    pools: BTreeSet<PoolId>,
}

impl ExcludeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self, host: HostId) {
        self.hosts.insert(host);
    }

    pub fn add_pod(&mut self, pod: PodId) {
        self.pods.insert(pod);
    }

    pub fn add_cluster(&mut self, cluster: ClusterId) {
        self.clusters.insert(cluster);
    }

    pub fn add_pool(&mut self, pool: PoolId) {
        self.pools.insert(pool);
    }

    pub fn should_avoid(&self, host: &HostRecord) -> bool {
        self.hosts.contains(&host.id)
            || self.pods.contains(&host.pod_id)
            || self.clusters.contains(&host.cluster_id)
    }

    pub fn avoids_pool(&self, pool: PoolId) -> bool {
        self.pools.contains(&pool)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostId> {
        self.hosts.iter()
    }

    pub fn len(&self) -> usize {
        self.hosts.len() + self.pods.len() + self.clusters.len() + self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every entry of `other` is also here.
    pub fn contains_all(&self, other: &ExcludeList) -> bool {
        other.hosts.is_subset(&self.hosts)
            && other.pods.is_subset(&self.pods)
            && other.clusters.is_subset(&self.clusters)
            && other.pools.is_subset(&self.pools)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: HostRecord,
    pub pool_id: Option<PoolId>,
}

impl Destination {
    pub fn host_id(&self) -> HostId {
        self.host.id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub trait DeploymentPlanner: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, profile: &VmProfile, plan: &DeploymentPlan, avoid: &ExcludeList) -> bool;

    fn plan(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Option<Destination>, PlannerError>;
}

#[derive(Clone, Default)]
pub struct PlannerChain {
    planners: Vec<Arc<dyn DeploymentPlanner>>,
}

impl PlannerChain {
    pub fn new(planners: Vec<Arc<dyn DeploymentPlanner>>) -> Self {
        Self { planners }
    }

    pub fn plan(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Option<Destination>, PlannerError> {
        for planner in &self.planners {
            if !planner.can_handle(profile, plan, avoid) {
                continue;
            }
            if let Some(dest) = planner.plan(profile, plan, avoid)? {
                debug!(
                    instance = %profile.instance.id,
                    planner = planner.name(),
                    host = %dest.host.id,
                    "destination found"
                );
                return Ok(Some(dest));
            }
            debug!(instance = %profile.instance.id, planner = planner.name(), "no destination");
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::model::{HostStatus, HypervisorType, ServiceOffering};
    use crate::store::{FleetStore, MemStore, contract};

    pub fn host(id: u64, pod: PodId, cluster: ClusterId) -> HostRecord {
        HostRecord {
            id: HostId(id),
            name: format!("h{id}"),
            zone_id: 1,
            pod_id: pod,
            cluster_id: cluster,
            hypervisor: HypervisorType::Simulator,
            status: HostStatus::Up,
            enabled: true,
            private_ip: format!("10.0.0.{id}"),
            cpus: 2,
            cpu_speed_mhz: 1000,
            memory_mb: 2048,
        }
    }

    pub fn offering() -> ServiceOffering {
        ServiceOffering {
            id: 1,
            name: "small".into(),
            cpus: 1,
            cpu_speed_mhz: 1000,
            memory_mb: 1024,
            ha_enabled: true,
            local_storage: false,
        }
    }

    pub fn profile() -> VmProfile {
        VmProfile::new(contract::instance(1, "u1"), offering())
    }

    pub fn store(hosts: &[HostRecord]) -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        for h in hosts {
            store.upsert_host(h).unwrap();
        }
        store.upsert_offering(&offering()).unwrap();
        store
    }
}
