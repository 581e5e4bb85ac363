use std::sync::Arc;

use tracing::debug;

use super::{DeploymentPlan, DeploymentPlanner, Destination, ExcludeList, PlannerError};
use crate::capacity::CapacityManager;
use crate::profile::VmProfile;
use crate::store::DynStore;

/// Honors a caller-pinned host (`plan.host_id`) and nothing else.
pub struct ExplicitHostPlanner {
    store: DynStore,
    capacity: Arc<CapacityManager>,
}

impl ExplicitHostPlanner {
    pub fn new(store: DynStore, capacity: Arc<CapacityManager>) -> Self {
        Self { store, capacity }
    }
}

impl DeploymentPlanner for ExplicitHostPlanner {
    fn name(&self) -> &'static str {
        "explicit-host"
    }

    fn can_handle(&self, _profile: &VmProfile, plan: &DeploymentPlan, _avoid: &ExcludeList) -> bool {
        plan.host_id.is_some()
    }

    fn plan(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Option<Destination>, PlannerError> {
        let Some(host_id) = plan.host_id else {
            return Ok(None);
        };
        let Some(host) = self.store.host(host_id)? else {
            debug!(host = %host_id, "pinned host does not exist");
            return Ok(None);
        };
        if avoid.should_avoid(&host)
            || !host.is_available()
            || !plan.admits(&host)
            || host.hypervisor != profile.instance.hypervisor
            || !self.capacity.has_room(&host, profile.demand())?
        {
            debug!(host = %host_id, "pinned host is not usable");
            return Ok(None);
        }
        Ok(Some(Destination {
            host,
            pool_id: plan.pool_id,
        }))
    }
}
