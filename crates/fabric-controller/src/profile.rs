use std::collections::BTreeMap;

use fabric_protocol::{DiskSpec, NicSpec, VmSpec};

use crate::capacity::Demand;
use crate::model::{Instance, ServiceOffering};

/// Everything needed to place and boot one instance, assembled per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct VmProfile {
    pub instance: Instance,
    pub offering: ServiceOffering,
    pub template: String,
    pub nics: Vec<NicSpec>,
    pub disks: Vec<DiskSpec>,
    pub user_data: Option<Vec<u8>>,
    /// Guru-supplied extras passed to the agent (boot args, system VM role).
    pub boot_args: BTreeMap<String, String>,
}

impl VmProfile {
    pub fn new(instance: Instance, offering: ServiceOffering) -> Self {
        let template = format!("template-{}", instance.template_id);
        Self {
            instance,
            offering,
            template,
            nics: Vec::new(),
            disks: Vec::new(),
            user_data: None,
            boot_args: BTreeMap::new(),
        }
    }

    pub fn demand(&self) -> Demand {
        Demand::from(&self.offering)
    }

    pub fn to_spec(&self) -> VmSpec {
        let mut details = self.instance.details.clone();
        details.extend(self.boot_args.clone());
        VmSpec {
            name: self.instance.name.clone(),
            uuid: self.instance.uuid.clone(),
            cpus: self.offering.cpus,
            cpu_speed_mhz: self.offering.cpu_speed_mhz,
            memory_mb: self.offering.memory_mb,
            template: self.template.clone(),
            nics: self.nics.clone(),
            disks: self.disks.clone(),
            user_data: self.user_data.clone(),
            details,
        }
    }
}
