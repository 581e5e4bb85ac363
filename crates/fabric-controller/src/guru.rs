//! Per-VM-type lifecycle hooks.
//!
//! Each [`VmType`] has one [`VmGuru`] registered in a [`GuruRegistry`] that
//! is built at startup and handed to the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use fabric_protocol::Answer;

use crate::model::{Instance, VmType};
use crate::planner::Destination;
use crate::profile::VmProfile;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GuruError {
    #[error("no guru registered for {0:?}")]
    Missing(VmType),
    #[error("{guru}: {reason}")]
    Rejected { guru: &'static str, reason: String },
}

pub trait VmGuru: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fill type-specific parts of the profile before placement.
    fn finalize_profile(&self, profile: &mut VmProfile) -> Result<(), GuruError>;

    /// Adjust the profile once a destination is known, before Start is sent.
    fn finalize_deployment(
        &self,
        profile: &mut VmProfile,
        dest: &Destination,
    ) -> Result<(), GuruError>;

    /// Confirm the agent's Start answer. An error fails the attempt.
    fn finalize_start(
        &self,
        profile: &VmProfile,
        dest: &Destination,
        answer: &Answer,
    ) -> Result<(), GuruError>;

    fn finalize_stop(&self, _instance: &Instance, _answer: Option<&Answer>) {}

    fn finalize_expunge(&self, _instance: &Instance) -> Result<(), GuruError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct GuruRegistry {
    gurus: HashMap<VmType, Arc<dyn VmGuru>>,
}

impl GuruRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// User guru for user VMs, system guru for everything else.
    pub fn standard() -> Self {
        let system = Arc::new(SystemVmGuru);
        Self::new()
            .register(VmType::User, Arc::new(UserVmGuru))
            .register(VmType::DomainRouter, system.clone())
            .register(VmType::ConsoleProxy, system.clone())
            .register(VmType::SecondaryStorageVm, system)
    }

    pub fn register(mut self, vm_type: VmType, guru: Arc<dyn VmGuru>) -> Self {
        self.gurus.insert(vm_type, guru);
        self
    }

    pub fn get(&self, vm_type: VmType) -> Result<Arc<dyn VmGuru>, GuruError> {
        self.gurus
            .get(&vm_type)
            .cloned()
            .ok_or(GuruError::Missing(vm_type))
    }
}

fn require_success(guru: &'static str, answer: &Answer) -> Result<(), GuruError> {
    if answer.result {
        Ok(())
    } else {
        Err(GuruError::Rejected {
            guru,
            reason: answer.details_or_default().to_string(),
        })
    }
}

pub struct UserVmGuru;

impl VmGuru for UserVmGuru {
    fn name(&self) -> &'static str {
        "user"
    }

    fn finalize_profile(&self, profile: &mut VmProfile) -> Result<(), GuruError> {
        if let Some(data) = profile.instance.detail("user_data") {
            profile.user_data = Some(data.as_bytes().to_vec());
        }
        if let Some(template) = profile.instance.detail("template_name") {
            profile.template = template.to_string();
        }
        Ok(())
    }

    fn finalize_deployment(
        &self,
        profile: &mut VmProfile,
        dest: &Destination,
    ) -> Result<(), GuruError> {
        profile
            .boot_args
            .insert("host_name".into(), dest.host.name.clone());
        Ok(())
    }

    fn finalize_start(
        &self,
        _profile: &VmProfile,
        _dest: &Destination,
        answer: &Answer,
    ) -> Result<(), GuruError> {
        require_success(self.name(), answer)
    }
}

/// Routers, console proxies and storage VMs: boot arguments carry the role.
pub struct SystemVmGuru;

impl VmGuru for SystemVmGuru {
    fn name(&self) -> &'static str {
        "system"
    }

    fn finalize_profile(&self, profile: &mut VmProfile) -> Result<(), GuruError> {
        let role = profile.instance.vm_type.as_str().to_string();
        profile.boot_args.insert("type".into(), role);
        profile
            .boot_args
            .insert("zone".into(), profile.instance.zone_id.to_string());
        Ok(())
    }

    fn finalize_deployment(
        &self,
        profile: &mut VmProfile,
        dest: &Destination,
    ) -> Result<(), GuruError> {
        profile
            .boot_args
            .insert("pod".into(), dest.host.pod_id.to_string());
        profile
            .boot_args
            .insert("mgmt_host".into(), dest.host.private_ip.clone());
        Ok(())
    }

    fn finalize_start(
        &self,
        _profile: &VmProfile,
        _dest: &Destination,
        answer: &Answer,
    ) -> Result<(), GuruError> {
        require_success(self.name(), answer)
    }
}
