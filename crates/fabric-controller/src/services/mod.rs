//! Narrow interfaces to the collaborators the orchestrator drives but does
//! not own: storage volumes, guest networking and account limits.

mod mem;

pub use mem::{MemLimits, MemNetworks, MemVolumes};

use async_trait::async_trait;

use fabric_protocol::{DiskSpec, NicSpec};

use crate::capacity::Demand;
use crate::model::{AccountId, ClusterId, HostId, Instance, InstanceId, NetworkId, PodId, PoolId};
use crate::planner::Destination;
use crate::profile::VmProfile;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// Temporary shortage; another destination may succeed.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::ResourceUnavailable(_) | ServiceError::InsufficientCapacity(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootVolume {
    pub volume_id: u64,
    pub size_gb: u64,
    /// Set once the volume has been created on primary storage.
    pub pool_id: Option<PoolId>,
    pub pod_id: Option<PodId>,
    pub cluster_id: Option<ClusterId>,
    pub ready: bool,
}

#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Record a placeholder root volume; nothing is created on storage yet.
    async fn allocate_root(&self, instance: &Instance, size_gb: u64)
    -> Result<RootVolume, ServiceError>;

    async fn root_volume(&self, instance: InstanceId) -> Result<Option<RootVolume>, ServiceError>;

    /// Create or attach the instance's volumes for `dest`.
    async fn prepare(
        &self,
        profile: &VmProfile,
        dest: &Destination,
    ) -> Result<Vec<DiskSpec>, ServiceError>;

    /// Undo per-attempt attachment on `host`.
    async fn release(&self, instance: InstanceId, host: HostId) -> Result<(), ServiceError>;

    async fn destroy(&self, instance: InstanceId) -> Result<(), ServiceError>;

    /// Undo `destroy` for an instance being recovered.
    async fn recover(&self, instance: InstanceId) -> Result<(), ServiceError>;

    async fn expunge(&self, instance: InstanceId) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn allocate_nics(
        &self,
        instance: &Instance,
        networks: &[NetworkId],
    ) -> Result<Vec<NicSpec>, ServiceError>;

    /// Reserve addresses and program the network for `dest`.
    async fn prepare(
        &self,
        profile: &VmProfile,
        dest: &Destination,
    ) -> Result<Vec<NicSpec>, ServiceError>;

    async fn release(&self, instance: InstanceId) -> Result<(), ServiceError>;

    async fn prepare_migration(
        &self,
        profile: &VmProfile,
        dest: &Destination,
    ) -> Result<(), ServiceError>;

    async fn commit_migration(
        &self,
        instance: InstanceId,
        source: HostId,
        dest: HostId,
    ) -> Result<(), ServiceError>;

    async fn rollback_migration(&self, instance: InstanceId, dest: HostId)
    -> Result<(), ServiceError>;

    /// Record one more NIC on `network`. It gets an address right away when
    /// the instance's NICs are already programmed on a host.
    async fn add_nic(&self, instance: &Instance, network: NetworkId)
    -> Result<NicSpec, ServiceError>;

    /// Forget the NIC on `network`, returning it if there was one.
    async fn remove_nic(
        &self,
        instance: InstanceId,
        network: NetworkId,
    ) -> Result<Option<NicSpec>, ServiceError>;

    async fn nics(&self, instance: InstanceId) -> Result<Vec<NicSpec>, ServiceError>;

    /// Drop every NIC record; used on expunge.
    async fn cleanup_nics(&self, instance: InstanceId) -> Result<(), ServiceError>;
}

pub trait ResourceLimiter: Send + Sync {
    /// Count a new instance against `account`, refusing past its limit.
    fn reserve(&self, account: AccountId, demand: Demand) -> Result<(), ServiceError>;
    fn release(&self, account: AccountId, demand: Demand);
}
