use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use fabric_protocol::{DiskSpec, NicSpec};

use super::{NetworkService, ResourceLimiter, RootVolume, ServiceError, VolumeService};
use crate::capacity::Demand;
use crate::model::{AccountId, HostId, Instance, InstanceId, NetworkId};
use crate::planner::Destination;
use crate::profile::VmProfile;

fn poisoned() -> ServiceError {
    ServiceError::Failed("service state poisoned".into())
}

#[derive(Debug, Clone)]
struct VolumeRow {
    root: RootVolume,
    attached_to: Option<HostId>,
    destroyed: bool,
}

#[derive(Default)]
struct VolumeTables {
    next_id: u64,
    rows: HashMap<InstanceId, VolumeRow>,
    fail_prepare_on: HashSet<HostId>,
    fail_expunge: bool,
    prepares: usize,
}

/// In-memory volume bookkeeping with injectable failures.
#[derive(Default)]
pub struct MemVolumes {
    inner: Mutex<VolumeTables>,
}

impl MemVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `prepare` report the pool as unavailable for `host`.
    pub fn fail_prepare_on(&self, host: HostId) {
        if let Ok(mut t) = self.inner.lock() {
            t.fail_prepare_on.insert(host);
        }
    }

    pub fn fail_expunge(&self, fail: bool) {
        if let Ok(mut t) = self.inner.lock() {
            t.fail_expunge = fail;
        }
    }

    pub fn prepare_calls(&self) -> usize {
        self.inner.lock().map(|t| t.prepares).unwrap_or(0)
    }

    pub fn attached_to(&self, instance: InstanceId) -> Option<HostId> {
        self.inner
            .lock()
            .ok()
            .and_then(|t| t.rows.get(&instance).and_then(|r| r.attached_to))
    }

    pub fn is_destroyed(&self, instance: InstanceId) -> bool {
        self.inner
            .lock()
            .map(|t| t.rows.get(&instance).is_some_and(|r| r.destroyed))
            .unwrap_or(false)
    }

    pub fn exists(&self, instance: InstanceId) -> bool {
        self.inner
            .lock()
            .map(|t| t.rows.contains_key(&instance))
            .unwrap_or(false)
    }

    /// Pretend the root disk was already created on `pool` in `cluster`.
    pub fn place_root(&self, instance: InstanceId, pool: u64, pod: u64, cluster: u64) {
        if let Ok(mut t) = self.inner.lock() {
            if let Some(row) = t.rows.get_mut(&instance) {
                row.root.pool_id = Some(pool);
                row.root.pod_id = Some(pod);
                row.root.cluster_id = Some(cluster);
                row.root.ready = true;
            }
        }
    }
}

#[async_trait]
impl VolumeService for MemVolumes {
    async fn allocate_root(
        &self,
        instance: &Instance,
        size_gb: u64,
    ) -> Result<RootVolume, ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        if let Some(row) = t.rows.get(&instance.id) {
            return Ok(row.root.clone());
        }
        t.next_id += 1;
        let root = RootVolume {
            volume_id: t.next_id,
            size_gb,
            pool_id: None,
            pod_id: None,
            cluster_id: None,
            ready: false,
        };
        t.rows.insert(
            instance.id,
            VolumeRow {
                root: root.clone(),
                attached_to: None,
                destroyed: false,
            },
        );
        Ok(root)
    }

    async fn root_volume(&self, instance: InstanceId) -> Result<Option<RootVolume>, ServiceError> {
        let t = self.inner.lock().map_err(|_| poisoned())?;
        Ok(t.rows.get(&instance).map(|r| r.root.clone()))
    }

    async fn prepare(
        &self,
        profile: &VmProfile,
        dest: &Destination,
    ) -> Result<Vec<DiskSpec>, ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        t.prepares += 1;
        if t.fail_prepare_on.contains(&dest.host.id) {
            return Err(ServiceError::ResourceUnavailable(format!(
                "no usable pool for {}",
                dest.host.id
            )));
        }
        let row = t
            .rows
            .get_mut(&profile.instance.id)
            .ok_or_else(|| ServiceError::NotFound(format!("root volume of {}", profile.instance.id)))?;
        if row.destroyed {
            return Err(ServiceError::Failed("root volume is destroyed".into()));
        }
        if !row.root.ready || row.root.cluster_id != Some(dest.host.cluster_id) {
            row.root.pool_id = Some(dest.pool_id.unwrap_or(100 + dest.host.cluster_id));
            row.root.pod_id = Some(dest.host.pod_id);
            row.root.cluster_id = Some(dest.host.cluster_id);
            row.root.ready = true;
        }
        row.attached_to = Some(dest.host.id);
        let pool_id = row.root.pool_id.unwrap_or_default();
        debug!(instance = %profile.instance.id, pool = pool_id, "root volume prepared");
        Ok(vec![DiskSpec {
            volume_id: row.root.volume_id,
            pool_id,
            path: format!("/pool-{pool_id}/vol-{}", row.root.volume_id),
            size_gb: row.root.size_gb,
        }])
    }

    async fn release(&self, instance: InstanceId, host: HostId) -> Result<(), ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        if let Some(row) = t.rows.get_mut(&instance) {
            if row.attached_to == Some(host) {
                row.attached_to = None;
            }
        }
        Ok(())
    }

    async fn destroy(&self, instance: InstanceId) -> Result<(), ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        if let Some(row) = t.rows.get_mut(&instance) {
            row.destroyed = true;
            row.attached_to = None;
        }
        Ok(())
    }

    async fn recover(&self, instance: InstanceId) -> Result<(), ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        let row = t
            .rows
            .get_mut(&instance)
            .ok_or_else(|| ServiceError::NotFound(format!("root volume of {instance}")))?;
        row.destroyed = false;
        Ok(())
    }

    async fn expunge(&self, instance: InstanceId) -> Result<(), ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        if t.fail_expunge {
            return Err(ServiceError::Failed("primary storage refused delete".into()));
        }
        t.rows.remove(&instance);
        Ok(())
    }
}

#[derive(Default)]
struct NetworkTables {
    nics: HashMap<InstanceId, Vec<NicSpec>>,
    prepared: HashSet<InstanceId>,
    migrating: HashMap<InstanceId, HostId>,
    fail_prepare_on: HashSet<HostId>,
}

/// In-memory NIC bookkeeping with injectable failures.
#[derive(Default)]
pub struct MemNetworks {
    inner: Mutex<NetworkTables>,
}

impl MemNetworks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_prepare_on(&self, host: HostId) {
        if let Ok(mut t) = self.inner.lock() {
            t.fail_prepare_on.insert(host);
        }
    }

    pub fn is_prepared(&self, instance: InstanceId) -> bool {
        self.inner
            .lock()
            .map(|t| t.prepared.contains(&instance))
            .unwrap_or(false)
    }

    pub fn nic_count(&self, instance: InstanceId) -> usize {
        self.inner
            .lock()
            .map(|t| t.nics.get(&instance).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn pending_migration(&self, instance: InstanceId) -> Option<HostId> {
        self.inner
            .lock()
            .ok()
            .and_then(|t| t.migrating.get(&instance).copied())
    }
}

#[async_trait]
impl NetworkService for MemNetworks {
    async fn allocate_nics(
        &self,
        instance: &Instance,
        networks: &[NetworkId],
    ) -> Result<Vec<NicSpec>, ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        let nics: Vec<NicSpec> = networks
            .iter()
            .enumerate()
            .map(|(i, network)| NicSpec {
                device_id: i as u32,
                network_id: *network,
                mac: format!(
                    "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
                    (instance.id.0 >> 16) & 0xff,
                    (instance.id.0 >> 8) & 0xff,
                    instance.id.0 & 0xff,
                    i
                ),
                ip: None,
            })
            .collect();
        t.nics.insert(instance.id, nics.clone());
        Ok(nics)
    }

    async fn prepare(
        &self,
        profile: &VmProfile,
        dest: &Destination,
    ) -> Result<Vec<NicSpec>, ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        if t.fail_prepare_on.contains(&dest.host.id) {
            return Err(ServiceError::ResourceUnavailable(format!(
                "network not implemented on {}",
                dest.host.id
            )));
        }
        let id = profile.instance.id;
        let nics = t.nics.entry(id).or_default();
        for nic in nics.iter_mut() {
            if nic.ip.is_none() {
                nic.ip = Some(format!("10.{}.{}.{}", nic.network_id % 256, (id.0 >> 8) % 256, id.0 % 256));
            }
        }
        let prepared = nics.clone();
        t.prepared.insert(id);
        Ok(prepared)
    }

    async fn release(&self, instance: InstanceId) -> Result<(), ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        t.prepared.remove(&instance);
        Ok(())
    }

    async fn prepare_migration(
        &self,
        profile: &VmProfile,
        dest: &Destination,
    ) -> Result<(), ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        if t.fail_prepare_on.contains(&dest.host.id) {
            return Err(ServiceError::ResourceUnavailable(format!(
                "network not implemented on {}",
                dest.host.id
            )));
        }
        t.migrating.insert(profile.instance.id, dest.host.id);
        Ok(())
    }

    async fn commit_migration(
        &self,
        instance: InstanceId,
        _source: HostId,
        _dest: HostId,
    ) -> Result<(), ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        t.migrating.remove(&instance);
        Ok(())
    }

    async fn rollback_migration(
        &self,
        instance: InstanceId,
        _dest: HostId,
    ) -> Result<(), ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        t.migrating.remove(&instance);
        Ok(())
    }

    async fn add_nic(
        &self,
        instance: &Instance,
        network: NetworkId,
    ) -> Result<NicSpec, ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        let prepared = t.prepared.contains(&instance.id);
        let nics = t.nics.entry(instance.id).or_default();
        if nics.iter().any(|n| n.network_id == network) {
            return Err(ServiceError::Failed(format!(
                "instance {} already has a nic on network {network}",
                instance.id
            )));
        }
        let device_id = nics.iter().map(|n| n.device_id + 1).max().unwrap_or(0);
        let id = instance.id.0;
        let nic = NicSpec {
            device_id,
            network_id: network,
            mac: format!(
                "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
                (id >> 16) & 0xff,
                (id >> 8) & 0xff,
                id & 0xff,
                device_id
            ),
            ip: prepared.then(|| format!("10.{}.{}.{}", network % 256, (id >> 8) % 256, id % 256)),
        };
        nics.push(nic.clone());
        Ok(nic)
    }

    async fn remove_nic(
        &self,
        instance: InstanceId,
        network: NetworkId,
    ) -> Result<Option<NicSpec>, ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        let Some(nics) = t.nics.get_mut(&instance) else {
            return Ok(None);
        };
        let removed = nics
            .iter()
            .position(|n| n.network_id == network)
            .map(|i| nics.remove(i));
        Ok(removed)
    }

    async fn nics(&self, instance: InstanceId) -> Result<Vec<NicSpec>, ServiceError> {
        let t = self.inner.lock().map_err(|_| poisoned())?;
        Ok(t.nics.get(&instance).cloned().unwrap_or_default())
    }

    async fn cleanup_nics(&self, instance: InstanceId) -> Result<(), ServiceError> {
        let mut t = self.inner.lock().map_err(|_| poisoned())?;
        t.nics.remove(&instance);
        t.prepared.remove(&instance);
        t.migrating.remove(&instance);
        Ok(())
    }
}

/// Per-account instance count limit.
pub struct MemLimits {
    max_instances: u32,
    counts: Mutex<HashMap<AccountId, u32>>,
}

impl Default for MemLimits {
    fn default() -> Self {
        Self::new(u32::MAX)
    }
}

impl MemLimits {
    pub fn new(max_instances: u32) -> Self {
        Self {
            max_instances,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn count(&self, account: AccountId) -> u32 {
        self.counts
            .lock()
            .map(|c| c.get(&account).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl ResourceLimiter for MemLimits {
    fn reserve(&self, account: AccountId, _demand: Demand) -> Result<(), ServiceError> {
        let mut counts = self.counts.lock().map_err(|_| poisoned())?;
        let count = counts.entry(account).or_insert(0);
        if *count >= self.max_instances {
            return Err(ServiceError::LimitExceeded(format!(
                "account {account} may own at most {} instances",
                self.max_instances
            )));
        }
        *count += 1;
        Ok(())
    }

    fn release(&self, account: AccountId, _demand: Demand) {
        if let Ok(mut counts) = self.counts.lock() {
            if let Some(count) = counts.get_mut(&account) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::fixtures;

    fn dest(host: u64, cluster: u64) -> Destination {
        Destination {
            host: fixtures::host(host, 1, cluster),
            pool_id: None,
        }
    }

    #[tokio::test]
    async fn root_volume_is_created_on_first_prepare() {
        let volumes = MemVolumes::new();
        let profile = fixtures::profile();
        let root = volumes.allocate_root(&profile.instance, 20).await.unwrap();
        assert!(!root.ready);
        // Allocation is idempotent per instance.
        assert_eq!(
            volumes.allocate_root(&profile.instance, 20).await.unwrap(),
            root
        );

        let disks = volumes.prepare(&profile, &dest(1, 3)).await.unwrap();
        assert_eq!(disks[0].pool_id, 103);
        let root = volumes.root_volume(profile.instance.id).await.unwrap().unwrap();
        assert!(root.ready);
        assert_eq!(root.cluster_id, Some(3));
        assert_eq!(volumes.attached_to(profile.instance.id), Some(HostId(1)));

        volumes.release(profile.instance.id, HostId(1)).await.unwrap();
        assert_eq!(volumes.attached_to(profile.instance.id), None);
    }

    #[tokio::test]
    async fn injected_failures_are_retryable() {
        let volumes = MemVolumes::new();
        let networks = MemNetworks::new();
        let profile = fixtures::profile();
        volumes.allocate_root(&profile.instance, 20).await.unwrap();
        volumes.fail_prepare_on(HostId(1));
        networks.fail_prepare_on(HostId(2));
        assert!(volumes
            .prepare(&profile, &dest(1, 1))
            .await
            .unwrap_err()
            .is_retryable());
        assert!(networks
            .prepare(&profile, &dest(2, 1))
            .await
            .unwrap_err()
            .is_retryable());
    }

    #[tokio::test]
    async fn nics_get_addresses_when_prepared() {
        let networks = MemNetworks::new();
        let profile = fixtures::profile();
        let nics = networks
            .allocate_nics(&profile.instance, &[200, 201])
            .await
            .unwrap();
        assert_eq!(nics.len(), 2);
        assert!(nics.iter().all(|n| n.ip.is_none()));
        let prepared = networks.prepare(&profile, &dest(1, 1)).await.unwrap();
        assert!(prepared.iter().all(|n| n.ip.is_some()));
        assert!(networks.is_prepared(profile.instance.id));
        networks.cleanup_nics(profile.instance.id).await.unwrap();
        assert_eq!(networks.nic_count(profile.instance.id), 0);
    }

    #[tokio::test]
    async fn added_nics_take_the_next_device() {
        let networks = MemNetworks::new();
        let profile = fixtures::profile();
        let id = profile.instance.id;
        networks.allocate_nics(&profile.instance, &[200]).await.unwrap();

        let cold = networks.add_nic(&profile.instance, 300).await.unwrap();
        assert_eq!(cold.device_id, 1);
        assert!(cold.ip.is_none());
        assert!(networks.add_nic(&profile.instance, 300).await.is_err());

        networks.prepare(&profile, &dest(1, 1)).await.unwrap();
        let hot = networks.add_nic(&profile.instance, 301).await.unwrap();
        assert_eq!(hot.device_id, 2);
        assert!(hot.ip.is_some());

        // Programming the host addressed the cold NIC too.
        let removed = networks.remove_nic(id, 300).await.unwrap().unwrap();
        assert_eq!(removed.device_id, cold.device_id);
        assert!(removed.ip.is_some());
        assert_eq!(networks.remove_nic(id, 300).await.unwrap(), None);
        assert_eq!(networks.nic_count(id), 2);
    }

    #[test]
    fn limits_refuse_past_max() {
        let limits = MemLimits::new(1);
        let demand = Demand {
            cpu_mhz: 1,
            memory_mb: 1,
        };
        limits.reserve(2, demand).unwrap();
        assert!(matches!(
            limits.reserve(2, demand),
            Err(ServiceError::LimitExceeded(_))
        ));
        limits.release(2, demand);
        limits.reserve(2, demand).unwrap();
    }
}
