//! Shared fixture for the integration tests.
//!
//! Each integration test compiles this module separately, so some helpers
//! look unused from any single test file.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use fabric_controller::clock::ManualClock;
use fabric_controller::config::{ChannelConfig, LedgerConfig};
use fabric_controller::model::{
    HostRecord, HostStatus, HypervisorType, Instance, InstanceId, ServiceOffering, State,
};
use fabric_controller::services::{MemLimits, MemNetworks, MemVolumes};
use fabric_controller::store::DynStore;
use fabric_controller::usage::UsageLog;
use fabric_controller::{
    AllocateRequest, ControllerConfig, MemStore, Orchestrator, RecoveryTask, SimulatedFleet,
    SqliteStore,
};
use fabric_protocol::{AgentEvent, HostId};

pub const ACCOUNT: u64 = 2;
pub const SMALL: u64 = 1;
/// Takes a whole host.
pub const LARGE: u64 = 2;
pub const NO_HA: u64 = 3;

pub const HOST_CPUS: u32 = 8;
pub const HOST_MHZ: u32 = 2000;
pub const HOST_MEMORY_MB: u64 = 16 * 1024;

/// Short timeouts so failure paths finish quickly.
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        ledger: LedgerConfig {
            inactivity_timeout: Duration::from_secs(600),
            wait_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(600),
        },
        channel: ChannelConfig {
            command_timeout: Duration::from_secs(5),
            migrate_timeout: Duration::from_secs(10),
            check_timeout: Duration::from_secs(2),
        },
        ..ControllerConfig::default()
    }
}

pub fn host(id: u64) -> HostRecord {
    HostRecord {
        id: HostId(id),
        name: format!("sim-{id}"),
        zone_id: 1,
        pod_id: 1,
        cluster_id: 1,
        hypervisor: HypervisorType::Simulator,
        status: HostStatus::Up,
        enabled: true,
        private_ip: format!("10.0.0.{id}"),
        cpus: HOST_CPUS,
        cpu_speed_mhz: HOST_MHZ,
        memory_mb: HOST_MEMORY_MB,
    }
}

fn offerings() -> Vec<ServiceOffering> {
    vec![
        ServiceOffering {
            id: SMALL,
            name: "small".into(),
            cpus: 1,
            cpu_speed_mhz: 1000,
            memory_mb: 1024,
            ha_enabled: true,
            local_storage: false,
        },
        ServiceOffering {
            id: LARGE,
            name: "large".into(),
            cpus: HOST_CPUS,
            cpu_speed_mhz: HOST_MHZ,
            memory_mb: 8 * 1024,
            ha_enabled: true,
            local_storage: false,
        },
        ServiceOffering {
            id: NO_HA,
            name: "no-ha".into(),
            cpus: 1,
            cpu_speed_mhz: 1000,
            memory_mb: 1024,
            ha_enabled: false,
            local_storage: false,
        },
    ]
}

pub struct Fixture {
    pub orch: Arc<Orchestrator>,
    pub store: DynStore,
    pub fleet: Arc<SimulatedFleet>,
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
    pub recovery: mpsc::UnboundedReceiver<RecoveryTask>,
    pub clock: Arc<ManualClock>,
    pub volumes: Arc<MemVolumes>,
    pub networks: Arc<MemNetworks>,
    pub limits: Arc<MemLimits>,
    pub usage: Arc<UsageLog>,
    _dir: Option<TempDir>,
}

impl Fixture {
    /// `hosts` simulated hosts on an in-memory store.
    pub fn new(hosts: u64) -> Self {
        Self::build(Arc::new(MemStore::new()), hosts, test_config(), None)
    }

    pub fn with_config(hosts: u64, config: ControllerConfig) -> Self {
        Self::build(Arc::new(MemStore::new()), hosts, config, None)
    }

    /// Same fleet on a SQLite file in a temp dir.
    pub fn sqlite(hosts: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("fleet.db")).unwrap();
        Self::build(Arc::new(store), hosts, test_config(), Some(dir))
    }

    fn build(store: DynStore, hosts: u64, config: ControllerConfig, dir: Option<TempDir>) -> Self {
        let (fleet, events) = SimulatedFleet::new();
        let fleet = Arc::new(fleet);
        for n in 1..=hosts {
            store.upsert_host(&host(n)).unwrap();
            fleet.add_host(HostId(n));
        }
        for offering in offerings() {
            store.upsert_offering(&offering).unwrap();
        }

        let clock = Arc::new(ManualClock::new(1_000_000));
        let volumes = Arc::new(MemVolumes::new());
        let networks = Arc::new(MemNetworks::new());
        let limits = Arc::new(MemLimits::new(50));
        let usage = Arc::new(UsageLog::new());
        let (orch, recovery) = Orchestrator::builder(store.clone(), fleet.clone())
            .config(config)
            .clock(clock.clone())
            .volumes(volumes.clone())
            .networks(networks.clone())
            .limits(limits.clone())
            .usage(usage.clone())
            .build();

        Self {
            orch: Arc::new(orch),
            store,
            fleet,
            events,
            recovery,
            clock,
            volumes,
            networks,
            limits,
            usage,
            _dir: dir,
        }
    }

    pub async fn allocate(&self, offering: u64) -> InstanceId {
        let mut request = AllocateRequest::new(ACCOUNT, 1, offering, 1, HypervisorType::Simulator);
        request.networks = vec![100];
        self.orch.allocate(request).await.unwrap()
    }

    /// Allocate and start on whatever host the planner picks.
    pub async fn running(&self, offering: u64) -> Instance {
        let id = self.allocate(offering).await;
        let vm = self.orch.start(id, None).await.unwrap();
        assert_eq!(vm.state, State::Running);
        vm
    }

    pub fn instance(&self, id: InstanceId) -> Instance {
        self.store.instance(id).unwrap().unwrap()
    }

    pub fn state(&self, id: InstanceId) -> State {
        self.instance(id).state
    }

    /// Everything queued for the recovery worker so far.
    pub fn drain_recovery(&mut self) -> Vec<RecoveryTask> {
        let mut tasks = Vec::new();
        while let Ok(task) = self.recovery.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    /// Pieces a daemon takes ownership of.
    pub fn split(
        self,
    ) -> (
        Arc<Orchestrator>,
        Arc<SimulatedFleet>,
        mpsc::UnboundedReceiver<RecoveryTask>,
        mpsc::UnboundedReceiver<AgentEvent>,
    ) {
        (self.orch, self.fleet, self.recovery, self.events)
    }

    pub fn drain_events(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// (cpu MHz, memory MB) charged to `host`, used plus reserved.
    pub fn allocated(&self, host: u64) -> (u64, u64) {
        let usage = self.orch.capacity().usage(HostId(host)).unwrap();
        (usage.allocated_cpu_mhz(), usage.allocated_memory_mb())
    }

    pub fn assert_no_capacity_charged(&self, hosts: u64) {
        for n in 1..=hosts {
            assert_eq!(self.allocated(n), (0, 0), "host-{n} still charged");
        }
    }
}
