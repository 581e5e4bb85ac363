use std::str::FromStr;
use std::time::Duration;

use fabric_protocol::CommandKind;

use crate::model::NodeId;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Id of this management node; stamped on every work item it creates.
    pub node_id: NodeId,
    /// Extra placement attempts after the first one fails.
    pub start_retry: u32,
    /// Destroy stops a running instance with `forced = true`.
    pub destroy_forces_stop: bool,
    /// Global switch for HA restarts scheduled by reconciliation.
    pub ha_enabled: bool,
    pub ledger: LedgerConfig,
    pub channel: ChannelConfig,
    pub planner: PlannerConfig,
    pub sync: SyncConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            start_retry: 2,
            // Unlike a plain stop, destroy abandons whatever is in flight
            // and does not wait on an unreachable host. Set false to have it
            // queue behind running work and fail when the host is gone.
            destroy_forces_stop: true,
            ha_enabled: true,
            ledger: LedgerConfig::default(),
            channel: ChannelConfig::default(),
            planner: PlannerConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Work ledger timing.
///
/// `inactivity_timeout` is the stale-override policy: an active work item
/// whose `updated_at` is older than this may be abandoned by another
/// acquirer. Setting it below the longest command timeout lets a slow but
/// live operation be overridden, so keep it comfortably above
/// `ChannelConfig::migrate_timeout`.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub inactivity_timeout: Duration,
    /// How long a lifecycle call waits for a conflicting operation to settle.
    pub wait_timeout: Duration,
    /// Poll period while waiting; covers work owned by other nodes.
    pub poll_interval: Duration,
    /// Finished items older than this are reaped.
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(600),
            wait_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub command_timeout: Duration,
    pub migrate_timeout: Duration,
    pub check_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            migrate_timeout: Duration::from_secs(120),
            check_timeout: Duration::from_secs(10),
        }
    }
}

impl ChannelConfig {
    pub fn timeout_for(&self, kind: CommandKind) -> Duration {
        match kind {
            CommandKind::Migrate | CommandKind::PrepareForMigration => self.migrate_timeout,
            CommandKind::CheckVirtualMachine => self.check_timeout,
            _ => self.command_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOrdering {
    /// Hosts in id order.
    FirstFit,
    /// The instance's last host first, then id order.
    LastHostFirst,
    /// Most free memory first.
    LeastLoaded,
}

impl FromStr for HostOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_fit" | "firstfit" => Ok(HostOrdering::FirstFit),
            "last_host_first" => Ok(HostOrdering::LastHostFirst),
            "least_loaded" => Ok(HostOrdering::LeastLoaded),
            other => Err(format!("unknown host ordering '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub cpu_overprovisioning: f64,
    pub memory_overprovisioning: f64,
    pub host_ordering: HostOrdering,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            cpu_overprovisioning: 1.0,
            memory_overprovisioning: 1.0,
            host_ordering: HostOrdering::LastHostFirst,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Transitional instances without live work for this long get re-checked.
    pub stuck_timeout: Duration,
    pub scan_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stuck_timeout: Duration::from_secs(900),
            scan_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid value '{value}' for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

impl ControllerConfig {
    /// Defaults overridden by `FABRIC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<NodeId>("FABRIC_NODE_ID")? {
            cfg.node_id = v;
        }
        if let Some(v) = env_parse::<u32>("FABRIC_START_RETRY")? {
            cfg.start_retry = v;
        }
        if let Some(v) = env_parse::<bool>("FABRIC_HA_ENABLED")? {
            cfg.ha_enabled = v;
        }
        if let Some(v) = env_parse::<bool>("FABRIC_DESTROY_FORCES_STOP")? {
            cfg.destroy_forces_stop = v;
        }
        if let Some(v) = env_secs("FABRIC_WORK_INACTIVITY_SECS")? {
            cfg.ledger.inactivity_timeout = v;
        }
        if let Some(v) = env_secs("FABRIC_WORK_WAIT_SECS")? {
            cfg.ledger.wait_timeout = v;
        }
        if let Some(v) = env_secs("FABRIC_WORK_RETENTION_SECS")? {
            cfg.ledger.retention = v;
        }
        if let Some(v) = env_secs("FABRIC_WORK_CLEANUP_INTERVAL_SECS")? {
            cfg.ledger.cleanup_interval = v;
        }
        if let Some(v) = env_secs("FABRIC_COMMAND_TIMEOUT_SECS")? {
            cfg.channel.command_timeout = v;
        }
        if let Some(v) = env_secs("FABRIC_MIGRATE_TIMEOUT_SECS")? {
            cfg.channel.migrate_timeout = v;
        }
        if let Some(v) = env_parse::<f64>("FABRIC_CPU_OVERPROVISIONING")? {
            cfg.planner.cpu_overprovisioning = v;
        }
        if let Some(v) = env_parse::<f64>("FABRIC_MEMORY_OVERPROVISIONING")? {
            cfg.planner.memory_overprovisioning = v;
        }
        if let Some(v) = env_parse::<HostOrdering>("FABRIC_HOST_ORDERING")? {
            cfg.planner.host_ordering = v;
        }
        if let Some(v) = env_secs("FABRIC_SYNC_STUCK_SECS")? {
            cfg.sync.stuck_timeout = v;
        }
        if let Some(v) = env_secs("FABRIC_SYNC_SCAN_SECS")? {
            cfg.sync.scan_interval = v;
        }
        Ok(cfg)
    }
}

fn env_parse<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError {
                var,
                value,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_secs(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(var)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_timeouts_follow_kind() {
        let cfg = ChannelConfig::default();
        assert_eq!(cfg.timeout_for(CommandKind::Start), Duration::from_secs(30));
        assert_eq!(cfg.timeout_for(CommandKind::Migrate), Duration::from_secs(120));
        assert_eq!(
            cfg.timeout_for(CommandKind::CheckVirtualMachine),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn host_ordering_parses() {
        assert_eq!("first_fit".parse(), Ok(HostOrdering::FirstFit));
        assert_eq!("least_loaded".parse(), Ok(HostOrdering::LeastLoaded));
        assert!("random".parse::<HostOrdering>().is_err());
    }

    #[test]
    fn defaults_keep_stale_override_above_migrate_timeout() {
        let cfg = ControllerConfig::default();
        assert!(cfg.ledger.inactivity_timeout > cfg.channel.migrate_timeout);
        assert_eq!(cfg.start_retry, 2);
    }
}
