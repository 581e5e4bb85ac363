use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};

use super::{
    AcquireOutcome, CommitOutcome, FleetStore, StoreError, StoreResult, WorkStepUpdate,
};
use crate::ledger::{Step, WorkItem, WorkType};
use crate::model::{
    CapacityBucket, CapacityChange, HostCapacity, HostId, HostRecord, HostStatus,
    HypervisorType, Instance, InstanceId, NodeId, OfferingId, PowerState, ServiceOffering, State,
    VmType, ZoneId, apply_delta, fits,
};

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sequences (
    name  TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS instances (
    id               INTEGER PRIMARY KEY,
    uuid             TEXT NOT NULL UNIQUE,
    name             TEXT NOT NULL,
    vm_type          TEXT NOT NULL,
    account_id       INTEGER NOT NULL,
    state            TEXT NOT NULL,
    power_state      TEXT NOT NULL,
    power_host_id    INTEGER,
    power_updated_at INTEGER NOT NULL,
    host_id          INTEGER,
    last_host_id     INTEGER,
    zone_id          INTEGER NOT NULL,
    pod_id           INTEGER,
    cluster_id       INTEGER,
    offering_id      INTEGER NOT NULL,
    template_id      INTEGER NOT NULL,
    hypervisor       TEXT NOT NULL,
    details          TEXT NOT NULL,
    reservation_id   TEXT,
    version          INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    removed_at       INTEGER
);
CREATE INDEX IF NOT EXISTS instances_host ON instances(host_id);
CREATE INDEX IF NOT EXISTS instances_state ON instances(state);
CREATE TABLE IF NOT EXISTS work_items (
    id            TEXT PRIMARY KEY,
    node_id       INTEGER NOT NULL,
    instance_id   INTEGER NOT NULL,
    work_type     TEXT NOT NULL,
    target_state  TEXT NOT NULL,
    step          TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    resource_id   INTEGER,
    resource_type TEXT
);
CREATE INDEX IF NOT EXISTS work_items_instance ON work_items(instance_id, step);
CREATE TABLE IF NOT EXISTS hosts (
    id            INTEGER PRIMARY KEY,
    name          TEXT NOT NULL,
    zone_id       INTEGER NOT NULL,
    pod_id        INTEGER NOT NULL,
    cluster_id    INTEGER NOT NULL,
    hypervisor    TEXT NOT NULL,
    status        TEXT NOT NULL,
    enabled       INTEGER NOT NULL,
    private_ip    TEXT NOT NULL,
    cpus          INTEGER NOT NULL,
    cpu_speed_mhz INTEGER NOT NULL,
    memory_mb     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS offerings (
    id            INTEGER PRIMARY KEY,
    name          TEXT NOT NULL,
    cpus          INTEGER NOT NULL,
    cpu_speed_mhz INTEGER NOT NULL,
    memory_mb     INTEGER NOT NULL,
    ha_enabled    INTEGER NOT NULL,
    local_storage INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS host_capacity (
    host_id  INTEGER NOT NULL,
    resource TEXT NOT NULL,
    used     INTEGER NOT NULL,
    reserved INTEGER NOT NULL,
    PRIMARY KEY (host_id, resource)
);
"#;

const INSTANCE_COLUMNS: &str = "id, uuid, name, vm_type, account_id, state, power_state, \
     power_host_id, power_updated_at, host_id, last_host_id, zone_id, pod_id, cluster_id, \
     offering_id, template_id, hypervisor, details, reservation_id, version, created_at, \
     updated_at, removed_at";

const WORK_COLUMNS: &str = "id, node_id, instance_id, work_type, target_state, step, \
     created_at, updated_at, resource_id, resource_type";

const HOST_COLUMNS: &str = "id, name, zone_id, pod_id, cluster_id, hypervisor, status, \
     enabled, private_ip, cpus, cpu_speed_mhz, memory_mb";

const ACTIVE: &str = "step NOT IN ('done', 'cancelled')";

const CPU: &str = "cpu";
const MEMORY: &str = "memory";

/// Durable store over a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn query_instances(
        &self,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> StoreResult<Vec<Instance>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE {filter} ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, instance_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn query_one_instance(
        &self,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> StoreResult<Option<Instance>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE {filter} LIMIT 1");
        Ok(conn.query_row(&sql, args, instance_from_row).optional()?)
    }
}

fn corrupt(idx: usize, column: &'static str, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(StoreError::Corrupt { column, value }),
    )
}

fn text_col<T>(
    row: &Row<'_>,
    idx: usize,
    column: &'static str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| corrupt(idx, column, raw))
}

fn host_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<HostId>> {
    Ok(row.get::<_, Option<u64>>(idx)?.map(HostId))
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<Instance> {
    let details_raw: String = row.get(17)?;
    let details: BTreeMap<String, String> = serde_json::from_str(&details_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(17, Type::Text, Box::new(e)))?;
    Ok(Instance {
        id: InstanceId(row.get(0)?),
        uuid: row.get(1)?,
        name: row.get(2)?,
        vm_type: text_col(row, 3, "vm_type", VmType::parse)?,
        account_id: row.get(4)?,
        state: text_col(row, 5, "state", State::parse)?,
        power_state: text_col(row, 6, "power_state", PowerState::parse)?,
        power_host_id: host_col(row, 7)?,
        power_updated_at: row.get(8)?,
        host_id: host_col(row, 9)?,
        last_host_id: host_col(row, 10)?,
        zone_id: row.get(11)?,
        pod_id: row.get(12)?,
        cluster_id: row.get(13)?,
        offering_id: row.get(14)?,
        template_id: row.get(15)?,
        hypervisor: text_col(row, 16, "hypervisor", HypervisorType::parse)?,
        details,
        reservation_id: row.get(18)?,
        version: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
        removed_at: row.get(22)?,
    })
}

fn work_from_row(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: row.get(0)?,
        node_id: row.get(1)?,
        instance_id: InstanceId(row.get(2)?),
        work_type: text_col(row, 3, "work_type", WorkType::parse)?,
        target_state: text_col(row, 4, "target_state", State::parse)?,
        step: text_col(row, 5, "step", Step::parse)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        resource_id: row.get(8)?,
        resource_type: row.get(9)?,
    })
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<HostRecord> {
    Ok(HostRecord {
        id: HostId(row.get(0)?),
        name: row.get(1)?,
        zone_id: row.get(2)?,
        pod_id: row.get(3)?,
        cluster_id: row.get(4)?,
        hypervisor: text_col(row, 5, "hypervisor", HypervisorType::parse)?,
        status: text_col(row, 6, "status", HostStatus::parse)?,
        enabled: row.get(7)?,
        private_ip: row.get(8)?,
        cpus: row.get(9)?,
        cpu_speed_mhz: row.get(10)?,
        memory_mb: row.get(11)?,
    })
}

fn active_work_tx(conn: &Connection, instance: InstanceId) -> rusqlite::Result<Option<WorkItem>> {
    let sql = format!(
        "SELECT {WORK_COLUMNS} FROM work_items WHERE instance_id = ?1 AND {ACTIVE} \
         ORDER BY created_at DESC LIMIT 1"
    );
    conn.query_row(&sql, params![instance.0], work_from_row)
        .optional()
}

fn counters(conn: &Connection, host: HostId, resource: &str) -> rusqlite::Result<(u64, u64)> {
    Ok(conn
        .query_row(
            "SELECT used, reserved FROM host_capacity WHERE host_id = ?1 AND resource = ?2",
            params![host.0, resource],
            |r| Ok((r.get::<_, u64>(0)?, r.get::<_, u64>(1)?)),
        )
        .optional()?
        .unwrap_or_default())
}

fn write_counters(
    conn: &Connection,
    host: HostId,
    resource: &str,
    (used, reserved): (u64, u64),
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO host_capacity (host_id, resource, used, reserved) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(host_id, resource) DO UPDATE SET used = excluded.used, reserved = excluded.reserved",
        params![host.0, resource, used, reserved],
    )?;
    Ok(())
}

fn shifted((used, reserved): (u64, u64), bucket: CapacityBucket, delta: i64) -> (u64, u64) {
    match bucket {
        CapacityBucket::Used => (apply_delta(used, delta), reserved),
        CapacityBucket::Reserved => (used, apply_delta(reserved, delta)),
    }
}

/// Takes the write lock up front; other connections wait up to
/// `BUSY_TIMEOUT` for it.
fn write_tx(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

impl FleetStore for SqliteStore {
    fn next_instance_id(&self) -> StoreResult<InstanceId> {
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;
        tx.execute(
            "INSERT OR IGNORE INTO sequences (name, value) VALUES ('instance', 0)",
            [],
        )?;
        tx.execute(
            "UPDATE sequences SET value = MAX(value, (SELECT COALESCE(MAX(id), 0) FROM instances)) + 1
             WHERE name = 'instance'",
            [],
        )?;
        let id: u64 = tx.query_row(
            "SELECT value FROM sequences WHERE name = 'instance'",
            [],
            |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(InstanceId(id))
    }

    fn insert_instance(&self, instance: &Instance) -> StoreResult<()> {
        let conn = self.conn()?;
        let taken: Option<String> = conn
            .query_row(
                "SELECT uuid FROM instances WHERE uuid = ?1 OR id = ?2",
                params![instance.uuid, instance.id.0],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(key) = taken {
            return Err(StoreError::Duplicate {
                kind: "instance",
                key,
            });
        }
        let details = serde_json::to_string(&instance.details)?;
        conn.execute(
            &format!(
                "INSERT INTO instances ({INSTANCE_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                 ?18, ?19, ?20, ?21, ?22, ?23)"
            ),
            params![
                instance.id.0,
                instance.uuid,
                instance.name,
                instance.vm_type.as_str(),
                instance.account_id,
                instance.state.as_str(),
                instance.power_state.as_str(),
                instance.power_host_id.map(|h| h.0),
                instance.power_updated_at,
                instance.host_id.map(|h| h.0),
                instance.last_host_id.map(|h| h.0),
                instance.zone_id,
                instance.pod_id,
                instance.cluster_id,
                instance.offering_id,
                instance.template_id,
                instance.hypervisor.as_str(),
                details,
                instance.reservation_id,
                instance.version,
                instance.created_at,
                instance.updated_at,
                instance.removed_at,
            ],
        )?;
        Ok(())
    }

    fn instance(&self, id: InstanceId) -> StoreResult<Option<Instance>> {
        self.query_one_instance("id = ?1", params![id.0])
    }

    fn instance_by_uuid(&self, uuid: &str) -> StoreResult<Option<Instance>> {
        self.query_one_instance("uuid = ?1", params![uuid])
    }

    fn instance_by_name(&self, name: &str) -> StoreResult<Option<Instance>> {
        self.query_one_instance("name = ?1 AND removed_at IS NULL", params![name])
    }

    fn instances_on_host(&self, host: HostId) -> StoreResult<Vec<Instance>> {
        self.query_instances("host_id = ?1 AND removed_at IS NULL", params![host.0])
    }

    fn instances_in_states(&self, states: &[State]) -> StoreResult<Vec<Instance>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let list = states
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        self.query_instances(
            &format!("state IN ({list}) AND removed_at IS NULL"),
            [],
        )
    }

    fn commit_transition(
        &self,
        next: &Instance,
        expected_state: State,
        expected_version: u64,
        work: Option<&WorkStepUpdate>,
    ) -> StoreResult<CommitOutcome> {
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;
        let current: Option<(String, u64)> = tx
            .query_row(
                "SELECT state, version FROM instances WHERE id = ?1",
                params![next.id.0],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((state, version)) = current else {
            return Err(StoreError::not_found("instance", next.id));
        };
        if state != expected_state.as_str() || version != expected_version {
            return Ok(CommitOutcome::Stale);
        }
        if let Some(update) = work {
            let step: Option<String> = tx
                .query_row(
                    "SELECT step FROM work_items WHERE id = ?1",
                    params![update.work_id],
                    |r| r.get(0),
                )
                .optional()?;
            let active = step
                .as_deref()
                .and_then(Step::parse)
                .is_some_and(|s| !s.is_finished());
            if !active {
                return Ok(CommitOutcome::WorkInactive);
            }
        }

        let changed = tx.execute(
            "UPDATE instances SET state = ?1, host_id = ?2, last_host_id = ?3, pod_id = ?4,
                 cluster_id = ?5, version = ?6, updated_at = ?7
             WHERE id = ?8 AND state = ?9 AND version = ?10",
            params![
                next.state.as_str(),
                next.host_id.map(|h| h.0),
                next.last_host_id.map(|h| h.0),
                next.pod_id,
                next.cluster_id,
                next.version,
                next.updated_at,
                next.id.0,
                expected_state.as_str(),
                expected_version,
            ],
        )?;
        if changed == 0 {
            return Ok(CommitOutcome::Stale);
        }
        if let Some(update) = work {
            tx.execute(
                "UPDATE work_items SET step = ?1, updated_at = ?2 WHERE id = ?3",
                params![update.step.as_str(), next.updated_at, update.work_id],
            )?;
        }
        tx.commit()?;
        Ok(CommitOutcome::Committed)
    }

    fn record_power_state(
        &self,
        id: InstanceId,
        power: PowerState,
        host: Option<HostId>,
        now: u64,
    ) -> StoreResult<bool> {
        let changed = self.conn()?.execute(
            "UPDATE instances SET power_state = ?1, power_host_id = ?2, power_updated_at = ?3
             WHERE id = ?4",
            params![power.as_str(), host.map(|h| h.0), now, id.0],
        )?;
        Ok(changed > 0)
    }

    fn set_details(&self, id: InstanceId, details: &BTreeMap<String, String>) -> StoreResult<()> {
        let json = serde_json::to_string(details)?;
        let changed = self.conn()?.execute(
            "UPDATE instances SET details = ?1 WHERE id = ?2",
            params![json, id.0],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("instance", id));
        }
        Ok(())
    }

    fn mark_removed(&self, id: InstanceId, now: u64) -> StoreResult<()> {
        let changed = self.conn()?.execute(
            "UPDATE instances SET removed_at = ?1 WHERE id = ?2",
            params![now, id.0],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("instance", id));
        }
        Ok(())
    }

    fn try_acquire_work(
        &self,
        item: &WorkItem,
        stale_before: u64,
        now: u64,
    ) -> StoreResult<AcquireOutcome> {
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;
        let abandoned = match active_work_tx(&tx, item.instance_id)? {
            Some(old) if old.updated_at >= stale_before => return Ok(AcquireOutcome::Busy(old)),
            Some(old) => {
                tx.execute(
                    "UPDATE work_items SET step = 'cancelled', updated_at = ?1 WHERE id = ?2",
                    params![now, old.id],
                )?;
                Some(old)
            }
            None => None,
        };
        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO work_items ({WORK_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                item.id,
                item.node_id,
                item.instance_id.0,
                item.work_type.as_str(),
                item.target_state.as_str(),
                item.step.as_str(),
                item.created_at,
                item.updated_at,
                item.resource_id,
                item.resource_type,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate {
                kind: "work item",
                key: item.id.clone(),
            });
        }
        tx.commit()?;
        Ok(AcquireOutcome::Acquired { abandoned })
    }

    fn work_item(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {WORK_COLUMNS} FROM work_items WHERE id = ?1"),
                params![id],
                work_from_row,
            )
            .optional()?)
    }

    fn update_work_step(&self, id: &str, step: Step, now: u64) -> StoreResult<bool> {
        let changed = self.conn()?.execute(
            &format!("UPDATE work_items SET step = ?1, updated_at = ?2 WHERE id = ?3 AND {ACTIVE}"),
            params![step.as_str(), now, id],
        )?;
        Ok(changed > 0)
    }

    fn set_work_resource(
        &self,
        id: &str,
        resource_type: &str,
        resource_id: u64,
        now: u64,
    ) -> StoreResult<bool> {
        let changed = self.conn()?.execute(
            &format!(
                "UPDATE work_items SET resource_type = ?1, resource_id = ?2, updated_at = ?3
                 WHERE id = ?4 AND {ACTIVE}"
            ),
            params![resource_type, resource_id, now, id],
        )?;
        Ok(changed > 0)
    }

    fn active_work(&self, instance: InstanceId) -> StoreResult<Option<WorkItem>> {
        let conn = self.conn()?;
        Ok(active_work_tx(&conn, instance)?)
    }

    fn find_outstanding(
        &self,
        instance: InstanceId,
        target_state: State,
    ) -> StoreResult<Option<WorkItem>> {
        Ok(self
            .active_work(instance)?
            .filter(|w| w.target_state == target_state))
    }

    fn outstanding_work(&self, node: Option<NodeId>) -> StoreResult<Vec<WorkItem>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {WORK_COLUMNS} FROM work_items WHERE {ACTIVE} \
             AND (?1 IS NULL OR node_id = ?1) ORDER BY created_at, instance_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![node], work_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn purge_finished_work(&self, older_than: u64) -> StoreResult<usize> {
        Ok(self.conn()?.execute(
            &format!("DELETE FROM work_items WHERE NOT ({ACTIVE}) AND updated_at < ?1"),
            params![older_than],
        )?)
    }

    fn purge_instance_work(&self, instance: InstanceId) -> StoreResult<usize> {
        Ok(self.conn()?.execute(
            "DELETE FROM work_items WHERE instance_id = ?1",
            params![instance.0],
        )?)
    }

    fn upsert_host(&self, host: &HostRecord) -> StoreResult<()> {
        self.conn()?.execute(
            &format!(
                "INSERT OR REPLACE INTO hosts ({HOST_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                host.id.0,
                host.name,
                host.zone_id,
                host.pod_id,
                host.cluster_id,
                host.hypervisor.as_str(),
                host.status.as_str(),
                host.enabled,
                host.private_ip,
                host.cpus,
                host.cpu_speed_mhz,
                host.memory_mb,
            ],
        )?;
        Ok(())
    }

    fn host(&self, id: HostId) -> StoreResult<Option<HostRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"),
                params![id.0],
                host_from_row,
            )
            .optional()?)
    }

    fn hosts_in_zone(&self, zone: ZoneId) -> StoreResult<Vec<HostRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE zone_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![zone], host_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_hosts(&self) -> StoreResult<Vec<HostRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {HOST_COLUMNS} FROM hosts ORDER BY id"))?;
        let rows = stmt.query_map([], host_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn set_host_status(&self, id: HostId, status: HostStatus) -> StoreResult<bool> {
        let changed = self.conn()?.execute(
            "UPDATE hosts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.0],
        )?;
        Ok(changed > 0)
    }

    fn upsert_offering(&self, offering: &ServiceOffering) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO offerings
                 (id, name, cpus, cpu_speed_mhz, memory_mb, ha_enabled, local_storage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                offering.id,
                offering.name,
                offering.cpus,
                offering.cpu_speed_mhz,
                offering.memory_mb,
                offering.ha_enabled,
                offering.local_storage,
            ],
        )?;
        Ok(())
    }

    fn offering(&self, id: OfferingId) -> StoreResult<Option<ServiceOffering>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, name, cpus, cpu_speed_mhz, memory_mb, ha_enabled, local_storage
                 FROM offerings WHERE id = ?1",
                params![id],
                |r| {
                    Ok(ServiceOffering {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        cpus: r.get(2)?,
                        cpu_speed_mhz: r.get(3)?,
                        memory_mb: r.get(4)?,
                        ha_enabled: r.get(5)?,
                        local_storage: r.get(6)?,
                    })
                },
            )
            .optional()?)
    }

    fn capacity(&self, host: HostId) -> StoreResult<HostCapacity> {
        let conn = self.conn()?;
        let (used_cpu_mhz, reserved_cpu_mhz) = counters(&conn, host, CPU)?;
        let (used_memory_mb, reserved_memory_mb) = counters(&conn, host, MEMORY)?;
        Ok(HostCapacity {
            used_cpu_mhz,
            reserved_cpu_mhz,
            used_memory_mb,
            reserved_memory_mb,
        })
    }

    fn adjust_capacity(&self, change: &CapacityChange) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;
        let cpu = counters(&tx, change.host, CPU)?;
        let memory = counters(&tx, change.host, MEMORY)?;
        if let Some(limit) = change.limit {
            if !fits(cpu.0 + cpu.1, change.cpu_mhz, limit.cpu_mhz)
                || !fits(memory.0 + memory.1, change.memory_mb, limit.memory_mb)
            {
                return Ok(false);
            }
        }
        write_counters(&tx, change.host, CPU, shifted(cpu, change.bucket, change.cpu_mhz))?;
        write_counters(
            &tx,
            change.host,
            MEMORY,
            shifted(memory, change.bucket, change.memory_mb),
        )?;
        tx.commit()?;
        Ok(true)
    }
}
