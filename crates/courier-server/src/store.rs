use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_contracts::{
    Credential, Egress, EgressDescriptor, EgressStatus, Identity, IdentityStatus, Target,
    TargetStatus,
};
use courier_kernel::parse_rfc3339;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseResult {
    Leased,
    AlreadyLeased { holder: Option<String> },
    IdentityAlreadyBound { egress_id: String },
    EgressNotFound,
    IdentityNotFound,
}

pub type SharedStore = Arc<Mutex<StoreBackend>>;

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
pub struct MemoryStore {
    identities: Vec<Identity>,
    identity_index: HashMap<String, usize>,
    egress: Vec<Egress>,
    egress_index: HashMap<String, usize>,
    targets: Vec<Target>,
    target_index: HashMap<String, usize>,
    next_target_seq: i64,
}

pub struct SqliteStore {
    conn: Connection,
}

impl StoreBackend {
    pub fn open(kind: &str, sqlite_path: Option<&str>) -> Result<Self, String> {
        match (kind, sqlite_path) {
            ("sqlite", Some(path)) => Ok(StoreBackend::Sqlite(SqliteStore::new(path)?)),
            ("sqlite", None) => Err("store.sqlite_path is required for sqlite store".to_string()),
            _ => Ok(StoreBackend::Memory(MemoryStore::default())),
        }
    }

    /// Returns false when an identity with the same id already exists.
    pub fn insert_identity(&mut self, identity: &Identity) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => {
                if store.identity_index.contains_key(&identity.id) {
                    return Ok(false);
                }
                store
                    .identity_index
                    .insert(identity.id.clone(), store.identities.len());
                store.identities.push(identity.clone());
                Ok(true)
            }
            StoreBackend::Sqlite(store) => store.insert_identity(identity),
        }
    }

    pub fn get_identity(&self, tenant_id: &str, id: &str) -> Result<Option<Identity>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .identity_index
                .get(id)
                .map(|idx| &store.identities[*idx])
                .filter(|v| v.tenant_id == tenant_id)
                .cloned()),
            StoreBackend::Sqlite(store) => store.get_identity(tenant_id, id),
        }
    }

    /// Creation order.
    pub fn list_identities(&self, tenant_id: &str) -> Result<Vec<Identity>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .identities
                .iter()
                .filter(|v| v.tenant_id == tenant_id)
                .cloned()
                .collect()),
            StoreBackend::Sqlite(store) => store.list_identities(tenant_id),
        }
    }

    /// Writes everything except `bound_egress_id`, which only lease and
    /// release change.
    pub fn save_identity(&mut self, identity: &Identity) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                let idx = *store
                    .identity_index
                    .get(&identity.id)
                    .ok_or_else(|| format!("identity {} not found", identity.id))?;
                let slot = &mut store.identities[idx];
                let bound = slot.bound_egress_id.take();
                *slot = identity.clone();
                slot.bound_egress_id = bound;
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_identity(identity),
        }
    }

    pub fn insert_egress(&mut self, egress: &Egress) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => {
                if store.egress_index.contains_key(&egress.id) {
                    return Ok(false);
                }
                store
                    .egress_index
                    .insert(egress.id.clone(), store.egress.len());
                store.egress.push(egress.clone());
                Ok(true)
            }
            StoreBackend::Sqlite(store) => store.insert_egress(egress),
        }
    }

    pub fn get_egress(&self, tenant_id: &str, id: &str) -> Result<Option<Egress>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .egress_index
                .get(id)
                .map(|idx| &store.egress[*idx])
                .filter(|v| v.tenant_id == tenant_id)
                .cloned()),
            StoreBackend::Sqlite(store) => store.get_egress(tenant_id, id),
        }
    }

    pub fn list_egress(&self, tenant_id: &str) -> Result<Vec<Egress>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .egress
                .iter()
                .filter(|v| v.tenant_id == tenant_id)
                .cloned()
                .collect()),
            StoreBackend::Sqlite(store) => store.list_egress(tenant_id),
        }
    }

    /// Claims an available egress for an identity and binds both sides in one step.
    pub fn lease_egress(
        &mut self,
        tenant_id: &str,
        egress_id: &str,
        identity_id: &str,
    ) -> Result<LeaseResult, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.lease_egress(tenant_id, egress_id, identity_id)),
            StoreBackend::Sqlite(store) => store.lease_egress(tenant_id, egress_id, identity_id),
        }
    }

    /// Returns false when the egress was already available.
    pub fn release_egress(&mut self, tenant_id: &str, egress_id: &str) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.release_egress(tenant_id, egress_id)),
            StoreBackend::Sqlite(store) => store.release_egress(tenant_id, egress_id),
        }
    }

    /// Assigns `seq`; returns None when the target id already exists.
    pub fn insert_target(&mut self, target: &Target) -> Result<Option<i64>, String> {
        match self {
            StoreBackend::Memory(store) => {
                if store.target_index.contains_key(&target.id) {
                    return Ok(None);
                }
                store.next_target_seq += 1;
                let mut stored = target.clone();
                stored.seq = store.next_target_seq;
                store
                    .target_index
                    .insert(stored.id.clone(), store.targets.len());
                store.targets.push(stored);
                Ok(Some(store.next_target_seq))
            }
            StoreBackend::Sqlite(store) => store.insert_target(target),
        }
    }

    pub fn get_target(&self, tenant_id: &str, id: &str) -> Result<Option<Target>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .target_index
                .get(id)
                .map(|idx| &store.targets[*idx])
                .filter(|v| v.tenant_id == tenant_id)
                .cloned()),
            StoreBackend::Sqlite(store) => store.get_target(tenant_id, id),
        }
    }

    /// One page in pool order, strictly after `after_seq`.
    pub fn list_targets_page(
        &self,
        tenant_id: &str,
        status: Option<TargetStatus>,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Target>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .targets
                .iter()
                .filter(|v| {
                    v.tenant_id == tenant_id
                        && v.seq > after_seq
                        && status.map(|s| v.status == s).unwrap_or(true)
                })
                .take(limit)
                .cloned()
                .collect()),
            StoreBackend::Sqlite(store) => {
                store.list_targets_page(tenant_id, status, after_seq, limit)
            }
        }
    }

    pub fn save_target(&mut self, target: &Target) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                let idx = *store
                    .target_index
                    .get(&target.id)
                    .ok_or_else(|| format!("target {} not found", target.id))?;
                store.targets[idx] = target.clone();
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_target(target),
        }
    }

    /// Only targets currently in `problem` are reset; empty `ids` means all of them.
    pub fn reset_problem_targets(&mut self, tenant_id: &str, ids: &[String]) -> Result<usize, String> {
        match self {
            StoreBackend::Memory(store) => {
                let mut reset = 0;
                for target in store.targets.iter_mut().filter(|v| {
                    v.tenant_id == tenant_id
                        && v.status == TargetStatus::Problem
                        && (ids.is_empty() || ids.contains(&v.id))
                }) {
                    target.status = TargetStatus::Available;
                    target.last_error = None;
                    reset += 1;
                }
                Ok(reset)
            }
            StoreBackend::Sqlite(store) => store.reset_problem_targets(tenant_id, ids),
        }
    }
}

impl MemoryStore {
    fn lease_egress(&mut self, tenant_id: &str, egress_id: &str, identity_id: &str) -> LeaseResult {
        let Some(identity_idx) = self
            .identity_index
            .get(identity_id)
            .copied()
            .filter(|idx| self.identities[*idx].tenant_id == tenant_id)
        else {
            return LeaseResult::IdentityNotFound;
        };
        let Some(egress_idx) = self
            .egress_index
            .get(egress_id)
            .copied()
            .filter(|idx| self.egress[*idx].tenant_id == tenant_id)
        else {
            return LeaseResult::EgressNotFound;
        };

        let egress = &self.egress[egress_idx];
        if egress.status == EgressStatus::Leased {
            if egress.leased_to.as_deref() == Some(identity_id) {
                return LeaseResult::Leased;
            }
            return LeaseResult::AlreadyLeased {
                holder: egress.leased_to.clone(),
            };
        }
        if let Some(bound) = &self.identities[identity_idx].bound_egress_id {
            return LeaseResult::IdentityAlreadyBound {
                egress_id: bound.clone(),
            };
        }

        let egress = &mut self.egress[egress_idx];
        egress.status = EgressStatus::Leased;
        egress.leased_to = Some(identity_id.to_string());
        self.identities[identity_idx].bound_egress_id = Some(egress_id.to_string());
        LeaseResult::Leased
    }

    fn release_egress(&mut self, tenant_id: &str, egress_id: &str) -> bool {
        let Some(egress_idx) = self
            .egress_index
            .get(egress_id)
            .copied()
            .filter(|idx| self.egress[*idx].tenant_id == tenant_id)
        else {
            return false;
        };
        let egress = &mut self.egress[egress_idx];
        if egress.status == EgressStatus::Available {
            return false;
        }
        let holder = egress.leased_to.take();
        egress.status = EgressStatus::Available;

        if let Some(idx) = holder.and_then(|id| self.identity_index.get(&id).copied()) {
            let identity = &mut self.identities[idx];
            if identity.bound_egress_id.as_deref() == Some(egress_id) {
                identity.bound_egress_id = None;
            }
        }
        true
    }
}

const IDENTITY_COLUMNS: &str = "id, tenant_id, label, credential, status, bound_egress_id, \
    daily_send_count, daily_send_window_start, last_action_at, lifetime_sent_count, \
    display_name, last_error, last_validated_at, created_at";

const EGRESS_COLUMNS: &str =
    "id, tenant_id, host, port, username, password, status, leased_to, created_at";

const TARGET_COLUMNS: &str = "id, tenant_id, label, seq, status, last_assigned_identity_id, \
    last_error, last_attempt_at, created_at";

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                label TEXT NOT NULL,
                credential TEXT NOT NULL,
                status TEXT NOT NULL,
                bound_egress_id TEXT,
                daily_send_count INTEGER NOT NULL,
                daily_send_window_start TEXT,
                last_action_at TEXT,
                lifetime_sent_count INTEGER NOT NULL,
                display_name TEXT,
                last_error TEXT,
                last_validated_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS identities_by_tenant ON identities (tenant_id);
            CREATE TABLE IF NOT EXISTS egress (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT,
                password TEXT,
                status TEXT NOT NULL,
                leased_to TEXT,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS egress_by_holder
                ON egress (leased_to) WHERE leased_to IS NOT NULL;
            CREATE TABLE IF NOT EXISTS targets (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                tenant_id TEXT NOT NULL,
                label TEXT NOT NULL,
                status TEXT NOT NULL,
                last_assigned_identity_id TEXT,
                last_error TEXT,
                last_attempt_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS targets_by_status ON targets (tenant_id, status, seq);
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn insert_identity(&mut self, identity: &Identity) -> Result<bool, String> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO identities ({IDENTITY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    identity.id,
                    identity.tenant_id,
                    identity.label,
                    identity.credential.expose(),
                    identity.status.as_str(),
                    identity.bound_egress_id,
                    identity.daily_send_count as i64,
                    ts_column(identity.daily_send_window_start),
                    ts_column(identity.last_action_at),
                    identity.lifetime_sent_count as i64,
                    identity.display_name,
                    identity.last_error,
                    ts_column(identity.last_validated_at),
                    identity.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(changed == 1)
    }

    fn get_identity(&self, tenant_id: &str, id: &str) -> Result<Option<Identity>, String> {
        self.conn
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id, id],
                identity_from_row,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn list_identities(&self, tenant_id: &str) -> Result<Vec<Identity>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {IDENTITY_COLUMNS} FROM identities WHERE tenant_id = ?1 ORDER BY rowid"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![tenant_id], identity_from_row)
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())
    }

    fn save_identity(&mut self, identity: &Identity) -> Result<(), String> {
        let changed = self
            .conn
            .execute(
                "
                UPDATE identities SET
                    label = ?3,
                    status = ?4,
                    daily_send_count = ?5,
                    daily_send_window_start = ?6,
                    last_action_at = ?7,
                    lifetime_sent_count = ?8,
                    display_name = ?9,
                    last_error = ?10,
                    last_validated_at = ?11
                WHERE tenant_id = ?1 AND id = ?2
                ",
                params![
                    identity.tenant_id,
                    identity.id,
                    identity.label,
                    identity.status.as_str(),
                    identity.daily_send_count as i64,
                    ts_column(identity.daily_send_window_start),
                    ts_column(identity.last_action_at),
                    identity.lifetime_sent_count as i64,
                    identity.display_name,
                    identity.last_error,
                    ts_column(identity.last_validated_at),
                ],
            )
            .map_err(|e| e.to_string())?;
        if changed == 0 {
            return Err(format!("identity {} not found", identity.id));
        }
        Ok(())
    }

    fn insert_egress(&mut self, egress: &Egress) -> Result<bool, String> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO egress ({EGRESS_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    egress.id,
                    egress.tenant_id,
                    egress.descriptor.host,
                    egress.descriptor.port as i64,
                    egress.descriptor.username,
                    egress.descriptor.password,
                    egress.status.as_str(),
                    egress.leased_to,
                    egress.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(changed == 1)
    }

    fn get_egress(&self, tenant_id: &str, id: &str) -> Result<Option<Egress>, String> {
        self.conn
            .query_row(
                &format!("SELECT {EGRESS_COLUMNS} FROM egress WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id, id],
                egress_from_row,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn list_egress(&self, tenant_id: &str) -> Result<Vec<Egress>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {EGRESS_COLUMNS} FROM egress WHERE tenant_id = ?1 ORDER BY rowid"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![tenant_id], egress_from_row)
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())
    }

    fn lease_egress(
        &mut self,
        tenant_id: &str,
        egress_id: &str,
        identity_id: &str,
    ) -> Result<LeaseResult, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;

        let bound: Option<Option<String>> = tx
            .query_row(
                "SELECT bound_egress_id FROM identities WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, identity_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        let bound = match bound {
            None => return Ok(LeaseResult::IdentityNotFound),
            Some(v) => v,
        };
        if let Some(existing) = bound.filter(|v| v != egress_id) {
            return Ok(LeaseResult::IdentityAlreadyBound { egress_id: existing });
        }

        let claimed = tx
            .execute(
                "
                UPDATE egress SET status = 'leased', leased_to = ?3
                WHERE tenant_id = ?1 AND id = ?2 AND status = 'available'
                ",
                params![tenant_id, egress_id, identity_id],
            )
            .map_err(|e| e.to_string())?;
        if claimed == 0 {
            let holder: Option<Option<String>> = tx
                .query_row(
                    "SELECT leased_to FROM egress WHERE tenant_id = ?1 AND id = ?2",
                    params![tenant_id, egress_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| e.to_string())?;
            return Ok(match holder {
                None => LeaseResult::EgressNotFound,
                Some(Some(h)) if h == identity_id => LeaseResult::Leased,
                Some(holder) => LeaseResult::AlreadyLeased { holder },
            });
        }

        tx.execute(
            "UPDATE identities SET bound_egress_id = ?3 WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, identity_id, egress_id],
        )
        .map_err(|e| e.to_string())?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok(LeaseResult::Leased)
    }

    fn release_egress(&mut self, tenant_id: &str, egress_id: &str) -> Result<bool, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let holder: Option<Option<String>> = tx
            .query_row(
                "SELECT leased_to FROM egress WHERE tenant_id = ?1 AND id = ?2 AND status = 'leased'",
                params![tenant_id, egress_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        let Some(holder) = holder else {
            return Ok(false);
        };

        tx.execute(
            "
            UPDATE egress SET status = 'available', leased_to = NULL
            WHERE tenant_id = ?1 AND id = ?2
            ",
            params![tenant_id, egress_id],
        )
        .map_err(|e| e.to_string())?;
        if let Some(identity_id) = holder {
            tx.execute(
                "
                UPDATE identities SET bound_egress_id = NULL
                WHERE tenant_id = ?1 AND id = ?2 AND bound_egress_id = ?3
                ",
                params![tenant_id, identity_id, egress_id],
            )
            .map_err(|e| e.to_string())?;
        }
        tx.commit().map_err(|e| e.to_string())?;
        Ok(true)
    }

    fn insert_target(&mut self, target: &Target) -> Result<Option<i64>, String> {
        let changed = self
            .conn
            .execute(
                "
                INSERT OR IGNORE INTO targets
                (id, tenant_id, label, status, last_assigned_identity_id, last_error, last_attempt_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    target.id,
                    target.tenant_id,
                    target.label,
                    target.status.as_str(),
                    target.last_assigned_identity_id,
                    target.last_error,
                    ts_column(target.last_attempt_at),
                    target.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| e.to_string())?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    fn get_target(&self, tenant_id: &str, id: &str) -> Result<Option<Target>, String> {
        self.conn
            .query_row(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id, id],
                target_from_row,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn list_targets_page(
        &self,
        tenant_id: &str,
        status: Option<TargetStatus>,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Target>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "
                SELECT {TARGET_COLUMNS} FROM targets
                WHERE tenant_id = ?1 AND seq > ?2 AND (?3 IS NULL OR status = ?3)
                ORDER BY seq
                LIMIT ?4
                "
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(
                params![
                    tenant_id,
                    after_seq,
                    status.map(TargetStatus::as_str),
                    limit.min(i64::MAX as usize) as i64
                ],
                target_from_row,
            )
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())
    }

    fn save_target(&mut self, target: &Target) -> Result<(), String> {
        let changed = self
            .conn
            .execute(
                "
                UPDATE targets SET
                    status = ?3,
                    last_assigned_identity_id = ?4,
                    last_error = ?5,
                    last_attempt_at = ?6
                WHERE tenant_id = ?1 AND id = ?2
                ",
                params![
                    target.tenant_id,
                    target.id,
                    target.status.as_str(),
                    target.last_assigned_identity_id,
                    target.last_error,
                    ts_column(target.last_attempt_at),
                ],
            )
            .map_err(|e| e.to_string())?;
        if changed == 0 {
            return Err(format!("target {} not found", target.id));
        }
        Ok(())
    }

    fn reset_problem_targets(&mut self, tenant_id: &str, ids: &[String]) -> Result<usize, String> {
        if ids.is_empty() {
            return self
                .conn
                .execute(
                    "
                    UPDATE targets SET status = 'available', last_error = NULL
                    WHERE tenant_id = ?1 AND status = 'problem'
                    ",
                    params![tenant_id],
                )
                .map_err(|e| e.to_string());
        }

        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let mut reset = 0;
        for id in ids {
            reset += tx
                .execute(
                    "
                    UPDATE targets SET status = 'available', last_error = NULL
                    WHERE tenant_id = ?1 AND id = ?2 AND status = 'problem'
                    ",
                    params![tenant_id, id],
                )
                .map_err(|e| e.to_string())?;
        }
        tx.commit().map_err(|e| e.to_string())?;
        Ok(reset)
    }
}

fn ts_column(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|v| v.to_rfc3339())
}

fn decode_failure(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn ts_from_row(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(v) => parse_rfc3339(&v)
            .map(Some)
            .ok_or_else(|| decode_failure(idx, format!("invalid timestamp {v:?}"))),
    }
}

fn required_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    ts_from_row(row, idx)?.ok_or_else(|| decode_failure(idx, "missing timestamp".to_string()))
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let status: String = row.get(4)?;
    Ok(Identity {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        label: row.get(2)?,
        credential: Credential::new(row.get::<_, String>(3)?),
        status: IdentityStatus::parse(&status)
            .ok_or_else(|| decode_failure(4, format!("unknown identity status {status:?}")))?,
        bound_egress_id: row.get(5)?,
        daily_send_count: row.get::<_, i64>(6)?.max(0) as u32,
        daily_send_window_start: ts_from_row(row, 7)?,
        last_action_at: ts_from_row(row, 8)?,
        lifetime_sent_count: row.get::<_, i64>(9)?.max(0) as u64,
        display_name: row.get(10)?,
        last_error: row.get(11)?,
        last_validated_at: ts_from_row(row, 12)?,
        created_at: required_ts(row, 13)?,
    })
}

fn egress_from_row(row: &Row<'_>) -> rusqlite::Result<Egress> {
    let port: i64 = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(Egress {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        descriptor: EgressDescriptor {
            host: row.get(2)?,
            port: u16::try_from(port)
                .map_err(|_| decode_failure(3, format!("port {port} out of range")))?,
            username: row.get(4)?,
            password: row.get(5)?,
        },
        status: EgressStatus::parse(&status)
            .ok_or_else(|| decode_failure(6, format!("unknown egress status {status:?}")))?,
        leased_to: row.get(7)?,
        created_at: required_ts(row, 8)?,
    })
}

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<Target> {
    let status: String = row.get(4)?;
    Ok(Target {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        label: row.get(2)?,
        seq: row.get(3)?,
        status: TargetStatus::parse(&status)
            .ok_or_else(|| decode_failure(4, format!("unknown target status {status:?}")))?,
        last_assigned_identity_id: row.get(5)?,
        last_error: row.get(6)?,
        last_attempt_at: ts_from_row(row, 7)?,
        created_at: required_ts(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db(name: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("courier-store-{name}-{nanos}.db"))
            .to_string_lossy()
            .to_string()
    }

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            tenant_id: "t".to_string(),
            label: id.to_string(),
            credential: Credential::new("secret"),
            status: IdentityStatus::Active,
            bound_egress_id: None,
            daily_send_count: 0,
            daily_send_window_start: None,
            last_action_at: None,
            lifetime_sent_count: 0,
            display_name: None,
            last_error: None,
            last_validated_at: None,
            created_at: Utc::now(),
        }
    }

    fn egress(id: &str) -> Egress {
        Egress {
            id: id.to_string(),
            tenant_id: "t".to_string(),
            descriptor: EgressDescriptor {
                host: "10.0.0.1".to_string(),
                port: 8080,
                username: None,
                password: Some("pw".to_string()),
            },
            status: EgressStatus::Available,
            leased_to: None,
            created_at: Utc::now(),
        }
    }

    fn backends(name: &str) -> Vec<StoreBackend> {
        vec![
            StoreBackend::Memory(MemoryStore::default()),
            StoreBackend::Sqlite(SqliteStore::new(&temp_db(name)).unwrap()),
        ]
    }

    fn assert_exclusive(store: &StoreBackend) {
        let identities = store.list_identities("t").unwrap();
        for e in store.list_egress("t").unwrap() {
            let holders: Vec<&Identity> = identities
                .iter()
                .filter(|i| i.bound_egress_id.as_deref() == Some(e.id.as_str()))
                .collect();
            match e.status {
                EgressStatus::Leased => {
                    assert_eq!(holders.len(), 1);
                    assert_eq!(e.leased_to.as_deref(), Some(holders[0].id.as_str()));
                }
                EgressStatus::Available => {
                    assert!(holders.is_empty());
                    assert!(e.leased_to.is_none());
                }
            }
        }
    }

    #[test]
    fn lease_is_exclusive_and_symmetric() {
        for mut store in backends("lease") {
            store.insert_identity(&identity("a")).unwrap();
            store.insert_identity(&identity("b")).unwrap();
            store.insert_egress(&egress("e1")).unwrap();
            store.insert_egress(&egress("e2")).unwrap();

            assert_eq!(store.lease_egress("t", "e1", "a").unwrap(), LeaseResult::Leased);
            assert_eq!(
                store.lease_egress("t", "e1", "b").unwrap(),
                LeaseResult::AlreadyLeased {
                    holder: Some("a".to_string())
                }
            );
            assert_eq!(
                store.lease_egress("t", "e2", "a").unwrap(),
                LeaseResult::IdentityAlreadyBound {
                    egress_id: "e1".to_string()
                }
            );
            assert_eq!(store.lease_egress("t", "e1", "a").unwrap(), LeaseResult::Leased);
            assert_eq!(
                store.lease_egress("t", "missing", "a").unwrap(),
                LeaseResult::EgressNotFound
            );
            assert_exclusive(&store);

            assert!(store.release_egress("t", "e1").unwrap());
            assert!(!store.release_egress("t", "e1").unwrap());
            assert_exclusive(&store);
            assert!(store.get_identity("t", "a").unwrap().unwrap().bound_egress_id.is_none());

            assert_eq!(store.lease_egress("t", "e1", "b").unwrap(), LeaseResult::Leased);
            assert_exclusive(&store);
        }
    }

    #[test]
    fn sqlite_lease_sees_claims_from_another_connection() {
        let path = temp_db("lease-race");
        let mut first = SqliteStore::new(&path).unwrap();
        let mut second = SqliteStore::new(&path).unwrap();
        first.insert_identity(&identity("a")).unwrap();
        first.insert_identity(&identity("b")).unwrap();
        first.insert_egress(&egress("e1")).unwrap();

        assert_eq!(first.lease_egress("t", "e1", "a").unwrap(), LeaseResult::Leased);
        assert!(matches!(
            second.lease_egress("t", "e1", "b").unwrap(),
            LeaseResult::AlreadyLeased { .. }
        ));
    }

    #[test]
    fn saving_a_stale_identity_keeps_the_lease_binding() {
        let path = temp_db("stale-save");
        let mut first = SqliteStore::new(&path).unwrap();
        let mut second = SqliteStore::new(&path).unwrap();
        first.insert_identity(&identity("a")).unwrap();
        first.insert_egress(&egress("e1")).unwrap();

        let mut stale = first.get_identity("t", "a").unwrap().unwrap();
        assert_eq!(second.lease_egress("t", "e1", "a").unwrap(), LeaseResult::Leased);
        stale.lifetime_sent_count = 1;
        first.save_identity(&stale).unwrap();

        let reloaded = first.get_identity("t", "a").unwrap().unwrap();
        assert_eq!(reloaded.bound_egress_id.as_deref(), Some("e1"));
        assert_eq!(reloaded.lifetime_sent_count, 1);
        assert_exclusive(&StoreBackend::Sqlite(first));
    }

    #[test]
    fn memory_save_never_rewrites_the_binding() {
        let mut store = StoreBackend::Memory(MemoryStore::default());
        store.insert_identity(&identity("a")).unwrap();
        store.insert_egress(&egress("e1")).unwrap();
        let stale = store.get_identity("t", "a").unwrap().unwrap();
        store.lease_egress("t", "e1", "a").unwrap();
        store.save_identity(&stale).unwrap();
        assert_eq!(
            store.get_identity("t", "a").unwrap().unwrap().bound_egress_id.as_deref(),
            Some("e1")
        );
        assert_exclusive(&store);
    }

    #[test]
    fn target_pages_follow_insertion_order() {
        for mut store in backends("pages") {
            for i in 0..5 {
                let target = Target {
                    id: format!("tgt{i}"),
                    tenant_id: "t".to_string(),
                    label: format!("user{i}"),
                    seq: 0,
                    status: TargetStatus::Available,
                    last_assigned_identity_id: None,
                    last_error: None,
                    last_attempt_at: None,
                    created_at: Utc::now(),
                };
                assert!(store.insert_target(&target).unwrap().is_some());
                assert!(store.insert_target(&target).unwrap().is_none());
            }
            let first = store
                .list_targets_page("t", Some(TargetStatus::Available), 0, 2)
                .unwrap();
            assert_eq!(first.len(), 2);
            let rest = store
                .list_targets_page("t", Some(TargetStatus::Available), first[1].seq, 10)
                .unwrap();
            let labels: Vec<&str> = rest.iter().map(|t| t.label.as_str()).collect();
            assert_eq!(labels, vec!["user2", "user3", "user4"]);
        }
    }

    #[test]
    fn identity_round_trips_through_sqlite() {
        let mut store = SqliteStore::new(&temp_db("identity")).unwrap();
        let mut original = identity("a");
        original.daily_send_count = 3;
        original.daily_send_window_start = Some(Utc::now());
        original.last_error = Some("login_required".to_string());
        assert!(store.insert_identity(&original).unwrap());
        assert!(!store.insert_identity(&original).unwrap());

        let loaded = store.get_identity("t", "a").unwrap().unwrap();
        assert_eq!(loaded.credential.expose(), "secret");
        assert_eq!(loaded.daily_send_count, 3);
        assert_eq!(loaded.last_error.as_deref(), Some("login_required"));
        assert!(store.get_identity("other-tenant", "a").unwrap().is_none());
    }
}
