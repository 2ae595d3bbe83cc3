//! SQLite-based store implementation

use chrono::{DateTime, Utc};
use portal_api::{Role, SessionState};
use portal_util::{InstanceId, UserId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    AuditEvent, InstanceRecord, SessionRecord, Store, StoreError, StoreResult, UserRecord,
};

const USER_COLUMNS: &str =
    "id, role, owner, instance_uuid, session_state, last_heartbeat, last_transition";

const INSTANCE_COLUMNS: &str = "uuid, provider_id, nickname, target_url, assigned_user";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("store lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Users and their session fields
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                owner TEXT,
                instance_uuid TEXT REFERENCES instances(uuid),
                session_state TEXT NOT NULL DEFAULT 'inactive',
                last_heartbeat TEXT,
                last_transition TEXT
            );

            -- Instance inventory
            CREATE TABLE IF NOT EXISTS instances (
                uuid TEXT PRIMARY KEY,
                provider_id INTEGER NOT NULL UNIQUE,
                nickname TEXT NOT NULL DEFAULT '',
                target_url TEXT NOT NULL,
                assigned_user TEXT REFERENCES users(id)
            );

            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- One instance per user, one user per instance
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_instance
                ON users(instance_uuid) WHERE instance_uuid IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_user
                ON instances(assigned_user) WHERE assigned_user IS NOT NULL;

            CREATE INDEX IF NOT EXISTS idx_users_state ON users(session_state);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn query_users(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> StoreResult<Vec<UserRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM users {} ORDER BY id", USER_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, user_from_row)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(StoreError::Serialization(message)),
    )
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", s, e)))
    })
    .transpose()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let role: String = row.get(1)?;
    let role = Role::parse(&role).ok_or_else(|| conversion_error(1, format!("unknown role '{}'", role)))?;
    let state: String = row.get(4)?;
    let state: SessionState = state
        .parse()
        .map_err(|e: portal_api::ParseStateError| conversion_error(4, e.to_string()))?;

    Ok(UserRecord {
        id: UserId::new(row.get::<_, String>(0)?),
        role,
        owner: row.get::<_, Option<String>>(2)?.map(UserId::new),
        instance: row.get::<_, Option<String>>(3)?.map(InstanceId::new),
        session: SessionRecord {
            state,
            last_heartbeat: timestamp_column(row, 5)?,
            last_transition: timestamp_column(row, 6)?,
        },
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<InstanceRecord> {
    let provider_id: i64 = row.get(1)?;
    Ok(InstanceRecord {
        uuid: InstanceId::new(row.get::<_, String>(0)?),
        provider_id: provider_id as u64,
        nickname: row.get(2)?,
        target_url: row.get(3)?,
        assigned_user: row.get::<_, Option<String>>(4)?.map(UserId::new),
    })
}

/// Users owned by `owner` that currently hold an instance
fn assigned_for_owner(conn: &Connection, owner: &str) -> rusqlite::Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE owner = ?1 AND instance_uuid IS NOT NULL",
        [owner],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

impl Store for SqliteStore {
    fn ensure_user(&self, id: &UserId, role: Role, owner: Option<&UserId>) -> StoreResult<bool> {
        let conn = self.conn()?;

        let exists = conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", [id.as_str()], |_| Ok(()))
            .optional()?
            .is_some();

        conn.execute(
            r#"
            INSERT INTO users (id, role, owner)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id)
            DO UPDATE SET role = excluded.role, owner = excluded.owner
            "#,
            params![id.as_str(), role.as_str(), owner.map(|o| o.as_str())],
        )?;

        debug!(user_id = %id, created = !exists, "User ensured");
        Ok(!exists)
    }

    fn get_user(&self, id: &UserId) -> StoreResult<Option<UserRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        let user = conn
            .query_row(&sql, [id.as_str()], user_from_row)
            .optional()?;
        Ok(user)
    }

    fn list_users(&self) -> StoreResult<Vec<UserRecord>> {
        self.query_users("", &[])
    }

    fn users_in_state(&self, state: SessionState) -> StoreResult<Vec<UserRecord>> {
        self.query_users("WHERE session_state = ?1", &[&state.as_str()])
    }

    fn users_with_assignment(&self) -> StoreResult<Vec<UserRecord>> {
        self.query_users("WHERE instance_uuid IS NOT NULL", &[])
    }

    fn save_session(&self, id: &UserId, session: &SessionRecord) -> StoreResult<()> {
        let conn = self.conn()?;

        let updated = conn.execute(
            r#"
            UPDATE users
            SET session_state = ?1, last_heartbeat = ?2, last_transition = ?3
            WHERE id = ?4
            "#,
            params![
                session.state.as_str(),
                session.last_heartbeat.map(|t| t.to_rfc3339()),
                session.last_transition.map(|t| t.to_rfc3339()),
                id.as_str(),
            ],
        )?;

        if updated == 0 {
            return Err(StoreError::NotFound(format!("user {}", id)));
        }
        Ok(())
    }

    fn ensure_instance(&self, instance: &InstanceRecord) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO instances (uuid, provider_id, nickname, target_url)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(uuid)
            DO UPDATE SET
                provider_id = excluded.provider_id,
                nickname = excluded.nickname,
                target_url = excluded.target_url
            "#,
            params![
                instance.uuid.as_str(),
                instance.provider_id as i64,
                instance.nickname,
                instance.target_url,
            ],
        )?;

        debug!(instance = %instance.uuid, "Instance ensured");
        Ok(())
    }

    fn get_instance(&self, uuid: &InstanceId) -> StoreResult<Option<InstanceRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM instances WHERE uuid = ?1", INSTANCE_COLUMNS);
        let instance = conn
            .query_row(&sql, [uuid.as_str()], instance_from_row)
            .optional()?;
        Ok(instance)
    }

    fn list_instances(&self) -> StoreResult<Vec<InstanceRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM instances ORDER BY uuid", INSTANCE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], instance_from_row)?;

        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    fn instance_for_user(&self, user: &UserId) -> StoreResult<Option<InstanceRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM instances WHERE assigned_user = ?1",
            INSTANCE_COLUMNS
        );
        let instance = conn
            .query_row(&sql, [user.as_str()], instance_from_row)
            .optional()?;
        Ok(instance)
    }

    fn assign(
        &self,
        user: &UserId,
        instance: &InstanceId,
        owner_limit: Option<u32>,
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let held: Option<(Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT instance_uuid, owner FROM users WHERE id = ?1",
                [user.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let owner = match held {
            None => return Err(StoreError::NotFound(format!("user {}", user))),
            Some((Some(current), _)) => {
                return Err(StoreError::Conflict(format!(
                    "user {} already holds instance {}",
                    user, current
                )));
            }
            Some((None, owner)) => owner,
        };

        let holder: Option<Option<String>> = tx
            .query_row(
                "SELECT assigned_user FROM instances WHERE uuid = ?1",
                [instance.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match holder {
            None => return Err(StoreError::NotFound(format!("instance {}", instance))),
            Some(Some(other)) => {
                return Err(StoreError::Conflict(format!(
                    "instance {} is already assigned to {}",
                    instance, other
                )));
            }
            Some(None) => {}
        }

        // Counted inside the transaction so concurrent assigns cannot both
        // squeeze under the limit
        if let (Some(owner), Some(limit)) = (owner, owner_limit) {
            let assigned = assigned_for_owner(&tx, &owner)?;
            if assigned >= limit {
                return Err(StoreError::OwnerLimit {
                    owner: UserId::new(owner),
                    assigned,
                    limit,
                });
            }
        }

        tx.execute(
            "UPDATE users SET instance_uuid = ?1 WHERE id = ?2",
            params![instance.as_str(), user.as_str()],
        )?;
        tx.execute(
            "UPDATE instances SET assigned_user = ?1 WHERE uuid = ?2",
            params![user.as_str(), instance.as_str()],
        )?;
        tx.commit()?;

        debug!(user_id = %user, instance = %instance, "Assignment stored");
        Ok(())
    }

    fn release(&self, user: &UserId) -> StoreResult<Option<InstanceId>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let held: Option<Option<String>> = tx
            .query_row(
                "SELECT instance_uuid FROM users WHERE id = ?1",
                [user.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let instance = match held {
            None => return Err(StoreError::NotFound(format!("user {}", user))),
            Some(None) => return Ok(None),
            Some(Some(instance)) => instance,
        };

        tx.execute(
            "UPDATE users SET instance_uuid = NULL WHERE id = ?1",
            [user.as_str()],
        )?;
        tx.execute(
            "UPDATE instances SET assigned_user = NULL WHERE uuid = ?1",
            [instance.as_str()],
        )?;
        tx.commit()?;

        debug!(user_id = %user, instance = %instance, "Assignment cleared");
        Ok(Some(InstanceId::new(instance)))
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?1, ?2)",
            params![event.timestamp.to_rfc3339(), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| portal_util::now());
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}
