// SPDX-License-Identifier: Apache-2.0
//! `rusqlite`-backed [`LedgerStore`]: one embedded SQL database file per
//! process, WAL mode so readers never block the single writer.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{GatewayError, Result};
use crate::model::{
    ChannelBinding, EventDirection, EventType, LedgerEvent, Principal, PrincipalKind,
    PrincipalStatus, Role, RoleAssignment,
};

use super::{EventFilter, EventPage, LedgerStore, PrincipalFilter};

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_events (
                id TEXT PRIMARY KEY,
                conversation_key TEXT NOT NULL,
                direction TEXT NOT NULL,
                author TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                text TEXT,
                raw_transport TEXT,
                raw_payload_ref TEXT,
                actor_principal_id TEXT,
                actor_member_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_events_conv_ts
                ON ledger_events (conversation_key, timestamp, id);

            CREATE TABLE IF NOT EXISTS principals (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                pubkey_fingerprint TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_seen TEXT
            );

            CREATE TABLE IF NOT EXISTS role_assignments (
                subject_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (subject_id, role)
            );

            CREATE TABLE IF NOT EXISTS channel_bindings (
                frontend TEXT NOT NULL,
                external_channel_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                working_dir_hint TEXT,
                PRIMARY KEY (frontend, external_channel_id)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor_principal_id TEXT NOT NULL,
                action TEXT NOT NULL,
                detail TEXT NOT NULL,
                at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        f(&conn).map_err(GatewayError::from)
    }
}

fn direction_str(d: EventDirection) -> &'static str {
    match d {
        EventDirection::InboundToAgent => "inbound_to_agent",
        EventDirection::OutboundFromAgent => "outbound_from_agent",
    }
}

fn direction_from_str(s: &str) -> EventDirection {
    match s {
        "outbound_from_agent" => EventDirection::OutboundFromAgent,
        _ => EventDirection::InboundToAgent,
    }
}

fn event_type_str(t: EventType) -> &'static str {
    match t {
        EventType::Message => "message",
        EventType::ToolCall => "tool_call",
        EventType::ToolResult => "tool_result",
        EventType::System => "system",
        EventType::Error => "error",
    }
}

fn event_type_from_str(s: &str) -> EventType {
    match s {
        "tool_call" => EventType::ToolCall,
        "tool_result" => EventType::ToolResult,
        "system" => EventType::System,
        "error" => EventType::Error,
        _ => EventType::Message,
    }
}

fn principal_kind_str(k: PrincipalKind) -> &'static str {
    match k {
        PrincipalKind::Client => "client",
        PrincipalKind::Agent => "agent",
        PrincipalKind::Pack => "pack",
    }
}

fn principal_kind_from_str(s: &str) -> PrincipalKind {
    match s {
        "agent" => PrincipalKind::Agent,
        "pack" => PrincipalKind::Pack,
        _ => PrincipalKind::Client,
    }
}

fn principal_status_str(s: PrincipalStatus) -> &'static str {
    match s {
        PrincipalStatus::Pending => "pending",
        PrincipalStatus::Approved => "approved",
        PrincipalStatus::Revoked => "revoked",
        PrincipalStatus::Online => "online",
        PrincipalStatus::Offline => "offline",
    }
}

fn principal_status_from_str(s: &str) -> PrincipalStatus {
    match s {
        "approved" => PrincipalStatus::Approved,
        "revoked" => PrincipalStatus::Revoked,
        "online" => PrincipalStatus::Online,
        "offline" => PrincipalStatus::Offline,
        _ => PrincipalStatus::Pending,
    }
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::Owner => "owner",
        Role::Admin => "admin",
        Role::Member => "member",
        Role::Leader => "leader",
    }
}

fn role_from_str(s: &str) -> Role {
    match s {
        "owner" => Role::Owner,
        "admin" => Role::Admin,
        "leader" => Role::Leader,
        _ => Role::Member,
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<LedgerEvent> {
    Ok(LedgerEvent {
        id: row.get(0)?,
        conversation_key: row.get(1)?,
        direction: direction_from_str(&row.get::<_, String>(2)?),
        author: row.get(3)?,
        timestamp: parse_ts(&row.get::<_, String>(4)?),
        event_type: event_type_from_str(&row.get::<_, String>(5)?),
        text: row.get(6)?,
        raw_transport: row.get(7)?,
        raw_payload_ref: row.get(8)?,
        actor_principal_id: row.get(9)?,
        actor_member_id: row.get(10)?,
    })
}

fn row_to_principal(row: &rusqlite::Row) -> rusqlite::Result<Principal> {
    Ok(Principal {
        id: row.get(0)?,
        kind: principal_kind_from_str(&row.get::<_, String>(1)?),
        pubkey_fingerprint: row.get(2)?,
        display_name: row.get(3)?,
        status: principal_status_from_str(&row.get::<_, String>(4)?),
        created_at: parse_ts(&row.get::<_, String>(5)?),
        last_seen: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_ts(&s)),
    })
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn save_event(&self, event: LedgerEvent) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO ledger_events
                 (id, conversation_key, direction, author, timestamp, event_type,
                  text, raw_transport, raw_payload_ref, actor_principal_id, actor_member_id)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    event.id,
                    event.conversation_key,
                    direction_str(event.direction),
                    event.author,
                    event.timestamp.to_rfc3339(),
                    event_type_str(event.event_type),
                    event.text,
                    event.raw_transport,
                    event.raw_payload_ref,
                    event.actor_principal_id,
                    event.actor_member_id,
                ],
            )?;
            Ok(())
        })
        .map_err(|e| match e {
            GatewayError::Storage(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                GatewayError::Conflict("duplicate ledger event id".into())
            }
            other => other,
        })
    }

    async fn get_events_by_conversation(
        &self,
        conversation_key: &str,
        filter: EventFilter,
    ) -> Result<EventPage> {
        let conversation_key = conversation_key.to_string();
        self.run(move |conn| {
            let mut sql = String::from(
                "SELECT id, conversation_key, direction, author, timestamp, event_type,
                        text, raw_transport, raw_payload_ref, actor_principal_id, actor_member_id
                 FROM ledger_events WHERE conversation_key = ?1",
            );
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(conversation_key)];

            if let Some(since) = filter.since_timestamp {
                bound.push(Box::new(since.to_rfc3339()));
                sql.push_str(&format!(" AND timestamp >= ?{}", bound.len()));
            }
            if let Some(until) = filter.until_timestamp {
                bound.push(Box::new(until.to_rfc3339()));
                sql.push_str(&format!(" AND timestamp <= ?{}", bound.len()));
            }
            // `cursor` (an opaque `next_cursor` from a prior page) and
            // `since_event_id` (an explicit resume point) both mean "only
            // events strictly after this id in (timestamp, id) order" —
            // cursor wins if both are set.
            if let Some(after_id) = filter.cursor.or(filter.since_event_id) {
                bound.push(Box::new(after_id));
                let idx = bound.len();
                sql.push_str(&format!(
                    " AND (timestamp, id) > ((SELECT timestamp FROM ledger_events WHERE id = ?{idx}), ?{idx})"
                ));
            }
            sql.push_str(" ORDER BY timestamp ASC, id ASC");
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let events: Vec<LedgerEvent> = stmt
                .query_map(param_refs.as_slice(), row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(EventPage {
                next_cursor: events.last().map(|e| e.id.clone()),
                events,
            })
        })
    }

    async fn get_events_by_thread(&self, thread_id: &str, limit: usize) -> Result<Vec<LedgerEvent>> {
        let thread_id = thread_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_key, direction, author, timestamp, event_type,
                        text, raw_transport, raw_payload_ref, actor_principal_id, actor_member_id
                 FROM ledger_events WHERE conversation_key = ?1
                 ORDER BY timestamp ASC, id ASC LIMIT ?2",
            )?;
            stmt.query_map(params![thread_id, limit as i64], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    async fn get_principal(&self, id: &str) -> Result<Option<Principal>> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT id, kind, pubkey_fingerprint, display_name, status, created_at, last_seen
                 FROM principals WHERE id = ?1",
                params![id],
                row_to_principal,
            )
            .optional()
        })
    }

    async fn get_principal_by_pubkey(&self, fingerprint: &str) -> Result<Option<Principal>> {
        let fingerprint = fingerprint.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT id, kind, pubkey_fingerprint, display_name, status, created_at, last_seen
                 FROM principals WHERE pubkey_fingerprint = ?1",
                params![fingerprint],
                row_to_principal,
            )
            .optional()
        })
    }

    async fn create_principal(&self, principal: Principal) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO principals
                 (id, kind, pubkey_fingerprint, display_name, status, created_at, last_seen)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    principal.id,
                    principal_kind_str(principal.kind),
                    principal.pubkey_fingerprint,
                    principal.display_name,
                    principal_status_str(principal.status),
                    principal.created_at.to_rfc3339(),
                    principal.last_seen.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .map_err(|e| match e {
            GatewayError::Storage(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                GatewayError::Conflict("principal id or pubkey fingerprint already exists".into())
            }
            other => other,
        })
    }

    async fn update_principal_status(
        &self,
        id: &str,
        status: PrincipalStatus,
    ) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE principals SET status = ?1 WHERE id = ?2",
                params![principal_status_str(status), id],
            )?;
            Ok(())
        })
    }

    async fn touch_principal_last_seen(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE principals SET last_seen = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )?;
            Ok(())
        })
    }

    async fn count_principals(&self, filter: PrincipalFilter) -> Result<u64> {
        self.run(move |conn| {
            let mut sql = String::from("SELECT COUNT(*) FROM principals WHERE 1=1");
            if let Some(kind) = filter.kind {
                sql.push_str(&format!(" AND kind = '{}'", principal_kind_str(kind)));
            }
            if let Some(status) = filter.status {
                sql.push_str(&format!(" AND status = '{}'", principal_status_str(status)));
            }
            conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    async fn delete_principal(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM principals WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    async fn add_role(&self, assignment: RoleAssignment) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO role_assignments (subject_id, role) VALUES (?1,?2)",
                params![assignment.subject_id, role_str(assignment.role)],
            )?;
            Ok(())
        })
    }

    async fn list_roles(&self, subject_id: &str) -> Result<Vec<RoleAssignment>> {
        let subject_id = subject_id.to_string();
        self.run(move |conn| {
            let mut stmt =
                conn.prepare("SELECT subject_id, role FROM role_assignments WHERE subject_id = ?1")?;
            stmt.query_map(params![subject_id], |row| {
                Ok(RoleAssignment {
                    subject_id: row.get(0)?,
                    role: role_from_str(&row.get::<_, String>(1)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    async fn create_binding(&self, binding: ChannelBinding) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO channel_bindings
                 (frontend, external_channel_id, agent_id, created_at, working_dir_hint)
                 VALUES (?1,?2,?3,?4,?5)",
                params![
                    binding.frontend,
                    binding.external_channel_id,
                    binding.agent_id,
                    binding.created_at.to_rfc3339(),
                    binding.working_dir_hint,
                ],
            )?;
            Ok(())
        })
        .map_err(|e| match e {
            GatewayError::Storage(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                GatewayError::Conflict("binding already exists for (frontend, channel)".into())
            }
            other => other,
        })
    }

    async fn get_binding(
        &self,
        frontend: &str,
        external_channel_id: &str,
    ) -> Result<Option<ChannelBinding>> {
        let frontend = frontend.to_string();
        let external_channel_id = external_channel_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT frontend, external_channel_id, agent_id, created_at, working_dir_hint
                 FROM channel_bindings WHERE frontend = ?1 AND external_channel_id = ?2",
                params![frontend, external_channel_id],
                |row| {
                    Ok(ChannelBinding {
                        frontend: row.get(0)?,
                        external_channel_id: row.get(1)?,
                        agent_id: row.get(2)?,
                        created_at: parse_ts(&row.get::<_, String>(3)?),
                        working_dir_hint: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    async fn list_bindings(&self) -> Result<Vec<ChannelBinding>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT frontend, external_channel_id, agent_id, created_at, working_dir_hint
                 FROM channel_bindings ORDER BY created_at ASC",
            )?;
            stmt.query_map([], |row| {
                Ok(ChannelBinding {
                    frontend: row.get(0)?,
                    external_channel_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    created_at: parse_ts(&row.get::<_, String>(3)?),
                    working_dir_hint: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    async fn delete_binding(&self, frontend: &str, external_channel_id: &str) -> Result<()> {
        let frontend = frontend.to_string();
        let external_channel_id = external_channel_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM channel_bindings WHERE frontend = ?1 AND external_channel_id = ?2",
                params![frontend, external_channel_id],
            )?;
            Ok(())
        })
    }

    async fn append_audit(
        &self,
        actor_principal_id: &str,
        action: &str,
        detail: &str,
    ) -> Result<()> {
        let actor_principal_id = actor_principal_id.to_string();
        let action = action.to_string();
        let detail = detail.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (actor_principal_id, action, detail, at) VALUES (?1,?2,?3,?4)",
                params![actor_principal_id, action, detail, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}
