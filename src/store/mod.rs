//! Durable persistence for sessions, messages, tool calls, cost records,
//! approvals, and the audit log, backed by an embedded SQLite database.
//!
//! Concurrency model: a per-session advisory lock (in-process, keyed by
//! session id) serialises appends so sequence numbers stay gap-free;
//! cross-session operations run in parallel. Reads never take the lock.

mod types;

pub use types::{
    ApprovalResolution, ApprovalRow, AuditRow, CostAggregate, CostGroupBy, CostRecord, Role,
    Session, StoredMessage, ToolCallRecord, ToolCallStatus,
};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("stale session {session_id}: expected seq {expected}, head is {head}")]
    StaleSession {
        session_id: String,
        expected: i64,
        head: i64,
    },

    #[error("session {0} is read-only")]
    SessionReadOnly(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store corruption in session {session_id}: {detail}")]
    StoreCorruption { session_id: String, detail: String },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::SessionNotFound(_) => "store.session_not_found",
            StoreError::StaleSession { .. } => "store.stale_session",
            StoreError::SessionReadOnly(_) => "store.session_read_only",
            StoreError::StoreUnavailable(_) => "store.unavailable",
            StoreError::StoreCorruption { .. } => "store.corruption",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::StoreUnavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::StoreUnavailable(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub struct Store {
    db_path: PathBuf,
    /// Advisory locks keyed by session id. Entries are created on first
    /// append and live for the process lifetime (bounded by session count).
    session_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::StoreUnavailable(e.to_string()))?;
        }
        let store = Self {
            db_path,
            session_locks: tokio::sync::Mutex::new(HashMap::new()),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> StoreResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                title TEXT NOT NULL,
                parent_id TEXT,
                created_at TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost REAL NOT NULL DEFAULT 0,
                read_only INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                body TEXT NOT NULL,
                tool_call TEXT,
                tool_call_id TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );
            CREATE TABLE IF NOT EXISTS tool_calls (
                session_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT,
                started_at TEXT,
                ended_at TEXT,
                PRIMARY KEY (session_id, id)
            );
            CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                tool_call_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                arguments TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                resolution TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS cost_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                turn_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                input_price REAL NOT NULL,
                output_price REAL NOT NULL,
                cost REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cost_session ON cost_records(session_id);
            CREATE INDEX IF NOT EXISTS idx_cost_created ON cost_records(created_at);
            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                target TEXT NOT NULL,
                metadata TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                self_hash TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    async fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub fn create_session(&self, owner: &str, title: &str) -> StoreResult<Session> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            title: title.to_string(),
            parent_id: None,
            created_at: Utc::now(),
            input_tokens: 0,
            output_tokens: 0,
            total_cost: 0.0,
            read_only: false,
        };
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO sessions (id, owner, title, parent_id, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                session.id,
                session.owner,
                session.title,
                session.parent_id,
                session.created_at.to_rfc3339()
            ],
        )?;
        debug!("created session {}", session.id);
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> StoreResult<Session> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT id, owner, title, parent_id, created_at, input_tokens, output_tokens,
                    total_cost, read_only
             FROM sessions WHERE id = ?",
            [session_id],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    pub fn list_sessions(&self, limit: usize, offset: usize) -> StoreResult<Vec<Session>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner, title, parent_id, created_at, input_tokens, output_tokens,
                    total_cost, read_only
             FROM sessions ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark a session read-only (integrity quarantine). Appends will be
    /// refused until the session is repaired out of band.
    pub fn mark_read_only(&self, session_id: &str) -> StoreResult<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE sessions SET read_only = 1 WHERE id = ?",
            [session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        warn!("session {} marked read-only", session_id);
        Ok(())
    }

    /// Delete a session and everything it owns. Audit entries are not
    /// touched; they reference the session by id only.
    pub fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM sessions WHERE id = ?", [session_id])?;
        if deleted == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        tx.execute("DELETE FROM messages WHERE session_id = ?", [session_id])?;
        tx.execute("DELETE FROM tool_calls WHERE session_id = ?", [session_id])?;
        tx.execute("DELETE FROM approvals WHERE session_id = ?", [session_id])?;
        tx.execute("DELETE FROM cost_records WHERE session_id = ?", [session_id])?;
        tx.commit()?;
        debug!("deleted session {}", session_id);
        Ok(())
    }

    /// Deep-copy a session's messages up to the current head into a new
    /// session. Tool call rows are copied so result references stay valid.
    pub async fn fork_session(
        &self,
        session_id: &str,
        new_title: Option<&str>,
    ) -> StoreResult<Session> {
        let source = self.get_session(session_id)?;
        // Hold the source lock so the fork point is a consistent head.
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let fork = Session {
            id: Uuid::new_v4().to_string(),
            owner: source.owner.clone(),
            title: new_title
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} (fork)", source.title)),
            parent_id: Some(source.id.clone()),
            created_at: Utc::now(),
            input_tokens: source.input_tokens,
            output_tokens: source.output_tokens,
            total_cost: 0.0,
            read_only: false,
        };

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (id, owner, title, parent_id, created_at,
                                   input_tokens, output_tokens)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                fork.id,
                fork.owner,
                fork.title,
                fork.parent_id,
                fork.created_at.to_rfc3339(),
                fork.input_tokens,
                fork.output_tokens
            ],
        )?;
        tx.execute(
            "INSERT INTO messages (session_id, seq, role, body, tool_call, tool_call_id,
                                   input_tokens, output_tokens, created_at)
             SELECT ?, seq, role, body, tool_call, tool_call_id,
                    input_tokens, output_tokens, created_at
             FROM messages WHERE session_id = ?",
            params![fork.id, session_id],
        )?;
        tx.execute(
            "INSERT INTO tool_calls (session_id, id, name, arguments, status, result,
                                     error, started_at, ended_at)
             SELECT ?, id, name, arguments, status, result, error, started_at, ended_at
             FROM tool_calls WHERE session_id = ?",
            params![fork.id, session_id],
        )?;
        tx.commit()?;
        debug!("forked session {} -> {}", session_id, fork.id);
        Ok(fork)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Append a message under the per-session advisory lock. The sequence
    /// number is assigned inside the lock, so it is dense and strictly
    /// increasing. `expected_seq`, when given, detects a competing writer
    /// that committed first (`StaleSession`).
    pub async fn append_message(
        &self,
        session_id: &str,
        msg: NewMessage<'_>,
        expected_seq: Option<i64>,
    ) -> StoreResult<i64> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let session = self.get_session(session_id)?;
        if session.read_only {
            return Err(StoreError::SessionReadOnly(session_id.to_string()));
        }

        let conn = self.connect()?;
        let next_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM messages WHERE session_id = ?",
            [session_id],
            |row| row.get(0),
        )?;
        if let Some(expected) = expected_seq
            && expected != next_seq
        {
            return Err(StoreError::StaleSession {
                session_id: session_id.to_string(),
                expected,
                head: next_seq,
            });
        }

        let tool_call_json = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(msg.tool_calls).unwrap_or_default())
        };
        conn.execute(
            "INSERT INTO messages (session_id, seq, role, body, tool_call, tool_call_id,
                                   input_tokens, output_tokens, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                session_id,
                next_seq,
                msg.role.as_str(),
                msg.body,
                tool_call_json,
                msg.tool_call_id,
                msg.input_tokens,
                msg.output_tokens,
                Utc::now().to_rfc3339()
            ],
        )?;
        conn.execute(
            "UPDATE sessions SET input_tokens = input_tokens + ?,
                                 output_tokens = output_tokens + ?
             WHERE id = ?",
            params![msg.input_tokens, msg.output_tokens, session_id],
        )?;
        Ok(next_seq)
    }

    /// Load messages in sequence order, optionally limited and bounded below
    /// `before` (exclusive). Detects sequence gaps as corruption and marks
    /// the session read-only.
    pub fn load_session(
        &self,
        session_id: &str,
        limit: Option<usize>,
        before: Option<i64>,
    ) -> StoreResult<Vec<StoredMessage>> {
        // Existence check first so a missing session is not confused with an
        // empty one.
        self.get_session(session_id)?;
        let conn = self.connect()?;
        let before = before.unwrap_or(i64::MAX);
        let limit = limit.map_or(i64::MAX, |l| l as i64);
        // Take the last `limit` messages below `before`, then restore order.
        let mut stmt = conn.prepare(
            "SELECT session_id, seq, role, body, tool_call, tool_call_id,
                    input_tokens, output_tokens, created_at
             FROM (SELECT * FROM messages WHERE session_id = ? AND seq < ?
                   ORDER BY seq DESC LIMIT ?)
             ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id, before, limit], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;

        // Dense-sequence check over the loaded window.
        for pair in rows.windows(2) {
            if pair[1].seq != pair[0].seq + 1 {
                let detail = format!("sequence gap between {} and {}", pair[0].seq, pair[1].seq);
                let _ = self.mark_read_only(session_id);
                return Err(StoreError::StoreCorruption {
                    session_id: session_id.to_string(),
                    detail,
                });
            }
        }
        Ok(rows)
    }

    pub fn head_seq(&self, session_id: &str) -> StoreResult<i64> {
        let conn = self.connect()?;
        let head: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), -1) FROM messages WHERE session_id = ?",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(head)
    }

    // -----------------------------------------------------------------------
    // Tool calls
    // -----------------------------------------------------------------------

    pub fn upsert_tool_call(&self, session_id: &str, tc: &ToolCallRecord) -> StoreResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO tool_calls (session_id, id, name, arguments, status, result,
                                     error, started_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id, id) DO UPDATE SET
                status = excluded.status,
                result = excluded.result,
                error = excluded.error,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at",
            params![
                session_id,
                tc.id,
                tc.name,
                serde_json::to_string(&tc.arguments).unwrap_or_default(),
                tc.status.as_str(),
                tc.result,
                tc.error,
                tc.started_at.map(|t| t.to_rfc3339()),
                tc.ended_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_tool_call(
        &self,
        session_id: &str,
        tool_call_id: &str,
    ) -> StoreResult<Option<ToolCallRecord>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, name, arguments, status, result, error, started_at, ended_at
                 FROM tool_calls WHERE session_id = ? AND id = ?",
                params![session_id, tool_call_id],
                row_to_tool_call,
            )
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    pub fn insert_approval(&self, row: &ApprovalRow) -> StoreResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO approvals (id, session_id, tool_call_id, reason, arguments,
                                    created_at, expires_at, resolution)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                row.id,
                row.session_id,
                row.tool_call_id,
                row.reason,
                serde_json::to_string(&row.arguments).unwrap_or_default(),
                row.created_at.to_rfc3339(),
                row.expires_at.to_rfc3339(),
                row.resolution.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Set the resolution only if still pending. Returns the resolution now
    /// recorded, so repeat calls are idempotent observers.
    pub fn resolve_approval(
        &self,
        approval_id: &str,
        resolution: ApprovalResolution,
    ) -> StoreResult<ApprovalResolution> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE approvals SET resolution = ? WHERE id = ? AND resolution = 'pending'",
            params![resolution.as_str(), approval_id],
        )?;
        let current: Option<String> = conn
            .query_row(
                "SELECT resolution FROM approvals WHERE id = ?",
                [approval_id],
                |row| row.get(0),
            )
            .optional()?;
        let current =
            current.ok_or_else(|| StoreError::SessionNotFound(approval_id.to_string()))?;
        Ok(ApprovalResolution::parse(&current))
    }

    pub fn get_approval(&self, approval_id: &str) -> StoreResult<Option<ApprovalRow>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, session_id, tool_call_id, reason, arguments, created_at,
                        expires_at, resolution
                 FROM approvals WHERE id = ?",
                [approval_id],
                row_to_approval,
            )
            .optional()?;
        Ok(row)
    }

    pub fn pending_approvals(&self) -> StoreResult<Vec<ApprovalRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, tool_call_id, reason, arguments, created_at,
                    expires_at, resolution
             FROM approvals WHERE resolution = 'pending' ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_approval)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Cost
    // -----------------------------------------------------------------------

    pub fn record_cost(&self, record: &CostRecord) -> StoreResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO cost_records (session_id, turn_id, provider, model, input_tokens,
                                       output_tokens, input_price, output_price, cost, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.session_id,
                record.turn_id,
                record.provider,
                record.model,
                record.input_tokens,
                record.output_tokens,
                record.input_price,
                record.output_price,
                record.cost,
                record.created_at.to_rfc3339(),
            ],
        )?;
        conn.execute(
            "UPDATE sessions SET total_cost = total_cost + ? WHERE id = ?",
            params![record.cost, record.session_id],
        )?;
        Ok(())
    }

    pub fn query_cost(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        group_by: CostGroupBy,
    ) -> StoreResult<Vec<CostAggregate>> {
        let conn = self.connect()?;
        let key_expr = match group_by {
            CostGroupBy::Session => "session_id",
            CostGroupBy::Day => "substr(created_at, 1, 10)",
            CostGroupBy::Month => "substr(created_at, 1, 7)",
            CostGroupBy::Provider => "provider",
        };
        let since = since.map_or_else(|| "0000".to_string(), |t| t.to_rfc3339());
        let until = until.map_or_else(|| "9999".to_string(), |t| t.to_rfc3339());
        let sql = format!(
            "SELECT {key_expr} AS k, SUM(input_tokens), SUM(output_tokens), SUM(cost)
             FROM cost_records
             WHERE created_at >= ? AND created_at < ?
             GROUP BY k ORDER BY k"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![since, until], |row| {
                Ok(CostAggregate {
                    key: row.get(0)?,
                    input_tokens: row.get(1)?,
                    output_tokens: row.get(2)?,
                    cost: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Total recorded cost for records whose timestamp starts with `prefix`
    /// (RFC 3339 date or month prefix), optionally scoped to one session.
    pub fn cost_sum(&self, prefix: &str, session_id: Option<&str>) -> StoreResult<f64> {
        let conn = self.connect()?;
        let like = format!("{prefix}%");
        let total: f64 = match session_id {
            Some(sid) => conn.query_row(
                "SELECT COALESCE(SUM(cost), 0) FROM cost_records
                 WHERE created_at LIKE ? AND session_id = ?",
                params![like, sid],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COALESCE(SUM(cost), 0) FROM cost_records WHERE created_at LIKE ?",
                [like],
                |row| row.get(0),
            )?,
        };
        Ok(total)
    }

    pub fn cost_total(&self) -> StoreResult<f64> {
        let conn = self.connect()?;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost), 0) FROM cost_records",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    /// Insert a fully-formed audit row. Only the audit writer task calls
    /// this; it owns chain ordering.
    pub fn append_audit(&self, row: &AuditRow) -> StoreResult<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO audit_log (created_at, actor, action, target, metadata,
                                    prev_hash, self_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                row.created_at.to_rfc3339(),
                row.actor,
                row.action,
                row.target,
                row.metadata,
                row.prev_hash,
                row.self_hash,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn last_audit(&self) -> StoreResult<Option<AuditRow>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT seq, created_at, actor, action, target, metadata, prev_hash, self_hash
                 FROM audit_log ORDER BY seq DESC LIMIT 1",
                [],
                row_to_audit,
            )
            .optional()?;
        Ok(row)
    }

    pub fn load_audit(
        &self,
        actor: Option<&str>,
        action: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<AuditRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT seq, created_at, actor, action, target, metadata, prev_hash, self_hash
             FROM audit_log
             WHERE (?1 IS NULL OR actor = ?1)
               AND (?2 IS NULL OR action = ?2)
               AND (?3 IS NULL OR created_at >= ?3)
             ORDER BY seq ASC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![
                    actor,
                    action,
                    since.map(|t| t.to_rfc3339()),
                    limit as i64
                ],
                row_to_audit,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Test hook: rewrite an audit row's metadata in place, bypassing the
    /// writer task, to exercise chain-break detection.
    #[cfg(test)]
    pub(crate) fn tamper_audit_for_tests(&self, seq: i64, metadata: &str) {
        let conn = self.connect().unwrap();
        conn.execute(
            "UPDATE audit_log SET metadata = ? WHERE seq = ?",
            params![metadata, seq],
        )
        .unwrap();
    }

    /// Stream the whole chain in sequence order for verification.
    pub fn all_audit(&self) -> StoreResult<Vec<AuditRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT seq, created_at, actor, action, target, metadata, prev_hash, self_hash
             FROM audit_log ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_audit)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Borrow-friendly message payload for [`Store::append_message`].
pub struct NewMessage<'a> {
    pub role: Role,
    pub body: &'a str,
    pub tool_calls: &'a [ToolCallRecord],
    pub tool_call_id: Option<&'a str>,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl<'a> NewMessage<'a> {
    pub fn text(role: Role, body: &'a str) -> Self {
        Self {
            role,
            body,
            tool_calls: &[],
            tool_call_id: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        owner: row.get(1)?,
        title: row.get(2)?,
        parent_id: row.get(3)?,
        created_at: parse_instant(&row.get::<_, String>(4)?),
        input_tokens: row.get(5)?,
        output_tokens: row.get(6)?,
        total_cost: row.get(7)?,
        read_only: row.get::<_, i64>(8)? != 0,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let tool_calls: Option<String> = row.get(4)?;
    Ok(StoredMessage {
        session_id: row.get(0)?,
        seq: row.get(1)?,
        role: Role::parse(&row.get::<_, String>(2)?),
        body: row.get(3)?,
        tool_calls: tool_calls
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        tool_call_id: row.get(5)?,
        input_tokens: row.get(6)?,
        output_tokens: row.get(7)?,
        created_at: parse_instant(&row.get::<_, String>(8)?),
    })
}

fn row_to_tool_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCallRecord> {
    let arguments: String = row.get(2)?;
    let started_at: Option<String> = row.get(6)?;
    let ended_at: Option<String> = row.get(7)?;
    Ok(ToolCallRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        arguments: serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null),
        status: ToolCallStatus::parse(&row.get::<_, String>(3)?),
        result: row.get(4)?,
        error: row.get(5)?,
        started_at: started_at.as_deref().map(parse_instant),
        ended_at: ended_at.as_deref().map(parse_instant),
    })
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRow> {
    let arguments: String = row.get(4)?;
    Ok(ApprovalRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        tool_call_id: row.get(2)?,
        reason: row.get(3)?,
        arguments: serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null),
        created_at: parse_instant(&row.get::<_, String>(5)?),
        expires_at: parse_instant(&row.get::<_, String>(6)?),
        resolution: ApprovalResolution::parse(&row.get::<_, String>(7)?),
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok(AuditRow {
        seq: row.get(0)?,
        created_at: parse_instant(&row.get::<_, String>(1)?),
        actor: row.get(2)?,
        action: row.get(3)?,
        target: row.get(4)?,
        metadata: row.get(5)?,
        prev_hash: row.get(6)?,
        self_hash: row.get(7)?,
    })
}

fn parse_instant(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
