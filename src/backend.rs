//! Append-only document store over SQLite.
//!
//! Every persisted entity of the engine lives here: sites, operations,
//! progress entries, plans, phase states, tokens, trusted clusters,
//! endpoints, auth resources, audit events, operation logs. Entities are
//! stored as JSON documents with their natural keys as columns; the write
//! semantics follow the concurrency contract:
//!
//! - `create_*` is insert-or-`already_exists`
//! - `upsert_*` is unconditional
//! - `compare_and_swap_*` fails with `compare_failed` when the stored value
//!   no longer matches the expectation
//!
//! The handle is a thin `Arc<Mutex<Connection>>`; critical sections are
//! single statements, so the mutex is held briefly even under the async
//! servers.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{EngineError, Result};
use crate::model::{
    Endpoints, Operation, OperationKey, OperationState, ProgressEntry, ProvisioningToken, Site,
    TrustedCluster,
};
use crate::plan::{OperationPlan, PhaseState};

/// Shared database handle. Cloning shares the connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                domain  TEXT PRIMARY KEY,
                doc     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS operations (
                site_domain TEXT NOT NULL,
                id          TEXT NOT NULL,
                state       TEXT NOT NULL,
                created     TEXT NOT NULL,
                doc         TEXT NOT NULL,
                PRIMARY KEY (site_domain, id)
            );
            CREATE TABLE IF NOT EXISTS progress_entries (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                site_domain TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                created     TEXT NOT NULL,
                doc         TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS plans (
                site_domain  TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                doc          TEXT NOT NULL,
                PRIMARY KEY (site_domain, operation_id)
            );
            CREATE TABLE IF NOT EXISTS phase_states (
                site_domain  TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                phase_id     TEXT NOT NULL,
                state        TEXT NOT NULL,
                error        TEXT,
                updated      TEXT NOT NULL,
                PRIMARY KEY (site_domain, operation_id, phase_id)
            );
            CREATE TABLE IF NOT EXISTS tokens (
                token   TEXT PRIMARY KEY,
                expires TEXT,
                doc     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trusted_clusters (
                name    TEXT PRIMARY KEY,
                expires TEXT,
                doc     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS endpoints (
                site_domain TEXT PRIMARY KEY,
                doc         TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS resources (
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                doc  TEXT NOT NULL,
                PRIMARY KEY (kind, name)
            );
            CREATE TABLE IF NOT EXISTS audit_events (
                seq     INTEGER PRIMARY KEY AUTOINCREMENT,
                created TEXT NOT NULL,
                event   TEXT NOT NULL,
                doc     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS log_entries (
                seq          INTEGER PRIMARY KEY AUTOINCREMENT,
                site_domain  TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                created      TEXT NOT NULL,
                message      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS blobs (
                digest TEXT PRIMARY KEY,
                data   BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS packages (
                repository TEXT NOT NULL,
                name       TEXT NOT NULL,
                version    TEXT NOT NULL,
                digest     TEXT NOT NULL,
                size       INTEGER NOT NULL,
                encrypted  INTEGER NOT NULL DEFAULT 0,
                created    TEXT NOT NULL,
                PRIMARY KEY (repository, name, version)
            );
            "#,
        )?;
        Ok(())
    }
}

/// Typed access to the persisted entities.
#[derive(Clone)]
pub struct Backend {
    db: Db,
}

impl Backend {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    // ── Sites ─────────────────────────────────────────────────────────

    pub fn create_site(&self, site: &Site) -> Result<()> {
        site.check()?;
        let doc = serde_json::to_string(site)?;
        let conn = self.db.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sites (domain, doc) VALUES (?1, ?2)",
            params![site.domain, doc],
        )?;
        if inserted == 0 {
            return Err(EngineError::already_exists(format!("site {}", site.domain)));
        }
        Ok(())
    }

    pub fn upsert_site(&self, site: &Site) -> Result<()> {
        site.check()?;
        let doc = serde_json::to_string(site)?;
        self.db.lock().execute(
            "INSERT INTO sites (domain, doc) VALUES (?1, ?2)
             ON CONFLICT (domain) DO UPDATE SET doc = excluded.doc",
            params![site.domain, doc],
        )?;
        Ok(())
    }

    pub fn update_site(&self, site: &Site) -> Result<()> {
        site.check()?;
        let doc = serde_json::to_string(site)?;
        let updated = self.db.lock().execute(
            "UPDATE sites SET doc = ?2 WHERE domain = ?1",
            params![site.domain, doc],
        )?;
        if updated == 0 {
            return Err(EngineError::not_found(format!("site {}", site.domain)));
        }
        Ok(())
    }

    pub fn get_site(&self, domain: &str) -> Result<Site> {
        let conn = self.db.lock();
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM sites WHERE domain = ?1", params![domain], |row| {
                row.get(0)
            })
            .optional()?;
        match doc {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Err(EngineError::not_found(format!("site {domain}"))),
        }
    }

    pub fn list_sites(&self) -> Result<Vec<Site>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT doc FROM sites ORDER BY domain")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut sites = Vec::new();
        for doc in rows {
            sites.push(serde_json::from_str(&doc?)?);
        }
        Ok(sites)
    }

    // ── Operations ────────────────────────────────────────────────────

    /// Create an operation, enforcing the at-most-one-active invariant.
    pub fn create_operation(&self, op: &Operation) -> Result<()> {
        let doc = serde_json::to_string(op)?;
        let conn = self.db.lock();
        let active: Option<String> = conn
            .query_row(
                "SELECT id FROM operations
                 WHERE site_domain = ?1
                   AND state NOT IN ('install_completed', 'install_failed',
                                     'expand_completed', 'expand_failed')
                 LIMIT 1",
                params![op.site_domain],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(active_id) = active {
            return Err(EngineError::already_exists(format!(
                "operation {active_id} is still active on site {}",
                op.site_domain
            )));
        }
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO operations (site_domain, id, state, created, doc)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![op.site_domain, op.id, op.state.to_string(), op.created.to_rfc3339(), doc],
        )?;
        if inserted == 0 {
            return Err(EngineError::already_exists(format!("operation {}", op.id)));
        }
        Ok(())
    }

    /// Unconditional write used by replication, where the remote copy is
    /// authoritative.
    pub fn upsert_operation(&self, op: &Operation) -> Result<()> {
        let doc = serde_json::to_string(op)?;
        self.db.lock().execute(
            "INSERT INTO operations (site_domain, id, state, created, doc)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (site_domain, id)
             DO UPDATE SET state = excluded.state, doc = excluded.doc",
            params![op.site_domain, op.id, op.state.to_string(), op.created.to_rfc3339(), doc],
        )?;
        Ok(())
    }

    pub fn update_operation(&self, op: &Operation) -> Result<()> {
        let doc = serde_json::to_string(op)?;
        let updated = self.db.lock().execute(
            "UPDATE operations SET state = ?3, doc = ?4 WHERE site_domain = ?1 AND id = ?2",
            params![op.site_domain, op.id, op.state.to_string(), doc],
        )?;
        if updated == 0 {
            return Err(EngineError::not_found(format!("operation {}", op.id)));
        }
        Ok(())
    }

    pub fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        let conn = self.db.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM operations WHERE site_domain = ?1 AND id = ?2",
                params![key.site_domain, key.operation_id],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Err(EngineError::not_found(format!("operation {key}"))),
        }
    }

    pub fn list_operations(&self, site_domain: &str) -> Result<Vec<Operation>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare("SELECT doc FROM operations WHERE site_domain = ?1 ORDER BY created")?;
        let rows = stmt.query_map(params![site_domain], |row| row.get::<_, String>(0))?;
        let mut ops = Vec::new();
        for doc in rows {
            ops.push(serde_json::from_str(&doc?)?);
        }
        Ok(ops)
    }

    /// Validated state transition with optimistic concurrency: the stored
    /// state must still equal the operation's current in-memory state.
    pub fn compare_and_swap_operation_state(
        &self,
        op: &mut Operation,
        next: OperationState,
    ) -> Result<()> {
        let prior = op.state;
        op.transition(next)?;
        let doc = serde_json::to_string(op)?;
        let updated = self.db.lock().execute(
            "UPDATE operations SET state = ?4, doc = ?5
             WHERE site_domain = ?1 AND id = ?2 AND state = ?3",
            params![op.site_domain, op.id, prior.to_string(), next.to_string(), doc],
        )?;
        if updated == 0 {
            op.state = prior;
            return Err(EngineError::compare_failed(format!(
                "operation {} was not in state {prior}",
                op.id
            )));
        }
        Ok(())
    }

    // ── Progress entries ──────────────────────────────────────────────

    /// Append a progress entry, assigning its sequence number.
    pub fn create_progress_entry(&self, entry: &ProgressEntry) -> Result<ProgressEntry> {
        let mut stored = entry.clone();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO progress_entries (site_domain, operation_id, created, doc)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.site_domain,
                entry.operation_id,
                entry.created.to_rfc3339(),
                serde_json::to_string(entry)?
            ],
        )?;
        stored.sequence = conn.last_insert_rowid();
        // rewrite the doc so reads see the assigned sequence
        conn.execute(
            "UPDATE progress_entries SET doc = ?2 WHERE seq = ?1",
            params![stored.sequence, serde_json::to_string(&stored)?],
        )?;
        Ok(stored)
    }

    pub fn last_progress_entry(&self, key: &OperationKey) -> Result<Option<ProgressEntry>> {
        let conn = self.db.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM progress_entries
                 WHERE site_domain = ?1 AND operation_id = ?2
                 ORDER BY created DESC, seq DESC LIMIT 1",
                params![key.site_domain, key.operation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match doc {
            Some(doc) => Some(serde_json::from_str(&doc)?),
            None => None,
        })
    }

    pub fn list_progress_entries(&self, key: &OperationKey) -> Result<Vec<ProgressEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT doc FROM progress_entries
             WHERE site_domain = ?1 AND operation_id = ?2
             ORDER BY created, seq",
        )?;
        let rows = stmt.query_map(params![key.site_domain, key.operation_id], |row| {
            row.get::<_, String>(0)
        })?;
        let mut entries = Vec::new();
        for doc in rows {
            entries.push(serde_json::from_str(&doc?)?);
        }
        Ok(entries)
    }

    // ── Plans & phase states ──────────────────────────────────────────

    pub fn create_plan(&self, key: &OperationKey, plan: &OperationPlan) -> Result<()> {
        let doc = serde_json::to_string(plan)?;
        let inserted = self.db.lock().execute(
            "INSERT OR IGNORE INTO plans (site_domain, operation_id, doc) VALUES (?1, ?2, ?3)",
            params![key.site_domain, key.operation_id, doc],
        )?;
        if inserted == 0 {
            return Err(EngineError::already_exists(format!("plan for {key}")));
        }
        Ok(())
    }

    pub fn get_plan(&self, key: &OperationKey) -> Result<OperationPlan> {
        let conn = self.db.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM plans WHERE site_domain = ?1 AND operation_id = ?2",
                params![key.site_domain, key.operation_id],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Err(EngineError::not_found(format!("plan for {key}"))),
        }
    }

    pub fn upsert_phase_state(
        &self,
        key: &OperationKey,
        phase_id: &str,
        state: PhaseState,
        error: Option<&str>,
    ) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO phase_states (site_domain, operation_id, phase_id, state, error, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (site_domain, operation_id, phase_id)
             DO UPDATE SET state = excluded.state, error = excluded.error, updated = excluded.updated",
            params![
                key.site_domain,
                key.operation_id,
                phase_id,
                state.to_string(),
                error,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Transition a phase only if it is still in the expected state. Used to
    /// prevent duplicate rollbacks and lost-update races between drivers.
    pub fn compare_and_swap_phase_state(
        &self,
        key: &OperationKey,
        phase_id: &str,
        expected: PhaseState,
        next: PhaseState,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE phase_states SET state = ?5, error = ?6, updated = ?7
             WHERE site_domain = ?1 AND operation_id = ?2 AND phase_id = ?3 AND state = ?4",
            params![
                key.site_domain,
                key.operation_id,
                phase_id,
                expected.to_string(),
                next.to_string(),
                error,
                Utc::now().to_rfc3339()
            ],
        )?;
        if updated == 0 {
            // distinguish a missing row (first write) from a lost race
            if expected == PhaseState::Unstarted {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO phase_states
                     (site_domain, operation_id, phase_id, state, error, updated)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        key.site_domain,
                        key.operation_id,
                        phase_id,
                        next.to_string(),
                        error,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                if inserted > 0 {
                    return Ok(());
                }
            }
            return Err(EngineError::compare_failed(format!(
                "phase {phase_id} of {key} was not in state {expected}"
            )));
        }
        Ok(())
    }

    pub fn list_phase_states(&self, key: &OperationKey) -> Result<Vec<PhaseStateRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT phase_id, state, error, updated FROM phase_states
             WHERE site_domain = ?1 AND operation_id = ?2",
        )?;
        let rows = stmt.query_map(params![key.site_domain, key.operation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (phase_id, state, error, updated) = row?;
            records.push(PhaseStateRecord {
                phase_id,
                state: state.parse()?,
                error,
                updated: DateTime::parse_from_rfc3339(&updated)
                    .map_err(|e| EngineError::bad_parameter(format!("bad timestamp: {e}")))?
                    .with_timezone(&Utc),
            });
        }
        Ok(records)
    }

    // ── Provisioning tokens ───────────────────────────────────────────

    pub fn create_token(&self, token: &ProvisioningToken) -> Result<()> {
        let doc = serde_json::to_string(token)?;
        let inserted = self.db.lock().execute(
            "INSERT OR IGNORE INTO tokens (token, expires, doc) VALUES (?1, ?2, ?3)",
            params![token.token, token.expires.map(|e| e.to_rfc3339()), doc],
        )?;
        if inserted == 0 {
            return Err(EngineError::already_exists("token".to_string()));
        }
        Ok(())
    }

    pub fn get_token(&self, token: &str) -> Result<ProvisioningToken> {
        let conn = self.db.lock();
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM tokens WHERE token = ?1", params![token], |row| {
                row.get(0)
            })
            .optional()?;
        let record: ProvisioningToken = match doc {
            Some(doc) => serde_json::from_str(&doc)?,
            None => return Err(EngineError::not_found("token".to_string())),
        };
        if record.is_expired(Utc::now()) {
            return Err(EngineError::not_found("token".to_string()));
        }
        Ok(record)
    }

    /// First live token of the given type for a site.
    pub fn find_token(
        &self,
        site_domain: &str,
        token_type: crate::model::TokenType,
    ) -> Result<Option<ProvisioningToken>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT doc FROM tokens")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for doc in rows {
            let token: ProvisioningToken = serde_json::from_str(&doc?)?;
            if token.site_domain == site_domain
                && token.token_type == token_type
                && !token.is_expired(Utc::now())
            {
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    pub fn delete_token(&self, token: &str) -> Result<()> {
        let deleted = self
            .db
            .lock()
            .execute("DELETE FROM tokens WHERE token = ?1", params![token])?;
        if deleted == 0 {
            return Err(EngineError::not_found("token".to_string()));
        }
        Ok(())
    }

    // ── Trusted clusters ──────────────────────────────────────────────

    pub fn upsert_trusted_cluster(&self, cluster: &TrustedCluster) -> Result<()> {
        cluster.check()?;
        let doc = serde_json::to_string(cluster)?;
        self.db.lock().execute(
            "INSERT INTO trusted_clusters (name, expires, doc) VALUES (?1, NULL, ?2)
             ON CONFLICT (name) DO UPDATE SET doc = excluded.doc, expires = NULL",
            params![cluster.name, doc],
        )?;
        Ok(())
    }

    pub fn get_trusted_cluster(&self, name: &str) -> Result<TrustedCluster> {
        let conn = self.db.lock();
        let row: Option<(Option<String>, String)> = conn
            .query_row(
                "SELECT expires, doc FROM trusted_clusters WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((expires, doc)) => {
                if expired(expires.as_deref())? {
                    return Err(EngineError::not_found(format!("trusted cluster {name}")));
                }
                Ok(serde_json::from_str(&doc)?)
            }
            None => Err(EngineError::not_found(format!("trusted cluster {name}"))),
        }
    }

    pub fn list_trusted_clusters(&self) -> Result<Vec<TrustedCluster>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT expires, doc FROM trusted_clusters ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut clusters = Vec::new();
        for row in rows {
            let (expires, doc) = row?;
            if !expired(expires.as_deref())? {
                clusters.push(serde_json::from_str(&doc)?);
            }
        }
        Ok(clusters)
    }

    pub fn delete_trusted_cluster(&self, name: &str) -> Result<()> {
        let deleted = self
            .db
            .lock()
            .execute("DELETE FROM trusted_clusters WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(EngineError::not_found(format!("trusted cluster {name}")));
        }
        Ok(())
    }

    /// Delayed delete: the record (and its tunnel) lapses at `when`.
    pub fn expire_trusted_cluster(&self, name: &str, when: DateTime<Utc>) -> Result<()> {
        let updated = self.db.lock().execute(
            "UPDATE trusted_clusters SET expires = ?2 WHERE name = ?1",
            params![name, when.to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(EngineError::not_found(format!("trusted cluster {name}")));
        }
        Ok(())
    }

    // ── Endpoints ─────────────────────────────────────────────────────

    pub fn put_endpoints(&self, site_domain: &str, endpoints: &Endpoints) -> Result<()> {
        endpoints.check()?;
        let doc = serde_json::to_string(endpoints)?;
        self.db.lock().execute(
            "INSERT INTO endpoints (site_domain, doc) VALUES (?1, ?2)
             ON CONFLICT (site_domain) DO UPDATE SET doc = excluded.doc",
            params![site_domain, doc],
        )?;
        Ok(())
    }

    pub fn get_endpoints(&self, site_domain: &str) -> Result<Endpoints> {
        let conn = self.db.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM endpoints WHERE site_domain = ?1",
                params![site_domain],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Err(EngineError::not_found(format!("endpoints for {site_domain}"))),
        }
    }

    // ── Auth resources (roles, oidc/saml connectors) ──────────────────

    pub fn upsert_resource(&self, kind: &str, name: &str, doc: &serde_json::Value) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO resources (kind, name, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT (kind, name) DO UPDATE SET doc = excluded.doc",
            params![kind, name, serde_json::to_string(doc)?],
        )?;
        Ok(())
    }

    pub fn get_resource(&self, kind: &str, name: &str) -> Result<serde_json::Value> {
        let conn = self.db.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM resources WHERE kind = ?1 AND name = ?2",
                params![kind, name],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Err(EngineError::not_found(format!("{kind} {name}"))),
        }
    }

    pub fn list_resources(&self, kind: &str) -> Result<Vec<serde_json::Value>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT doc FROM resources WHERE kind = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![kind], |row| row.get::<_, String>(0))?;
        let mut docs = Vec::new();
        for doc in rows {
            docs.push(serde_json::from_str(&doc?)?);
        }
        Ok(docs)
    }

    pub fn delete_resource(&self, kind: &str, name: &str) -> Result<()> {
        let deleted = self.db.lock().execute(
            "DELETE FROM resources WHERE kind = ?1 AND name = ?2",
            params![kind, name],
        )?;
        if deleted == 0 {
            return Err(EngineError::not_found(format!("{kind} {name}")));
        }
        Ok(())
    }

    // ── Audit & logs ──────────────────────────────────────────────────

    pub fn append_audit_event(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO audit_events (created, event, doc) VALUES (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), event, serde_json::to_string(&payload)?],
        )?;
        Ok(())
    }

    pub fn list_audit_events(&self) -> Result<Vec<(String, serde_json::Value)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT event, doc FROM audit_events ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (event, doc) = row?;
            events.push((event, serde_json::from_str(&doc)?));
        }
        Ok(events)
    }

    pub fn append_log_entry(&self, key: &OperationKey, message: &str) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO log_entries (site_domain, operation_id, created, message)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.site_domain, key.operation_id, Utc::now().to_rfc3339(), message],
        )?;
        Ok(())
    }

    pub fn list_log_entries(&self, key: &OperationKey) -> Result<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT message FROM log_entries
             WHERE site_domain = ?1 AND operation_id = ?2 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![key.site_domain, key.operation_id], |row| {
            row.get::<_, String>(0)
        })?;
        let mut lines = Vec::new();
        for line in rows {
            lines.push(line?);
        }
        Ok(lines)
    }
}

/// Persisted state of one plan phase.
#[derive(Debug, Clone)]
pub struct PhaseStateRecord {
    pub phase_id: String,
    pub state: PhaseState,
    pub error: Option<String>,
    pub updated: DateTime<Utc>,
}

fn expired(expires: Option<&str>) -> Result<bool> {
    match expires {
        None => Ok(false),
        Some(raw) => {
            let when = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| EngineError::bad_parameter(format!("bad expiry timestamp: {e}")))?;
            Ok(when.with_timezone(&Utc) <= Utc::now())
        }
    }
}
