use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params, types::ToSql};

use traceline_common::{
    Attempt, AuditEvent, EntityKind, Job, Mission, ModeDecision, Plan, Resource, Severity,
    StateTransition,
};

use crate::audit::{AuditFilter, AuditStats};

/// Async-safe handle to the core database.
///
/// Wraps `CoreDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CoreDb>>,
}

impl DbHandle {
    pub fn new(db: CoreDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CoreDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Acceptable in startup
    /// initialization and tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CoreDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Current lifecycle state record for one entity.
#[derive(Debug, Clone)]
pub struct EntityStateRow {
    pub state: String,
    pub updated_at: String,
}

/// One row of the grouped state-count query used by telemetry snapshots.
#[derive(Debug, Clone)]
pub struct StateCount {
    pub entity_type: String,
    pub state: String,
    pub count: i64,
}

pub struct CoreDb {
    conn: Connection,
}

impl CoreDb {
    /// Open (or create) a SQLite database at the given path and run
    /// migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS missions (
                    id TEXT PRIMARY KEY,
                    parent_mission_id TEXT REFERENCES missions(id),
                    tags TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS plans (
                    id TEXT PRIMARY KEY,
                    mission_id TEXT NOT NULL REFERENCES missions(id),
                    plan_type TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    plan_id TEXT NOT NULL REFERENCES plans(id),
                    job_type TEXT NOT NULL,
                    tags TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS attempts (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL REFERENCES jobs(id),
                    attempt_number INTEGER NOT NULL,
                    retry_reason TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE(job_id, attempt_number)
                );

                CREATE TABLE IF NOT EXISTS resources (
                    uuid TEXT PRIMARY KEY,
                    attempt_id TEXT NOT NULL REFERENCES attempts(id),
                    resource_type TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS entity_states (
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (entity_type, entity_id)
                );

                CREATE TABLE IF NOT EXISTS state_transitions (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    transition_id TEXT NOT NULL UNIQUE,
                    timestamp TEXT NOT NULL,
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    from_state TEXT,
                    to_state TEXT NOT NULL,
                    transition_type TEXT NOT NULL,
                    metadata TEXT
                );

                CREATE TABLE IF NOT EXISTS audit_events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    audit_id TEXT NOT NULL UNIQUE,
                    timestamp TEXT NOT NULL,
                    mission_id TEXT,
                    plan_id TEXT,
                    job_id TEXT,
                    attempt_id TEXT,
                    event_type TEXT NOT NULL,
                    event_category TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    message TEXT NOT NULL,
                    details TEXT
                );

                CREATE TABLE IF NOT EXISTS mode_decisions (
                    decision_id TEXT PRIMARY KEY,
                    job_type TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    matched_rules TEXT NOT NULL DEFAULT '[]',
                    decided_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_plans_mission ON plans(mission_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_plan ON jobs(plan_id);
                CREATE INDEX IF NOT EXISTS idx_attempts_job ON attempts(job_id);
                CREATE INDEX IF NOT EXISTS idx_resources_attempt ON resources(attempt_id);
                CREATE INDEX IF NOT EXISTS idx_transitions_entity
                    ON state_transitions(entity_type, entity_id);
                CREATE INDEX IF NOT EXISTS idx_audit_mission ON audit_events(mission_id);
                CREATE INDEX IF NOT EXISTS idx_audit_job ON audit_events(job_id);
                CREATE INDEX IF NOT EXISTS idx_audit_severity ON audit_events(severity);
                CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_events(timestamp);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Existence checks ──────────────────────────────────────────────

    pub fn entity_exists(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let (table, key) = table_for(kind);
        let sql = format!("SELECT COUNT(*) > 0 FROM {} WHERE {} = ?1", table, key);
        self.conn
            .query_row(&sql, params![id], |row| row.get(0))
            .context("Failed to check entity existence")
    }

    // ── Missions ──────────────────────────────────────────────────────

    pub fn insert_mission(&self, mission: &Mission, initial_state: &str) -> Result<()> {
        let tags = serde_json::to_string(&mission.tags).context("Failed to serialize tags")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO missions (id, parent_mission_id, tags, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![mission.id, mission.parent_mission_id, tags, mission.created_at],
        )
        .context("Failed to insert mission")?;
        tx.execute(
            "INSERT INTO entity_states (entity_type, entity_id, state, updated_at) VALUES ('mission', ?1, ?2, ?3)",
            params![mission.id, initial_state, mission.created_at],
        )
        .context("Failed to initialize mission state")?;
        tx.commit().context("Failed to commit mission insert")?;
        Ok(())
    }

    pub fn get_mission(&self, id: &str) -> Result<Option<Mission>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, parent_mission_id, tags, created_at FROM missions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query mission")?;
        match row {
            Some((id, parent_mission_id, tags_str, created_at)) => Ok(Some(Mission {
                id,
                parent_mission_id,
                tags: serde_json::from_str(&tags_str)
                    .with_context(|| format!("corrupt tags JSON '{}'", tags_str))?,
                created_at,
            })),
            None => Ok(None),
        }
    }

    // ── Plans ─────────────────────────────────────────────────────────

    pub fn insert_plan(&self, plan: &Plan, initial_state: &str) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO plans (id, mission_id, plan_type, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![plan.id, plan.mission_id, plan.plan_type, plan.created_at],
        )
        .context("Failed to insert plan")?;
        tx.execute(
            "INSERT INTO entity_states (entity_type, entity_id, state, updated_at) VALUES ('plan', ?1, ?2, ?3)",
            params![plan.id, initial_state, plan.created_at],
        )
        .context("Failed to initialize plan state")?;
        tx.commit().context("Failed to commit plan insert")?;
        Ok(())
    }

    pub fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
        self.conn
            .query_row(
                "SELECT id, mission_id, plan_type, created_at FROM plans WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Plan {
                        id: row.get(0)?,
                        mission_id: row.get(1)?,
                        plan_type: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query plan")
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn insert_job(&self, job: &Job, initial_state: &str) -> Result<()> {
        let tags = serde_json::to_string(&job.tags).context("Failed to serialize tags")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO jobs (id, plan_id, job_type, tags, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job.id, job.plan_id, job.job_type, tags, job.created_at],
        )
        .context("Failed to insert job")?;
        tx.execute(
            "INSERT INTO entity_states (entity_type, entity_id, state, updated_at) VALUES ('job', ?1, ?2, ?3)",
            params![job.id, initial_state, job.created_at],
        )
        .context("Failed to initialize job state")?;
        tx.commit().context("Failed to commit job insert")?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, plan_id, job_type, tags, created_at FROM jobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query job")?;
        match row {
            Some((id, plan_id, job_type, tags_str, created_at)) => Ok(Some(Job {
                id,
                plan_id,
                job_type,
                tags: serde_json::from_str(&tags_str)
                    .with_context(|| format!("corrupt tags JSON '{}'", tags_str))?,
                created_at,
            })),
            None => Ok(None),
        }
    }

    // ── Attempts ──────────────────────────────────────────────────────

    /// Insert an attempt, allocating the next attempt_number for the job
    /// inside the same statement. The UNIQUE(job_id, attempt_number)
    /// constraint rejects any duplicate a concurrent writer could produce,
    /// so numbers form a contiguous 1-based sequence per job.
    pub fn insert_attempt(
        &self,
        id: &str,
        job_id: &str,
        retry_reason: Option<&str>,
        created_at: &str,
        initial_state: &str,
    ) -> Result<Attempt> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO attempts (id, job_id, attempt_number, retry_reason, created_at)
             VALUES (?1, ?2,
                     (SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM attempts WHERE job_id = ?2),
                     ?3, ?4)",
            params![id, job_id, retry_reason, created_at],
        )
        .context("Failed to insert attempt")?;
        tx.execute(
            "INSERT INTO entity_states (entity_type, entity_id, state, updated_at) VALUES ('attempt', ?1, ?2, ?3)",
            params![id, initial_state, created_at],
        )
        .context("Failed to initialize attempt state")?;
        let attempt = tx
            .query_row(
                "SELECT id, job_id, attempt_number, retry_reason, created_at FROM attempts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Attempt {
                        id: row.get(0)?,
                        job_id: row.get(1)?,
                        attempt_number: row.get(2)?,
                        retry_reason: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .context("Attempt not found after insert")?;
        tx.commit().context("Failed to commit attempt insert")?;
        Ok(attempt)
    }

    pub fn get_attempt(&self, id: &str) -> Result<Option<Attempt>> {
        self.conn
            .query_row(
                "SELECT id, job_id, attempt_number, retry_reason, created_at FROM attempts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Attempt {
                        id: row.get(0)?,
                        job_id: row.get(1)?,
                        attempt_number: row.get(2)?,
                        retry_reason: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query attempt")
    }

    // ── Resources ─────────────────────────────────────────────────────

    pub fn insert_resource(&self, resource: &Resource) -> Result<()> {
        let metadata =
            serde_json::to_string(&resource.metadata).context("Failed to serialize metadata")?;
        self.conn
            .execute(
                "INSERT INTO resources (uuid, attempt_id, resource_type, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    resource.uuid,
                    resource.attempt_id,
                    resource.resource_type,
                    metadata,
                    resource.created_at
                ],
            )
            .context("Failed to insert resource")?;
        Ok(())
    }

    pub fn get_resource(&self, uuid: &str) -> Result<Option<Resource>> {
        let row = self
            .conn
            .query_row(
                "SELECT uuid, attempt_id, resource_type, metadata, created_at FROM resources WHERE uuid = ?1",
                params![uuid],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query resource")?;
        row.map(resource_from_row).transpose()
    }

    pub fn list_resources_for_attempt(&self, attempt_id: &str) -> Result<Vec<Resource>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT uuid, attempt_id, resource_type, metadata, created_at
                 FROM resources WHERE attempt_id = ?1 ORDER BY created_at, uuid",
            )
            .context("Failed to prepare list_resources_for_attempt")?;
        let rows = stmt
            .query_map(params![attempt_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query resources")?;
        let mut resources = Vec::new();
        for row in rows {
            resources.push(resource_from_row(row.context("Failed to read resource row")?)?);
        }
        Ok(resources)
    }

    // ── Entity state & transitions ────────────────────────────────────

    pub fn get_entity_state(&self, kind: EntityKind, id: &str) -> Result<Option<EntityStateRow>> {
        self.conn
            .query_row(
                "SELECT state, updated_at FROM entity_states WHERE entity_type = ?1 AND entity_id = ?2",
                params![kind.as_str(), id],
                |row| {
                    Ok(EntityStateRow {
                        state: row.get(0)?,
                        updated_at: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to query entity state")
    }

    /// Apply a validated transition: conditionally move the denormalized
    /// current-state record and append the history row, in one transaction.
    ///
    /// The current-state write is the serialization point: it only succeeds
    /// if the stored state still equals `expected_from`. Returns `Ok(None)`
    /// when that condition fails (a concurrent transition won the race);
    /// nothing is written in that case.
    pub fn apply_transition(
        &self,
        transition: &StateTransition,
        expected_from: Option<&str>,
    ) -> Result<Option<StateTransition>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let changed = match expected_from {
            Some(from) => tx
                .execute(
                    "UPDATE entity_states SET state = ?1, updated_at = ?2
                     WHERE entity_type = ?3 AND entity_id = ?4 AND state = ?5",
                    params![
                        transition.to_state,
                        transition.timestamp,
                        transition.entity_type.as_str(),
                        transition.entity_id,
                        from
                    ],
                )
                .context("Failed to update entity state")?,
            None => tx
                .execute(
                    "INSERT INTO entity_states (entity_type, entity_id, state, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(entity_type, entity_id) DO NOTHING",
                    params![
                        transition.entity_type.as_str(),
                        transition.entity_id,
                        transition.to_state,
                        transition.timestamp
                    ],
                )
                .context("Failed to insert entity state")?,
        };

        if changed != 1 {
            // Lost the optimistic write; leave no trace.
            return Ok(None);
        }

        let metadata = transition
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize transition metadata")?;
        tx.execute(
            "INSERT INTO state_transitions
                 (transition_id, timestamp, entity_type, entity_id, from_state, to_state, transition_type, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                transition.transition_id,
                transition.timestamp,
                transition.entity_type.as_str(),
                transition.entity_id,
                transition.from_state,
                transition.to_state,
                transition.transition_type,
                metadata
            ],
        )
        .context("Failed to append state transition")?;
        tx.commit().context("Failed to commit transition")?;
        Ok(Some(transition.clone()))
    }

    /// Transition history for one entity, oldest first.
    pub fn get_history(
        &self,
        kind: EntityKind,
        id: &str,
        limit: i64,
    ) -> Result<Vec<StateTransition>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT transition_id, timestamp, entity_type, entity_id, from_state, to_state, transition_type, metadata
                 FROM state_transitions
                 WHERE entity_type = ?1 AND entity_id = ?2
                 ORDER BY seq ASC LIMIT ?3",
            )
            .context("Failed to prepare get_history")?;
        let rows = stmt
            .query_map(params![kind.as_str(), id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .context("Failed to query transitions")?;
        let mut transitions = Vec::new();
        for row in rows {
            transitions.push(transition_from_row(row.context("Failed to read transition row")?)?);
        }
        Ok(transitions)
    }

    // ── Audit events ──────────────────────────────────────────────────

    pub fn insert_audit_event(&self, event: &AuditEvent) -> Result<()> {
        let details = event
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize event details")?;
        self.conn
            .execute(
                "INSERT INTO audit_events
                     (audit_id, timestamp, mission_id, plan_id, job_id, attempt_id,
                      event_type, event_category, severity, message, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    event.audit_id,
                    event.timestamp,
                    event.mission_id,
                    event.plan_id,
                    event.job_id,
                    event.attempt_id,
                    event.event_type,
                    event.event_category,
                    event.severity.as_str(),
                    event.message,
                    details
                ],
            )
            .context("Failed to insert audit event")?;
        Ok(())
    }

    /// Filtered audit query, newest first, plus the total count matching
    /// the filter (ignoring limit/offset).
    pub fn query_audit_events(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditEvent>, i64)> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        let push = |clauses: &mut Vec<String>, values: &mut Vec<Box<dyn ToSql>>, column: &str, value: String| {
            clauses.push(format!("{} = ?{}", column, values.len() + 1));
            values.push(Box::new(value));
        };
        if let Some(v) = &filter.mission_id {
            push(&mut clauses, &mut values, "mission_id", v.clone());
        }
        if let Some(v) = &filter.plan_id {
            push(&mut clauses, &mut values, "plan_id", v.clone());
        }
        if let Some(v) = &filter.job_id {
            push(&mut clauses, &mut values, "job_id", v.clone());
        }
        if let Some(v) = &filter.attempt_id {
            push(&mut clauses, &mut values, "attempt_id", v.clone());
        }
        if let Some(v) = &filter.event_type {
            push(&mut clauses, &mut values, "event_type", v.clone());
        }
        if let Some(v) = &filter.severity {
            push(&mut clauses, &mut values, "severity", v.as_str().to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM audit_events{}", where_clause);
        let count_params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let total: i64 = self
            .conn
            .query_row(&count_sql, &count_params[..], |row| row.get(0))
            .context("Failed to count audit events")?;

        let sql = format!(
            "SELECT audit_id, timestamp, mission_id, plan_id, job_id, attempt_id,
                    event_type, event_category, severity, message, details
             FROM audit_events{}
             ORDER BY seq DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            values.len() + 1,
            values.len() + 2
        );
        values.push(Box::new(limit));
        values.push(Box::new(offset));
        let query_params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare audit query")?;
        let rows = stmt
            .query_map(&query_params[..], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .context("Failed to query audit events")?;

        let mut events = Vec::new();
        for row in rows {
            events.push(audit_event_from_row(row.context("Failed to read audit row")?)?);
        }
        Ok((events, total))
    }

    /// Aggregate audit counts; `window_start` bounds the rolling error
    /// count (RFC 3339, inclusive).
    pub fn audit_stats(&self, window_start: &str) -> Result<AuditStats> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))
            .context("Failed to count audit events")?;

        let mut by_severity = std::collections::BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT severity, COUNT(*) FROM audit_events GROUP BY severity")
            .context("Failed to prepare severity counts")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query severity counts")?;
        for row in rows {
            let (severity, count) = row.context("Failed to read severity count")?;
            by_severity.insert(severity, count);
        }

        let mut by_category = std::collections::BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT event_category, COUNT(*) FROM audit_events GROUP BY event_category")
            .context("Failed to prepare category counts")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query category counts")?;
        for row in rows {
            let (category, count) = row.context("Failed to read category count")?;
            by_category.insert(category, count);
        }

        let recent_errors: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM audit_events
                 WHERE severity IN ('error', 'critical') AND timestamp >= ?1",
                params![window_start],
                |row| row.get(0),
            )
            .context("Failed to count recent errors")?;

        Ok(AuditStats {
            total_events: total,
            by_severity,
            by_category,
            recent_errors,
        })
    }

    // ── Mode decisions ────────────────────────────────────────────────

    pub fn insert_mode_decision(&self, decision: &ModeDecision) -> Result<()> {
        let matched = serde_json::to_string(&decision.matched_rules)
            .context("Failed to serialize matched rules")?;
        self.conn
            .execute(
                "INSERT INTO mode_decisions (decision_id, job_type, mode, reason, matched_rules, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    decision.decision_id,
                    decision.job_type,
                    decision.mode.as_str(),
                    decision.reason,
                    matched,
                    decision.decided_at
                ],
            )
            .context("Failed to insert mode decision")?;
        Ok(())
    }

    // ── Batched snapshot reads ────────────────────────────────────────

    /// Entity counts by kind, in one pass.
    pub fn entity_counts(&self) -> Result<std::collections::BTreeMap<String, i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT 'mission', COUNT(*) FROM missions
                 UNION ALL SELECT 'plan', COUNT(*) FROM plans
                 UNION ALL SELECT 'job', COUNT(*) FROM jobs
                 UNION ALL SELECT 'attempt', COUNT(*) FROM attempts
                 UNION ALL SELECT 'resource', COUNT(*) FROM resources",
            )
            .context("Failed to prepare entity counts")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query entity counts")?;
        let mut counts = std::collections::BTreeMap::new();
        for row in rows {
            let (kind, count) = row.context("Failed to read entity count")?;
            counts.insert(kind, count);
        }
        Ok(counts)
    }

    /// Current-state counts grouped by entity type and state, in one pass.
    pub fn state_counts(&self) -> Result<Vec<StateCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT entity_type, state, COUNT(*) FROM entity_states GROUP BY entity_type, state",
            )
            .context("Failed to prepare state counts")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StateCount {
                    entity_type: row.get(0)?,
                    state: row.get(1)?,
                    count: row.get(2)?,
                })
            })
            .context("Failed to query state counts")?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row.context("Failed to read state count")?);
        }
        Ok(counts)
    }
}

fn table_for(kind: EntityKind) -> (&'static str, &'static str) {
    match kind {
        EntityKind::Mission => ("missions", "id"),
        EntityKind::Plan => ("plans", "id"),
        EntityKind::Job => ("jobs", "id"),
        EntityKind::Attempt => ("attempts", "id"),
        EntityKind::Resource => ("resources", "uuid"),
    }
}

fn resource_from_row(
    (uuid, attempt_id, resource_type, metadata_str, created_at): (
        String,
        String,
        String,
        String,
        String,
    ),
) -> Result<Resource> {
    Ok(Resource {
        uuid,
        attempt_id,
        resource_type,
        metadata: serde_json::from_str(&metadata_str)
            .with_context(|| format!("corrupt resource metadata JSON '{}'", metadata_str))?,
        created_at,
    })
}

#[allow(clippy::type_complexity)]
fn transition_from_row(
    (transition_id, timestamp, entity_type, entity_id, from_state, to_state, transition_type, metadata_str): (
        String,
        String,
        String,
        String,
        Option<String>,
        String,
        String,
        Option<String>,
    ),
) -> Result<StateTransition> {
    let metadata = metadata_str
        .map(|s| {
            serde_json::from_str(&s).with_context(|| format!("corrupt transition metadata JSON '{}'", s))
        })
        .transpose()?;
    Ok(StateTransition {
        transition_id,
        timestamp,
        entity_type: EntityKind::from_str(&entity_type)
            .map_err(|e| anyhow::anyhow!("invalid entity_type in database: {}", e))?,
        entity_id,
        from_state,
        to_state,
        transition_type,
        metadata,
    })
}

#[allow(clippy::type_complexity)]
fn audit_event_from_row(
    (audit_id, timestamp, mission_id, plan_id, job_id, attempt_id, event_type, event_category, severity, message, details_str): (
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
        String,
        String,
        String,
        Option<String>,
    ),
) -> Result<AuditEvent> {
    let details = details_str
        .map(|s| {
            serde_json::from_str(&s).with_context(|| format!("corrupt event details JSON '{}'", s))
        })
        .transpose()?;
    Ok(AuditEvent {
        audit_id,
        timestamp,
        mission_id,
        plan_id,
        job_id,
        attempt_id,
        event_type,
        event_category,
        severity: Severity::from_str(&severity)
            .map_err(|e| anyhow::anyhow!("invalid severity in database: {}", e))?,
        message,
        details,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────
