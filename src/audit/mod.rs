//! Append-only audit ledger: the system of record for "what happened".
//!
//! `log` writes to the durable store first (the commit point) and only
//! then forwards the event to the live event channel for subscribers.
//! Forwarding is best-effort and can never fail the call. No update or
//! delete operation exists.

use std::collections::BTreeMap;

use chrono::{Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use traceline_common::{AuditEvent, CoreError, Severity, id, now_rfc3339};

use crate::store::DbHandle;

/// Payload for appending one audit event. Trace ids are recorded as given;
/// they are advisory references, not enforced foreign keys, so the ledger
/// can record events about entities this core never issued.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAuditEvent {
    pub mission_id: Option<String>,
    pub plan_id: Option<String>,
    pub job_id: Option<String>,
    pub attempt_id: Option<String>,
    pub event_type: String,
    pub event_category: String,
    pub severity: Severity,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Query filter; every field is an optional conjunct.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub mission_id: Option<String>,
    pub plan_id: Option<String>,
    pub job_id: Option<String>,
    pub attempt_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<Severity>,
}

/// Aggregate ledger counts.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub total_events: i64,
    pub by_severity: BTreeMap<String, i64>,
    pub by_category: BTreeMap<String, i64>,
    /// Error/critical events within the recent rolling window.
    pub recent_errors: i64,
}

const DEFAULT_QUERY_LIMIT: i64 = 50;
const MAX_QUERY_LIMIT: i64 = 500;

pub struct AuditLog {
    db: DbHandle,
    events_tx: broadcast::Sender<String>,
    error_window_secs: u64,
}

impl AuditLog {
    pub fn new(db: DbHandle, events_tx: broadcast::Sender<String>, error_window_secs: u64) -> Self {
        Self {
            db,
            events_tx,
            error_window_secs,
        }
    }

    /// Append one event. The durable write is the contract's guarantee;
    /// the subsequent fan-out to live subscribers is fire-and-forget.
    pub async fn log(&self, new: NewAuditEvent) -> Result<AuditEvent, CoreError> {
        let event = AuditEvent {
            audit_id: id::mint_audit_id(),
            timestamp: now_rfc3339(),
            mission_id: new.mission_id,
            plan_id: new.plan_id,
            job_id: new.job_id,
            attempt_id: new.attempt_id,
            event_type: new.event_type,
            event_category: new.event_category,
            severity: new.severity,
            message: new.message,
            details: new.details,
        };

        let stored = event.clone();
        self.db
            .call(move |db| db.insert_audit_event(&stored))
            .await
            .map_err(CoreError::storage)?;

        self.forward(&event);
        Ok(event)
    }

    /// Filtered, paginated query, newest first, plus the total match count.
    pub async fn query_events(
        &self,
        filter: AuditFilter,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<(Vec<AuditEvent>, i64), CoreError> {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT);
        let offset = offset.unwrap_or(0).max(0);
        self.db
            .call(move |db| db.query_audit_events(&filter, limit, offset))
            .await
            .map_err(CoreError::storage)
    }

    pub async fn stats(&self) -> Result<AuditStats, CoreError> {
        let window_start = (Utc::now() - Duration::seconds(self.error_window_secs as i64))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        self.db
            .call(move |db| db.audit_stats(&window_start))
            .await
            .map_err(CoreError::storage)
    }

    /// Best-effort fan-out of a committed event to live subscribers.
    /// Failures here never surface to the caller: the durable record
    /// already exists.
    fn forward(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                // A send error only means there are no subscribers right now.
                let _ = self.events_tx.send(json);
            }
            Err(e) => {
                warn!(audit_id = %event.audit_id, error = %e, "audit event fan-out failed");
            }
        }
    }
}
