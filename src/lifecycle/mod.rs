//! Lifecycle engine: the single point of truth for "is this move legal".
//!
//! Each stateful entity kind has an explicit adjacency map from the current
//! state (or `None` for "no state recorded yet") to the set of allowed next
//! states. A successful transition conditionally moves the denormalized
//! current-state record and appends a history row in one store transaction;
//! the conditional write is the serialization point, so a concurrent
//! transition on the same entity loses cleanly instead of overwriting.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use traceline_common::{
    AttemptState, CoreError, EntityKind, JobState, MissionState, StateTransition, id, now_rfc3339,
};

use crate::store::{DbHandle, HotCache};

/// Default number of history rows returned when no limit is given.
const DEFAULT_HISTORY_LIMIT: i64 = 100;

// ── Adjacency maps ────────────────────────────────────────────────────

fn mission_targets(from: Option<MissionState>) -> &'static [MissionState] {
    use MissionState::*;
    match from {
        None => &[Pending],
        Some(Pending) => &[Planning, Cancelled],
        Some(Planning) => &[Planned, Cancelled],
        Some(Planned) => &[Executing, Cancelled],
        Some(Executing) => &[Completed, Failed, Timeout, Cancelled],
        Some(Completed) | Some(Failed) | Some(Timeout) | Some(Cancelled) => &[],
    }
}

fn job_targets(from: Option<JobState>) -> &'static [JobState] {
    use JobState::*;
    match from {
        None => &[Pending],
        Some(Pending) => &[Running, Cancelled],
        Some(Running) => &[Completed, Failed, Timeout, Cancelled],
        Some(Completed) | Some(Failed) | Some(Timeout) | Some(Cancelled) => &[],
    }
}

fn attempt_targets(from: Option<AttemptState>) -> &'static [AttemptState] {
    use AttemptState::*;
    match from {
        None => &[Pending],
        Some(Pending) => &[Running, Cancelled],
        Some(Running) => &[Succeeded, Failed, Timeout, OrphanKilled],
        Some(Succeeded) | Some(Failed) | Some(Timeout) | Some(OrphanKilled) | Some(Cancelled) => &[],
    }
}

/// Allowed next-state names for an entity kind given its current state.
///
/// Plans share the job machine: they move pending → running → terminal.
/// Fails with `UnknownState` if the stored current state does not parse
/// for the kind (a corrupt record), and with `InvalidRequest` for kinds
/// without a lifecycle.
pub fn allowed_targets(kind: EntityKind, from: Option<&str>) -> Result<Vec<&'static str>, CoreError> {
    let parse_err = |value: &str| CoreError::UnknownState {
        kind,
        value: value.to_string(),
    };
    match kind {
        EntityKind::Mission => {
            let from = from
                .map(|s| MissionState::from_str(s).map_err(|_| parse_err(s)))
                .transpose()?;
            Ok(mission_targets(from).iter().map(|s| s.as_str()).collect())
        }
        EntityKind::Plan | EntityKind::Job => {
            let from = from
                .map(|s| JobState::from_str(s).map_err(|_| parse_err(s)))
                .transpose()?;
            Ok(job_targets(from).iter().map(|s| s.as_str()).collect())
        }
        EntityKind::Attempt => {
            let from = from
                .map(|s| AttemptState::from_str(s).map_err(|_| parse_err(s)))
                .transpose()?;
            Ok(attempt_targets(from).iter().map(|s| s.as_str()).collect())
        }
        EntityKind::Resource => Err(CoreError::InvalidRequest {
            message: "resources have no lifecycle".into(),
        }),
    }
}

/// Check a target state name is a valid state for the kind at all
/// (independent of reachability).
fn validate_state_name(kind: EntityKind, state: &str) -> Result<(), CoreError> {
    let known = match kind {
        EntityKind::Mission => MissionState::from_str(state).is_ok(),
        EntityKind::Plan | EntityKind::Job => JobState::from_str(state).is_ok(),
        EntityKind::Attempt => AttemptState::from_str(state).is_ok(),
        EntityKind::Resource => false,
    };
    if known {
        Ok(())
    } else {
        Err(CoreError::UnknownState {
            kind,
            value: state.to_string(),
        })
    }
}

/// Current lifecycle state of one entity plus its last-transition time.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct CurrentState {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub state: String,
    pub updated_at: String,
}

pub struct LifecycleEngine {
    db: DbHandle,
    cache: Arc<HotCache>,
}

impl LifecycleEngine {
    pub fn new(db: DbHandle, cache: Arc<HotCache>) -> Self {
        Self { db, cache }
    }

    /// Validate and record one transition. On success the returned row has
    /// already been committed together with the current-state update.
    pub async fn transition(
        &self,
        kind: EntityKind,
        entity_id: &str,
        target_state: &str,
        transition_type: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<StateTransition, CoreError> {
        if !kind.is_stateful() {
            return Err(CoreError::InvalidRequest {
                message: format!("{} entities have no lifecycle", kind),
            });
        }
        validate_state_name(kind, target_state)?;

        let current = self.read_state(kind, entity_id).await?;
        let from = current.as_ref().map(|c| c.state.clone());

        let allowed = allowed_targets(kind, from.as_deref())?;
        if !allowed.iter().any(|s| *s == target_state) {
            debug!(
                kind = %kind,
                entity_id = %entity_id,
                from = from.as_deref().unwrap_or("<none>"),
                target = %target_state,
                "transition denied"
            );
            return Err(CoreError::InvalidStateTransition {
                kind,
                from,
                to: target_state.to_string(),
            });
        }

        let transition = StateTransition {
            transition_id: id::mint_transition_id(),
            timestamp: now_rfc3339(),
            entity_type: kind,
            entity_id: entity_id.to_string(),
            from_state: from.clone(),
            to_state: target_state.to_string(),
            transition_type: transition_type.unwrap_or_else(|| "requested".to_string()),
            metadata,
        };

        let stored = transition.clone();
        let expected = from.clone();
        let applied = self
            .db
            .call(move |db| db.apply_transition(&stored, expected.as_deref()))
            .await
            .map_err(CoreError::storage)?;

        match applied {
            Some(transition) => {
                self.refresh_state_cache(kind, entity_id, &transition);
                Ok(transition)
            }
            None => {
                // A concurrent transition won the conditional write. Report
                // the state we now observe so the caller can re-decide.
                self.cache
                    .invalidate(&HotCache::state_key(kind, entity_id));
                let observed = self.read_state_from_store(kind, entity_id).await?;
                warn!(
                    kind = %kind,
                    entity_id = %entity_id,
                    expected = from.as_deref().unwrap_or("<none>"),
                    observed = observed.as_ref().map(|c| c.state.as_str()).unwrap_or("<none>"),
                    "transition lost optimistic write"
                );
                Err(CoreError::InvalidStateTransition {
                    kind,
                    from: observed.map(|c| c.state),
                    to: target_state.to_string(),
                })
            }
        }
    }

    /// Current state of an entity; `NotFound` if the entity is unknown.
    pub async fn current_state(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<CurrentState, CoreError> {
        self.read_state(kind, entity_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                kind,
                id: entity_id.to_string(),
            })
    }

    /// Ordered transition history for one entity, oldest first.
    pub async fn history(
        &self,
        kind: EntityKind,
        entity_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<StateTransition>, CoreError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1000);
        let owned = entity_id.to_string();
        self.db
            .call(move |db| db.get_history(kind, &owned, limit))
            .await
            .map_err(CoreError::storage)
    }

    // ── Internals ─────────────────────────────────────────────────────

    /// Cache-then-store read of the current state record. Returns `None`
    /// when the entity exists but has no state row yet; `NotFound` when
    /// the entity is entirely unknown.
    async fn read_state(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<CurrentState>, CoreError> {
        let key = HotCache::state_key(kind, entity_id);
        if let Some(cached) = self.cache.get(&key) {
            match serde_json::from_str::<CurrentState>(&cached) {
                Ok(state) => return Ok(Some(state)),
                Err(e) => {
                    warn!(key = %key, error = %e, "discarding unparseable state cache entry");
                    self.cache.invalidate(&key);
                }
            }
        }
        self.read_state_from_store(kind, entity_id).await
    }

    async fn read_state_from_store(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<CurrentState>, CoreError> {
        let owned = entity_id.to_string();
        let row = self
            .db
            .call(move |db| {
                let state = db.get_entity_state(kind, &owned)?;
                let exists = state.is_some() || db.entity_exists(kind, &owned)?;
                Ok((state, exists))
            })
            .await
            .map_err(CoreError::storage)?;
        match row {
            (Some(state), _) => {
                let current = CurrentState {
                    entity_type: kind,
                    entity_id: entity_id.to_string(),
                    state: state.state,
                    updated_at: state.updated_at,
                };
                match serde_json::to_string(&current) {
                    Ok(json) => self.cache.put(HotCache::state_key(kind, entity_id), json),
                    Err(e) => warn!(error = %e, "state cache population failed"),
                }
                Ok(Some(current))
            }
            (None, true) => Ok(None),
            (None, false) => Err(CoreError::NotFound {
                kind,
                id: entity_id.to_string(),
            }),
        }
    }

    fn refresh_state_cache(&self, kind: EntityKind, entity_id: &str, transition: &StateTransition) {
        let current = CurrentState {
            entity_type: kind,
            entity_id: entity_id.to_string(),
            state: transition.to_state.clone(),
            updated_at: transition.timestamp.clone(),
        };
        match serde_json::to_string(&current) {
            Ok(json) => self.cache.put(HotCache::state_key(kind, entity_id), json),
            Err(e) => warn!(kind = %kind, entity_id = %entity_id, error = %e, "state cache update failed"),
        }
    }
}
