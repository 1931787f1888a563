//! Identity registry: issues and resolves hierarchical entity identities
//! and reconstructs the full trace chain for any entity.
//!
//! All writes land in the durable store first; the hot cache is populated
//! afterwards and any cache failure is logged and swallowed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use traceline_common::{
    Attempt, CoreError, EntityKind, Job, Mission, Plan, Resource, TraceChain, now_rfc3339,
};

use crate::store::{DbHandle, HotCache};

// ── Creation payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateMission {
    pub id: Option<String>,
    pub parent_mission_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlan {
    pub id: Option<String>,
    pub mission_id: String,
    pub plan_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJob {
    pub id: Option<String>,
    pub plan_id: String,
    pub job_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAttempt {
    pub id: Option<String>,
    pub job_id: String,
    pub retry_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateResource {
    pub uuid: Option<String>,
    pub attempt_id: String,
    pub resource_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Any registered entity, serialized as its inner record.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Entity {
    Mission(Mission),
    Plan(Plan),
    Job(Job),
    Attempt(Attempt),
    Resource(Resource),
}

/// Initial lifecycle state for every stateful kind.
const INITIAL_STATE: &str = "pending";

pub struct IdentityRegistry {
    db: DbHandle,
    cache: Arc<HotCache>,
}

impl IdentityRegistry {
    pub fn new(db: DbHandle, cache: Arc<HotCache>) -> Self {
        Self { db, cache }
    }

    // ── Creation ──────────────────────────────────────────────────────

    pub async fn create_mission(&self, req: CreateMission) -> Result<Mission, CoreError> {
        let id = self
            .claim_id(EntityKind::Mission, req.id)
            .await?;
        if let Some(parent) = &req.parent_mission_id {
            self.require_exists(EntityKind::Mission, parent).await?;
        }
        let mission = Mission {
            id,
            parent_mission_id: req.parent_mission_id,
            tags: req.tags,
            created_at: now_rfc3339(),
        };
        let stored = mission.clone();
        self.db
            .call(move |db| db.insert_mission(&stored, INITIAL_STATE))
            .await
            .map_err(CoreError::storage)?;
        self.populate_cache(EntityKind::Mission, &mission.id, &Entity::Mission(mission.clone()));
        Ok(mission)
    }

    pub async fn create_plan(&self, req: CreatePlan) -> Result<Plan, CoreError> {
        let id = self.claim_id(EntityKind::Plan, req.id).await?;
        self.require_exists(EntityKind::Mission, &req.mission_id)
            .await?;
        let plan = Plan {
            id,
            mission_id: req.mission_id,
            plan_type: req.plan_type,
            created_at: now_rfc3339(),
        };
        let stored = plan.clone();
        self.db
            .call(move |db| db.insert_plan(&stored, INITIAL_STATE))
            .await
            .map_err(CoreError::storage)?;
        self.populate_cache(EntityKind::Plan, &plan.id, &Entity::Plan(plan.clone()));
        Ok(plan)
    }

    pub async fn create_job(&self, req: CreateJob) -> Result<Job, CoreError> {
        let id = self.claim_id(EntityKind::Job, req.id).await?;
        self.require_exists(EntityKind::Plan, &req.plan_id).await?;
        let job = Job {
            id,
            plan_id: req.plan_id,
            job_type: req.job_type,
            tags: req.tags,
            created_at: now_rfc3339(),
        };
        let stored = job.clone();
        self.db
            .call(move |db| db.insert_job(&stored, INITIAL_STATE))
            .await
            .map_err(CoreError::storage)?;
        self.populate_cache(EntityKind::Job, &job.id, &Entity::Job(job.clone()));
        Ok(job)
    }

    /// Create an attempt; the attempt_number is allocated atomically in the
    /// store so concurrent retries never collide.
    pub async fn create_attempt(&self, req: CreateAttempt) -> Result<Attempt, CoreError> {
        let id = self.claim_id(EntityKind::Attempt, req.id).await?;
        self.require_exists(EntityKind::Job, &req.job_id).await?;
        let job_id = req.job_id;
        let retry_reason = req.retry_reason;
        let attempt_id = id.clone();
        let created_at = now_rfc3339();
        let attempt = self
            .db
            .call(move |db| {
                db.insert_attempt(
                    &attempt_id,
                    &job_id,
                    retry_reason.as_deref(),
                    &created_at,
                    INITIAL_STATE,
                )
            })
            .await
            .map_err(CoreError::storage)?;
        self.populate_cache(EntityKind::Attempt, &attempt.id, &Entity::Attempt(attempt.clone()));
        Ok(attempt)
    }

    pub async fn create_resource(&self, req: CreateResource) -> Result<Resource, CoreError> {
        let uuid = self.claim_id(EntityKind::Resource, req.uuid).await?;
        self.require_exists(EntityKind::Attempt, &req.attempt_id)
            .await?;
        let resource = Resource {
            uuid,
            attempt_id: req.attempt_id,
            resource_type: req.resource_type,
            metadata: req.metadata,
            created_at: now_rfc3339(),
        };
        let stored = resource.clone();
        self.db
            .call(move |db| db.insert_resource(&stored))
            .await
            .map_err(CoreError::storage)?;
        self.populate_cache(
            EntityKind::Resource,
            &resource.uuid,
            &Entity::Resource(resource.clone()),
        );
        Ok(resource)
    }

    // ── Resolution ────────────────────────────────────────────────────

    /// Resolve one entity, probing the hot cache before the durable store.
    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Entity, CoreError> {
        let key = HotCache::entity_key(kind, id);
        if let Some(cached) = self.cache.get(&key) {
            match parse_cached(kind, &cached) {
                Some(entity) => return Ok(entity),
                None => {
                    warn!(key = %key, "discarding unparseable cache entry");
                    self.cache.invalidate(&key);
                }
            }
        }

        let owned = id.to_string();
        let entity = self
            .db
            .call(move |db| fetch_entity(db, kind, &owned))
            .await
            .map_err(CoreError::storage)?
            .ok_or_else(|| CoreError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        self.populate_cache(kind, id, &entity);
        Ok(entity)
    }

    /// Reconstruct the full hierarchy reachable from any entity.
    ///
    /// Ancestors are resolved by walking parent references; a dangling
    /// reference leaves its field `None` rather than failing the whole
    /// chain. Resources are listed only when the chain reaches an attempt.
    pub async fn trace_chain(&self, kind: EntityKind, id: &str) -> Result<TraceChain, CoreError> {
        let anchor = self.get(kind, id).await?;

        let mut chain = TraceChain {
            mission: None,
            plan: None,
            job: None,
            attempt: None,
            resources: Vec::new(),
        };

        match anchor {
            Entity::Mission(m) => chain.mission = Some(m),
            Entity::Plan(p) => chain.plan = Some(p),
            Entity::Job(j) => chain.job = Some(j),
            Entity::Attempt(a) => chain.attempt = Some(a),
            Entity::Resource(r) => {
                chain.attempt = self.get_attempt_opt(&r.attempt_id).await?;
                chain.resources.push(r);
            }
        }

        if let Some(attempt) = &chain.attempt {
            if chain.resources.is_empty() {
                let attempt_id = attempt.id.clone();
                chain.resources = self
                    .db
                    .call(move |db| db.list_resources_for_attempt(&attempt_id))
                    .await
                    .map_err(CoreError::storage)?;
            }
            chain.job = self.get_job_opt(&attempt.job_id).await?;
        }
        if let Some(job) = &chain.job {
            chain.plan = self.get_plan_opt(&job.plan_id).await?;
        }
        if let Some(plan) = &chain.plan {
            chain.mission = self.get_mission_opt(&plan.mission_id).await?;
        }

        Ok(chain)
    }

    // ── Internals ─────────────────────────────────────────────────────

    /// Resolve the final id for a creation: mint one, or verify a
    /// caller-supplied id does not collide.
    async fn claim_id(&self, kind: EntityKind, requested: Option<String>) -> Result<String, CoreError> {
        match requested {
            None => Ok(kind.mint_id()),
            Some(id) => {
                let owned = id.clone();
                let exists = self
                    .db
                    .call(move |db| db.entity_exists(kind, &owned))
                    .await
                    .map_err(CoreError::storage)?;
                if exists {
                    Err(CoreError::Conflict { kind, id })
                } else {
                    Ok(id)
                }
            }
        }
    }

    async fn require_exists(&self, kind: EntityKind, id: &str) -> Result<(), CoreError> {
        let owned = id.to_string();
        let exists = self
            .db
            .call(move |db| db.entity_exists(kind, &owned))
            .await
            .map_err(CoreError::storage)?;
        if exists {
            Ok(())
        } else {
            Err(CoreError::NotFound {
                kind,
                id: id.to_string(),
            })
        }
    }

    fn populate_cache(&self, kind: EntityKind, id: &str, entity: &Entity) {
        match serde_json::to_string(entity) {
            Ok(json) => self.cache.put(HotCache::entity_key(kind, id), json),
            Err(e) => warn!(kind = %kind, id = %id, error = %e, "cache population failed"),
        }
    }

    async fn get_mission_opt(&self, id: &str) -> Result<Option<Mission>, CoreError> {
        match self.get(EntityKind::Mission, id).await {
            Ok(Entity::Mission(m)) => Ok(Some(m)),
            Ok(_) | Err(CoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_plan_opt(&self, id: &str) -> Result<Option<Plan>, CoreError> {
        match self.get(EntityKind::Plan, id).await {
            Ok(Entity::Plan(p)) => Ok(Some(p)),
            Ok(_) | Err(CoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_job_opt(&self, id: &str) -> Result<Option<Job>, CoreError> {
        match self.get(EntityKind::Job, id).await {
            Ok(Entity::Job(j)) => Ok(Some(j)),
            Ok(_) | Err(CoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_attempt_opt(&self, id: &str) -> Result<Option<Attempt>, CoreError> {
        match self.get(EntityKind::Attempt, id).await {
            Ok(Entity::Attempt(a)) => Ok(Some(a)),
            Ok(_) | Err(CoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn parse_cached(kind: EntityKind, json: &str) -> Option<Entity> {
    match kind {
        EntityKind::Mission => serde_json::from_str(json).ok().map(Entity::Mission),
        EntityKind::Plan => serde_json::from_str(json).ok().map(Entity::Plan),
        EntityKind::Job => serde_json::from_str(json).ok().map(Entity::Job),
        EntityKind::Attempt => serde_json::from_str(json).ok().map(Entity::Attempt),
        EntityKind::Resource => serde_json::from_str(json).ok().map(Entity::Resource),
    }
}

fn fetch_entity(
    db: &crate::store::CoreDb,
    kind: EntityKind,
    id: &str,
) -> anyhow::Result<Option<Entity>> {
    Ok(match kind {
        EntityKind::Mission => db.get_mission(id)?.map(Entity::Mission),
        EntityKind::Plan => db.get_plan(id)?.map(Entity::Plan),
        EntityKind::Job => db.get_job(id)?.map(Entity::Job),
        EntityKind::Attempt => db.get_attempt(id)?.map(Entity::Attempt),
        EntityKind::Resource => db.get_resource(id)?.map(Entity::Resource),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CoreDb;

    fn registry() -> IdentityRegistry {
        let db = DbHandle::new(CoreDb::new_in_memory().unwrap());
        IdentityRegistry::new(db, Arc::new(HotCache::default()))
    }

    async fn seed_attempt(registry: &IdentityRegistry) -> (Mission, Plan, Job, Attempt) {
        let mission = registry.create_mission(CreateMission::default()).await.unwrap();
        let plan = registry
            .create_plan(CreatePlan {
                id: None,
                mission_id: mission.id.clone(),
                plan_type: "course_outline".into(),
            })
            .await
            .unwrap();
        let job = registry
            .create_job(CreateJob {
                id: None,
                plan_id: plan.id.clone(),
                job_type: "generate_lesson".into(),
                tags: Default::default(),
            })
            .await
            .unwrap();
        let attempt = registry
            .create_attempt(CreateAttempt {
                id: None,
                job_id: job.id.clone(),
                retry_reason: None,
            })
            .await
            .unwrap();
        (mission, plan, job, attempt)
    }

    #[tokio::test]
    async fn create_mission_mints_prefixed_id() {
        let registry = registry();
        let mission = registry.create_mission(CreateMission::default()).await.unwrap();
        assert!(mission.id.starts_with("m_"));
    }

    #[tokio::test]
    async fn create_plan_requires_existing_mission() {
        let registry = registry();
        let err = registry
            .create_plan(CreatePlan {
                id: None,
                mission_id: "m_missing".into(),
                plan_type: "course_outline".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn caller_supplied_id_collision_is_conflict() {
        let registry = registry();
        let first = registry
            .create_mission(CreateMission {
                id: Some("m_fixed".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.id, "m_fixed");

        let err = registry
            .create_mission(CreateMission {
                id: Some("m_fixed".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn attempt_numbers_increase_per_job() {
        let registry = registry();
        let (_, _, job, first) = seed_attempt(&registry).await;
        assert_eq!(first.attempt_number, 1);

        let second = registry
            .create_attempt(CreateAttempt {
                id: None,
                job_id: job.id.clone(),
                retry_reason: Some("transient upstream failure".into()),
            })
            .await
            .unwrap();
        assert_eq!(second.attempt_number, 2);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn get_unknown_entity_is_not_found() {
        let registry = registry();
        let err = registry.get(EntityKind::Job, "j_missing").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn get_survives_cache_eviction() {
        let db = DbHandle::new(CoreDb::new_in_memory().unwrap());
        let cache = Arc::new(HotCache::new(std::time::Duration::from_millis(1)));
        let registry = IdentityRegistry::new(db, cache.clone());

        let mission = registry.create_mission(CreateMission::default()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(cache.get(&HotCache::entity_key(EntityKind::Mission, &mission.id)).is_none());

        // Miss falls through to the store and repopulates.
        let fetched = registry.get(EntityKind::Mission, &mission.id).await.unwrap();
        assert!(matches!(fetched, Entity::Mission(m) if m.id == mission.id));
        assert!(cache.get(&HotCache::entity_key(EntityKind::Mission, &mission.id)).is_some());
    }

    #[tokio::test]
    async fn trace_chain_from_attempt_resolves_all_ancestors() {
        let registry = registry();
        let (mission, plan, job, attempt) = seed_attempt(&registry).await;
        let resource = registry
            .create_resource(CreateResource {
                uuid: None,
                attempt_id: attempt.id.clone(),
                resource_type: "artifact".into(),
                metadata: serde_json::json!({"path": "out/lesson.md"}),
            })
            .await
            .unwrap();

        let chain = registry
            .trace_chain(EntityKind::Attempt, &attempt.id)
            .await
            .unwrap();
        assert_eq!(chain.mission.as_ref().map(|m| m.id.as_str()), Some(mission.id.as_str()));
        assert_eq!(chain.plan.as_ref().map(|p| p.id.as_str()), Some(plan.id.as_str()));
        assert_eq!(chain.job.as_ref().map(|j| j.id.as_str()), Some(job.id.as_str()));
        assert_eq!(chain.attempt.as_ref().map(|a| a.id.as_str()), Some(attempt.id.as_str()));
        assert_eq!(chain.resources.len(), 1);
        assert_eq!(chain.resources[0].uuid, resource.uuid);
    }

    #[tokio::test]
    async fn trace_chain_from_mission_leaves_descendants_empty() {
        let registry = registry();
        let mission = registry.create_mission(CreateMission::default()).await.unwrap();
        let chain = registry
            .trace_chain(EntityKind::Mission, &mission.id)
            .await
            .unwrap();
        assert!(chain.mission.is_some());
        assert!(chain.plan.is_none());
        assert!(chain.job.is_none());
        assert!(chain.attempt.is_none());
        assert!(chain.resources.is_empty());
    }

    #[tokio::test]
    async fn trace_chain_for_unknown_id_is_not_found() {
        let registry = registry();
        let err = registry
            .trace_chain(EntityKind::Attempt, "a_missing")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }
}
