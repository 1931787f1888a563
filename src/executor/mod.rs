//! Execution wrapper: orchestrates a single attempt around an externally
//! supplied unit of work.
//!
//! The wrapper drives the lifecycle engine, audit log and telemetry
//! aggregator sequentially but independently, never inside a shared
//! transaction. Secondary-concern failures are logged and collected as
//! warnings on the report, never re-thrown.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use traceline_common::{
    Attempt, AttemptState, CoreError, EntityKind, ErrorCategory, Severity,
};

use crate::audit::{AuditLog, NewAuditEvent};
use crate::lifecycle::LifecycleEngine;
use crate::registry::{Entity, IdentityRegistry};
use crate::telemetry::Telemetry;

/// Reference to an ancestor entity the caller claims to act under.
#[derive(Debug, Clone, Deserialize)]
pub struct ParentContext {
    pub entity_type: EntityKind,
    pub entity_id: String,
}

/// Everything the wrapper needs to run one attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionContext {
    pub attempt_id: String,
    pub parent_context: Option<ParentContext>,
    #[serde(default)]
    pub job_parameters: Value,
}

/// Failure detail captured from the unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionFailure {
    pub message: String,
    pub error_type: String,
    pub category: ErrorCategory,
}

/// Outcome of one wrapped execution. `success` reflects the unit of work;
/// `warnings` lists secondary-concern failures that did not affect it.
#[derive(Debug, Serialize)]
pub struct ExecutionReport {
    pub attempt_id: String,
    pub success: bool,
    pub final_state: AttemptState,
    pub duration_ms: u64,
    pub output: Option<Value>,
    pub error: Option<ExecutionFailure>,
    pub warnings: Vec<String>,
}

pub struct ExecutionWrapper {
    registry: Arc<IdentityRegistry>,
    lifecycle: Arc<LifecycleEngine>,
    audit: Arc<AuditLog>,
    telemetry: Arc<Telemetry>,
}

impl ExecutionWrapper {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        lifecycle: Arc<LifecycleEngine>,
        audit: Arc<AuditLog>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            audit,
            telemetry,
        }
    }

    /// Run one attempt. Fails fast (before any state change) if the
    /// attempt or the declared parent context cannot be resolved, or if
    /// the attempt cannot legally move to running. Afterwards the unit of
    /// work's outcome is always captured: the attempt ends in `succeeded`
    /// or `failed`, never stays `running`.
    pub async fn execute<F, Fut>(
        &self,
        ctx: ExecutionContext,
        unit_of_work: F,
    ) -> Result<ExecutionReport, CoreError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let attempt = match self.registry.get(EntityKind::Attempt, &ctx.attempt_id).await? {
            Entity::Attempt(attempt) => attempt,
            _ => {
                return Err(CoreError::NotFound {
                    kind: EntityKind::Attempt,
                    id: ctx.attempt_id.clone(),
                })
            }
        };
        if let Some(parent) = &ctx.parent_context {
            self.registry.get(parent.entity_type, &parent.entity_id).await?;
        }

        self.lifecycle
            .transition(
                EntityKind::Attempt,
                &attempt.id,
                AttemptState::Running.as_str(),
                Some("execution".into()),
                None,
            )
            .await?;

        let mut warnings = Vec::new();
        self.log_secondary(
            start_event(&attempt),
            &mut warnings,
        )
        .await;

        let started = Instant::now();
        let outcome = unit_of_work(ctx.job_parameters.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                self.finish_secondary(&attempt, AttemptState::Succeeded, &mut warnings)
                    .await;
                self.log_secondary(success_event(&attempt, duration_ms), &mut warnings)
                    .await;
                self.telemetry
                    .record_execution(&attempt.id, true, duration_ms, None, None);
                Ok(ExecutionReport {
                    attempt_id: attempt.id,
                    success: true,
                    final_state: AttemptState::Succeeded,
                    duration_ms,
                    output: Some(output),
                    error: None,
                    warnings,
                })
            }
            Err(err) => {
                let failure = classify_failure(&err);
                self.finish_secondary(&attempt, AttemptState::Failed, &mut warnings)
                    .await;
                self.log_secondary(failure_event(&attempt, duration_ms, &failure), &mut warnings)
                    .await;
                self.telemetry.record_execution(
                    &attempt.id,
                    false,
                    duration_ms,
                    Some(&failure.error_type),
                    Some(failure.category),
                );
                Ok(ExecutionReport {
                    attempt_id: attempt.id,
                    success: false,
                    final_state: AttemptState::Failed,
                    duration_ms,
                    output: None,
                    error: Some(failure),
                    warnings,
                })
            }
        }
    }

    /// Terminal transition as a secondary concern: a failure here must not
    /// mask the unit of work's result, but it does mean the attempt is
    /// stuck in running, which is worth an error-level log.
    async fn finish_secondary(
        &self,
        attempt: &Attempt,
        target: AttemptState,
        warnings: &mut Vec<String>,
    ) {
        if let Err(e) = self
            .lifecycle
            .transition(
                EntityKind::Attempt,
                &attempt.id,
                target.as_str(),
                Some("execution".into()),
                None,
            )
            .await
        {
            error!(attempt_id = %attempt.id, target = %target, error = %e, "terminal transition failed");
            warnings.push(format!("transition to {} failed: {}", target, e));
        }
    }

    async fn log_secondary(&self, event: NewAuditEvent, warnings: &mut Vec<String>) {
        if let Err(e) = self.audit.log(event).await {
            warn!(error = %e, "audit logging failed during execution");
            warnings.push(format!("audit log failed: {}", e));
        }
    }
}

fn start_event(attempt: &Attempt) -> NewAuditEvent {
    NewAuditEvent {
        mission_id: None,
        plan_id: None,
        job_id: Some(attempt.job_id.clone()),
        attempt_id: Some(attempt.id.clone()),
        event_type: "execution_start".into(),
        event_category: "execution".into(),
        severity: Severity::Info,
        message: format!("attempt {} started", attempt.attempt_number),
        details: None,
    }
}

fn success_event(attempt: &Attempt, duration_ms: u64) -> NewAuditEvent {
    NewAuditEvent {
        mission_id: None,
        plan_id: None,
        job_id: Some(attempt.job_id.clone()),
        attempt_id: Some(attempt.id.clone()),
        event_type: "execution_success".into(),
        event_category: "execution".into(),
        severity: Severity::Info,
        message: format!("attempt {} succeeded", attempt.attempt_number),
        details: Some(serde_json::json!({ "duration_ms": duration_ms })),
    }
}

fn failure_event(attempt: &Attempt, duration_ms: u64, failure: &ExecutionFailure) -> NewAuditEvent {
    NewAuditEvent {
        mission_id: None,
        plan_id: None,
        job_id: Some(attempt.job_id.clone()),
        attempt_id: Some(attempt.id.clone()),
        event_type: "execution_failure".into(),
        event_category: "execution".into(),
        severity: Severity::Error,
        message: failure.message.clone(),
        details: Some(serde_json::json!({
            "duration_ms": duration_ms,
            "error_type": failure.error_type,
            "error_category": failure.category.as_str(),
        })),
    }
}

fn classify_failure(err: &anyhow::Error) -> ExecutionFailure {
    match err.downcast_ref::<CoreError>() {
        Some(core) => ExecutionFailure {
            message: core.to_string(),
            error_type: core.code().to_string(),
            category: core.category(),
        },
        None => ExecutionFailure {
            message: err.to_string(),
            error_type: "unit_of_work_error".into(),
            category: ErrorCategory::Mechanical,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::registry::{CreateAttempt, CreateJob, CreateMission, CreatePlan};
    use crate::store::{CoreDb, DbHandle, HotCache};
    use tokio::sync::broadcast;

    struct Fixture {
        wrapper: ExecutionWrapper,
        registry: Arc<IdentityRegistry>,
        lifecycle: Arc<LifecycleEngine>,
        audit: Arc<AuditLog>,
        telemetry: Arc<Telemetry>,
    }

    fn fixture() -> Fixture {
        let db = DbHandle::new(CoreDb::new_in_memory().unwrap());
        let cache = Arc::new(HotCache::default());
        let (tx, _) = broadcast::channel(16);
        let registry = Arc::new(IdentityRegistry::new(db.clone(), cache.clone()));
        let lifecycle = Arc::new(LifecycleEngine::new(db.clone(), cache));
        let audit = Arc::new(AuditLog::new(db.clone(), tx, 3600));
        let telemetry = Arc::new(Telemetry::new(db));
        Fixture {
            wrapper: ExecutionWrapper::new(
                registry.clone(),
                lifecycle.clone(),
                audit.clone(),
                telemetry.clone(),
            ),
            registry,
            lifecycle,
            audit,
            telemetry,
        }
    }

    async fn seed_attempt(f: &Fixture) -> Attempt {
        let mission = f.registry.create_mission(CreateMission::default()).await.unwrap();
        let plan = f
            .registry
            .create_plan(CreatePlan {
                id: None,
                mission_id: mission.id,
                plan_type: "course_outline".into(),
            })
            .await
            .unwrap();
        let job = f
            .registry
            .create_job(CreateJob {
                id: None,
                plan_id: plan.id,
                job_type: "generate_lesson".into(),
                tags: Default::default(),
            })
            .await
            .unwrap();
        f.registry
            .create_attempt(CreateAttempt {
                id: None,
                job_id: job.id,
                retry_reason: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_work_leaves_attempt_succeeded() {
        let f = fixture();
        let attempt = seed_attempt(&f).await;

        let report = f
            .wrapper
            .execute(
                ExecutionContext {
                    attempt_id: attempt.id.clone(),
                    parent_context: None,
                    job_parameters: serde_json::json!({"topic": "ownership"}),
                },
                |params| async move {
                    assert_eq!(params["topic"], "ownership");
                    Ok(serde_json::json!({"lesson": "done"}))
                },
            )
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.final_state, AttemptState::Succeeded);
        assert!(report.warnings.is_empty());
        assert_eq!(report.output.unwrap()["lesson"], "done");

        let state = f
            .lifecycle
            .current_state(EntityKind::Attempt, &attempt.id)
            .await
            .unwrap();
        assert_eq!(state.state, "succeeded");

        let (events, _) = f
            .audit
            .query_events(
                AuditFilter {
                    attempt_id: Some(attempt.id.clone()),
                    ..Default::default()
                },
                None,
                None,
            )
            .await
            .unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"execution_start"));
        assert!(types.contains(&"execution_success"));

        let metrics = f.telemetry.raw_metrics();
        assert_eq!(metrics.attempts_total.get("attempt:succeeded"), Some(&1));
    }

    #[tokio::test]
    async fn failing_work_never_leaves_attempt_running() {
        let f = fixture();
        let attempt = seed_attempt(&f).await;

        let report = f
            .wrapper
            .execute(
                ExecutionContext {
                    attempt_id: attempt.id.clone(),
                    parent_context: None,
                    job_parameters: Value::Null,
                },
                |_| async move { Err(anyhow::anyhow!("upstream model unavailable")) },
            )
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.final_state, AttemptState::Failed);
        let failure = report.error.unwrap();
        assert_eq!(failure.message, "upstream model unavailable");
        assert_eq!(failure.category, ErrorCategory::Mechanical);

        let state = f
            .lifecycle
            .current_state(EntityKind::Attempt, &attempt.id)
            .await
            .unwrap();
        assert_eq!(state.state, "failed", "attempt must not stay running");

        let (events, _) = f
            .audit
            .query_events(
                AuditFilter {
                    attempt_id: Some(attempt.id.clone()),
                    severity: Some(Severity::Error),
                    ..Default::default()
                },
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "execution_failure");

        let metrics = f.telemetry.raw_metrics();
        assert_eq!(metrics.attempts_total.get("attempt:failed"), Some(&1));
        assert_eq!(metrics.errors_by_category.get("mechanical"), Some(&1));
    }

    #[tokio::test]
    async fn unresolvable_parent_context_fails_fast() {
        let f = fixture();
        let attempt = seed_attempt(&f).await;

        let err = f
            .wrapper
            .execute(
                ExecutionContext {
                    attempt_id: attempt.id.clone(),
                    parent_context: Some(ParentContext {
                        entity_type: EntityKind::Mission,
                        entity_id: "m_missing".into(),
                    }),
                    job_parameters: Value::Null,
                },
                |_| async move { Ok(Value::Null) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));

        // Nothing ran: the attempt is still pending and no events exist.
        let state = f
            .lifecycle
            .current_state(EntityKind::Attempt, &attempt.id)
            .await
            .unwrap();
        assert_eq!(state.state, "pending");

        let (events, _) = f
            .audit
            .query_events(
                AuditFilter {
                    attempt_id: Some(attempt.id.clone()),
                    ..Default::default()
                },
                None,
                None,
            )
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn core_errors_from_work_keep_their_classification() {
        let f = fixture();
        let attempt = seed_attempt(&f).await;

        let report = f
            .wrapper
            .execute(
                ExecutionContext {
                    attempt_id: attempt.id.clone(),
                    parent_context: None,
                    job_parameters: Value::Null,
                },
                |_| async move {
                    Err(anyhow::Error::new(CoreError::PolicyCooldown {
                        reason: "reflex window active".into(),
                    }))
                },
            )
            .await
            .unwrap();

        let failure = report.error.unwrap();
        assert_eq!(failure.error_type, "NR-E008");
        assert_eq!(failure.category, ErrorCategory::Ethical);

        let metrics = f.telemetry.raw_metrics();
        assert_eq!(metrics.errors_by_category.get("ethical"), Some(&1));
    }

    #[tokio::test]
    async fn already_terminal_attempt_cannot_start() {
        let f = fixture();
        let attempt = seed_attempt(&f).await;
        f.lifecycle
            .transition(EntityKind::Attempt, &attempt.id, "cancelled", None, None)
            .await
            .unwrap();

        let err = f
            .wrapper
            .execute(
                ExecutionContext {
                    attempt_id: attempt.id,
                    parent_context: None,
                    job_parameters: Value::Null,
                },
                |_| async move { Ok(Value::Null) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
    }
}
