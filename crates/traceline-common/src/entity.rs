use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::id::EntityKind;

/// A unit of strategic work. Missions may nest (parent_mission_id) and own
/// zero or more plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub parent_mission_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub created_at: String,
}

/// A plan under a mission. Immutable after creation except for state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub mission_id: String,
    pub plan_type: String,
    pub created_at: String,
}

/// A schedulable unit of work under a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub plan_id: String,
    pub job_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub created_at: String,
}

/// One execution attempt of a job. Retries create new attempts with a
/// strictly increasing 1-based attempt_number; prior attempts are never
/// mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub job_id: String,
    pub attempt_number: i64,
    pub retry_reason: Option<String>,
    pub created_at: String,
}

/// A side artifact produced during an attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub uuid: String,
    pub attempt_id: String,
    pub resource_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: String,
}

/// The full mission→plan→job→attempt→resource hierarchy reachable from a
/// given entity. Fields above the anchor are populated by walking parent
/// references; fields below it stay `None` (except resources, listed when
/// the anchor resolves to an attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceChain {
    pub mission: Option<Mission>,
    pub plan: Option<Plan>,
    pub job: Option<Job>,
    pub attempt: Option<Attempt>,
    pub resources: Vec<Resource>,
}

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// An immutable audit ledger entry. Trace ids are advisory references into
/// the identity registry; they are recorded as given, not enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub audit_id: String,
    pub timestamp: String,
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

/// One recorded lifecycle transition. The full ordered set of these rows
/// for an entity is its state history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub transition_id: String,
    pub timestamp: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub transition_type: String,
    pub metadata: Option<serde_json::Value>,
}

/// Execution mode selected by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Direct,
    Rail,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Rail => "rail",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "rail" => Ok(Self::Rail),
            _ => Err(format!("Invalid execution mode: {}", s)),
        }
    }
}

/// The governor's answer for one job: how stringently to supervise the
/// subsequent execution. Persisted for audit, no effect on entity state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeDecision {
    pub decision_id: String,
    pub job_type: String,
    pub mode: ExecutionMode,
    pub reason: String,
    pub matched_rules: Vec<String>,
    pub decided_at: String,
}
