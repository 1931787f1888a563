//! Governor: rule-based decision of how stringently to supervise a job's
//! execution.
//!
//! The rule list is an explicitly constructed, immutable ordered list
//! passed in at startup, so multiple configurations can be tested in
//! isolation. Evaluation is first-match-wins for the selected mode; every
//! matching rule id is reported. Deciding has no effect on entity state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use traceline_common::{CoreError, ExecutionMode, ModeDecision, id, now_rfc3339};

use crate::store::DbHandle;

/// Declarative predicate over the job context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Context flag is boolean `true`.
    FlagTrue { flag: String },
    /// Context key equals the given JSON value.
    KeyEquals { key: String, value: Value },
    /// The job_type matches exactly.
    JobTypeIs { job_type: String },
    /// Matches every decision request.
    Always,
}

impl RuleCondition {
    pub fn matches(&self, job_type: &str, context: &Map<String, Value>) -> bool {
        match self {
            Self::FlagTrue { flag } => context.get(flag).and_then(Value::as_bool) == Some(true),
            Self::KeyEquals { key, value } => context.get(key) == Some(value),
            Self::JobTypeIs { job_type: expected } => job_type == expected,
            Self::Always => true,
        }
    }
}

/// One ordered governance rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorRule {
    pub id: String,
    pub mode: ExecutionMode,
    pub reason: String,
    pub condition: RuleCondition,
}

/// The built-in rule set used when configuration supplies none.
pub fn default_rules() -> Vec<GovernorRule> {
    vec![
        GovernorRule {
            id: "personal_data_rail".into(),
            mode: ExecutionMode::Rail,
            reason: "Job context processes personal data; rail supervision required under GDPR/DSGVO Art. 6"
                .into(),
            condition: RuleCondition::FlagTrue {
                flag: "uses_personal_data".into(),
            },
        },
        GovernorRule {
            id: "irreversible_effects_rail".into(),
            mode: ExecutionMode::Rail,
            reason: "Job declares irreversible side effects; rail supervision required".into(),
            condition: RuleCondition::FlagTrue {
                flag: "irreversible_side_effects".into(),
            },
        },
        GovernorRule {
            id: "external_spend_rail".into(),
            mode: ExecutionMode::Rail,
            reason: "Job incurs external cost; rail supervision required".into(),
            condition: RuleCondition::FlagTrue {
                flag: "incurs_external_cost".into(),
            },
        },
    ]
}

pub struct Governor {
    rules: Vec<GovernorRule>,
    db: DbHandle,
}

impl Governor {
    pub fn new(rules: Vec<GovernorRule>, db: DbHandle) -> Self {
        Self { rules, db }
    }

    pub fn rules(&self) -> &[GovernorRule] {
        &self.rules
    }

    /// Map a job context to an execution mode. The decision is persisted
    /// for audit and statistics before being returned; it never mutates
    /// entity state.
    pub async fn decide(
        &self,
        job_type: &str,
        context: &Map<String, Value>,
    ) -> Result<ModeDecision, CoreError> {
        let matched: Vec<&GovernorRule> = self
            .rules
            .iter()
            .filter(|rule| rule.condition.matches(job_type, context))
            .collect();

        let (mode, reason) = match matched.first() {
            Some(rule) => (rule.mode, rule.reason.clone()),
            None => (
                ExecutionMode::Direct,
                "No governance rule matched; default mode applies".to_string(),
            ),
        };

        let decision = ModeDecision {
            decision_id: id::mint_decision_id(),
            job_type: job_type.to_string(),
            mode,
            reason,
            matched_rules: matched.iter().map(|r| r.id.clone()).collect(),
            decided_at: now_rfc3339(),
        };
        debug!(
            job_type = %job_type,
            mode = %decision.mode,
            matched = decision.matched_rules.len(),
            "mode decided"
        );

        let stored = decision.clone();
        self.db
            .call(move |db| db.insert_mode_decision(&stored))
            .await
            .map_err(CoreError::storage)?;
        Ok(decision)
    }
}
