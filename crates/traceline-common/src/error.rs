//! Typed error taxonomy for the governance core.
//!
//! Every error carries a stable namespaced code (`NR-Exxx`), a category
//! describing where the failure originates, and a retriability flag, so
//! programmatic callers can branch without string matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::EntityKind;

/// Where a failure originates.
///
/// `Mechanical` covers infrastructure and transient faults, `Ethical`
/// covers policy/governance refusals, `System` covers programming and
/// contract violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Mechanical,
    Ethical,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mechanical => "mechanical",
            Self::Ethical => "ethical",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the trace & governance core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid {kind} transition from {} to {to}", .from.as_deref().unwrap_or("<none>"))]
    InvalidStateTransition {
        kind: EntityKind,
        from: Option<String>,
        to: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("{kind} id {id} already exists")]
    Conflict { kind: EntityKind, id: String },

    #[error("Unknown state '{value}' for {kind}")]
    UnknownState { kind: EntityKind, value: String },

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Execution timed out after {elapsed_ms}ms")]
    ExecutionTimeout { elapsed_ms: u64 },

    #[error("Retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },

    #[error("Policy reflex cooldown active: {reason}")]
    PolicyCooldown { reason: String },

    #[error("Orphan process killed for attempt {attempt_id}")]
    OrphanKilled { attempt_id: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
}

impl CoreError {
    /// Stable error code, safe to branch on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidStateTransition { .. } => "NR-E001",
            Self::NotFound { .. } => "NR-E002",
            Self::Conflict { .. } => "NR-E003",
            Self::UnknownState { .. } => "NR-E004",
            Self::Storage(_) => "NR-E005",
            Self::ExecutionTimeout { .. } => "NR-E006",
            Self::RetryBudgetExhausted { .. } => "NR-E007",
            Self::PolicyCooldown { .. } => "NR-E008",
            Self::OrphanKilled { .. } => "NR-E009",
            Self::InvalidRequest { .. } => "NR-E010",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Storage(_) | Self::ExecutionTimeout { .. } | Self::RetryBudgetExhausted { .. } => {
                ErrorCategory::Mechanical
            }
            Self::PolicyCooldown { .. } => ErrorCategory::Ethical,
            Self::InvalidStateTransition { .. }
            | Self::NotFound { .. }
            | Self::Conflict { .. }
            | Self::UnknownState { .. }
            | Self::OrphanKilled { .. }
            | Self::InvalidRequest { .. } => ErrorCategory::System,
        }
    }

    pub fn retriable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::ExecutionTimeout { .. })
    }

    /// Wrap an infrastructure failure, preserving its context chain.
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_carries_current_and_target() {
        let err = CoreError::InvalidStateTransition {
            kind: EntityKind::Mission,
            from: Some("planning".into()),
            to: "completed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("planning"));
        assert!(msg.contains("completed"));
        assert_eq!(err.code(), "NR-E001");
        assert_eq!(err.category(), ErrorCategory::System);
        assert!(!err.retriable());
    }

    #[test]
    fn invalid_transition_from_unknown_state_renders_placeholder() {
        let err = CoreError::InvalidStateTransition {
            kind: EntityKind::Job,
            from: None,
            to: "running".into(),
        };
        assert!(err.to_string().contains("<none>"));
    }

    #[test]
    fn categories_follow_failure_origin() {
        assert_eq!(
            CoreError::ExecutionTimeout { elapsed_ms: 5000 }.category(),
            ErrorCategory::Mechanical
        );
        assert_eq!(
            CoreError::RetryBudgetExhausted { attempts: 3 }.category(),
            ErrorCategory::Mechanical
        );
        assert_eq!(
            CoreError::PolicyCooldown {
                reason: "reflex window".into()
            }
            .category(),
            ErrorCategory::Ethical
        );
        assert_eq!(
            CoreError::OrphanKilled {
                attempt_id: "a_1".into()
            }
            .category(),
            ErrorCategory::System
        );
    }

    #[test]
    fn retriability_matches_contract() {
        assert!(CoreError::ExecutionTimeout { elapsed_ms: 1 }.retriable());
        assert!(CoreError::storage(anyhow::anyhow!("db offline")).retriable());
        assert!(!CoreError::RetryBudgetExhausted { attempts: 3 }.retriable());
        assert!(
            !CoreError::PolicyCooldown {
                reason: "x".into()
            }
            .retriable()
        );
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            CoreError::InvalidStateTransition {
                kind: EntityKind::Mission,
                from: None,
                to: "pending".into(),
            },
            CoreError::NotFound {
                kind: EntityKind::Plan,
                id: "p_1".into(),
            },
            CoreError::Conflict {
                kind: EntityKind::Job,
                id: "j_1".into(),
            },
            CoreError::UnknownState {
                kind: EntityKind::Job,
                value: "bogus".into(),
            },
            CoreError::storage(anyhow::anyhow!("x")),
            CoreError::ExecutionTimeout { elapsed_ms: 1 },
            CoreError::RetryBudgetExhausted { attempts: 1 },
            CoreError::PolicyCooldown { reason: "x".into() },
            CoreError::OrphanKilled {
                attempt_id: "a_1".into(),
            },
            CoreError::InvalidRequest {
                message: "bad input".into(),
            },
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
