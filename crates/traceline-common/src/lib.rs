//! Shared domain types for the traceline governance core.
//!
//! Everything the service crate and its callers agree on lives here:
//! entity identities, lifecycle states, audit/transition records, and the
//! typed error taxonomy with stable codes.

pub mod entity;
pub mod error;
pub mod id;
pub mod state;

pub use entity::{
    Attempt, AuditEvent, ExecutionMode, Job, Mission, ModeDecision, Plan, Resource, Severity,
    StateTransition, TraceChain,
};
pub use error::{CoreError, ErrorCategory};
pub use id::EntityKind;
pub use state::{AttemptState, JobState, MissionState};

use chrono::{SecondsFormat, Utc};

/// Current UTC time as RFC 3339 with millisecond precision.
///
/// All persisted timestamps use this format so lexicographic ordering
/// matches chronological ordering.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
