use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kinds of entity the identity registry can issue ids for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Mission,
    Plan,
    Job,
    Attempt,
    Resource,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mission => "mission",
            Self::Plan => "plan",
            Self::Job => "job",
            Self::Attempt => "attempt",
            Self::Resource => "resource",
        }
    }

    /// Type-discriminating id prefix, e.g. `m_` for missions.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::Mission => "m_",
            Self::Plan => "p_",
            Self::Job => "j_",
            Self::Attempt => "a_",
            Self::Resource => "r_",
        }
    }

    /// Whether this kind carries a lifecycle state machine.
    pub fn is_stateful(&self) -> bool {
        !matches!(self, Self::Resource)
    }

    /// Mint a fresh globally unique id for this kind.
    pub fn mint_id(&self) -> String {
        format!("{}{}", self.id_prefix(), Uuid::new_v4().simple())
    }

    /// Check that an id carries this kind's prefix.
    pub fn owns_id(&self, id: &str) -> bool {
        id.starts_with(self.id_prefix())
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mission" => Ok(Self::Mission),
            "plan" => Ok(Self::Plan),
            "job" => Ok(Self::Job),
            "attempt" => Ok(Self::Attempt),
            "resource" => Ok(Self::Resource),
            _ => Err(format!("Invalid entity kind: {}", s)),
        }
    }
}

/// Mint an audit event id (`evt_…`).
pub fn mint_audit_id() -> String {
    format!("evt_{}", Uuid::new_v4().simple())
}

/// Mint a state transition id (`tr_…`).
pub fn mint_transition_id() -> String {
    format!("tr_{}", Uuid::new_v4().simple())
}

/// Mint a mode decision id (`d_…`).
pub fn mint_decision_id() -> String {
    format!("d_{}", Uuid::new_v4().simple())
}
