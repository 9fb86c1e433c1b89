use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a live workflow definition.
    WorkflowId
);
string_id!(
    /// Identifier of a step, unique within its workflow.
    StepId
);
string_id!(
    /// Identifier of an immutable workflow version.
    VersionId
);
string_id!(
    /// Identifier of the participant moving through a workflow.
    ParticipantId
);
string_id!(
    /// Identifier of one parallel branch row.
    BranchStateId
);
string_id!(
    /// Identifier of one entry into a fork step.
    ForkInstanceId
);

/// Who performed a mutation.
///
/// Automatic transitions (SLA escalation, fork joins) are attributed to
/// `System` instead of a sentinel user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User(String),
    System,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }

    /// Stored form: `system`, or `user:<id>` for a user.
    pub fn tagged(&self) -> String {
        match self {
            Self::User(id) => format!("user:{}", id),
            Self::System => "system".to_string(),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "{}", id),
            Self::System => write!(f, "system"),
        }
    }
}

/// A bare id is always a user; only [`Actor::System`] names the engine.
impl From<&str> for Actor {
    fn from(s: &str) -> Self {
        Self::User(s.to_string())
    }
}

/// Parses the [`Actor::tagged`] form.
impl std::str::FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.strip_prefix("user:") {
            Some(id) => Ok(Self::User(id.to_string())),
            None if s == "system" => Ok(Self::System),
            None => Err(format!("untagged actor: {}", s)),
        }
    }
}

/// Action applied to a participant's current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Approve,
    Reject,
    Bypass,
    /// Only reachable through the SLA monitor.
    Escalate,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
            Self::Bypass => write!(f, "bypass"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "bypass" => Ok(Self::Bypass),
            "escalate" => Ok(Self::Escalate),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// Signals produced by the engine for an external notification dispatcher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A participant was placed on a workflow's entry step.
    Entered {
        participant_id: ParticipantId,
        version_id: VersionId,
        step_id: StepId,
        at: DateTime<Utc>,
    },
    /// A participant moved between steps or reached a final status.
    Transitioned {
        participant_id: ParticipantId,
        action: Action,
        actor: Actor,
        from_step: Option<StepId>,
        to_step: Option<StepId>,
        status: crate::participant::ParticipantStatus,
        at: DateTime<Utc>,
    },
    /// Branch states were spawned for a fork step.
    ForkOpened {
        participant_id: ParticipantId,
        instance_id: ForkInstanceId,
        fork_step_id: StepId,
        branches: usize,
    },
    /// One parallel branch was approved or rejected.
    BranchResolved {
        participant_id: ParticipantId,
        branch_state_id: BranchStateId,
        branch_step_id: StepId,
        action: Action,
        actor: Actor,
    },
    /// The join condition of a fork fired.
    ForkJoined {
        participant_id: ParticipantId,
        instance_id: ForkInstanceId,
        fork_step_id: StepId,
        action: Action,
    },
    /// A participant has been on a step longer than its SLA.
    SlaWarning {
        participant_id: ParticipantId,
        step_id: StepId,
        overdue_minutes: i64,
        minutes_to_breach: i64,
    },
    /// A participant passed the SLA breach threshold.
    SlaBreach {
        participant_id: ParticipantId,
        step_id: StepId,
        overdue_minutes: i64,
        sla_action: crate::workflow::SlaAction,
    },
}

impl WorkflowEvent {
    /// Short machine name, used as the journal `event_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Entered { .. } => "entered",
            Self::Transitioned { .. } => "transitioned",
            Self::ForkOpened { .. } => "fork_opened",
            Self::BranchResolved { .. } => "branch_resolved",
            Self::ForkJoined { .. } => "fork_joined",
            Self::SlaWarning { .. } => "sla_warning",
            Self::SlaBreach { .. } => "sla_breach",
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        match self {
            Self::Entered { participant_id, .. }
            | Self::Transitioned { participant_id, .. }
            | Self::ForkOpened { participant_id, .. }
            | Self::BranchResolved { participant_id, .. }
            | Self::ForkJoined { participant_id, .. }
            | Self::SlaWarning { participant_id, .. }
            | Self::SlaBreach { participant_id, .. } => participant_id,
        }
    }
}
