use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    Action, Actor, BranchStateId, ForkInstanceId, ParticipantId, StepId, VersionId,
};
use crate::workflow::TerminalOutcome;

/// Overall accreditation status of a participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl From<TerminalOutcome> for ParticipantStatus {
    fn from(outcome: TerminalOutcome) -> Self {
        match outcome {
            TerminalOutcome::Approved => Self::Approved,
            TerminalOutcome::Rejected => Self::Rejected,
        }
    }
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ParticipantStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown participant status: {}", other)),
        }
    }
}

/// The workflow-relevant fields of a participant record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub workflow_version_id: Option<VersionId>,
    pub current_step_id: Option<StepId>,
    pub step_entered_at: Option<DateTime<Utc>>,
    pub status: ParticipantStatus,
    /// Optimistic-concurrency counter, bumped on every position write.
    pub revision: u64,
}

impl Participant {
    /// A participant that has not entered any workflow yet.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ParticipantId(id.into()),
            workflow_version_id: None,
            current_step_id: None,
            step_entered_at: None,
            status: ParticipantStatus::Pending,
            revision: 0,
        }
    }
}

/// Status of one parallel branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    /// Left pending when the fork was closed without it.
    Abandoned,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Approve => Some(Self::Approved),
            Action::Reject => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::str::FromStr for BranchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown branch status: {}", other)),
        }
    }
}

/// One independently resolvable branch beneath a fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranchState {
    pub id: BranchStateId,
    pub participant_id: ParticipantId,
    pub fork_instance_id: ForkInstanceId,
    pub fork_step_id: StepId,
    pub branch_step_id: StepId,
    pub label: String,
    pub status: BranchStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<Actor>,
    pub action: Option<Action>,
    pub remarks: Option<String>,
    pub revision: u64,
}

impl ParallelBranchState {
    pub fn is_open(&self) -> bool {
        self.status == BranchStatus::Pending
    }
}

/// One entry of a participant into a fork step.
///
/// `joined_at` is the per-instance guard that makes the join fire once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkInstance {
    pub id: ForkInstanceId,
    pub participant_id: ParticipantId,
    pub fork_step_id: StepId,
    pub opened_at: DateTime<Utc>,
    pub joined_at: Option<DateTime<Utc>>,
    /// Aggregated action; `None` when the fork was left by escalation.
    pub outcome: Option<Action>,
}

impl ForkInstance {
    pub fn is_closed(&self) -> bool {
        self.joined_at.is_some()
    }
}

/// Kind of mutation an audit row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Entry,
    Transition,
    BranchResolution,
    Join,
    Escalation,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Transition => "transition",
            Self::BranchResolution => "branch_resolution",
            Self::Join => "join",
            Self::Escalation => "escalation",
        }
    }
}

impl std::str::FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "entry" => Ok(Self::Entry),
            "transition" => Ok(Self::Transition),
            "branch_resolution" => Ok(Self::BranchResolution),
            "join" => Ok(Self::Join),
            "escalation" => Ok(Self::Escalation),
            other => Err(format!("unknown audit kind: {}", other)),
        }
    }
}

/// Append-only record accompanying every mutating operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub participant_id: ParticipantId,
    pub kind: AuditKind,
    pub actor: Actor,
    pub action: Option<Action>,
    pub remarks: Option<String>,
    pub from_step: Option<StepId>,
    pub to_step: Option<StepId>,
    pub at: DateTime<Utc>,
}

/// Branch rows to spawn together with a new fork instance.
#[derive(Debug, Clone)]
pub struct ForkOpening {
    pub instance: ForkInstance,
    pub branches: Vec<ParallelBranchState>,
}

/// Closing an open fork instance as part of a position write.
#[derive(Debug, Clone)]
pub struct ForkClose {
    pub instance_id: ForkInstanceId,
    pub outcome: Option<Action>,
}

/// A position change committed atomically by the store.
///
/// The store rejects the write with `Conflict` when the participant's
/// stored revision differs from `expected_revision`, and with
/// `ForkAlreadyJoined` when `close_fork` names an instance that is
/// already closed.
#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub participant_id: ParticipantId,
    pub expected_revision: u64,
    pub workflow_version_id: Option<VersionId>,
    pub current_step_id: Option<StepId>,
    pub step_entered_at: DateTime<Utc>,
    pub status: ParticipantStatus,
    pub close_fork: Option<ForkClose>,
    pub open_fork: Option<ForkOpening>,
}
