//! Loading a participant together with its pinned snapshot.
//!
//! The transition engine and the batch evaluator both go through
//! [`locate`] and [`eligibility`], so the two can never disagree about a
//! participant.

use tracing::warn;

use accredit_core::error::{Ineligibility, WorkflowError};
use accredit_core::participant::Participant;
use accredit_core::traits::WorkflowStore;
use accredit_core::types::{Action, ParticipantId};

use crate::snapshot::{self, WorkflowSnapshot};
use crate::transition::{can_transition, Resolution};

/// A participant and the snapshot of the version it is pinned to.
#[derive(Debug, Clone)]
pub(crate) struct Position {
    pub participant: Participant,
    pub snapshot: WorkflowSnapshot,
}

#[derive(Debug)]
pub(crate) enum PositionError {
    /// The participant cannot take any action right now.
    Ineligible(Ineligibility),
    /// The store failed; not a statement about the participant.
    Failed(WorkflowError),
}

impl From<WorkflowError> for PositionError {
    fn from(e: WorkflowError) -> Self {
        Self::Failed(e)
    }
}

impl PositionError {
    /// Collapse into the error returned to a caller acting on `action`.
    pub fn into_error(self, participant: &ParticipantId, action: Action) -> WorkflowError {
        match self {
            Self::Ineligible(Ineligibility::ParticipantNotFound) => {
                WorkflowError::ParticipantNotFound(participant.to_string())
            }
            Self::Ineligible(reason) => WorkflowError::Ineligible {
                participant: participant.to_string(),
                action,
                reason,
            },
            Self::Failed(e) => e,
        }
    }
}

pub(crate) async fn locate(
    store: &dyn WorkflowStore,
    participant_id: &ParticipantId,
) -> Result<Position, PositionError> {
    let participant = store
        .load_participant(participant_id)
        .await?
        .ok_or(PositionError::Ineligible(Ineligibility::ParticipantNotFound))?;

    let version_id = participant
        .workflow_version_id
        .clone()
        .ok_or(PositionError::Ineligible(Ineligibility::NoVersion))?;
    let version = store
        .load_version(&version_id)
        .await?
        .ok_or(PositionError::Ineligible(Ineligibility::NoVersion))?;

    let snapshot = match snapshot::deserialize(&version.snapshot) {
        Ok(s) => s,
        Err(e) => {
            warn!(
                participant = %participant_id,
                version = %version_id,
                error = %e,
                "Pinned snapshot failed validation"
            );
            return Err(PositionError::Ineligible(Ineligibility::SnapshotInvalid));
        }
    };

    Ok(Position {
        participant,
        snapshot,
    })
}

/// Where `action` would take the participant, without touching anything.
///
/// A target fork whose branch set cannot be opened makes the action
/// ineligible here rather than failing half way through the commit.
pub(crate) fn eligibility(position: &Position, action: Action) -> Result<Resolution, Ineligibility> {
    let step_id = position
        .participant
        .current_step_id
        .as_ref()
        .ok_or(Ineligibility::NoCurrentStep)?;
    let resolution = can_transition(&position.snapshot, step_id, action)?;

    if let Resolution::Step(target) = &resolution {
        let broken_fork = position
            .snapshot
            .step(target)
            .and_then(|s| s.fork_config())
            .is_some_and(|config| config.validate().is_err());
        if broken_fork {
            return Err(Ineligibility::SnapshotInvalid);
        }
    }
    Ok(resolution)
}
