use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use accredit_core::clock::Clock;
use accredit_core::error::{Result, WorkflowError};
use accredit_core::participant::{AuditKind, Participant};
use accredit_core::traits::WorkflowStore;
use accredit_core::types::{Actor, ForkInstanceId, ParticipantId, StepId, VersionId, WorkflowId};
use accredit_core::workflow::WorkflowStatus;

use crate::snapshot::WorkflowSnapshot;
use crate::transition::{CommitRequest, Resolution, TransitionEngine};

/// Where a participant landed after entering a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub participant: Participant,
    pub version_id: VersionId,
    pub version: u32,
    pub entry_step: StepId,
    /// Set when the entry step is a fork.
    pub fork_instance: Option<ForkInstanceId>,
}

/// Pins participants to the current version of a workflow and places them
/// on its entry step.
pub struct EntryResolver {
    store: Arc<dyn WorkflowStore>,
    engine: Arc<TransitionEngine>,
    clock: Arc<dyn Clock>,
}

impl EntryResolver {
    pub fn new(store: Arc<dyn WorkflowStore>, engine: Arc<TransitionEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { store, engine, clock }
    }

    /// Enter `participant_id` into `workflow_id`.
    ///
    /// Everything that can fail on the workflow's shape is checked before
    /// the first write, so a workflow without an entry point leaves both the
    /// participant and the version table untouched. Re-entry is not refused:
    /// it overwrites the previous position.
    pub async fn enter(
        &self,
        participant_id: &ParticipantId,
        workflow_id: &WorkflowId,
        actor: Actor,
    ) -> Result<EntryOutcome> {
        let workflow = self
            .store
            .load_workflow(workflow_id)
            .await?
            .filter(|w| w.status != WorkflowStatus::Archived)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;

        let snapshot = WorkflowSnapshot::from_workflow(&workflow);
        snapshot.validate()?;
        let entry_step = snapshot.entry_step()?.id.clone();
        let json = snapshot.to_json()?;
        let fingerprint = snapshot.fingerprint()?;

        let participant = self
            .store
            .load_participant(participant_id)
            .await?
            .ok_or_else(|| WorkflowError::ParticipantNotFound(participant_id.to_string()))?;

        let version = self
            .store
            .load_or_create_version(workflow_id, json, fingerprint, self.clock.now())
            .await?;

        if let Some(previous) = &participant.current_step_id {
            warn!(
                participant = %participant_id,
                workflow = %workflow_id,
                previous_step = %previous,
                "Participant re-entering a workflow, previous position is overwritten"
            );
        }

        let transition = self
            .engine
            .commit(CommitRequest {
                participant: &participant,
                snapshot: &snapshot,
                version_id: version.id.clone(),
                resolution: Resolution::Step(entry_step.clone()),
                kind: AuditKind::Entry,
                action: None,
                actor,
                remarks: None,
                close_fork: None,
            })
            .await?;

        info!(
            participant = %participant_id,
            workflow = %workflow_id,
            version = version.version,
            step = %entry_step,
            "Participant entered workflow"
        );

        Ok(EntryOutcome {
            participant: transition.participant,
            version_id: version.id,
            version: version.version,
            entry_step,
            fork_instance: transition.fork_instance,
        })
    }
}
