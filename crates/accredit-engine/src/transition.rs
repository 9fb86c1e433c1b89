use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use accredit_core::clock::Clock;
use accredit_core::error::{Ineligibility, Result, WorkflowError};
use accredit_core::event::EventBus;
use accredit_core::participant::{
    AuditKind, AuditRecord, ForkClose, Participant, ParticipantStatus, PositionUpdate,
};
use accredit_core::traits::WorkflowStore;
use accredit_core::types::{Action, Actor, ForkInstanceId, ParticipantId, StepId, VersionId, WorkflowEvent};
use accredit_core::workflow::{Step, StepKind};

use crate::audit::record_audit;
use crate::fork;
use crate::position::{self, Position, PositionError};
use crate::snapshot::WorkflowSnapshot;

/// Where an action leads from a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    /// Move onto another step of the same snapshot.
    Step(StepId),
    /// Leave the workflow with a final status.
    Complete(ParticipantStatus),
}

/// Resolve `action` from `step_id` without side effects.
///
/// This is the single rule behind both [`TransitionEngine::apply`] and the
/// batch evaluator.
pub fn can_transition(
    snapshot: &WorkflowSnapshot,
    step_id: &StepId,
    action: Action,
) -> std::result::Result<Resolution, Ineligibility> {
    let step = snapshot
        .step(step_id)
        .ok_or(Ineligibility::StepNotInSnapshot)?;
    if action == Action::Escalate {
        return Err(Ineligibility::UnsupportedAction);
    }
    if step.fork_config().is_some() {
        return Err(Ineligibility::ForkInProgress);
    }
    resolve_target(snapshot, step, action)
}

/// Follow `step`'s target for `action`. Forks are not special-cased here:
/// the join uses the fork step's own targets.
pub(crate) fn resolve_target(
    snapshot: &WorkflowSnapshot,
    step: &Step,
    action: Action,
) -> std::result::Result<Resolution, Ineligibility> {
    match step.target_for(action) {
        Some(target) => {
            let target_step = snapshot
                .step(target)
                .ok_or(Ineligibility::StepNotInSnapshot)?;
            Ok(land_on(target_step))
        }
        None if action == Action::Approve && step.is_final() => Ok(match step.kind {
            StepKind::Terminal { outcome } => Resolution::Complete(outcome.into()),
            _ => Resolution::Complete(ParticipantStatus::Approved),
        }),
        None => Err(Ineligibility::NoTargetForAction),
    }
}

/// Terminal steps complete the participant instead of holding it.
fn land_on(step: &Step) -> Resolution {
    match step.kind {
        StepKind::Terminal { outcome } => Resolution::Complete(outcome.into()),
        _ => Resolution::Step(step.id.clone()),
    }
}

/// Result of a committed position change.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub participant: Participant,
    pub from_step: Option<StepId>,
    pub to_step: Option<StepId>,
    pub status: ParticipantStatus,
    /// Fork instance opened by landing on a fork step.
    pub fork_instance: Option<ForkInstanceId>,
}

/// Everything [`TransitionEngine::commit`] needs to write one position change.
pub(crate) struct CommitRequest<'a> {
    pub participant: &'a Participant,
    pub snapshot: &'a WorkflowSnapshot,
    pub version_id: VersionId,
    pub resolution: Resolution,
    pub kind: AuditKind,
    /// `None` for entry.
    pub action: Option<Action>,
    pub actor: Actor,
    pub remarks: Option<String>,
    pub close_fork: Option<ForkClose>,
}

/// A position read earlier by the caller. Guarded calls act only if the
/// participant is still on `step_id` at `revision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedPosition {
    pub step_id: StepId,
    pub revision: u64,
}

impl ExpectedPosition {
    /// The position `participant` was read at, if it sits on a step.
    pub fn of(participant: &Participant) -> Option<Self> {
        participant.current_step_id.clone().map(|step_id| Self {
            step_id,
            revision: participant.revision,
        })
    }
}

/// Applies approve/reject/bypass to participants and commits every
/// position change made by the engine.
pub struct TransitionEngine {
    store: Arc<dyn WorkflowStore>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl TransitionEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, event_bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            event_bus,
            clock,
        }
    }

    /// Apply a user action to the participant's current step.
    pub async fn apply(
        &self,
        participant_id: &ParticipantId,
        action: Action,
        remarks: Option<String>,
        actor: Actor,
    ) -> Result<TransitionOutcome> {
        self.apply_guarded(participant_id, None, action, remarks, actor)
            .await
    }

    /// Like [`apply`](Self::apply), but only while the participant is still
    /// where `expected` says. Any move since then gives `Conflict`.
    pub async fn apply_at(
        &self,
        participant_id: &ParticipantId,
        expected: &ExpectedPosition,
        action: Action,
        remarks: Option<String>,
        actor: Actor,
    ) -> Result<TransitionOutcome> {
        self.apply_guarded(participant_id, Some(expected), action, remarks, actor)
            .await
    }

    async fn apply_guarded(
        &self,
        participant_id: &ParticipantId,
        expected: Option<&ExpectedPosition>,
        action: Action,
        remarks: Option<String>,
        actor: Actor,
    ) -> Result<TransitionOutcome> {
        let position = position::locate(self.store.as_ref(), participant_id)
            .await
            .map_err(|e| e.into_error(participant_id, action))?;
        check_expected(&position.participant, expected)?;
        let resolution = position::eligibility(&position, action)
            .map_err(|reason| PositionError::Ineligible(reason).into_error(participant_id, action))?;

        self.commit(CommitRequest {
            participant: &position.participant,
            snapshot: &position.snapshot,
            version_id: pinned_version(&position)?,
            resolution,
            kind: AuditKind::Transition,
            action: Some(action),
            actor,
            remarks,
            close_fork: None,
        })
        .await
    }

    /// Move the participant to its current step's escalation target,
    /// bypassing approve/reject resolution. Leaving a fork this way closes
    /// the open instance without an outcome.
    pub async fn escalate(
        &self,
        participant_id: &ParticipantId,
        actor: Actor,
        remarks: Option<String>,
    ) -> Result<TransitionOutcome> {
        self.escalate_guarded(participant_id, None, actor, remarks)
            .await
    }

    /// Escalate only while the participant is still where `expected` says.
    pub async fn escalate_at(
        &self,
        participant_id: &ParticipantId,
        expected: &ExpectedPosition,
        actor: Actor,
        remarks: Option<String>,
    ) -> Result<TransitionOutcome> {
        self.escalate_guarded(participant_id, Some(expected), actor, remarks)
            .await
    }

    async fn escalate_guarded(
        &self,
        participant_id: &ParticipantId,
        expected: Option<&ExpectedPosition>,
        actor: Actor,
        remarks: Option<String>,
    ) -> Result<TransitionOutcome> {
        let ineligible = |reason: Ineligibility| {
            PositionError::Ineligible(reason).into_error(participant_id, Action::Escalate)
        };

        let position = position::locate(self.store.as_ref(), participant_id)
            .await
            .map_err(|e| e.into_error(participant_id, Action::Escalate))?;
        check_expected(&position.participant, expected)?;
        let step_id = position
            .participant
            .current_step_id
            .clone()
            .ok_or_else(|| ineligible(Ineligibility::NoCurrentStep))?;
        let step = position
            .snapshot
            .step(&step_id)
            .ok_or_else(|| ineligible(Ineligibility::StepNotInSnapshot))?;
        let resolution =
            resolve_target(&position.snapshot, step, Action::Escalate).map_err(ineligible)?;

        let close_fork = if step.fork_config().is_some() {
            self.store
                .open_fork_instance(participant_id, &step_id)
                .await?
                .map(|instance| ForkClose {
                    instance_id: instance.id,
                    outcome: None,
                })
        } else {
            None
        };

        self.commit(CommitRequest {
            participant: &position.participant,
            snapshot: &position.snapshot,
            version_id: pinned_version(&position)?,
            resolution,
            kind: AuditKind::Escalation,
            action: Some(Action::Escalate),
            actor,
            remarks,
            close_fork,
        })
        .await
    }

    /// Leave a fork with the aggregated branch action, through the fork
    /// step's own targets. The store refuses the write if the instance has
    /// already been closed.
    pub(crate) async fn complete_join(
        &self,
        position: &Position,
        fork_step: &Step,
        instance_id: &ForkInstanceId,
        action: Action,
    ) -> Result<TransitionOutcome> {
        let resolution = resolve_target(&position.snapshot, fork_step, action).map_err(|reason| {
            WorkflowError::Ineligible {
                participant: position.participant.id.to_string(),
                action,
                reason,
            }
        })?;

        self.commit(CommitRequest {
            participant: &position.participant,
            snapshot: &position.snapshot,
            version_id: pinned_version(position)?,
            resolution,
            kind: AuditKind::Join,
            action: Some(action),
            actor: Actor::System,
            remarks: None,
            close_fork: Some(ForkClose {
                instance_id: instance_id.clone(),
                outcome: Some(action),
            }),
        })
        .await
    }

    /// Write a position change, spawning branch states when the new step is
    /// a fork, then audit and publish.
    pub(crate) async fn commit(&self, req: CommitRequest<'_>) -> Result<TransitionOutcome> {
        let now = self.clock.now();
        let participant_id = req.participant.id.clone();
        let from_step = req.participant.current_step_id.clone();

        let (to_step, status) = match &req.resolution {
            Resolution::Step(id) => (Some(id.clone()), ParticipantStatus::Pending),
            Resolution::Complete(status) => (None, *status),
        };

        let open_fork = match to_step.as_ref().and_then(|id| req.snapshot.step(id)) {
            Some(step) if step.fork_config().is_some() => {
                Some(fork::plan_opening(&participant_id, step, now)?)
            }
            _ => None,
        };
        let opened = open_fork
            .as_ref()
            .map(|o| (o.instance.id.clone(), o.instance.fork_step_id.clone(), o.branches.len()));

        let participant = self
            .store
            .save_position(PositionUpdate {
                participant_id: participant_id.clone(),
                expected_revision: req.participant.revision,
                workflow_version_id: Some(req.version_id.clone()),
                current_step_id: to_step.clone(),
                step_entered_at: now,
                status,
                close_fork: req.close_fork,
                open_fork,
            })
            .await?;

        info!(
            participant = %participant_id,
            kind = req.kind.as_str(),
            action = ?req.action,
            actor = %req.actor,
            from = ?from_step,
            to = ?to_step,
            status = status.as_str(),
            "Position committed"
        );

        record_audit(
            self.store.as_ref(),
            AuditRecord {
                participant_id: participant_id.clone(),
                kind: req.kind,
                actor: req.actor.clone(),
                action: req.action,
                remarks: req.remarks,
                from_step: from_step.clone(),
                to_step: to_step.clone(),
                at: now,
            },
        )
        .await;

        match (req.action, &to_step) {
            (Some(action), _) => self.event_bus.publish(WorkflowEvent::Transitioned {
                participant_id: participant_id.clone(),
                action,
                actor: req.actor,
                from_step: from_step.clone(),
                to_step: to_step.clone(),
                status,
                at: now,
            }),
            (None, Some(step_id)) => self.event_bus.publish(WorkflowEvent::Entered {
                participant_id: participant_id.clone(),
                version_id: req.version_id,
                step_id: step_id.clone(),
                at: now,
            }),
            (None, None) => {}
        }

        let fork_instance = opened.map(|(instance_id, fork_step_id, branches)| {
            self.event_bus.publish(WorkflowEvent::ForkOpened {
                participant_id: participant_id.clone(),
                instance_id: instance_id.clone(),
                fork_step_id,
                branches,
            });
            instance_id
        });

        Ok(TransitionOutcome {
            participant,
            from_step,
            to_step,
            status,
            fork_instance,
        })
    }
}

// The commit writes with the revision checked here, so a move that lands
// after this check still fails in the store.
fn check_expected(participant: &Participant, expected: Option<&ExpectedPosition>) -> Result<()> {
    match expected {
        Some(expected)
            if participant.revision != expected.revision
                || participant.current_step_id.as_ref() != Some(&expected.step_id) =>
        {
            Err(WorkflowError::Conflict(format!(
                "participant {} left step {} (revision {} -> {})",
                participant.id, expected.step_id, expected.revision, participant.revision
            )))
        }
        _ => Ok(()),
    }
}

fn pinned_version(position: &Position) -> Result<VersionId> {
    position.participant.workflow_version_id.clone().ok_or_else(|| {
        WorkflowError::VersionNotFound(format!("participant {}", position.participant.id))
    })
}
