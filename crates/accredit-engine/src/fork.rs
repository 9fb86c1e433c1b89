//! Parallel fork/join coordination.
//!
//! A fork step spawns one [`ParallelBranchState`] per declared branch inside
//! a [`ForkInstance`]. Branches are resolved independently; after each
//! resolution the join policy is re-evaluated, and when it fires the
//! participant leaves the fork through the fork step's own targets. The
//! instance's `joined_at` marker is claimed in the same store transaction as
//! that position change, so the downstream transition happens once no
//! matter how many evaluations race.
//!
//! `All` is the reference policy. `Any` and `Quorum` are extension points
//! whose tie-breaks are fixed here: the earliest resolution decides `Any`
//! (reject wins a tie), and `Quorum` rejects once every branch has resolved
//! without either action reaching the quorum.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use accredit_core::clock::Clock;
use accredit_core::error::{Result, WorkflowError};
use accredit_core::event::EventBus;
use accredit_core::participant::{
    AuditKind, AuditRecord, BranchStatus, ForkInstance, ForkOpening, ParallelBranchState,
};
use accredit_core::traits::WorkflowStore;
use accredit_core::types::{
    Action, Actor, BranchStateId, ForkInstanceId, ParticipantId, StepId, WorkflowEvent,
};
use accredit_core::workflow::{JoinPolicy, Step};
use accredit_core::Ineligibility;

use crate::audit::record_audit;
use crate::position::{self, PositionError};
use crate::transition::{TransitionEngine, TransitionOutcome};

/// Attempts at a join whose position write lost a revision race.
const MAX_JOIN_ATTEMPTS: usize = 3;

/// What the join policy says about the current branch states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Wait { resolved: usize, total: usize },
    Fire(Action),
}

/// Result of one join evaluation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JoinOutcome {
    /// The policy is not satisfied yet.
    Pending { resolved: usize, total: usize },
    /// This evaluation fired the join.
    Joined {
        action: Action,
        transition: TransitionOutcome,
    },
    /// Another evaluation already fired it.
    AlreadyJoined,
    /// The participant is no longer inside this fork instance.
    Stale,
}

impl JoinOutcome {
    pub fn fired(&self) -> bool {
        matches!(self, Self::Joined { .. })
    }
}

/// A resolved branch and the join evaluation that followed it.
#[derive(Debug, Clone, Serialize)]
pub struct BranchResolution {
    pub branch: ParallelBranchState,
    pub join: JoinOutcome,
}

/// Apply a join policy to the branch states of one fork instance.
pub fn decide_join(policy: JoinPolicy, branches: &[ParallelBranchState]) -> JoinDecision {
    let total = branches.len();
    let approved = count(branches, BranchStatus::Approved);
    let rejected = count(branches, BranchStatus::Rejected);
    let pending = count(branches, BranchStatus::Pending);
    let wait = JoinDecision::Wait {
        resolved: approved + rejected,
        total,
    };

    if total == 0 {
        return wait;
    }

    match policy {
        JoinPolicy::All => {
            if pending > 0 {
                wait
            } else if rejected > 0 {
                JoinDecision::Fire(Action::Reject)
            } else {
                JoinDecision::Fire(Action::Approve)
            }
        }
        JoinPolicy::Any => branches
            .iter()
            .filter(|b| matches!(b.status, BranchStatus::Approved | BranchStatus::Rejected))
            .min_by_key(|b| (b.completed_at, b.status != BranchStatus::Rejected))
            .map(|b| match b.status {
                BranchStatus::Rejected => JoinDecision::Fire(Action::Reject),
                _ => JoinDecision::Fire(Action::Approve),
            })
            .unwrap_or(wait),
        JoinPolicy::Quorum { required } => {
            if rejected >= required {
                JoinDecision::Fire(Action::Reject)
            } else if approved >= required {
                JoinDecision::Fire(Action::Approve)
            } else if pending == 0 {
                JoinDecision::Fire(Action::Reject)
            } else {
                wait
            }
        }
    }
}

fn count(branches: &[ParallelBranchState], status: BranchStatus) -> usize {
    branches.iter().filter(|b| b.status == status).count()
}

/// Build the instance and pending branch rows for entering `step`.
pub(crate) fn plan_opening(
    participant_id: &ParticipantId,
    step: &Step,
    now: DateTime<Utc>,
) -> Result<ForkOpening> {
    let config = step
        .fork_config()
        .ok_or_else(|| WorkflowError::InvalidForkConfig {
            step: step.id.to_string(),
            message: format!("step is a {} step, not a fork", step.kind.name()),
        })?;
    config
        .validate()
        .map_err(|message| WorkflowError::InvalidForkConfig {
            step: step.id.to_string(),
            message,
        })?;

    let instance = ForkInstance {
        id: ForkInstanceId::new(),
        participant_id: participant_id.clone(),
        fork_step_id: step.id.clone(),
        opened_at: now,
        joined_at: None,
        outcome: None,
    };
    let branches = config
        .branches
        .iter()
        .map(|branch| ParallelBranchState {
            id: BranchStateId::new(),
            participant_id: participant_id.clone(),
            fork_instance_id: instance.id.clone(),
            fork_step_id: step.id.clone(),
            branch_step_id: branch.branch_step_id.clone(),
            label: branch.label.clone(),
            status: BranchStatus::Pending,
            completed_at: None,
            completed_by: None,
            action: None,
            remarks: None,
            revision: 0,
        })
        .collect();

    Ok(ForkOpening { instance, branches })
}

/// Spawns branch states, records branch resolutions, and fires joins.
pub struct ForkCoordinator {
    store: Arc<dyn WorkflowStore>,
    engine: Arc<TransitionEngine>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl ForkCoordinator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        engine: Arc<TransitionEngine>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            engine,
            event_bus,
            clock,
        }
    }

    /// Make sure the participant's fork step has an open instance.
    ///
    /// Landing on a fork already spawns its branches, so this only creates
    /// rows when none are open, e.g. for participants positioned on a fork
    /// by an older writer.
    pub async fn enter_fork(
        &self,
        participant_id: &ParticipantId,
        fork_step_id: &StepId,
    ) -> Result<ForkInstance> {
        let position = position::locate(self.store.as_ref(), participant_id)
            .await
            .map_err(|e| e.into_error(participant_id, Action::Approve))?;
        if position.participant.current_step_id.as_ref() != Some(fork_step_id) {
            return Err(WorkflowError::Conflict(format!(
                "participant {} is not on fork {}",
                participant_id, fork_step_id
            )));
        }

        if let Some(open) = self
            .store
            .open_fork_instance(participant_id, fork_step_id)
            .await?
        {
            debug!(participant = %participant_id, instance = %open.id, "Fork already open");
            return Ok(open);
        }

        let step = position
            .snapshot
            .step(fork_step_id)
            .ok_or_else(|| WorkflowError::StepNotFound {
                step: fork_step_id.to_string(),
                version: position.snapshot.workflow_id.to_string(),
            })?;
        let opening = plan_opening(participant_id, step, self.clock.now())?;
        let instance = opening.instance.clone();
        let branches = opening.branches.len();
        self.store.create_branch_states(opening).await?;

        info!(participant = %participant_id, fork = %fork_step_id, branches, "Fork opened");
        self.event_bus.publish(WorkflowEvent::ForkOpened {
            participant_id: participant_id.clone(),
            instance_id: instance.id.clone(),
            fork_step_id: fork_step_id.clone(),
            branches,
        });
        Ok(instance)
    }

    /// Approve or reject one branch, then evaluate the join of its fork.
    ///
    /// The branch update commits on its own. If the join evaluation fails
    /// afterwards, `evaluate_join` can be called again safely.
    pub async fn resolve_branch(
        &self,
        branch_id: &BranchStateId,
        action: Action,
        remarks: Option<String>,
        actor: Actor,
    ) -> Result<BranchResolution> {
        let branch = self
            .store
            .load_branch_state(branch_id)
            .await?
            .ok_or_else(|| WorkflowError::BranchNotFound(branch_id.to_string()))?;

        let status = BranchStatus::from_action(action).ok_or_else(|| WorkflowError::Ineligible {
            participant: branch.participant_id.to_string(),
            action,
            reason: Ineligibility::UnsupportedAction,
        })?;
        if !branch.is_open() {
            return Err(WorkflowError::BranchClosed(branch_id.to_string()));
        }

        let now = self.clock.now();
        let expected = branch.revision;
        let updated = ParallelBranchState {
            status,
            completed_at: Some(now),
            completed_by: Some(actor.clone()),
            action: Some(action),
            remarks: remarks.clone(),
            ..branch
        };
        let saved = self.store.update_branch_state(&updated, expected).await?;

        info!(
            participant = %saved.participant_id,
            branch = %saved.id,
            step = %saved.branch_step_id,
            action = %action,
            actor = %actor,
            "Branch resolved"
        );

        record_audit(
            self.store.as_ref(),
            AuditRecord {
                participant_id: saved.participant_id.clone(),
                kind: AuditKind::BranchResolution,
                actor: actor.clone(),
                action: Some(action),
                remarks,
                from_step: Some(saved.branch_step_id.clone()),
                to_step: None,
                at: now,
            },
        )
        .await;

        self.event_bus.publish(WorkflowEvent::BranchResolved {
            participant_id: saved.participant_id.clone(),
            branch_state_id: saved.id.clone(),
            branch_step_id: saved.branch_step_id.clone(),
            action,
            actor,
        });

        let join = self
            .evaluate_instance(&saved.participant_id, &saved.fork_instance_id)
            .await?;
        Ok(BranchResolution {
            branch: saved,
            join,
        })
    }

    /// Re-read the branches of the participant's open instance of
    /// `fork_step_id` and fire the join if its policy is satisfied.
    /// Idempotent: once joined, further calls are no-ops.
    pub async fn evaluate_join(
        &self,
        participant_id: &ParticipantId,
        fork_step_id: &StepId,
    ) -> Result<JoinOutcome> {
        match self
            .store
            .open_fork_instance(participant_id, fork_step_id)
            .await?
        {
            Some(instance) => self.evaluate_instance(participant_id, &instance.id).await,
            None => Ok(JoinOutcome::AlreadyJoined),
        }
    }

    /// Branch states of the fork the participant currently sits on.
    pub async fn open_branches(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<Vec<ParallelBranchState>> {
        let participant = self
            .store
            .load_participant(participant_id)
            .await?
            .ok_or_else(|| WorkflowError::ParticipantNotFound(participant_id.to_string()))?;
        let Some(step_id) = participant.current_step_id else {
            return Ok(Vec::new());
        };

        match self.store.open_fork_instance(participant_id, &step_id).await? {
            Some(instance) => self.store.list_branch_states(&instance.id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn evaluate_instance(
        &self,
        participant_id: &ParticipantId,
        instance_id: &ForkInstanceId,
    ) -> Result<JoinOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let instance = self
                .store
                .load_fork_instance(instance_id)
                .await?
                .ok_or_else(|| WorkflowError::ForkNotFound(instance_id.to_string()))?;
            if instance.is_closed() {
                return Ok(JoinOutcome::AlreadyJoined);
            }

            let position = match position::locate(self.store.as_ref(), participant_id).await {
                Ok(p) => p,
                Err(PositionError::Failed(e)) => return Err(e),
                Err(PositionError::Ineligible(reason)) => {
                    warn!(participant = %participant_id, instance = %instance_id, reason = %reason, "Join skipped");
                    return Ok(JoinOutcome::Stale);
                }
            };
            if position.participant.current_step_id.as_ref() != Some(&instance.fork_step_id) {
                debug!(participant = %participant_id, instance = %instance_id, "Participant left the fork");
                return Ok(JoinOutcome::Stale);
            }
            let newest = self
                .store
                .open_fork_instance(participant_id, &instance.fork_step_id)
                .await?;
            if newest.map(|i| i.id).as_ref() != Some(instance_id) {
                debug!(participant = %participant_id, instance = %instance_id, "Fork instance superseded");
                return Ok(JoinOutcome::Stale);
            }

            let fork_step = position
                .snapshot
                .step(&instance.fork_step_id)
                .ok_or_else(|| WorkflowError::StepNotFound {
                    step: instance.fork_step_id.to_string(),
                    version: position.snapshot.workflow_id.to_string(),
                })?;
            let policy = fork_step
                .fork_config()
                .map(|c| c.join_policy)
                .ok_or_else(|| WorkflowError::InvalidForkConfig {
                    step: fork_step.id.to_string(),
                    message: "step is no longer a fork".to_string(),
                })?;

            let branches = self.store.list_branch_states(instance_id).await?;
            let action = match decide_join(policy, &branches) {
                JoinDecision::Wait { resolved, total } => {
                    debug!(participant = %participant_id, resolved, total, "Join waiting");
                    return Ok(JoinOutcome::Pending { resolved, total });
                }
                JoinDecision::Fire(action) => action,
            };

            match self
                .engine
                .complete_join(&position, fork_step, instance_id, action)
                .await
            {
                Ok(transition) => {
                    info!(
                        participant = %participant_id,
                        fork = %instance.fork_step_id,
                        action = %action,
                        "Fork joined"
                    );
                    self.event_bus.publish(WorkflowEvent::ForkJoined {
                        participant_id: participant_id.clone(),
                        instance_id: instance_id.clone(),
                        fork_step_id: instance.fork_step_id.clone(),
                        action,
                    });
                    return Ok(JoinOutcome::Joined { action, transition });
                }
                Err(WorkflowError::ForkAlreadyJoined(_)) => return Ok(JoinOutcome::AlreadyJoined),
                Err(e) if e.is_retryable() && attempt < MAX_JOIN_ATTEMPTS => {
                    debug!(participant = %participant_id, attempt, "Join lost a revision race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accredit_core::workflow::{ForkConfig, TerminalOutcome};
    use chrono::Duration;

    fn branches(statuses: &[BranchStatus]) -> Vec<ParallelBranchState> {
        let base = Utc::now();
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| ParallelBranchState {
                id: BranchStateId::from(format!("b{}", i).as_str()),
                participant_id: ParticipantId::from("p1"),
                fork_instance_id: ForkInstanceId::from("fi"),
                fork_step_id: StepId::from("fork"),
                branch_step_id: StepId::from(format!("s{}", i).as_str()),
                label: String::new(),
                status: *status,
                completed_at: (*status != BranchStatus::Pending)
                    .then(|| base + Duration::minutes(i as i64)),
                completed_by: None,
                action: None,
                remarks: None,
                revision: 0,
            })
            .collect()
    }

    use BranchStatus::{Approved, Pending, Rejected};

    #[test]
    fn test_all_waits_for_every_branch() {
        let decision = decide_join(JoinPolicy::All, &branches(&[Approved, Approved, Pending]));
        assert_eq!(decision, JoinDecision::Wait { resolved: 2, total: 3 });
    }

    #[test]
    fn test_all_is_reject_dominant() {
        assert_eq!(
            decide_join(JoinPolicy::All, &branches(&[Approved, Approved, Rejected])),
            JoinDecision::Fire(Action::Reject)
        );
        assert_eq!(
            decide_join(JoinPolicy::All, &branches(&[Approved, Approved, Approved])),
            JoinDecision::Fire(Action::Approve)
        );
    }

    #[test]
    fn test_any_takes_first_resolution() {
        let mut set = branches(&[Pending, Approved, Rejected]);
        assert_eq!(
            decide_join(JoinPolicy::Any, &set),
            JoinDecision::Fire(Action::Approve)
        );

        // Same instant: reject wins.
        set[2].completed_at = set[1].completed_at;
        assert_eq!(
            decide_join(JoinPolicy::Any, &set),
            JoinDecision::Fire(Action::Reject)
        );

        assert_eq!(
            decide_join(JoinPolicy::Any, &branches(&[Pending, Pending])),
            JoinDecision::Wait { resolved: 0, total: 2 }
        );
    }

    #[test]
    fn test_quorum() {
        let policy = JoinPolicy::Quorum { required: 2 };
        assert_eq!(
            decide_join(policy, &branches(&[Approved, Pending, Pending])),
            JoinDecision::Wait { resolved: 1, total: 3 }
        );
        assert_eq!(
            decide_join(policy, &branches(&[Approved, Approved, Pending])),
            JoinDecision::Fire(Action::Approve)
        );
        assert_eq!(
            decide_join(policy, &branches(&[Rejected, Approved, Rejected])),
            JoinDecision::Fire(Action::Reject)
        );
    }

    #[test]
    fn test_quorum_unreached_rejects() {
        let policy = JoinPolicy::Quorum { required: 3 };
        assert_eq!(
            decide_join(policy, &branches(&[Approved, Approved, Rejected])),
            JoinDecision::Fire(Action::Reject)
        );
    }

    #[test]
    fn test_empty_branch_set_never_fires() {
        assert_eq!(
            decide_join(JoinPolicy::All, &[]),
            JoinDecision::Wait { resolved: 0, total: 0 }
        );
    }

    #[test]
    fn test_plan_opening_spawns_pending_branches() {
        let step = Step::fork(
            "checks",
            ForkConfig::new(JoinPolicy::All)
                .with_branch("security", "Security")
                .with_branch("press", "Press"),
        );
        let opening = plan_opening(&ParticipantId::from("p1"), &step, Utc::now()).unwrap();

        assert_eq!(opening.branches.len(), 2);
        assert!(opening.branches.iter().all(|b| b.is_open()));
        assert!(opening
            .branches
            .iter()
            .all(|b| b.fork_instance_id == opening.instance.id));
        assert_eq!(opening.branches[0].label, "Security");
        assert!(!opening.instance.is_closed());
    }

    #[test]
    fn test_plan_opening_rejects_bad_config() {
        let empty = Step::fork("f", ForkConfig::new(JoinPolicy::All));
        let err = plan_opening(&ParticipantId::from("p1"), &empty, Utc::now()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidForkConfig { .. }));
        assert_eq!(err.status(), 400);

        let quorum = Step::fork(
            "f",
            ForkConfig::new(JoinPolicy::Quorum { required: 0 }).with_branch("a", ""),
        );
        assert!(plan_opening(&ParticipantId::from("p1"), &quorum, Utc::now()).is_err());

        let not_fork = Step::terminal("t", TerminalOutcome::Approved);
        assert!(plan_opening(&ParticipantId::from("p1"), &not_fork, Utc::now()).is_err());
    }
}
