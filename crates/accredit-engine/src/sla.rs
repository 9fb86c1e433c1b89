use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use accredit_core::clock::Clock;
use accredit_core::error::{Result, WorkflowError};
use accredit_core::event::EventBus;
use accredit_core::participant::{Participant, ParticipantStatus};
use accredit_core::traits::WorkflowStore;
use accredit_core::types::{Action, Actor, ParticipantId, StepId, VersionId, WorkflowEvent};
use accredit_core::workflow::SlaAction;

use crate::scheduler::ScanJob;
use crate::snapshot::{self, WorkflowSnapshot};
use crate::transition::{ExpectedPosition, TransitionEngine, TransitionOutcome};

/// Where a participant stands against its step's SLA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaStatus {
    WithinSla,
    /// Past the SLA but inside the breach grace window.
    Warning {
        overdue_minutes: i64,
        minutes_to_breach: i64,
    },
    Breach { overdue_minutes: i64 },
}

/// Classify time spent on a step.
///
/// The breach threshold is `sla_minutes + grace_minutes`.
pub fn classify(elapsed_minutes: i64, sla_minutes: u32, grace_minutes: u32) -> SlaStatus {
    let sla = i64::from(sla_minutes);
    let breach_at = sla + i64::from(grace_minutes);

    if elapsed_minutes < sla {
        SlaStatus::WithinSla
    } else if elapsed_minutes < breach_at {
        SlaStatus::Warning {
            overdue_minutes: elapsed_minutes - sla,
            minutes_to_breach: breach_at - elapsed_minutes,
        }
    } else {
        SlaStatus::Breach {
            overdue_minutes: elapsed_minutes - sla,
        }
    }
}

/// An automatic transition performed on breach.
#[derive(Debug, Clone, Serialize)]
pub struct SlaActionTaken {
    pub participant_id: ParticipantId,
    pub step_id: StepId,
    pub sla_action: SlaAction,
    pub to_step: Option<StepId>,
    pub status: ParticipantStatus,
}

/// Counters for one scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanSummary {
    pub checked: usize,
    pub warnings: usize,
    /// Breaches found, whether or not their automatic action succeeded.
    pub breached: usize,
    pub actions: Vec<SlaActionTaken>,
    /// Breached participants whose automatic action failed.
    pub action_failures: usize,
    /// Participants that moved between listing and acting; left untouched.
    pub skipped: usize,
    /// Participants whose check failed; they are in no other counter.
    pub failed: usize,
}

enum Checked {
    Within,
    Warned,
    Breached(Option<SlaActionTaken>),
    ActionFailed,
    Moved,
}

/// Finds participants that overstayed their step and acts on breaches.
pub struct SlaMonitor {
    store: Arc<dyn WorkflowStore>,
    engine: Arc<TransitionEngine>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    breach_grace_minutes: u32,
}

impl SlaMonitor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        engine: Arc<TransitionEngine>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        breach_grace_minutes: u32,
    ) -> Self {
        Self {
            store,
            engine,
            event_bus,
            clock,
            breach_grace_minutes,
        }
    }

    /// Scan every participant that sits on a step.
    ///
    /// A participant whose check fails is logged and counted in `failed`;
    /// the scan carries on with the rest. Only failing to list participants
    /// fails the scan as a whole.
    ///
    /// Breach actions only apply to the position the listing returned. A
    /// participant that moved in the meantime is counted in `skipped`.
    pub async fn check_overdue_slas(&self) -> Result<ScanSummary> {
        let participants = self.store.list_active_participants().await?;
        let now = self.clock.now();
        let mut snapshots: HashMap<VersionId, WorkflowSnapshot> = HashMap::new();
        let mut summary = ScanSummary::default();

        for participant in &participants {
            match self.check_participant(participant, now, &mut snapshots).await {
                Ok(Checked::Moved) => summary.skipped += 1,
                Ok(Checked::Within) => summary.checked += 1,
                Ok(Checked::Warned) => {
                    summary.checked += 1;
                    summary.warnings += 1;
                }
                Ok(Checked::Breached(action)) => {
                    summary.checked += 1;
                    summary.breached += 1;
                    summary.actions.extend(action);
                }
                Ok(Checked::ActionFailed) => {
                    summary.checked += 1;
                    summary.breached += 1;
                    summary.action_failures += 1;
                }
                Err(e) => {
                    error!(participant = %participant.id, error = %e, "SLA check failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            checked = summary.checked,
            warnings = summary.warnings,
            breached = summary.breached,
            actions = summary.actions.len(),
            action_failures = summary.action_failures,
            skipped = summary.skipped,
            failed = summary.failed,
            "SLA scan complete"
        );
        Ok(summary)
    }

    async fn check_participant(
        &self,
        participant: &Participant,
        now: DateTime<Utc>,
        snapshots: &mut HashMap<VersionId, WorkflowSnapshot>,
    ) -> Result<Checked> {
        let (Some(expected), Some(entered_at)) =
            (ExpectedPosition::of(participant), participant.step_entered_at)
        else {
            return Ok(Checked::Within);
        };
        let step_id = &expected.step_id;
        let version_id = participant
            .workflow_version_id
            .as_ref()
            .ok_or_else(|| WorkflowError::VersionNotFound(format!("participant {}", participant.id)))?;

        if !snapshots.contains_key(version_id) {
            let version = self
                .store
                .load_version(version_id)
                .await?
                .ok_or_else(|| WorkflowError::VersionNotFound(version_id.to_string()))?;
            snapshots.insert(version_id.clone(), snapshot::deserialize(&version.snapshot)?);
        }
        let step = snapshots
            .get(version_id)
            .and_then(|s| s.step(step_id))
            .ok_or_else(|| WorkflowError::StepNotFound {
                step: step_id.to_string(),
                version: version_id.to_string(),
            })?;

        let Some(sla_minutes) = step.sla_duration_minutes else {
            return Ok(Checked::Within);
        };
        let sla_action = step.sla_action;
        let elapsed = (now - entered_at).num_minutes();

        match classify(elapsed, sla_minutes, self.breach_grace_minutes) {
            SlaStatus::WithinSla => Ok(Checked::Within),
            SlaStatus::Warning {
                overdue_minutes,
                minutes_to_breach,
            } => {
                debug!(participant = %participant.id, step = %step_id, overdue_minutes, "SLA warning");
                self.event_bus.publish(WorkflowEvent::SlaWarning {
                    participant_id: participant.id.clone(),
                    step_id: step_id.clone(),
                    overdue_minutes,
                    minutes_to_breach,
                });
                Ok(Checked::Warned)
            }
            SlaStatus::Breach { overdue_minutes } => {
                let remarks = Some(format!("SLA breached by {} minutes", overdue_minutes));
                let checked = match self
                    .act_on_breach(&participant.id, &expected, sla_action, remarks)
                    .await
                {
                    Ok(transition) => Checked::Breached(transition.map(|t| SlaActionTaken {
                        participant_id: participant.id.clone(),
                        step_id: step_id.clone(),
                        sla_action,
                        to_step: t.to_step,
                        status: t.status,
                    })),
                    Err(WorkflowError::Conflict(reason)) => {
                        info!(
                            participant = %participant.id,
                            step = %step_id,
                            %reason,
                            "Participant moved during SLA scan, skipped"
                        );
                        return Ok(Checked::Moved);
                    }
                    Err(e) => {
                        error!(
                            participant = %participant.id,
                            step = %step_id,
                            action = ?sla_action,
                            error = %e,
                            "SLA breach action failed"
                        );
                        Checked::ActionFailed
                    }
                };

                warn!(
                    participant = %participant.id,
                    step = %step_id,
                    overdue_minutes,
                    action = ?sla_action,
                    "SLA breached"
                );
                self.event_bus.publish(WorkflowEvent::SlaBreach {
                    participant_id: participant.id.clone(),
                    step_id: step_id.clone(),
                    overdue_minutes,
                    sla_action,
                });
                Ok(checked)
            }
        }
    }

    /// Perform the step's breach action against the position the scan read.
    async fn act_on_breach(
        &self,
        participant_id: &ParticipantId,
        expected: &ExpectedPosition,
        sla_action: SlaAction,
        remarks: Option<String>,
    ) -> Result<Option<TransitionOutcome>> {
        let engine = &self.engine;
        let outcome = match sla_action {
            SlaAction::Notify => return Ok(None),
            SlaAction::Escalate => {
                engine
                    .escalate_at(participant_id, expected, Actor::System, remarks)
                    .await?
            }
            SlaAction::AutoApprove => {
                engine
                    .apply_at(participant_id, expected, Action::Approve, remarks, Actor::System)
                    .await?
            }
            SlaAction::AutoReject => {
                engine
                    .apply_at(participant_id, expected, Action::Reject, remarks, Actor::System)
                    .await?
            }
        };
        Ok(Some(outcome))
    }
}

impl ScanJob for SlaMonitor {
    fn name(&self) -> &str {
        "sla-monitor"
    }

    fn run(&self) -> BoxFuture<'_, Result<ScanSummary>> {
        Box::pin(self.check_overdue_slas())
    }
}
