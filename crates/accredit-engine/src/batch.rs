use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use accredit_core::error::{Ineligibility, Result};
use accredit_core::traits::WorkflowStore;
use accredit_core::types::{Action, ParticipantId};

use crate::position::{self, PositionError};

/// A participant excluded from a bulk action, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IneligibleParticipant {
    pub id: ParticipantId,
    pub reason: Ineligibility,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchEligibility {
    pub eligible: Vec<ParticipantId>,
    pub ineligible: Vec<IneligibleParticipant>,
}

/// Read-only classification of participants for a bulk action.
///
/// Uses the same position lookup and resolution rule as
/// [`TransitionEngine::apply`](crate::TransitionEngine::apply), so a
/// participant is eligible exactly when applying the action would succeed
/// against the current state.
pub struct BatchEvaluator {
    store: Arc<dyn WorkflowStore>,
}

impl BatchEvaluator {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Classify each id, in input order. Store failures abort the batch.
    pub async fn evaluate_batch(
        &self,
        participant_ids: &[ParticipantId],
        action: Action,
    ) -> Result<BatchEligibility> {
        let mut result = BatchEligibility::default();

        for id in participant_ids {
            let verdict = match position::locate(self.store.as_ref(), id).await {
                Ok(pos) => position::eligibility(&pos, action).map(|_| ()),
                Err(PositionError::Ineligible(reason)) => Err(reason),
                Err(PositionError::Failed(e)) => return Err(e),
            };

            match verdict {
                Ok(()) => result.eligible.push(id.clone()),
                Err(reason) => result.ineligible.push(IneligibleParticipant {
                    id: id.clone(),
                    reason,
                }),
            }
        }

        debug!(
            action = %action,
            eligible = result.eligible.len(),
            ineligible = result.ineligible.len(),
            "Batch evaluated"
        );
        Ok(result)
    }

    /// Like [`evaluate_batch`](Self::evaluate_batch) for an action given by
    /// name; an unknown name makes every participant `unsupported-action`.
    pub async fn evaluate_named(
        &self,
        participant_ids: &[ParticipantId],
        action: &str,
    ) -> Result<BatchEligibility> {
        match action.parse::<Action>() {
            Ok(action) => self.evaluate_batch(participant_ids, action).await,
            Err(_) => Ok(BatchEligibility {
                eligible: Vec::new(),
                ineligible: participant_ids
                    .iter()
                    .map(|id| IneligibleParticipant {
                        id: id.clone(),
                        reason: Ineligibility::UnsupportedAction,
                    })
                    .collect(),
            }),
        }
    }
}
