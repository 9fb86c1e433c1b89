use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::participant::*;
use crate::types::*;
use crate::workflow::{Workflow, WorkflowVersion};

/// Durable store consumed by the engine.
///
/// Every method is atomic per record. Implementations signal lost updates
/// with `WorkflowError::Conflict` rather than overwriting.
pub trait WorkflowStore: Send + Sync + 'static {
    /// Create or replace a live workflow definition (admin surface).
    fn save_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>>;

    /// Load a live workflow definition.
    fn load_workflow(&self, id: &WorkflowId) -> BoxFuture<'_, Result<Option<Workflow>>>;

    /// Return an existing version of `workflow_id` with this fingerprint,
    /// otherwise persist `snapshot` as the next version number.
    fn load_or_create_version(
        &self,
        workflow_id: &WorkflowId,
        snapshot: String,
        fingerprint: String,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<WorkflowVersion>>;

    fn load_version(&self, id: &VersionId) -> BoxFuture<'_, Result<Option<WorkflowVersion>>>;

    /// Insert a participant record that has not entered any workflow.
    fn register_participant(&self, participant: &Participant) -> BoxFuture<'_, Result<()>>;

    fn load_participant(&self, id: &ParticipantId) -> BoxFuture<'_, Result<Option<Participant>>>;

    /// Participants that currently sit on a step.
    fn list_active_participants(&self) -> BoxFuture<'_, Result<Vec<Participant>>>;

    /// Apply a position change in one transaction and return the new record.
    fn save_position(&self, update: PositionUpdate) -> BoxFuture<'_, Result<Participant>>;

    /// Create a fork instance and all of its branch rows, or nothing.
    fn create_branch_states(&self, opening: ForkOpening) -> BoxFuture<'_, Result<()>>;

    fn load_branch_state(
        &self,
        id: &BranchStateId,
    ) -> BoxFuture<'_, Result<Option<ParallelBranchState>>>;

    /// Compare-and-swap on the branch revision; returns the stored row.
    fn update_branch_state(
        &self,
        branch: &ParallelBranchState,
        expected_revision: u64,
    ) -> BoxFuture<'_, Result<ParallelBranchState>>;

    fn list_branch_states(
        &self,
        instance_id: &ForkInstanceId,
    ) -> BoxFuture<'_, Result<Vec<ParallelBranchState>>>;

    fn load_fork_instance(&self, id: &ForkInstanceId) -> BoxFuture<'_, Result<Option<ForkInstance>>>;

    /// The not-yet-joined instance of `fork_step_id` for a participant.
    fn open_fork_instance(
        &self,
        participant_id: &ParticipantId,
        fork_step_id: &StepId,
    ) -> BoxFuture<'_, Result<Option<ForkInstance>>>;

    fn append_audit(&self, record: &AuditRecord) -> BoxFuture<'_, Result<()>>;

    /// Audit rows for a participant, oldest first.
    fn list_audit(&self, participant_id: &ParticipantId) -> BoxFuture<'_, Result<Vec<AuditRecord>>>;
}
