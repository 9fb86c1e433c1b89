//! Shared fixtures for accredit tests: a settable clock, canned workflows,
//! seeded stores, and a store wrapper that injects failures.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::BoxFuture;

use accredit_core::clock::Clock;
use accredit_core::error::{Result, WorkflowError};
use accredit_core::participant::*;
use accredit_core::traits::WorkflowStore;
use accredit_core::types::*;
use accredit_core::workflow::*;
use accredit_store::SqliteStore;

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    /// Starts at [`base_time`].
    pub fn at_base() -> Arc<Self> {
        Self::new(base_time())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.advance(Duration::minutes(minutes));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Fixed instant tests start from.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// `A(entry) -> B(fork of B1, B2, ALL) -> C` on approve, `-> D` on reject.
/// Rejecting at A ends the workflow as rejected.
pub fn accreditation_workflow() -> Workflow {
    Workflow::new("wf-accreditation", "tenant-1", "Media accreditation")
        .with_step(Step::review("A").entry().on_approve("B").on_reject("A-rejected"))
        .with_step(
            Step::fork(
                "B",
                ForkConfig::new(JoinPolicy::All)
                    .with_branch("B1", "Security vetting")
                    .with_branch("B2", "Press office"),
            )
            .on_approve("C")
            .on_reject("D"),
        )
        .with_step(Step::review("B1"))
        .with_step(Step::review("B2"))
        .with_step(Step::approval("C").final_on_approve())
        .with_step(Step::review("D").on_approve("C"))
        .with_step(Step::terminal("A-rejected", TerminalOutcome::Rejected))
}

/// `intake -> checks(fork of three branches) -> done | declined`.
pub fn three_branch_workflow(policy: JoinPolicy) -> Workflow {
    Workflow::new("wf-three", "tenant-1", "Three checks")
        .with_step(Step::review("intake").entry().on_approve("checks"))
        .with_step(
            Step::fork(
                "checks",
                ForkConfig::new(policy)
                    .with_branch("identity", "Identity")
                    .with_branch("security", "Security")
                    .with_branch("credentials", "Credentials"),
            )
            .on_approve("done")
            .on_reject("declined"),
        )
        .with_step(Step::review("identity"))
        .with_step(Step::review("security"))
        .with_step(Step::review("credentials"))
        .with_step(Step::terminal("done", TerminalOutcome::Approved))
        .with_step(Step::terminal("declined", TerminalOutcome::Rejected))
}

/// `docs` carries the SLA; escalation goes to `supervisor`.
pub fn sla_workflow(id: &str, sla_minutes: u32, action: SlaAction) -> Workflow {
    Workflow::new(id, "tenant-1", "SLA checked")
        .with_step(
            Step::review("docs")
                .entry()
                .on_approve("final")
                .on_reject("rejected")
                .on_escalate("supervisor")
                .with_sla(sla_minutes, action),
        )
        .with_step(Step::approval("supervisor").on_approve("final").on_reject("rejected"))
        .with_step(Step::approval("final").final_on_approve())
        .with_step(Step::terminal("rejected", TerminalOutcome::Rejected))
}

/// In-memory store holding `workflows` and registered `participants`.
pub async fn seeded_store(workflows: &[Workflow], participants: &[&str]) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    seed(store.as_ref(), workflows, participants).await;
    store
}

/// File-backed store in `dir`, seeded like [`seeded_store`].
pub async fn seeded_file_store(
    dir: &Path,
    workflows: &[Workflow],
    participants: &[&str],
) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::open(&dir.join("accredit.db")).unwrap());
    seed(store.as_ref(), workflows, participants).await;
    store
}

async fn seed(store: &dyn WorkflowStore, workflows: &[Workflow], participants: &[&str]) {
    for workflow in workflows {
        store.save_workflow(workflow).await.unwrap();
    }
    for id in participants {
        store.register_participant(&Participant::new(*id)).await.unwrap();
    }
}

/// Write `workflow` as pretty JSON, the format `accredit publish` reads.
pub fn write_workflow_json(dir: &Path, workflow: &Workflow) -> std::path::PathBuf {
    let path = dir.join(format!("{}.json", workflow.id));
    std::fs::write(&path, serde_json::to_string_pretty(workflow).unwrap()).unwrap();
    path
}

/// Wraps a store and fails selected calls.
pub struct FaultyStore {
    inner: Arc<dyn WorkflowStore>,
    broken_participants: Mutex<HashSet<ParticipantId>>,
    broken_versions: Mutex<HashSet<VersionId>>,
    fail_audit: Mutex<bool>,
    moves_after_listing: Mutex<Vec<(ParticipantId, StepId, DateTime<Utc>)>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn WorkflowStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            broken_participants: Mutex::new(HashSet::new()),
            broken_versions: Mutex::new(HashSet::new()),
            fail_audit: Mutex::new(false),
            moves_after_listing: Mutex::new(Vec::new()),
        })
    }

    /// Make loading this participant fail with a database error.
    pub fn break_participant(&self, id: &str) {
        self.broken_participants
            .lock()
            .unwrap()
            .insert(ParticipantId::from(id));
    }

    /// Make loading this version fail with a database error.
    pub fn break_version(&self, id: &VersionId) {
        self.broken_versions.lock().unwrap().insert(id.clone());
    }

    pub fn fail_audit(&self, fail: bool) {
        *self.fail_audit.lock().unwrap() = fail;
    }

    /// Once the next `list_active_participants` has returned its rows, move
    /// the participant onto `step` as another writer would.
    pub fn move_after_listing(&self, id: &str, step: &str, at: DateTime<Utc>) {
        self.moves_after_listing
            .lock()
            .unwrap()
            .push((ParticipantId::from(id), StepId::from(step), at));
    }
}

impl WorkflowStore for FaultyStore {
    fn save_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        self.inner.save_workflow(workflow)
    }

    fn load_workflow(&self, id: &WorkflowId) -> BoxFuture<'_, Result<Option<Workflow>>> {
        self.inner.load_workflow(id)
    }

    fn load_or_create_version(
        &self,
        workflow_id: &WorkflowId,
        snapshot: String,
        fingerprint: String,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<WorkflowVersion>> {
        self.inner
            .load_or_create_version(workflow_id, snapshot, fingerprint, now)
    }

    fn load_version(&self, id: &VersionId) -> BoxFuture<'_, Result<Option<WorkflowVersion>>> {
        if self.broken_versions.lock().unwrap().contains(id) {
            let id = id.clone();
            return Box::pin(async move {
                Err(WorkflowError::Database(format!("snapshot for {} is unreadable", id)))
            });
        }
        self.inner.load_version(id)
    }

    fn register_participant(&self, participant: &Participant) -> BoxFuture<'_, Result<()>> {
        self.inner.register_participant(participant)
    }

    fn load_participant(&self, id: &ParticipantId) -> BoxFuture<'_, Result<Option<Participant>>> {
        if self.broken_participants.lock().unwrap().contains(id) {
            let id = id.clone();
            return Box::pin(async move {
                Err(WorkflowError::Database(format!("row for {} is unreadable", id)))
            });
        }
        self.inner.load_participant(id)
    }

    fn list_active_participants(&self) -> BoxFuture<'_, Result<Vec<Participant>>> {
        let moves = std::mem::take(&mut *self.moves_after_listing.lock().unwrap());
        Box::pin(async move {
            let listed = self.inner.list_active_participants().await?;
            for (id, step, at) in moves {
                let current = self
                    .inner
                    .load_participant(&id)
                    .await?
                    .ok_or_else(|| WorkflowError::ParticipantNotFound(id.to_string()))?;
                self.inner
                    .save_position(PositionUpdate {
                        participant_id: id,
                        expected_revision: current.revision,
                        workflow_version_id: current.workflow_version_id,
                        current_step_id: Some(step),
                        step_entered_at: at,
                        status: current.status,
                        close_fork: None,
                        open_fork: None,
                    })
                    .await?;
            }
            Ok(listed)
        })
    }

    fn save_position(&self, update: PositionUpdate) -> BoxFuture<'_, Result<Participant>> {
        self.inner.save_position(update)
    }

    fn create_branch_states(&self, opening: ForkOpening) -> BoxFuture<'_, Result<()>> {
        self.inner.create_branch_states(opening)
    }

    fn load_branch_state(
        &self,
        id: &BranchStateId,
    ) -> BoxFuture<'_, Result<Option<ParallelBranchState>>> {
        self.inner.load_branch_state(id)
    }

    fn update_branch_state(
        &self,
        branch: &ParallelBranchState,
        expected_revision: u64,
    ) -> BoxFuture<'_, Result<ParallelBranchState>> {
        self.inner.update_branch_state(branch, expected_revision)
    }

    fn list_branch_states(
        &self,
        instance_id: &ForkInstanceId,
    ) -> BoxFuture<'_, Result<Vec<ParallelBranchState>>> {
        self.inner.list_branch_states(instance_id)
    }

    fn load_fork_instance(&self, id: &ForkInstanceId) -> BoxFuture<'_, Result<Option<ForkInstance>>> {
        self.inner.load_fork_instance(id)
    }

    fn open_fork_instance(
        &self,
        participant_id: &ParticipantId,
        fork_step_id: &StepId,
    ) -> BoxFuture<'_, Result<Option<ForkInstance>>> {
        self.inner.open_fork_instance(participant_id, fork_step_id)
    }

    fn append_audit(&self, record: &AuditRecord) -> BoxFuture<'_, Result<()>> {
        if *self.fail_audit.lock().unwrap() {
            return Box::pin(async { Err(WorkflowError::Database("audit_log is read-only".into())) });
        }
        self.inner.append_audit(record)
    }

    fn list_audit(&self, participant_id: &ParticipantId) -> BoxFuture<'_, Result<Vec<AuditRecord>>> {
        self.inner.list_audit(participant_id)
    }
}
