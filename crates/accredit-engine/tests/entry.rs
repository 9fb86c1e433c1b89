use std::sync::Arc;

use accredit_core::error::WorkflowError;
use accredit_core::participant::{AuditKind, Participant, ParticipantStatus};
use accredit_core::traits::WorkflowStore;
use accredit_core::types::{Action, Actor, ParticipantId, StepId, WorkflowId};
use accredit_core::workflow::{ForkConfig, JoinPolicy, SlaAction, Step, Workflow, WorkflowStatus};
use accredit_engine::{deserialize, JoinOutcome, WorkflowEngine};
use accredit_store::SqliteStore;
use accredit_test_utils::{
    accreditation_workflow, base_time, seeded_file_store, seeded_store, sla_workflow,
    three_branch_workflow, ManualClock,
};

fn engine(store: Arc<SqliteStore>, clock: Arc<ManualClock>) -> WorkflowEngine {
    WorkflowEngine::builder(store).clock(clock).build()
}

fn pid(id: &str) -> ParticipantId {
    ParticipantId::from(id)
}

fn wid(id: &str) -> WorkflowId {
    WorkflowId::from(id)
}

#[tokio::test]
async fn enter_places_participant_on_entry_step() {
    let clock = ManualClock::at_base();
    let store = seeded_store(&[accreditation_workflow()], &["p1"]).await;
    let engine = engine(store.clone(), clock);

    let outcome = engine
        .entry
        .enter(&pid("p1"), &wid("wf-accreditation"), Actor::user("admin"))
        .await
        .unwrap();

    assert_eq!(outcome.entry_step, StepId::from("A"));
    assert_eq!(outcome.version, 1);
    assert!(outcome.fork_instance.is_none());

    let stored = store.load_participant(&pid("p1")).await.unwrap().unwrap();
    assert_eq!(stored.current_step_id, Some(StepId::from("A")));
    assert_eq!(stored.workflow_version_id, Some(outcome.version_id.clone()));
    assert_eq!(stored.status, ParticipantStatus::Pending);
    assert_eq!(stored.step_entered_at, Some(base_time()));

    let audit = store.list_audit(&pid("p1")).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, AuditKind::Entry);
    assert_eq!(audit[0].actor, Actor::user("admin"));
    assert_eq!(audit[0].to_step, Some(StepId::from("A")));
}

#[tokio::test]
async fn user_named_system_is_audited_as_that_user() {
    let store = seeded_store(&[accreditation_workflow()], &["p1"]).await;
    let engine = engine(store.clone(), ManualClock::at_base());

    engine
        .entry
        .enter(&pid("p1"), &wid("wf-accreditation"), Actor::user("system"))
        .await
        .unwrap();

    let audit = store.list_audit(&pid("p1")).await.unwrap();
    assert_eq!(audit[0].actor, Actor::user("system"));
    assert!(!audit[0].actor.is_system());
}

#[tokio::test]
async fn pinned_snapshot_round_trips_the_live_graph() {
    let workflow = accreditation_workflow();
    let store = seeded_store(&[workflow.clone()], &["p1"]).await;
    let engine = engine(store.clone(), ManualClock::at_base());

    let outcome = engine
        .entry
        .enter(&pid("p1"), &workflow.id, Actor::System)
        .await
        .unwrap();
    let version = store.load_version(&outcome.version_id).await.unwrap().unwrap();
    let snapshot = deserialize(&version.snapshot).unwrap();

    for step in &workflow.steps {
        let pinned = snapshot.step(&step.id).unwrap();
        assert_eq!(pinned.kind, step.kind);
        assert_eq!(pinned.next_step_id, step.next_step_id);
        assert_eq!(pinned.rejection_target_id, step.rejection_target_id);
        assert_eq!(pinned.bypass_target_id, step.bypass_target_id);
        assert_eq!(pinned.escalation_target_id, step.escalation_target_id);
    }
}

#[tokio::test]
async fn missing_entry_point_leaves_participant_untouched() {
    let workflow = Workflow::new("wf-headless", "tenant-1", "No entry")
        .with_step(Step::review("a").on_approve("b"))
        .with_step(Step::approval("b").final_on_approve());
    let store = seeded_store(&[workflow], &["p1"]).await;
    let engine = engine(store.clone(), ManualClock::at_base());

    let err = engine
        .entry
        .enter(&pid("p1"), &wid("wf-headless"), Actor::user("admin"))
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::NoEntryPoint(_)));
    assert_eq!(err.status(), 400);
    assert_eq!(
        store.load_participant(&pid("p1")).await.unwrap().unwrap(),
        Participant::new("p1")
    );
    assert!(store.list_audit(&pid("p1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_entry_point_on_an_entered_participant_keeps_old_position() {
    let store = seeded_store(
        &[
            sla_workflow("wf-sla", 60, SlaAction::Notify),
            Workflow::new("wf-headless", "tenant-1", "No entry").with_step(Step::review("a")),
        ],
        &["p1"],
    )
    .await;
    let engine = engine(store.clone(), ManualClock::at_base());
    engine
        .entry
        .enter(&pid("p1"), &wid("wf-sla"), Actor::System)
        .await
        .unwrap();
    let before = store.load_participant(&pid("p1")).await.unwrap().unwrap();

    assert!(engine
        .entry
        .enter(&pid("p1"), &wid("wf-headless"), Actor::System)
        .await
        .is_err());
    assert_eq!(store.load_participant(&pid("p1")).await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn unknown_and_archived_workflows_are_not_found() {
    let mut archived = sla_workflow("wf-old", 60, SlaAction::Notify);
    archived.status = WorkflowStatus::Archived;
    let store = seeded_store(&[archived], &["p1"]).await;
    let engine = engine(store, ManualClock::at_base());

    let err = engine
        .entry
        .enter(&pid("p1"), &wid("wf-missing"), Actor::System)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::WorkflowNotFound(_)));
    assert_eq!(err.status(), 404);

    let err = engine
        .entry
        .enter(&pid("p1"), &wid("wf-old"), Actor::System)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::WorkflowNotFound(_)));
}

#[tokio::test]
async fn unknown_participant_is_not_found() {
    let store = seeded_store(&[accreditation_workflow()], &[]).await;
    let engine = engine(store, ManualClock::at_base());

    let err = engine
        .entry
        .enter(&pid("nobody"), &wid("wf-accreditation"), Actor::System)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ParticipantNotFound(_)));
}

#[tokio::test]
async fn unchanged_definition_reuses_its_version() {
    let store = seeded_store(&[sla_workflow("wf-sla", 60, SlaAction::Notify)], &["p1", "p2", "p3", "p4"]).await;
    let engine = engine(store.clone(), ManualClock::at_base());

    let first = engine.entry.enter(&pid("p1"), &wid("wf-sla"), Actor::System).await.unwrap();
    let second = engine.entry.enter(&pid("p2"), &wid("wf-sla"), Actor::System).await.unwrap();
    assert_eq!(first.version_id, second.version_id);

    let edited = sla_workflow("wf-sla", 90, SlaAction::Notify);
    store.save_workflow(&edited).await.unwrap();

    let third = engine.entry.enter(&pid("p3"), &wid("wf-sla"), Actor::System).await.unwrap();
    assert_ne!(third.version_id, first.version_id);
    assert_eq!(third.version, 2);

    // Reverting the edit lands on the original version again.
    store
        .save_workflow(&sla_workflow("wf-sla", 60, SlaAction::Notify))
        .await
        .unwrap();
    let fourth = engine.entry.enter(&pid("p4"), &wid("wf-sla"), Actor::System).await.unwrap();
    assert_eq!(fourth.version_id, first.version_id);
    assert_eq!(fourth.version, 1);
}

#[tokio::test]
async fn entry_onto_a_fork_opens_its_branches() {
    let workflow = Workflow::new("wf-fork-first", "tenant-1", "Fork first")
        .with_step(
            Step::fork(
                "checks",
                ForkConfig::new(JoinPolicy::All)
                    .with_branch("left", "Left")
                    .with_branch("right", "Right"),
            )
            .entry()
            .on_approve("done"),
        )
        .with_step(Step::review("left"))
        .with_step(Step::review("right"))
        .with_step(Step::approval("done").final_on_approve());
    let store = seeded_store(&[workflow], &["p1"]).await;
    let engine = engine(store, ManualClock::at_base());

    let outcome = engine
        .entry
        .enter(&pid("p1"), &wid("wf-fork-first"), Actor::System)
        .await
        .unwrap();
    assert!(outcome.fork_instance.is_some());

    let branches = engine.forks.open_branches(&pid("p1")).await.unwrap();
    assert_eq!(branches.len(), 2);
    assert!(branches.iter().all(|b| b.is_open()));
}

#[tokio::test]
async fn re_entry_overwrites_position_and_strands_open_fork() {
    let store = seeded_store(&[three_branch_workflow(JoinPolicy::All)], &["p1"]).await;
    let engine = engine(store.clone(), ManualClock::at_base());
    let wf = wid("wf-three");

    engine.entry.enter(&pid("p1"), &wf, Actor::System).await.unwrap();
    engine
        .transitions
        .apply(&pid("p1"), Action::Approve, None, Actor::user("r1"))
        .await
        .unwrap();
    let revision = store.load_participant(&pid("p1")).await.unwrap().unwrap().revision;

    let again = engine.entry.enter(&pid("p1"), &wf, Actor::System).await.unwrap();
    assert_eq!(again.participant.current_step_id, Some(StepId::from("intake")));
    assert_eq!(again.participant.revision, revision + 1);

    let join = engine
        .forks
        .evaluate_join(&pid("p1"), &StepId::from("checks"))
        .await
        .unwrap();
    assert!(matches!(join, JoinOutcome::Stale));
    assert_eq!(store.list_audit(&pid("p1")).await.unwrap().len(), 3);
}

#[tokio::test]
async fn file_backed_store_keeps_position_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = seeded_file_store(dir.path(), &[accreditation_workflow()], &["p1"]).await;
        let engine = engine(store, ManualClock::at_base());
        engine
            .entry
            .enter(&pid("p1"), &wid("wf-accreditation"), Actor::System)
            .await
            .unwrap();
    }

    let reopened = SqliteStore::open(&dir.path().join("accredit.db")).unwrap();
    let participant = reopened.load_participant(&pid("p1")).await.unwrap().unwrap();
    assert_eq!(participant.current_step_id, Some(StepId::from("A")));
}
