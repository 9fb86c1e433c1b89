use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;

use accredit_core::error::{Result, WorkflowError};
use accredit_core::participant::*;
use accredit_core::traits::WorkflowStore;
use accredit_core::types::*;
use accredit_core::workflow::{Workflow, WorkflowVersion};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workflow_versions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        snapshot TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(workflow_id, version)
    );

    CREATE INDEX IF NOT EXISTS idx_workflow_versions_fingerprint
        ON workflow_versions(workflow_id, fingerprint);

    CREATE TABLE IF NOT EXISTS participants (
        id TEXT PRIMARY KEY,
        workflow_version_id TEXT,
        current_step_id TEXT,
        step_entered_at TEXT,
        status TEXT NOT NULL,
        revision INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_participants_step
        ON participants(current_step_id);

    CREATE TABLE IF NOT EXISTS fork_instances (
        id TEXT PRIMARY KEY,
        participant_id TEXT NOT NULL,
        fork_step_id TEXT NOT NULL,
        opened_at TEXT NOT NULL,
        joined_at TEXT,
        outcome TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_fork_instances_participant
        ON fork_instances(participant_id, fork_step_id);

    CREATE TABLE IF NOT EXISTS branch_states (
        id TEXT PRIMARY KEY,
        participant_id TEXT NOT NULL,
        fork_instance_id TEXT NOT NULL REFERENCES fork_instances(id),
        fork_step_id TEXT NOT NULL,
        branch_step_id TEXT NOT NULL,
        label TEXT NOT NULL,
        status TEXT NOT NULL,
        completed_at TEXT,
        completed_by TEXT,
        action TEXT,
        remarks TEXT,
        revision INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_branch_states_instance
        ON branch_states(fork_instance_id);

    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        participant_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        actor TEXT NOT NULL,
        action TEXT,
        remarks TEXT,
        from_step TEXT,
        to_step TEXT,
        at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_audit_participant
        ON audit_log(participant_id, id);";

const PARTICIPANT_COLUMNS: &str =
    "id, workflow_version_id, current_step_id, step_entered_at, status, revision";

const BRANCH_COLUMNS: &str = "id, participant_id, fork_instance_id, fork_step_id, branch_step_id, \
     label, status, completed_at, completed_by, action, remarks, revision";

const FORK_COLUMNS: &str = "id, participant_id, fork_step_id, opened_at, joined_at, outcome";

const VERSION_COLUMNS: &str = "id, workflow_id, version, snapshot, fingerprint, created_at";

/// SQLite-backed workflow store.
///
/// Every write runs inside one transaction on a single connection, so each
/// trait method is atomic. Lost updates are detected through the `revision`
/// columns on participants and branch states.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WorkflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WorkflowError::Database(e.to_string()))
    }
}

impl WorkflowStore for SqliteStore {
    fn save_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        let id = workflow.id.0.clone();
        let definition = serde_json::to_string(workflow);

        Box::pin(async move {
            let definition = definition?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflows (id, definition, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET definition = excluded.definition,
                                               updated_at = excluded.updated_at",
                params![id, definition, Utc::now().to_rfc3339()],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn load_workflow(&self, id: &WorkflowId) -> BoxFuture<'_, Result<Option<Workflow>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let definition: Option<String> = conn
                .query_row(
                    "SELECT definition FROM workflows WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;

            match definition {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn load_or_create_version(
        &self,
        workflow_id: &WorkflowId,
        snapshot: String,
        fingerprint: String,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<WorkflowVersion>> {
        let workflow_id = workflow_id.clone();

        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db)?;

            let matching = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM workflow_versions WHERE workflow_id = ?1 AND fingerprint = ?2
                         ORDER BY version DESC LIMIT 1",
                        VERSION_COLUMNS
                    ),
                    params![workflow_id.0, fingerprint],
                    row_to_version,
                )
                .optional()
                .map_err(db)?;
            if let Some(existing) = matching {
                debug!(
                    workflow = %workflow_id,
                    version = existing.version,
                    "Reusing identical workflow version"
                );
                return Ok(existing);
            }

            let latest: Option<i64> = tx
                .query_row(
                    "SELECT MAX(version) FROM workflow_versions WHERE workflow_id = ?1",
                    params![workflow_id.0],
                    |row| row.get(0),
                )
                .map_err(db)?;
            let next_number = latest.map_or(1, |v| v as u32 + 1);

            let version = WorkflowVersion {
                id: VersionId::new(),
                workflow_id,
                version: next_number,
                snapshot,
                fingerprint,
                created_at: now,
            };

            tx.execute(
                "INSERT INTO workflow_versions (id, workflow_id, version, snapshot, fingerprint, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    version.id.0,
                    version.workflow_id.0,
                    version.version as i64,
                    version.snapshot,
                    version.fingerprint,
                    version.created_at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
            tx.commit().map_err(db)?;

            debug!(
                workflow = %version.workflow_id,
                version = version.version,
                "Created workflow version"
            );
            Ok(version)
        })
    }

    fn load_version(&self, id: &VersionId) -> BoxFuture<'_, Result<Option<WorkflowVersion>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                &format!("SELECT {} FROM workflow_versions WHERE id = ?1", VERSION_COLUMNS),
                params![id],
                row_to_version,
            )
            .optional()
            .map_err(db)
        })
    }

    fn register_participant(&self, participant: &Participant) -> BoxFuture<'_, Result<()>> {
        let p = participant.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO participants (id, workflow_version_id, current_step_id, step_entered_at, status, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    p.id.0,
                    p.workflow_version_id.map(|v| v.0),
                    p.current_step_id.map(|s| s.0),
                    p.step_entered_at.map(|t| t.to_rfc3339()),
                    p.status.as_str(),
                    p.revision as i64,
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn load_participant(&self, id: &ParticipantId) -> BoxFuture<'_, Result<Option<Participant>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            select_participant(&conn, &id)
        })
    }

    fn list_active_participants(&self) -> BoxFuture<'_, Result<Vec<Participant>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM participants WHERE current_step_id IS NOT NULL ORDER BY id",
                    PARTICIPANT_COLUMNS
                ))
                .map_err(db)?;

            let rows = stmt.query_map([], row_to_participant).map_err(db)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
        })
    }

    fn save_position(&self, update: PositionUpdate) -> BoxFuture<'_, Result<Participant>> {
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db)?;

            // The join guard is checked before the revision so the loser of a
            // join race sees ForkAlreadyJoined rather than a plain conflict.
            if let Some(close) = &update.close_fork {
                let closed_at = update.step_entered_at.to_rfc3339();
                let changed = tx
                    .execute(
                        "UPDATE fork_instances SET joined_at = ?1, outcome = ?2
                         WHERE id = ?3 AND joined_at IS NULL",
                        params![
                            closed_at,
                            close.outcome.map(|a| a.to_string()),
                            close.instance_id.0,
                        ],
                    )
                    .map_err(db)?;

                if changed == 0 {
                    return Err(if row_exists(&tx, "fork_instances", &close.instance_id.0)? {
                        WorkflowError::ForkAlreadyJoined(close.instance_id.0.clone())
                    } else {
                        WorkflowError::ForkNotFound(close.instance_id.0.clone())
                    });
                }

                tx.execute(
                    "UPDATE branch_states SET status = 'abandoned', completed_at = ?1,
                         revision = revision + 1
                     WHERE fork_instance_id = ?2 AND status = 'pending'",
                    params![closed_at, close.instance_id.0],
                )
                .map_err(db)?;
            }

            let changed = tx
                .execute(
                    "UPDATE participants
                     SET workflow_version_id = ?1, current_step_id = ?2, step_entered_at = ?3,
                         status = ?4, revision = revision + 1
                     WHERE id = ?5 AND revision = ?6",
                    params![
                        update.workflow_version_id.as_ref().map(|v| v.0.as_str()),
                        update.current_step_id.as_ref().map(|s| s.0.as_str()),
                        update.step_entered_at.to_rfc3339(),
                        update.status.as_str(),
                        update.participant_id.0,
                        update.expected_revision as i64,
                    ],
                )
                .map_err(db)?;

            if changed == 0 {
                return Err(if row_exists(&tx, "participants", &update.participant_id.0)? {
                    WorkflowError::Conflict(format!("participant {}", update.participant_id))
                } else {
                    WorkflowError::ParticipantNotFound(update.participant_id.0.clone())
                });
            }

            if let Some(opening) = &update.open_fork {
                insert_fork_opening(&tx, opening)?;
            }

            let saved = select_participant(&tx, &update.participant_id.0)?
                .ok_or_else(|| WorkflowError::ParticipantNotFound(update.participant_id.0.clone()))?;
            tx.commit().map_err(db)?;
            Ok(saved)
        })
    }

    fn create_branch_states(&self, opening: ForkOpening) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db)?;
            insert_fork_opening(&tx, &opening)?;
            tx.commit().map_err(db)?;
            Ok(())
        })
    }

    fn load_branch_state(
        &self,
        id: &BranchStateId,
    ) -> BoxFuture<'_, Result<Option<ParallelBranchState>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            select_branch(&conn, &id)
        })
    }

    fn update_branch_state(
        &self,
        branch: &ParallelBranchState,
        expected_revision: u64,
    ) -> BoxFuture<'_, Result<ParallelBranchState>> {
        let b = branch.clone();

        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db)?;
            let changed = tx
                .execute(
                    "UPDATE branch_states
                     SET status = ?1, completed_at = ?2, completed_by = ?3, action = ?4,
                         remarks = ?5, revision = revision + 1
                     WHERE id = ?6 AND revision = ?7",
                    params![
                        b.status.as_str(),
                        b.completed_at.map(|t| t.to_rfc3339()),
                        b.completed_by.as_ref().map(Actor::tagged),
                        b.action.map(|a| a.to_string()),
                        b.remarks,
                        b.id.0,
                        expected_revision as i64,
                    ],
                )
                .map_err(db)?;

            if changed == 0 {
                return Err(if row_exists(&tx, "branch_states", &b.id.0)? {
                    WorkflowError::Conflict(format!("branch {}", b.id))
                } else {
                    WorkflowError::BranchNotFound(b.id.0.clone())
                });
            }

            let saved = select_branch(&tx, &b.id.0)?
                .ok_or_else(|| WorkflowError::BranchNotFound(b.id.0.clone()))?;
            tx.commit().map_err(db)?;
            Ok(saved)
        })
    }

    fn list_branch_states(
        &self,
        instance_id: &ForkInstanceId,
    ) -> BoxFuture<'_, Result<Vec<ParallelBranchState>>> {
        let instance_id = instance_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM branch_states WHERE fork_instance_id = ?1 ORDER BY rowid",
                    BRANCH_COLUMNS
                ))
                .map_err(db)?;

            let rows = stmt.query_map(params![instance_id], row_to_branch).map_err(db)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
        })
    }

    fn load_fork_instance(&self, id: &ForkInstanceId) -> BoxFuture<'_, Result<Option<ForkInstance>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                &format!("SELECT {} FROM fork_instances WHERE id = ?1", FORK_COLUMNS),
                params![id],
                row_to_fork,
            )
            .optional()
            .map_err(db)
        })
    }

    fn open_fork_instance(
        &self,
        participant_id: &ParticipantId,
        fork_step_id: &StepId,
    ) -> BoxFuture<'_, Result<Option<ForkInstance>>> {
        let participant_id = participant_id.0.clone();
        let fork_step_id = fork_step_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM fork_instances
                     WHERE participant_id = ?1 AND fork_step_id = ?2 AND joined_at IS NULL
                     ORDER BY opened_at DESC, rowid DESC LIMIT 1",
                    FORK_COLUMNS
                ),
                params![participant_id, fork_step_id],
                row_to_fork,
            )
            .optional()
            .map_err(db)
        })
    }

    fn append_audit(&self, record: &AuditRecord) -> BoxFuture<'_, Result<()>> {
        let r = record.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO audit_log (participant_id, kind, actor, action, remarks, from_step, to_step, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    r.participant_id.0,
                    r.kind.as_str(),
                    r.actor.tagged(),
                    r.action.map(|a| a.to_string()),
                    r.remarks,
                    r.from_step.map(|s| s.0),
                    r.to_step.map(|s| s.0),
                    r.at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn list_audit(&self, participant_id: &ParticipantId) -> BoxFuture<'_, Result<Vec<AuditRecord>>> {
        let participant_id = participant_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT participant_id, kind, actor, action, remarks, from_step, to_step, at
                     FROM audit_log WHERE participant_id = ?1 ORDER BY id ASC",
                )
                .map_err(db)?;

            let rows = stmt
                .query_map(params![participant_id], |row| {
                    Ok(AuditRecord {
                        participant_id: ParticipantId(row.get(0)?),
                        kind: parse_col(1, row.get::<_, String>(1)?)?,
                        actor: parse_col(2, row.get::<_, String>(2)?)?,
                        action: parse_opt(3, row.get(3)?)?,
                        remarks: row.get(4)?,
                        from_step: row.get::<_, Option<String>>(5)?.map(StepId),
                        to_step: row.get::<_, Option<String>>(6)?.map(StepId),
                        at: parse_ts(7, row.get(7)?)?,
                    })
                })
                .map_err(db)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
        })
    }
}

fn db(e: rusqlite::Error) -> WorkflowError {
    WorkflowError::Database(e.to_string())
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE id = ?1", table),
            params![id],
            |row| row.get(0),
        )
        .map_err(db)?;
    Ok(count > 0)
}

fn insert_fork_opening(tx: &Transaction<'_>, opening: &ForkOpening) -> Result<()> {
    let instance = &opening.instance;
    tx.execute(
        "INSERT INTO fork_instances (id, participant_id, fork_step_id, opened_at, joined_at, outcome)
         VALUES (?1, ?2, ?3, ?4, NULL, NULL)",
        params![
            instance.id.0,
            instance.participant_id.0,
            instance.fork_step_id.0,
            instance.opened_at.to_rfc3339(),
        ],
    )
    .map_err(db)?;

    for branch in &opening.branches {
        tx.execute(
            "INSERT INTO branch_states (id, participant_id, fork_instance_id, fork_step_id,
                 branch_step_id, label, status, completed_at, completed_by, action, remarks, revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL, NULL, 0)",
            params![
                branch.id.0,
                branch.participant_id.0,
                branch.fork_instance_id.0,
                branch.fork_step_id.0,
                branch.branch_step_id.0,
                branch.label,
                branch.status.as_str(),
            ],
        )
        .map_err(db)?;
    }
    Ok(())
}

fn select_participant(conn: &Connection, id: &str) -> Result<Option<Participant>> {
    conn.query_row(
        &format!("SELECT {} FROM participants WHERE id = ?1", PARTICIPANT_COLUMNS),
        params![id],
        row_to_participant,
    )
    .optional()
    .map_err(db)
}

fn select_branch(conn: &Connection, id: &str) -> Result<Option<ParallelBranchState>> {
    conn.query_row(
        &format!("SELECT {} FROM branch_states WHERE id = ?1", BRANCH_COLUMNS),
        params![id],
        row_to_branch,
    )
    .optional()
    .map_err(db)
}

fn row_to_participant(row: &Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: ParticipantId(row.get(0)?),
        workflow_version_id: row.get::<_, Option<String>>(1)?.map(VersionId),
        current_step_id: row.get::<_, Option<String>>(2)?.map(StepId),
        step_entered_at: match row.get::<_, Option<String>>(3)? {
            Some(ts) => Some(parse_ts(3, ts)?),
            None => None,
        },
        status: parse_col(4, row.get::<_, String>(4)?)?,
        revision: row.get::<_, i64>(5)? as u64,
    })
}

fn row_to_branch(row: &Row<'_>) -> rusqlite::Result<ParallelBranchState> {
    Ok(ParallelBranchState {
        id: BranchStateId(row.get(0)?),
        participant_id: ParticipantId(row.get(1)?),
        fork_instance_id: ForkInstanceId(row.get(2)?),
        fork_step_id: StepId(row.get(3)?),
        branch_step_id: StepId(row.get(4)?),
        label: row.get(5)?,
        status: parse_col(6, row.get::<_, String>(6)?)?,
        completed_at: match row.get::<_, Option<String>>(7)? {
            Some(ts) => Some(parse_ts(7, ts)?),
            None => None,
        },
        completed_by: parse_opt(8, row.get(8)?)?,
        action: parse_opt(9, row.get(9)?)?,
        remarks: row.get(10)?,
        revision: row.get::<_, i64>(11)? as u64,
    })
}

fn row_to_fork(row: &Row<'_>) -> rusqlite::Result<ForkInstance> {
    Ok(ForkInstance {
        id: ForkInstanceId(row.get(0)?),
        participant_id: ParticipantId(row.get(1)?),
        fork_step_id: StepId(row.get(2)?),
        opened_at: parse_ts(3, row.get(3)?)?,
        joined_at: match row.get::<_, Option<String>>(4)? {
            Some(ts) => Some(parse_ts(4, ts)?),
            None => None,
        },
        outcome: parse_opt(5, row.get(5)?)?,
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<WorkflowVersion> {
    Ok(WorkflowVersion {
        id: VersionId(row.get(0)?),
        workflow_id: WorkflowId(row.get(1)?),
        version: row.get::<_, i64>(2)? as u32,
        snapshot: row.get(3)?,
        fingerprint: row.get(4)?,
        created_at: parse_ts(5, row.get(5)?)?,
    })
}

fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_col<T: FromStr<Err = String>>(idx: usize, value: String) -> rusqlite::Result<T> {
    value
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_opt<T: FromStr<Err = String>>(idx: usize, value: Option<String>) -> rusqlite::Result<Option<T>> {
    value.map(|v| parse_col(idx, v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use accredit_core::workflow::{Step, TerminalOutcome};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    async fn store_with_participant(id: &str) -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.register_participant(&Participant::new(id)).await.unwrap();
        store
    }

    fn move_to(p: &Participant, step: &str) -> PositionUpdate {
        PositionUpdate {
            participant_id: p.id.clone(),
            expected_revision: p.revision,
            workflow_version_id: Some(VersionId::from("v1")),
            current_step_id: Some(StepId::from(step)),
            step_entered_at: now(),
            status: ParticipantStatus::Pending,
            close_fork: None,
            open_fork: None,
        }
    }

    fn opening(participant: &str, branches: &[&str]) -> ForkOpening {
        let instance = ForkInstance {
            id: ForkInstanceId::new(),
            participant_id: ParticipantId::from(participant),
            fork_step_id: StepId::from("fork"),
            opened_at: now(),
            joined_at: None,
            outcome: None,
        };
        let branches = branches
            .iter()
            .map(|b| ParallelBranchState {
                id: BranchStateId::new(),
                participant_id: ParticipantId::from(participant),
                fork_instance_id: instance.id.clone(),
                fork_step_id: StepId::from("fork"),
                branch_step_id: StepId::from(*b),
                label: b.to_string(),
                status: BranchStatus::Pending,
                completed_at: None,
                completed_by: None,
                action: None,
                remarks: None,
                revision: 0,
            })
            .collect();
        ForkOpening { instance, branches }
    }

    #[tokio::test]
    async fn test_workflow_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = Workflow::new("wf-1", "tenant-a", "Media accreditation")
            .with_step(Step::review("a").entry().on_approve("done"))
            .with_step(Step::terminal("done", TerminalOutcome::Approved));
        store.save_workflow(&wf).await.unwrap();

        let loaded = store.load_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Media accreditation");
        assert_eq!(loaded.steps.len(), 2);
        assert!(store
            .load_workflow(&WorkflowId::from("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_version_reused_when_fingerprint_matches() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = WorkflowId::from("wf-1");

        let v1 = store
            .load_or_create_version(&wf, "{}".into(), "fp-1".into(), now())
            .await
            .unwrap();
        let again = store
            .load_or_create_version(&wf, "{}".into(), "fp-1".into(), now())
            .await
            .unwrap();
        assert_eq!(v1.id, again.id);
        assert_eq!(again.version, 1);

        let v2 = store
            .load_or_create_version(&wf, "{\"x\":1}".into(), "fp-2".into(), now())
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_ne!(v2.id, v1.id);

        // The old version is untouched
        let old = store.load_version(&v1.id).await.unwrap().unwrap();
        assert_eq!(old.snapshot, "{}");
        assert_eq!(old.fingerprint, "fp-1");
    }

    #[tokio::test]
    async fn test_reverted_definition_reuses_the_older_version() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = WorkflowId::from("wf-1");

        let a = store
            .load_or_create_version(&wf, "{}".into(), "fp-a".into(), now())
            .await
            .unwrap();
        let b = store
            .load_or_create_version(&wf, "{\"x\":1}".into(), "fp-b".into(), now())
            .await
            .unwrap();
        let back = store
            .load_or_create_version(&wf, "{}".into(), "fp-a".into(), now())
            .await
            .unwrap();
        assert_eq!(back.id, a.id);
        assert_eq!(back.version, 1);

        // The numbering continues from the highest version.
        let c = store
            .load_or_create_version(&wf, "{\"x\":2}".into(), "fp-c".into(), now())
            .await
            .unwrap();
        assert_eq!(c.version, b.version + 1);

        // Fingerprints are scoped to their workflow.
        let other = store
            .load_or_create_version(&WorkflowId::from("wf-2"), "{}".into(), "fp-a".into(), now())
            .await
            .unwrap();
        assert_eq!(other.version, 1);
        assert_ne!(other.id, a.id);
    }

    #[tokio::test]
    async fn test_save_position_bumps_revision() {
        let store = store_with_participant("p1").await;
        let p = store.load_participant(&ParticipantId::from("p1")).await.unwrap().unwrap();
        assert_eq!(p.revision, 0);

        let saved = store.save_position(move_to(&p, "a")).await.unwrap();
        assert_eq!(saved.revision, 1);
        assert_eq!(saved.current_step_id, Some(StepId::from("a")));
        assert!(saved.step_entered_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_revision_is_conflict() {
        let store = store_with_participant("p1").await;
        let p = store.load_participant(&ParticipantId::from("p1")).await.unwrap().unwrap();

        store.save_position(move_to(&p, "a")).await.unwrap();
        let err = store.save_position(move_to(&p, "b")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        assert!(err.is_retryable());

        let current = store.load_participant(&p.id).await.unwrap().unwrap();
        assert_eq!(current.current_step_id, Some(StepId::from("a")));
    }

    #[tokio::test]
    async fn test_save_position_unknown_participant() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .save_position(move_to(&Participant::new("ghost"), "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ParticipantNotFound(_)));
    }

    #[tokio::test]
    async fn test_active_participants_excludes_finished() {
        let store = store_with_participant("p1").await;
        store.register_participant(&Participant::new("p2")).await.unwrap();
        let p1 = store.load_participant(&ParticipantId::from("p1")).await.unwrap().unwrap();
        store.save_position(move_to(&p1, "a")).await.unwrap();

        let active = store.list_active_participants().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.as_str(), "p1");
    }

    #[tokio::test]
    async fn test_fork_opening_is_stored_with_position() {
        let store = store_with_participant("p1").await;
        let p = store.load_participant(&ParticipantId::from("p1")).await.unwrap().unwrap();

        let open = opening("p1", &["b1", "b2", "b3"]);
        let instance_id = open.instance.id.clone();
        let mut update = move_to(&p, "fork");
        update.open_fork = Some(open);
        store.save_position(update).await.unwrap();

        let branches = store.list_branch_states(&instance_id).await.unwrap();
        assert_eq!(branches.len(), 3);
        assert!(branches.iter().all(|b| b.status == BranchStatus::Pending));

        let instance = store
            .open_fork_instance(&p.id, &StepId::from("fork"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.id, instance_id);
    }

    #[tokio::test]
    async fn test_close_fork_only_once() {
        let store = store_with_participant("p1").await;
        let p = store.load_participant(&ParticipantId::from("p1")).await.unwrap().unwrap();
        let open = opening("p1", &["b1", "b2"]);
        let instance_id = open.instance.id.clone();
        let mut update = move_to(&p, "fork");
        update.open_fork = Some(open);
        let p = store.save_position(update).await.unwrap();

        let mut close = move_to(&p, "after");
        close.close_fork = Some(ForkClose {
            instance_id: instance_id.clone(),
            outcome: Some(Action::Approve),
        });
        let p2 = store.save_position(close.clone()).await.unwrap();
        assert_eq!(p2.current_step_id, Some(StepId::from("after")));

        // Second close loses even with a fresh revision
        close.expected_revision = p2.revision;
        let err = store.save_position(close).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ForkAlreadyJoined(_)));

        let instance = store.load_fork_instance(&instance_id).await.unwrap().unwrap();
        assert!(instance.is_closed());
        assert_eq!(instance.outcome, Some(Action::Approve));

        // Pending branches were abandoned with the close
        let branches = store.list_branch_states(&instance_id).await.unwrap();
        assert!(branches.iter().all(|b| b.status == BranchStatus::Abandoned));
        assert!(store
            .open_fork_instance(&p.id, &StepId::from("fork"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_branch_compare_and_swap() {
        let store = SqliteStore::in_memory().unwrap();
        let open = opening("p1", &["b1"]);
        let branch_id = open.branches[0].id.clone();
        store.create_branch_states(open).await.unwrap();

        let mut branch = store.load_branch_state(&branch_id).await.unwrap().unwrap();
        branch.status = BranchStatus::Approved;
        branch.action = Some(Action::Approve);
        branch.completed_by = Some(Actor::user("security-lead"));
        branch.completed_at = Some(now());
        branch.remarks = Some("cleared".into());

        let saved = store.update_branch_state(&branch, 0).await.unwrap();
        assert_eq!(saved.revision, 1);
        assert_eq!(saved.status, BranchStatus::Approved);
        assert_eq!(saved.completed_by, Some(Actor::user("security-lead")));
        assert_eq!(saved.remarks.as_deref(), Some("cleared"));

        let err = store.update_branch_state(&branch, 0).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_audit_log_in_order() {
        let store = SqliteStore::in_memory().unwrap();
        let pid = ParticipantId::from("p1");
        for (kind, actor) in [
            (AuditKind::Entry, Actor::user("admin")),
            (AuditKind::Transition, Actor::user("reviewer")),
            (AuditKind::Escalation, Actor::System),
        ] {
            store
                .append_audit(&AuditRecord {
                    participant_id: pid.clone(),
                    kind,
                    actor,
                    action: None,
                    remarks: None,
                    from_step: None,
                    to_step: Some(StepId::from("a")),
                    at: now(),
                })
                .await
                .unwrap();
        }

        let records = store.list_audit(&pid).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].kind, AuditKind::Entry);
        assert_eq!(records[2].actor, Actor::System);
    }

    #[tokio::test]
    async fn test_user_named_system_is_not_the_system_actor() {
        let store = SqliteStore::in_memory().unwrap();
        let pid = ParticipantId::from("p1");
        for actor in [Actor::user("system"), Actor::System, Actor::user("user:x")] {
            store
                .append_audit(&AuditRecord {
                    participant_id: pid.clone(),
                    kind: AuditKind::Transition,
                    actor,
                    action: Some(Action::Approve),
                    remarks: None,
                    from_step: None,
                    to_step: None,
                    at: now(),
                })
                .await
                .unwrap();
        }
        let actors: Vec<Actor> = store
            .list_audit(&pid)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.actor)
            .collect();
        assert_eq!(
            actors,
            vec![Actor::user("system"), Actor::System, Actor::user("user:x")]
        );

        let open = opening("p1", &["b1"]);
        let branch_id = open.branches[0].id.clone();
        store.create_branch_states(open).await.unwrap();
        let mut branch = store.load_branch_state(&branch_id).await.unwrap().unwrap();
        branch.status = BranchStatus::Approved;
        branch.completed_by = Some(Actor::user("system"));
        let saved = store.update_branch_state(&branch, 0).await.unwrap();
        assert_eq!(saved.completed_by, Some(Actor::user("system")));
    }

    #[tokio::test]
    async fn test_open_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("accredit.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.register_participant(&Participant::new("p1")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store
            .load_participant(&ParticipantId::from("p1"))
            .await
            .unwrap()
            .is_some());
    }
}
