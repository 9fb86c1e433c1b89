//! Approval workflow runtime.
//!
//! A participant is pinned to an immutable [`WorkflowSnapshot`] when it
//! enters a workflow. From there the [`TransitionEngine`] moves it along the
//! step graph one action at a time, the [`ForkCoordinator`] runs parallel
//! branches and converges them, and the [`SlaMonitor`] watches how long
//! participants sit on a step. The [`BatchEvaluator`] answers "would this
//! action succeed?" for many participants using the same resolution rule.

mod audit;
pub mod batch;
pub mod engine;
pub mod entry;
pub mod fork;
pub mod journal;
mod position;
pub mod scheduler;
pub mod sla;
pub mod snapshot;
pub mod transition;

pub use batch::{BatchEligibility, BatchEvaluator, IneligibleParticipant};
pub use engine::{EngineBuilder, WorkflowEngine};
pub use entry::{EntryOutcome, EntryResolver};
pub use fork::{decide_join, BranchResolution, ForkCoordinator, JoinDecision, JoinOutcome};
pub use journal::EventJournal;
pub use scheduler::{ScanJob, SchedulerStatus, SlaScheduler};
pub use sla::{classify, ScanSummary, SlaActionTaken, SlaMonitor, SlaStatus};
pub use snapshot::{deserialize, serialize, WorkflowSnapshot};
pub use transition::{can_transition, ExpectedPosition, Resolution, TransitionEngine, TransitionOutcome};
