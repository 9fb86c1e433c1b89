use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::types::Action;

/// Why an action cannot be applied to a participant right now.
///
/// Shared by the transition engine and the batch evaluator so both give the
/// same answer for the same participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ineligibility {
    NoVersion,
    NoCurrentStep,
    StepNotInSnapshot,
    NoTargetForAction,
    UnsupportedAction,
    ForkInProgress,
    ParticipantNotFound,
    SnapshotInvalid,
}

impl Ineligibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoVersion => "no-version",
            Self::NoCurrentStep => "no-current-step",
            Self::StepNotInSnapshot => "step-not-in-snapshot",
            Self::NoTargetForAction => "no-target-for-action",
            Self::UnsupportedAction => "unsupported-action",
            Self::ForkInProgress => "fork-in-progress",
            Self::ParticipantNotFound => "participant-not-found",
            Self::SnapshotInvalid => "snapshot-invalid",
        }
    }

    /// HTTP-equivalent status.
    pub fn status(&self) -> u16 {
        match self {
            Self::StepNotInSnapshot | Self::ParticipantNotFound => 404,
            _ => 400,
        }
    }
}

impl fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    // Lookups
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow version not found: {0}")]
    VersionNotFound(String),

    #[error("Step {step} not found in version {version}")]
    StepNotFound { step: String, version: String },

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("Branch state not found: {0}")]
    BranchNotFound(String),

    #[error("Fork instance not found: {0}")]
    ForkNotFound(String),

    // Structure
    #[error("Workflow {0} has no entry point")]
    NoEntryPoint(String),

    #[error("Invalid workflow snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Invalid fork configuration on step {step}: {message}")]
    InvalidForkConfig { step: String, message: String },

    // Eligibility
    #[error("Action {action} not allowed for participant {participant}: {reason}")]
    Ineligible {
        participant: String,
        action: Action,
        reason: Ineligibility,
    },

    #[error("Branch {0} is already closed")]
    BranchClosed(String),

    #[error("Fork instance {0} has already joined")]
    ForkAlreadyJoined(String),

    // Concurrency
    #[error("Concurrent modification of {0}, reload and retry")]
    Conflict(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkflowError {
    /// HTTP-equivalent status code for callers that surface errors over a wire.
    pub fn status(&self) -> u16 {
        match self {
            Self::WorkflowNotFound(_)
            | Self::VersionNotFound(_)
            | Self::StepNotFound { .. }
            | Self::ParticipantNotFound(_)
            | Self::BranchNotFound(_)
            | Self::ForkNotFound(_) => 404,
            Self::NoEntryPoint(_)
            | Self::InvalidSnapshot(_)
            | Self::InvalidForkConfig { .. }
            | Self::BranchClosed(_) => 400,
            Self::Ineligible { reason, .. } => reason.status(),
            Self::Conflict(_) | Self::ForkAlreadyJoined(_) => 409,
            Self::Database(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Io(_)
            | Self::Json(_) => 500,
        }
    }

    /// Only concurrent-modification errors are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Client-caused errors (4xx other than conflicts).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status()) && !matches!(self, Self::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
