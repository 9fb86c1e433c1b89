use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Action, StepId, VersionId, WorkflowId};

/// Lifecycle of a live workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

/// A live, editable workflow definition scoped to a tenant and event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub tenant_id: String,
    #[serde(default)]
    pub event_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Steps in display order.
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId(id.into()),
            tenant_id: tenant_id.into(),
            event_id: None,
            name: name.into(),
            status: WorkflowStatus::Published,
            steps: Vec::new(),
        }
    }

    /// Append a step, assigning it the next display order.
    pub fn with_step(mut self, mut step: Step) -> Self {
        step.order = self.steps.len() as u32;
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }
}

/// Final status a terminal step assigns to the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Approved,
    Rejected,
}

/// How the branches of a fork converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Wait for every branch; any rejection rejects.
    All,
    /// First resolved branch decides.
    Any,
    /// Fires once `required` branches agree on the same action.
    Quorum { required: usize },
}

/// One branch declared by a fork step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkBranch {
    pub branch_step_id: StepId,
    #[serde(default)]
    pub label: String,
}

/// Payload of a fork step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkConfig {
    pub branches: Vec<ForkBranch>,
    pub join_policy: JoinPolicy,
}

impl ForkConfig {
    pub fn new(join_policy: JoinPolicy) -> Self {
        Self {
            branches: Vec::new(),
            join_policy,
        }
    }

    pub fn with_branch(mut self, branch_step_id: impl Into<String>, label: impl Into<String>) -> Self {
        self.branches.push(ForkBranch {
            branch_step_id: StepId(branch_step_id.into()),
            label: label.into(),
        });
        self
    }

    /// Structural checks that a publish-time validator should already have done.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.branches.is_empty() {
            return Err("fork declares no branches".to_string());
        }
        if let JoinPolicy::Quorum { required } = self.join_policy {
            if required == 0 || required > self.branches.len() {
                return Err(format!(
                    "quorum of {} is not satisfiable with {} branches",
                    required,
                    self.branches.len()
                ));
            }
        }
        Ok(())
    }
}

/// Step type with its type-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Review,
    Approval,
    Notification,
    Fork(ForkConfig),
    Terminal { outcome: TerminalOutcome },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Approval => "approval",
            Self::Notification => "notification",
            Self::Fork(_) => "fork",
            Self::Terminal { .. } => "terminal",
        }
    }
}

/// What the SLA monitor does once a step breaches its allotted duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaAction {
    #[default]
    Notify,
    Escalate,
    AutoApprove,
    AutoReject,
}

/// A node of the workflow graph. Targets reference other steps by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub order: u32,
    pub kind: StepKind,
    #[serde(default)]
    pub is_entry_point: bool,
    #[serde(default)]
    pub is_terminal: bool,
    /// Target on approve.
    #[serde(default)]
    pub next_step_id: Option<StepId>,
    #[serde(default)]
    pub rejection_target_id: Option<StepId>,
    #[serde(default)]
    pub bypass_target_id: Option<StepId>,
    #[serde(default)]
    pub escalation_target_id: Option<StepId>,
    #[serde(default)]
    pub sla_duration_minutes: Option<u32>,
    #[serde(default)]
    pub sla_action: SlaAction,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: StepId(id),
            order: 0,
            kind,
            is_entry_point: false,
            is_terminal: false,
            next_step_id: None,
            rejection_target_id: None,
            bypass_target_id: None,
            escalation_target_id: None,
            sla_duration_minutes: None,
            sla_action: SlaAction::Notify,
        }
    }

    pub fn review(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Review)
    }

    pub fn approval(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Approval)
    }

    pub fn fork(id: impl Into<String>, config: ForkConfig) -> Self {
        Self::new(id, StepKind::Fork(config))
    }

    pub fn terminal(id: impl Into<String>, outcome: TerminalOutcome) -> Self {
        let mut step = Self::new(id, StepKind::Terminal { outcome });
        step.is_terminal = true;
        step
    }

    pub fn entry(mut self) -> Self {
        self.is_entry_point = true;
        self
    }

    pub fn final_on_approve(mut self) -> Self {
        self.is_terminal = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn on_approve(mut self, target: impl Into<String>) -> Self {
        self.next_step_id = Some(StepId(target.into()));
        self
    }

    pub fn on_reject(mut self, target: impl Into<String>) -> Self {
        self.rejection_target_id = Some(StepId(target.into()));
        self
    }

    pub fn on_bypass(mut self, target: impl Into<String>) -> Self {
        self.bypass_target_id = Some(StepId(target.into()));
        self
    }

    pub fn on_escalate(mut self, target: impl Into<String>) -> Self {
        self.escalation_target_id = Some(StepId(target.into()));
        self
    }

    pub fn with_sla(mut self, minutes: u32, action: SlaAction) -> Self {
        self.sla_duration_minutes = Some(minutes);
        self.sla_action = action;
        self
    }

    /// Configured target for an action, if any.
    pub fn target_for(&self, action: Action) -> Option<&StepId> {
        match action {
            Action::Approve => self.next_step_id.as_ref(),
            Action::Reject => self.rejection_target_id.as_ref(),
            Action::Bypass => self.bypass_target_id.as_ref(),
            Action::Escalate => self.escalation_target_id.as_ref(),
        }
    }

    pub fn fork_config(&self) -> Option<&ForkConfig> {
        match &self.kind {
            StepKind::Fork(config) => Some(config),
            _ => None,
        }
    }

    /// A step whose approval ends the workflow when no next step is set.
    pub fn is_final(&self) -> bool {
        self.is_terminal || matches!(self.kind, StepKind::Terminal { .. })
    }

    /// All non-null target pointers with the field they came from.
    pub fn targets(&self) -> impl Iterator<Item = (&'static str, &StepId)> {
        [
            ("next_step_id", self.next_step_id.as_ref()),
            ("rejection_target_id", self.rejection_target_id.as_ref()),
            ("bypass_target_id", self.bypass_target_id.as_ref()),
            ("escalation_target_id", self.escalation_target_id.as_ref()),
        ]
        .into_iter()
        .filter_map(|(field, target)| target.map(|t| (field, t)))
    }
}

/// An immutable, versioned copy of a workflow's step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: VersionId,
    pub workflow_id: WorkflowId,
    pub version: u32,
    /// Serialized snapshot JSON.
    pub snapshot: String,
    /// sha-256 of the snapshot, used to reuse unchanged versions.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builder() {
        let step = Step::review("a")
            .entry()
            .named("Document check")
            .on_approve("b")
            .on_reject("r")
            .with_sla(60, SlaAction::Escalate);

        assert!(step.is_entry_point);
        assert_eq!(step.name, "Document check");
        assert_eq!(step.target_for(Action::Approve), Some(&StepId::from("b")));
        assert_eq!(step.target_for(Action::Reject), Some(&StepId::from("r")));
        assert_eq!(step.target_for(Action::Bypass), None);
        assert_eq!(step.sla_duration_minutes, Some(60));
        assert_eq!(step.targets().count(), 2);
    }

    #[test]
    fn test_terminal_step_is_final() {
        let step = Step::terminal("done", TerminalOutcome::Approved);
        assert!(step.is_final());
        assert!(!Step::review("x").is_final());
        assert!(Step::review("x").final_on_approve().is_final());
    }

    #[test]
    fn test_fork_config_validation() {
        let ok = ForkConfig::new(JoinPolicy::All).with_branch("b1", "Security");
        assert!(ok.validate().is_ok());

        let empty = ForkConfig::new(JoinPolicy::All);
        assert!(empty.validate().is_err());

        let quorum = ForkConfig::new(JoinPolicy::Quorum { required: 3 })
            .with_branch("b1", "")
            .with_branch("b2", "");
        assert!(quorum.validate().is_err());
    }

    #[test]
    fn test_step_kind_serde_tagged() {
        let step = Step::fork(
            "f",
            ForkConfig::new(JoinPolicy::Quorum { required: 2 })
                .with_branch("b1", "Security")
                .with_branch("b2", "Media"),
        );
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["kind"]["type"], "fork");
        assert_eq!(json["kind"]["join_policy"]["kind"], "quorum");
        assert_eq!(json["kind"]["join_policy"]["required"], 2);

        let parsed: Step = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, step);
    }

    #[test]
    fn test_workflow_with_step_assigns_order() {
        let wf = Workflow::new("wf", "tenant", "Media")
            .with_step(Step::review("a"))
            .with_step(Step::review("b"));
        assert_eq!(wf.steps[0].order, 0);
        assert_eq!(wf.steps[1].order, 1);
        assert!(wf.step(&StepId::from("b")).is_some());
    }
}
