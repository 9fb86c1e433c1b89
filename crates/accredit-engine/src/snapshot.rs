use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use accredit_core::error::{Result, WorkflowError};
use accredit_core::types::{StepId, WorkflowId};
use accredit_core::workflow::{Step, Workflow};

/// Version of the snapshot layout written into every snapshot.
pub const SNAPSHOT_FORMAT: u32 = 1;

/// Self-contained copy of a workflow's step graph.
///
/// Steps reference each other only by id, so a snapshot never points back
/// into the live schema. Back-edges (rework loops) are allowed: resolving a
/// transition is a single lookup, never a walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub format: u32,
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    steps: Vec<Step>,
    #[serde(skip)]
    index: HashMap<StepId, usize>,
}

/// Serialize a live workflow into snapshot JSON.
pub fn serialize(workflow: &Workflow) -> Result<String> {
    WorkflowSnapshot::from_workflow(workflow).to_json()
}

/// Rehydrate snapshot JSON, rejecting dangling step references.
pub fn deserialize(json: &str) -> Result<WorkflowSnapshot> {
    WorkflowSnapshot::from_json(json)
}

impl WorkflowSnapshot {
    /// Deep-copy every step of `workflow`, ordered by display order.
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let mut steps = workflow.steps.clone();
        steps.sort_by_key(|s| s.order);

        let index = build_index(&steps);
        Self {
            format: SNAPSHOT_FORMAT,
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            steps,
            index,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut snapshot: Self = serde_json::from_str(json)
            .map_err(|e| WorkflowError::InvalidSnapshot(format!("malformed snapshot: {}", e)))?;
        snapshot.index = build_index(&snapshot.steps);
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// sha-256 of the snapshot JSON, hex encoded.
    pub fn fingerprint(&self) -> Result<String> {
        let json = self.to_json()?;
        Ok(format!("{:x}", Sha256::digest(json.as_bytes())))
    }

    /// Referential integrity: unique ids, and every target and fork branch
    /// names a step of this snapshot.
    pub fn validate(&self) -> Result<()> {
        if self.format != SNAPSHOT_FORMAT {
            return Err(WorkflowError::InvalidSnapshot(format!(
                "unsupported snapshot format {}",
                self.format
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(&step.id) {
                return Err(WorkflowError::InvalidSnapshot(format!(
                    "duplicate step id {}",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for (field, target) in step.targets() {
                if !self.index.contains_key(target) {
                    return Err(WorkflowError::InvalidSnapshot(format!(
                        "step {} {} references unknown step {}",
                        step.id, field, target
                    )));
                }
            }
            if let Some(config) = step.fork_config() {
                for branch in &config.branches {
                    if !self.index.contains_key(&branch.branch_step_id) {
                        return Err(WorkflowError::InvalidSnapshot(format!(
                            "fork {} branch references unknown step {}",
                            step.id, branch.branch_step_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// The unique step flagged as entry point.
    pub fn entry_step(&self) -> Result<&Step> {
        let mut entries = self.steps.iter().filter(|s| s.is_entry_point);
        let entry = entries
            .next()
            .ok_or_else(|| WorkflowError::NoEntryPoint(self.workflow_id.0.clone()))?;
        if let Some(other) = entries.next() {
            return Err(WorkflowError::InvalidSnapshot(format!(
                "multiple entry points: {} and {}",
                entry.id, other.id
            )));
        }
        Ok(entry)
    }
}

fn build_index(steps: &[Step]) -> HashMap<StepId, usize> {
    steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect()
}
