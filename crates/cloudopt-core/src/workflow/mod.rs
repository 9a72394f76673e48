//! Workflows: ordered action, condition and delay steps run as one unit.

pub mod condition;
pub mod engine;
pub mod schedule;
pub mod step;

pub use self::condition::{result_key, Expr, Operand, StepContext};
pub use self::engine::WorkflowEngine;
pub use self::schedule::{CronSchedule, TriggerConfig};
pub use self::step::{compile, parse_steps, Edges, Next, Step, StepGraph, StepKind, StepTarget};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::Record;
use crate::types::{ExecutionStatus, TriggerType, WorkflowStatus};

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub organization_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: TriggerConfig,
    pub steps: Vec<Step>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Ids of every action the workflow's steps run.
    pub fn action_ids(&self) -> Vec<Uuid> {
        self.steps
            .iter()
            .filter_map(|s| match s.kind {
                StepKind::Action { action_id, .. } => Some(action_id),
                _ => None,
            })
            .collect()
    }
}

impl Record for Workflow {
    const TABLE: &'static str = "workflows";

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Input for [`WorkflowEngine::create`]. Steps stay raw JSON until
/// validation so errors can name the step they came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub organization_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: TriggerConfig,
    pub steps: Vec<Value>,
}

fn default_trigger_type() -> TriggerType {
    TriggerType::Manual
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// One visited step, in the order the driver ran them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub kind: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub initiator: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// `step_<index>` → step result. Entries are never rewritten.
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    #[serde(default)]
    pub trail: Vec<StepRecord>,
    /// Next step to run while the execution is in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<usize>,
    /// Set while parked on a long delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn open(workflow_id: Uuid, initiator: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            initiator: initiator.to_string(),
            status: ExecutionStatus::InProgress,
            start_time: now,
            end_time: None,
            results: BTreeMap::new(),
            trail: Vec::new(),
            cursor: Some(0),
            resume_at: None,
            failed_step: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_parked(&self) -> bool {
        self.status == ExecutionStatus::InProgress && self.resume_at.is_some()
    }

    /// Close the execution. No-op once it is already finished.
    pub fn close(&mut self, status: ExecutionStatus, message: Option<String>, now: DateTime<Utc>) {
        if self.status.is_finished() {
            return;
        }
        self.status = status;
        self.message = message;
        self.cursor = None;
        self.resume_at = None;
        self.end_time = Some(now);
        self.updated_at = now;
    }

    pub fn summary(&self) -> WorkflowResult {
        WorkflowResult {
            workflow_id: self.workflow_id,
            execution_id: self.id,
            status: self.status,
            steps_run: self.trail.len(),
            failed_step: self.failed_step,
            resume_at: self.resume_at,
            message: self.message.clone(),
        }
    }
}

impl Record for WorkflowExecution {
    const TABLE: &'static str = "workflow_executions";

    fn id(&self) -> Uuid {
        self.id
    }
}

/// What a caller of `execute` gets back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub steps_run: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    /// Set when the run is parked on a delay rather than finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkflowResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_ids_in_step_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let steps = parse_steps(&[
            json!({"type": "action", "action_id": a}),
            json!({"type": "delay", "duration_seconds": 1}),
            json!({"type": "action", "action_id": b}),
        ])
        .unwrap();
        let now = Utc::now();
        let wf = Workflow {
            id: Uuid::new_v4(),
            organization_id: "org".into(),
            name: "wf".into(),
            description: None,
            trigger_type: TriggerType::Manual,
            trigger_config: TriggerConfig::default(),
            steps,
            status: WorkflowStatus::Active,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(wf.action_ids(), vec![a, b]);
    }

    #[test]
    fn close_is_final() {
        let now = Utc::now();
        let mut exec = WorkflowExecution::open(Uuid::new_v4(), "tester", now);
        exec.close(ExecutionStatus::Cancelled, Some("stop".into()), now);
        exec.close(ExecutionStatus::Completed, None, now);
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert_eq!(exec.message.as_deref(), Some("stop"));
        assert_eq!(exec.cursor, None);
    }
}
