//! Workflow steps and the forward-only graph they compile into.
//!
//! Steps arrive as JSON/YAML objects tagged by `type`:
//!
//! ```yaml
//! - type: action
//!   name: stop
//!   action_id: 6f0c...
//!   on_failure: notify
//! - type: condition
//!   condition: { operator: equals, left: { step_result: 0, path: status }, right: completed }
//!   on_true: end
//!   on_false: 2
//! - type: delay
//!   name: notify
//!   duration_seconds: 30
//! ```
//!
//! Edge targets are a step index, a step name or `end`. A missing edge
//! falls through to the next step.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::condition::Expr;
use crate::error::{CloudoptError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action {
        action_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_success: Option<StepTarget>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_failure: Option<StepTarget>,
    },
    Condition {
        condition: Expr,
        #[serde(default, alias = "true_branch", skip_serializing_if = "Option::is_none")]
        on_true: Option<StepTarget>,
        #[serde(default, alias = "false_branch", skip_serializing_if = "Option::is_none")]
        on_false: Option<StepTarget>,
    },
    Delay {
        duration_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_success: Option<StepTarget>,
    },
}

impl Step {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Action { .. } => "action",
            StepKind::Condition { .. } => "condition",
            StepKind::Delay { .. } => "delay",
        }
    }

    /// `"<index> (<name>)"`, or just the index for unnamed steps.
    pub fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) => format!("{index} ({name})"),
            None => index.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepTarget {
    Index(usize),
    Name(String),
}

/// Reserved target name that ends the workflow.
pub const END: &str = "end";

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Step(usize),
    End,
}

/// Resolved edges of one step. For a condition `on_success` is the true
/// branch and `on_failure` the false branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edges {
    pub on_success: Next,
    /// `None` means a failure ends the workflow as failed.
    pub on_failure: Option<Next>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepGraph {
    edges: Vec<Edges>,
}

impl StepGraph {
    pub fn edges(&self, index: usize) -> Option<Edges> {
        self.edges.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Parse raw step objects. Errors name the offending step index.
pub fn parse_steps(raw: &[Value]) -> Result<Vec<Step>> {
    if raw.is_empty() {
        return Err(CloudoptError::InvalidWorkflow(
            "workflow must have at least one step".to_string(),
        ));
    }
    raw.iter()
        .enumerate()
        .map(|(i, value)| {
            if value.get("type").and_then(Value::as_str).is_none() {
                return Err(CloudoptError::InvalidWorkflow(format!(
                    "step {i} is missing its type"
                )));
            }
            serde_json::from_value(value.clone())
                .map_err(|e| CloudoptError::InvalidWorkflow(format!("step {i}: {e}")))
        })
        .collect()
}

/// Check names, branches and references, and resolve every edge. Edges
/// must point strictly forward, so every compiled graph terminates.
pub fn compile(steps: &[Step]) -> Result<StepGraph> {
    if steps.is_empty() {
        return Err(CloudoptError::InvalidWorkflow(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut names: HashMap<&str, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        let Some(name) = step.name.as_deref() else {
            continue;
        };
        if name.trim().is_empty() || name == END {
            return Err(CloudoptError::InvalidWorkflow(format!(
                "step {i}: name {name:?} is reserved or empty"
            )));
        }
        if let Some(first) = names.insert(name, i) {
            return Err(CloudoptError::InvalidWorkflow(format!(
                "step {i}: name {name:?} already used by step {first}"
            )));
        }
    }

    let resolve = |from: usize, target: &Option<StepTarget>| -> Result<Next> {
        let next = match target {
            None => fallthrough(from, steps.len()),
            Some(StepTarget::Name(name)) if name == END => Next::End,
            Some(StepTarget::Name(name)) => match names.get(name.as_str()) {
                Some(&to) => Next::Step(to),
                None => {
                    return Err(CloudoptError::InvalidWorkflow(format!(
                        "step {from}: unknown target {name:?}"
                    )))
                }
            },
            Some(StepTarget::Index(to)) if *to >= steps.len() => {
                return Err(CloudoptError::InvalidWorkflow(format!(
                    "step {from}: target {to} is out of range"
                )))
            }
            Some(StepTarget::Index(to)) => Next::Step(*to),
        };
        if let Next::Step(to) = next {
            if to <= from {
                return Err(CloudoptError::InvalidWorkflow(format!(
                    "step {from}: target {to} does not point forward"
                )));
            }
        }
        Ok(next)
    };

    let mut edges = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let e = match &step.kind {
            StepKind::Action {
                on_success,
                on_failure,
                ..
            } => Edges {
                on_success: resolve(i, on_success)?,
                on_failure: match on_failure {
                    Some(_) => Some(resolve(i, on_failure)?),
                    None => None,
                },
            },
            StepKind::Condition {
                condition,
                on_true,
                on_false,
            } => {
                if on_true.is_none() && on_false.is_none() {
                    return Err(CloudoptError::InvalidWorkflow(format!(
                        "step {i}: condition needs on_true or on_false"
                    )));
                }
                if let Some(bad) = condition.step_refs().into_iter().find(|r| *r >= i) {
                    return Err(CloudoptError::InvalidWorkflow(format!(
                        "step {i}: condition reads step {bad}, which has not run yet"
                    )));
                }
                Edges {
                    on_success: resolve(i, on_true)?,
                    on_failure: Some(resolve(i, on_false)?),
                }
            }
            StepKind::Delay { on_success, .. } => Edges {
                on_success: resolve(i, on_success)?,
                on_failure: None,
            },
        };
        edges.push(e);
    }
    Ok(StepGraph { edges })
}

fn fallthrough(from: usize, len: usize) -> Next {
    if from + 1 < len {
        Next::Step(from + 1)
    } else {
        Next::End
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
