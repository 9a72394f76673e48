use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::{CloudoptError, Result};
use crate::recommendation::ResourceRef;
use crate::store::Record;
use crate::types::{ActionKind, ActionStatus, ApprovalStatus, ExecutionStatus};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff. Attempt `n` failing schedules the
/// next attempt `backoff_seconds × 2^(n−1)` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_seconds: u64,
}

const MAX_BACKOFF_SECONDS: u64 = 7 * 24 * 3600;

impl RetryPolicy {
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let secs = self
            .backoff_seconds
            .saturating_mul(1u64 << exp)
            .min(MAX_BACKOFF_SECONDS);
        Duration::seconds(secs as i64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            backoff_seconds: cfg.backoff_seconds,
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_id: Option<Uuid>,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    pub action_type: ActionKind,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub status: ActionStatus,
    pub requires_approval: bool,
    pub approval_status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Action {
    /// True when the approval gate permits execution.
    pub fn approval_satisfied(&self) -> bool {
        !self.requires_approval || self.approval_status == ApprovalStatus::Approved
    }

    pub fn retries_left(&self) -> bool {
        self.attempts < self.retry.max_attempts
    }

    /// Key for per-resource mutual exclusion. Actions without a resource only
    /// exclude themselves.
    pub fn lock_key(&self) -> String {
        match &self.resource {
            Some(r) => format!("{}:{}", self.account_id, r.id),
            None => format!("action:{}", self.id),
        }
    }

    /// Checked status change.
    pub fn transition_to(&mut self, target: ActionStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(CloudoptError::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: format!("action {} cannot move to {target}", self.id),
            });
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Every precondition `execute` checks, in order, before anything is
    /// mutated.
    pub fn check_executable(&self) -> Result<()> {
        if !self.approval_satisfied() {
            return Err(CloudoptError::ApprovalRequired(self.id));
        }
        if !self.status.is_executable() {
            return Err(CloudoptError::InvalidTransition {
                from: self.status.to_string(),
                to: ActionStatus::InProgress.to_string(),
                reason: "only pending or failed actions can be executed".to_string(),
            });
        }
        if !self.retries_left() {
            return Err(CloudoptError::RetryExhausted {
                id: self.id,
                attempts: self.attempts,
            });
        }
        Ok(())
    }
}

impl Record for Action {
    const TABLE: &'static str = "actions";

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Input for direct action creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAction {
    pub account_id: String,
    #[serde(default)]
    pub resource: Option<ResourceRef>,
    pub action_type: ActionKind,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default = "default_requires_approval")]
    pub requires_approval: bool,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recommendation_id: Option<Uuid>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    pub created_by: String,
}

fn default_requires_approval() -> bool {
    true
}

// ---------------------------------------------------------------------------
// ActionApproval
// ---------------------------------------------------------------------------

/// Immutable approval decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionApproval {
    pub id: Uuid,
    pub action_id: Uuid,
    pub approver: String,
    pub decision: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record for ActionApproval {
    const TABLE: &'static str = "action_approvals";

    fn id(&self) -> Uuid {
        self.id
    }
}

// ---------------------------------------------------------------------------
// ActionExecution
// ---------------------------------------------------------------------------

/// One execution attempt of an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: Uuid,
    pub action_id: Uuid,
    pub executor: String,
    /// 1-indexed.
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub logs: String,
    /// This attempt moved the linked recommendation to `applied`.
    #[serde(default)]
    pub recommendation_applied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionExecution {
    pub fn start(action_id: Uuid, executor: &str, attempt: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_id,
            executor: executor.to_string(),
            attempt,
            status: ExecutionStatus::InProgress,
            start_time: now,
            end_time: None,
            result: None,
            logs: String::new(),
            recommendation_applied: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn finish(&mut self, status: ExecutionStatus, logs: String, now: DateTime<Utc>) {
        self.status = status;
        self.logs = logs;
        self.end_time = Some(now);
        self.updated_at = now;
    }
}

impl Record for ActionExecution {
    const TABLE: &'static str = "action_executions";

    fn id(&self) -> Uuid {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
