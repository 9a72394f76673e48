//! Action lifecycle: creation, the approval gate, execution against a
//! provider, bounded retry and restart recovery.
//!
//! State machine (`ActionStatus`):
//!
//! ```text
//! pending ──(approved & due)──▶ in_progress ──▶ completed
//!    │                              │
//!    │                              └──▶ failed ──(retry budget left)──▶ in_progress
//!    └──▶ cancelled ◀───────────────────────┘
//! ```
//!
//! `execute` checks every precondition before it mutates anything, then
//! claims the action in one store transaction and closes it in another. The
//! provider call in between is the only suspension point; provider failures
//! end up as persisted `failed` state, never as an `Err`.

pub mod locks;

pub use self::locks::ResourceLocks;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::{Action, ActionApproval, ActionExecution, NewAction, RetryPolicy};
use crate::config::Config;
use crate::error::{CloudoptError, Result};
use crate::provider::{self, ProviderAdapter, ProviderMap};
use crate::recommendation::Recommendation;
use crate::store::Store;
use crate::types::{
    ActionKind, ActionStatus, ApprovalStatus, ExecutionStatus, RecommendationStatus,
    RecommendationType, WorkflowStatus,
};
use crate::workflow::Workflow;

/// Outcome of one `execute` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub action_id: Uuid,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// `status == completed`, so workflow conditions can test a bool.
    pub success: bool,
    pub attempt: u32,
    pub message: String,
    pub details: Value,
    pub recommendation_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Filter for [`ActionEngine::list`].
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub account_id: Option<String>,
    pub status: Option<ActionStatus>,
    pub recommendation_id: Option<Uuid>,
}

enum Outcome {
    Succeeded { message: String, details: Value },
    Failed { message: String, details: Value },
}

pub struct ActionEngine<S: Store> {
    store: Arc<S>,
    retry: RetryPolicy,
    provider_timeout: StdDuration,
    locks: ResourceLocks,
}

impl<S: Store> ActionEngine<S> {
    pub fn new(store: Arc<S>, config: &Config) -> Self {
        Self {
            store,
            retry: config.retry.clone().into(),
            provider_timeout: StdDuration::from_secs(config.execution.provider_timeout_seconds),
            locks: ResourceLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Turn an open recommendation into an action. With
    /// `approval_required = false` the action is pre-approved.
    pub fn create_from_recommendation(
        &self,
        recommendation_id: Uuid,
        approval_required: bool,
        created_by: &str,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Action> {
        let now = Utc::now();
        self.store.write(|t| {
            let rec: Recommendation = t.require(recommendation_id)?;
            if rec.status != RecommendationStatus::Open {
                return Err(CloudoptError::Validation(format!(
                    "recommendation {recommendation_id} is {}, not open",
                    rec.status
                )));
            }

            let action = Action {
                id: Uuid::new_v4(),
                recommendation_id: Some(rec.id),
                account_id: rec.account_id.clone(),
                resource: rec.resource.clone(),
                action_type: rec.recommendation_type.action_kind(),
                parameters: parameters_for(&rec),
                status: ActionStatus::Pending,
                requires_approval: approval_required,
                approval_status: if approval_required {
                    ApprovalStatus::Pending
                } else {
                    ApprovalStatus::Approved
                },
                scheduled_time,
                retry: self.retry,
                attempts: 0,
                next_attempt_at: None,
                created_by: created_by.to_string(),
                result: None,
                executed_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            };
            t.insert(&action)?;
            info!(
                action_id = %action.id,
                recommendation_id = %rec.id,
                action_type = %action.action_type,
                requires_approval = approval_required,
                "action created from recommendation"
            );
            Ok(action)
        })
    }

    /// Create an action directly, e.g. as the target of a workflow step.
    pub fn create(&self, new: NewAction) -> Result<Action> {
        if new.account_id.trim().is_empty() {
            return Err(CloudoptError::Validation("account_id is required".to_string()));
        }
        if new.action_type == ActionKind::AddTags && !new.parameters.contains_key("tags") {
            return Err(CloudoptError::Validation(
                "add_tags actions need a 'tags' parameter".to_string(),
            ));
        }
        let now = Utc::now();
        let action = Action {
            id: Uuid::new_v4(),
            recommendation_id: new.recommendation_id,
            account_id: new.account_id,
            resource: new.resource,
            action_type: new.action_type,
            parameters: new.parameters,
            status: ActionStatus::Pending,
            requires_approval: new.requires_approval,
            approval_status: if new.requires_approval {
                ApprovalStatus::Pending
            } else {
                ApprovalStatus::Approved
            },
            scheduled_time: new.scheduled_time,
            retry: new.retry.unwrap_or(self.retry),
            attempts: 0,
            next_attempt_at: None,
            created_by: new.created_by,
            result: None,
            executed_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.write(|t| {
            if let Some(rec_id) = action.recommendation_id {
                t.require::<Recommendation>(rec_id)?;
            }
            t.insert(&action)
        })?;
        info!(action_id = %action.id, action_type = %action.action_type, "action created");
        Ok(action)
    }

    // -----------------------------------------------------------------------
    // Approval gate
    // -----------------------------------------------------------------------

    pub fn approve(&self, id: Uuid, approver: &str, comment: Option<String>) -> Result<Action> {
        self.decide(id, approver, comment, ApprovalStatus::Approved)
    }

    /// Reject an action. A rejected action is also cancelled.
    pub fn reject(&self, id: Uuid, approver: &str, comment: Option<String>) -> Result<Action> {
        self.decide(id, approver, comment, ApprovalStatus::Rejected)
    }

    fn decide(
        &self,
        id: Uuid,
        approver: &str,
        comment: Option<String>,
        decision: ApprovalStatus,
    ) -> Result<Action> {
        let now = Utc::now();
        self.store.write(|t| {
            let mut action: Action = t.require(id)?;
            if !action.requires_approval {
                return Err(CloudoptError::Validation(format!(
                    "action {id} does not require approval"
                )));
            }
            if action.approval_status != ApprovalStatus::Pending {
                return Err(CloudoptError::Validation(format!(
                    "action {id} was already {}",
                    action.approval_status
                )));
            }

            action.approval_status = decision;
            action.updated_at = now;
            if decision == ApprovalStatus::Rejected && action.status != ActionStatus::Cancelled {
                action.transition_to(ActionStatus::Cancelled, now)?;
            }

            t.insert(&ActionApproval {
                id: Uuid::new_v4(),
                action_id: id,
                approver: approver.to_string(),
                decision,
                comment,
                created_at: now,
            })?;
            t.update(&action)?;
            info!(action_id = %id, approver, decision = %decision, "approval recorded");
            Ok(action)
        })
    }

    // -----------------------------------------------------------------------
    // Cancellation and scheduling
    // -----------------------------------------------------------------------

    pub fn cancel(&self, id: Uuid) -> Result<Action> {
        let now = Utc::now();
        self.store.write(|t| {
            let mut action: Action = t.require(id)?;
            action.transition_to(ActionStatus::Cancelled, now)?;
            action.next_attempt_at = None;
            t.update(&action)?;
            info!(action_id = %id, "action cancelled");
            Ok(action)
        })
    }

    /// Set `scheduled_time` on each pending action. All or nothing.
    pub fn schedule(&self, ids: &[Uuid], time: DateTime<Utc>) -> Result<Vec<Action>> {
        let now = Utc::now();
        self.store.write(|t| {
            let mut scheduled = Vec::with_capacity(ids.len());
            for id in ids {
                let mut action: Action = t.require(*id)?;
                if action.status != ActionStatus::Pending {
                    return Err(CloudoptError::Validation(format!(
                        "action {id} is {}; only pending actions can be scheduled",
                        action.status
                    )));
                }
                action.scheduled_time = Some(time);
                action.updated_at = now;
                t.update(&action)?;
                scheduled.push(action);
            }
            Ok(scheduled)
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: Uuid) -> Result<Action> {
        self.store.require(id)
    }

    /// Newest first.
    pub fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>> {
        let mut actions = self.store.filter::<Action>(|a| {
            filter.account_id.as_deref().map_or(true, |acct| a.account_id == acct)
                && filter.status.map_or(true, |s| a.status == s)
                && filter
                    .recommendation_id
                    .map_or(true, |r| a.recommendation_id == Some(r))
        })?;
        actions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(actions)
    }

    /// Execution attempts, oldest first.
    pub fn executions(&self, action_id: Uuid) -> Result<Vec<ActionExecution>> {
        self.store.read(|t| {
            t.require::<Action>(action_id)?;
            let mut execs = t.filter::<ActionExecution>(|e| e.action_id == action_id)?;
            execs.sort_by_key(|e| e.attempt);
            Ok(execs)
        })
    }

    pub fn approvals(&self, action_id: Uuid) -> Result<Vec<ActionApproval>> {
        self.store.read(|t| {
            t.require::<Action>(action_id)?;
            let mut approvals = t.filter::<ActionApproval>(|a| a.action_id == action_id)?;
            approvals.sort_by_key(|a| a.created_at);
            Ok(approvals)
        })
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    pub async fn execute(
        &self,
        id: Uuid,
        provider: &dyn ProviderAdapter,
        executor: &str,
    ) -> Result<ExecutionResult> {
        self.execute_at(id, provider, executor, Utc::now()).await
    }

    /// [`execute`](Self::execute) with an explicit clock for timestamps and
    /// the retry schedule.
    pub async fn execute_at(
        &self,
        id: Uuid,
        provider: &dyn ProviderAdapter,
        executor: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecutionResult> {
        let action: Action = self.store.require(id)?;
        action.check_executable()?;

        let _guard = self.locks.acquire(&action.lock_key()).await;
        let (action, execution) = self.claim(id, executor, now)?;
        info!(
            action_id = %id,
            execution_id = %execution.id,
            attempt = execution.attempt,
            action_type = %action.action_type,
            "executing action"
        );

        let call = provider::perform(
            provider,
            action.action_type,
            action.resource.as_ref(),
            &action.parameters,
        );
        let outcome = match tokio::time::timeout(self.provider_timeout, call).await {
            Ok(Ok(res)) if res.success => Outcome::Succeeded {
                message: res.message,
                details: res.details,
            },
            Ok(Ok(res)) => Outcome::Failed {
                message: if res.message.is_empty() {
                    "provider reported failure".to_string()
                } else {
                    res.message
                },
                details: res.details,
            },
            Ok(Err(e)) => Outcome::Failed {
                message: e.to_string(),
                details: Value::Null,
            },
            Err(_) => Outcome::Failed {
                message: format!(
                    "provider call timed out after {}s",
                    self.provider_timeout.as_secs()
                ),
                details: Value::Null,
            },
        };

        self.finish(id, execution.id, outcome, now)
    }

    /// Re-check preconditions and open a new execution, atomically.
    fn claim(&self, id: Uuid, executor: &str, now: DateTime<Utc>) -> Result<(Action, ActionExecution)> {
        self.store.write(|t| {
            let mut action: Action = t.require(id)?;
            action.check_executable()?;
            let running = t.filter::<ActionExecution>(|e| {
                e.action_id == id && e.status == ExecutionStatus::InProgress
            })?;
            if !running.is_empty() {
                return Err(CloudoptError::InvalidTransition {
                    from: action.status.to_string(),
                    to: ActionStatus::InProgress.to_string(),
                    reason: format!("action {id} already has an execution in progress"),
                });
            }

            action.transition_to(ActionStatus::InProgress, now)?;
            action.attempts += 1;
            action.executed_at = Some(now);
            action.next_attempt_at = None;
            let execution = ActionExecution::start(id, executor, action.attempts, now);
            t.insert(&execution)?;
            t.update(&action)?;
            Ok((action, execution))
        })
    }

    /// Close the execution and the action; flip the recommendation on success.
    fn finish(
        &self,
        id: Uuid,
        execution_id: Uuid,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<ExecutionResult> {
        let result = self.store.write(|t| {
            let mut action: Action = t.require(id)?;
            let mut execution: ActionExecution = t.require(execution_id)?;
            let ts = now.to_rfc3339();

            let (status, message, details) = match outcome {
                Outcome::Succeeded { message, details } => {
                    execution.finish(
                        ExecutionStatus::Completed,
                        format!("Action executed at {ts}\nResult: {message}"),
                        now,
                    );
                    action.transition_to(ActionStatus::Completed, now)?;
                    action.completed_at = Some(now);

                    if let Some(rec_id) = action.recommendation_id {
                        match t.get::<Recommendation>(rec_id)? {
                            Some(mut rec) if rec.status == RecommendationStatus::Open => {
                                rec.transition_to(RecommendationStatus::Applied, now)?;
                                t.update(&rec)?;
                                execution.recommendation_applied = true;
                            }
                            Some(rec) => debug!(
                                recommendation_id = %rec_id,
                                status = %rec.status,
                                "recommendation already closed; not re-applied"
                            ),
                            None => warn!(recommendation_id = %rec_id, "linked recommendation missing"),
                        }
                    }
                    (ExecutionStatus::Completed, message, details)
                }
                Outcome::Failed { message, details } => {
                    execution.finish(
                        ExecutionStatus::Failed,
                        format!("Action execution failed at {ts}\nError: {message}"),
                        now,
                    );
                    action.transition_to(ActionStatus::Failed, now)?;
                    action.next_attempt_at = action
                        .retries_left()
                        .then(|| now + action.retry.backoff_after(action.attempts));
                    (ExecutionStatus::Failed, message, details)
                }
            };

            let payload = if status == ExecutionStatus::Completed {
                json!({ "message": message, "details": details })
            } else {
                json!({ "error": message, "details": details })
            };
            execution.result = Some(payload.clone());
            action.result = Some(payload);
            t.update(&execution)?;
            t.update(&action)?;

            Ok(ExecutionResult {
                action_id: id,
                execution_id,
                status,
                success: status == ExecutionStatus::Completed,
                attempt: execution.attempt,
                message,
                details,
                recommendation_applied: execution.recommendation_applied,
                next_attempt_at: action.next_attempt_at,
            })
        })?;

        if result.succeeded() {
            info!(action_id = %id, execution_id = %execution_id, "action completed");
        } else {
            warn!(
                action_id = %id,
                execution_id = %execution_id,
                attempt = result.attempt,
                error = %result.message,
                "action failed"
            );
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Scheduler entry points
    // -----------------------------------------------------------------------

    /// Actions the scheduler may run at `now`, in the order it runs them.
    pub fn due(&self, providers: &ProviderMap, now: DateTime<Utc>) -> Result<Vec<Action>> {
        self.store.read(|t| {
            let owned_by_workflows: HashSet<Uuid> = t
                .filter::<Workflow>(|w| w.status == WorkflowStatus::Active)?
                .iter()
                .flat_map(Workflow::action_ids)
                .collect();

            let mut due = t.filter::<Action>(|a| {
                let retry_due = match a.status {
                    ActionStatus::Pending => true,
                    ActionStatus::Failed => a.next_attempt_at.is_some_and(|at| at <= now),
                    _ => false,
                };
                retry_due
                    && a.check_executable().is_ok()
                    && a.scheduled_time.map_or(true, |at| at <= now)
                    && !owned_by_workflows.contains(&a.id)
                    && providers.contains(&a.account_id)
            })?;
            due.sort_by_key(|a| (a.scheduled_time.unwrap_or(a.created_at), a.created_at));
            Ok(due)
        })
    }

    /// Execute every due action, one at a time. A failing action is logged
    /// and does not stop the pass.
    pub async fn process_due(
        &self,
        providers: &ProviderMap,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionResult>> {
        let due = self.due(providers, now)?;
        let mut results = Vec::with_capacity(due.len());
        for action in due {
            let Some(provider) = providers.get(&action.account_id) else {
                continue;
            };
            match self
                .execute_at(action.id, provider.as_ref(), "scheduler", now)
                .await
            {
                Ok(result) => results.push(result),
                Err(e) => warn!(action_id = %action.id, error = %e, "skipping due action"),
            }
        }
        Ok(results)
    }

    /// Fail actions stuck `in_progress` for longer than `max_age`, e.g.
    /// after a crash mid-execution. Returns the number recovered.
    pub fn recover_stale(&self, max_age: Duration, now: DateTime<Utc>) -> Result<u32> {
        let cutoff = now - max_age;
        let recovered = self.store.write(|t| {
            let stuck = t.filter::<Action>(|a| {
                a.status == ActionStatus::InProgress && a.updated_at < cutoff
            })?;
            let mut count = 0u32;
            for mut action in stuck {
                let open = t.filter::<ActionExecution>(|e| {
                    e.action_id == action.id && e.status == ExecutionStatus::InProgress
                })?;
                for mut execution in open {
                    execution.finish(
                        ExecutionStatus::Failed,
                        format!(
                            "Action execution failed at {}\nError: recovered from restart",
                            now.to_rfc3339()
                        ),
                        now,
                    );
                    t.update(&execution)?;
                }
                action.transition_to(ActionStatus::Failed, now)?;
                action.result = Some(json!({ "error": "recovered from restart" }));
                action.next_attempt_at = action
                    .retries_left()
                    .then(|| now + action.retry.backoff_after(action.attempts));
                t.update(&action)?;
                count += 1;
            }
            Ok(count)
        })?;
        if recovered > 0 {
            info!(recovered, "recovered stale in-progress actions");
        }
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Parameter derivation
// ---------------------------------------------------------------------------

/// Provider parameters for an action created from `rec`.
fn parameters_for(rec: &Recommendation) -> Map<String, Value> {
    let mut params = Map::new();
    match rec.recommendation_type {
        RecommendationType::Resize => {
            for (from, to) in [
                ("recommended_instance_type", "instance_type"),
                ("recommended_vm_size", "vm_size"),
                ("recommended_machine_type", "machine_type"),
            ] {
                if let Some(v) = rec.detail(from) {
                    params.insert(to.to_string(), v.clone());
                }
            }
        }
        RecommendationType::Idle => match rec.detail("suggested_action").and_then(Value::as_str) {
            Some("stop_instance") => {
                params.insert("force".into(), Value::Bool(true));
            }
            Some("stop_vm") => {
                params.insert("deallocate".into(), Value::Bool(true));
            }
            _ => {}
        },
        RecommendationType::MissingTags => {
            let tags: Map<String, Value> = rec
                .detail("missing_tags")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(|tag| (tag.to_string(), Value::String("Please update".into())))
                .collect();
            params.insert("tags".into(), Value::Object(tags));
        }
        _ => {}
    }

    if rec.detail("provider_type").and_then(Value::as_str) == Some("azure_advisor") {
        params.insert("apply_immediately".into(), Value::Bool(true));
    }
    params
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderActionResult;
    use crate::recommendation::ResourceRef;
    use crate::store::MemoryStore;
    use crate::types::ResourceKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays scripted results and records every verb it was asked to run.
    struct Scripted {
        results: Mutex<Vec<Result<ProviderActionResult>>>,
        verbs: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<ProviderActionResult>>) -> Self {
            Self {
                results: Mutex::new(results),
                verbs: Mutex::new(Vec::new()),
            }
        }

        fn ok() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute_action(
            &self,
            verb: &str,
            _resource: Option<&ResourceRef>,
            _parameters: &Map<String, Value>,
        ) -> Result<ProviderActionResult> {
            self.verbs.lock().unwrap().push(verb.to_string());
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(ProviderActionResult::ok("ok"))
            } else {
                results.remove(0)
            }
        }
    }

    fn engine() -> ActionEngine<MemoryStore> {
        ActionEngine::new(Arc::new(MemoryStore::new()), &Config::default())
    }

    fn idle_rec(engine: &ActionEngine<MemoryStore>) -> Recommendation {
        let mut rec = Recommendation::new(
            "acct",
            Some(ResourceRef::new("i-1", ResourceKind::Ec2Instance)),
            RecommendationType::Idle,
            Utc::now(),
        );
        rec.details = json!({"suggested_action": "stop_instance"});
        engine.store().insert(&rec).unwrap();
        rec
    }

    #[tokio::test]
    async fn unapproved_action_is_refused_before_mutation() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let action = engine
            .create_from_recommendation(rec.id, true, "alice", None)
            .unwrap();
        assert_eq!(action.action_type, ActionKind::StopResource);
        assert_eq!(action.approval_status, ApprovalStatus::Pending);
        assert_eq!(action.parameters["force"], true);

        let provider = Scripted::ok();
        let err = engine.execute(action.id, &provider, "bob").await.unwrap_err();
        assert!(matches!(err, CloudoptError::ApprovalRequired(id) if id == action.id));
        assert_eq!(engine.get(action.id).unwrap().status, ActionStatus::Pending);
        assert!(engine.executions(action.id).unwrap().is_empty());
        assert!(provider.verbs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn approved_execution_applies_recommendation() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let action = engine
            .create_from_recommendation(rec.id, true, "alice", None)
            .unwrap();
        engine.approve(action.id, "carol", Some("ok".into())).unwrap();

        let provider = Scripted::ok();
        let res = engine.execute(action.id, &provider, "bob").await.unwrap();
        assert!(res.succeeded());
        assert!(res.recommendation_applied);
        assert_eq!(provider.verbs.lock().unwrap().as_slice(), ["stop_instance"]);

        let execs = engine.executions(action.id).unwrap();
        assert_eq!(execs.len(), 1);
        assert!(execs[0].logs.starts_with("Action executed at "));
        assert_eq!(
            engine.store().require::<Recommendation>(rec.id).unwrap().status,
            RecommendationStatus::Applied
        );
        assert_eq!(engine.approvals(action.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_action_does_not_reapply_recommendation() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let a = engine
            .create_from_recommendation(rec.id, false, "alice", None)
            .unwrap();
        let b = engine
            .create_from_recommendation(rec.id, false, "alice", None)
            .unwrap();
        let provider = Scripted::ok();
        assert!(engine.execute(a.id, &provider, "x").await.unwrap().recommendation_applied);
        let second = engine.execute(b.id, &provider, "x").await.unwrap();
        assert!(second.succeeded());
        assert!(!second.recommendation_applied);
        // Closed recommendations cannot spawn more actions.
        assert!(matches!(
            engine.create_from_recommendation(rec.id, false, "alice", None),
            Err(CloudoptError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn provider_failure_is_absorbed_and_backs_off() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let action = engine
            .create_from_recommendation(rec.id, false, "alice", None)
            .unwrap();
        let provider = Scripted::new(vec![Err(CloudoptError::Provider("throttled".into()))]);

        let now = Utc::now();
        let res = engine
            .execute_at(action.id, &provider, "x", now)
            .await
            .unwrap();
        assert_eq!(res.status, ExecutionStatus::Failed);
        assert_eq!(res.next_attempt_at, Some(now + Duration::seconds(300)));

        let stored = engine.get(action.id).unwrap();
        assert_eq!(stored.status, ActionStatus::Failed);
        let log = &engine.executions(action.id).unwrap()[0].logs;
        assert!(log.starts_with("Action execution failed at "));
        assert!(log.contains("throttled"));
        assert_eq!(
            engine.store().require::<Recommendation>(rec.id).unwrap().status,
            RecommendationStatus::Open
        );
    }

    #[tokio::test]
    async fn unsuccessful_result_counts_as_failure() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let action = engine
            .create_from_recommendation(rec.id, false, "alice", None)
            .unwrap();
        let provider = Scripted::new(vec![Ok(ProviderActionResult {
            success: false,
            message: "instance locked".into(),
            details: Value::Null,
        })]);
        let res = engine.execute(action.id, &provider, "x").await.unwrap();
        assert_eq!(res.status, ExecutionStatus::Failed);
        assert_eq!(res.message, "instance locked");
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let action = engine
            .create_from_recommendation(rec.id, false, "alice", None)
            .unwrap();
        let provider = Scripted::new(vec![
            Err(CloudoptError::Provider("1".into())),
            Err(CloudoptError::Provider("2".into())),
            Err(CloudoptError::Provider("3".into())),
        ]);
        for attempt in 1..=3 {
            let res = engine.execute(action.id, &provider, "x").await.unwrap();
            assert_eq!(res.attempt, attempt);
        }
        let last = engine.get(action.id).unwrap();
        assert!(last.next_attempt_at.is_none());
        assert!(matches!(
            engine.execute(action.id, &provider, "x").await,
            Err(CloudoptError::RetryExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn completed_action_cannot_run_twice() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let action = engine
            .create_from_recommendation(rec.id, false, "alice", None)
            .unwrap();
        let provider = Scripted::ok();
        engine.execute(action.id, &provider, "x").await.unwrap();
        assert!(matches!(
            engine.execute(action.id, &provider, "x").await,
            Err(CloudoptError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn reject_cancels_and_double_decisions_fail() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let action = engine
            .create_from_recommendation(rec.id, true, "alice", None)
            .unwrap();
        let rejected = engine.reject(action.id, "carol", None).unwrap();
        assert_eq!(rejected.status, ActionStatus::Cancelled);
        assert_eq!(rejected.approval_status, ApprovalStatus::Rejected);
        assert!(matches!(
            engine.approve(action.id, "carol", None),
            Err(CloudoptError::Validation(_))
        ));

        let auto = engine
            .create_from_recommendation(rec.id, false, "alice", None)
            .unwrap();
        assert!(matches!(
            engine.approve(auto.id, "carol", None),
            Err(CloudoptError::Validation(_))
        ));
    }

    #[test]
    fn missing_recommendation_is_not_found() {
        let engine = engine();
        assert!(matches!(
            engine.create_from_recommendation(Uuid::new_v4(), true, "a", None),
            Err(CloudoptError::NotFound { kind: "recommendation", .. })
        ));
    }

    #[test]
    fn parameters_from_recommendation_details() {
        let now = Utc::now();
        let mut resize = Recommendation::new("acct", None, RecommendationType::Resize, now);
        resize.details = json!({
            "provider_type": "azure_advisor",
            "provider_details": {"recommended_vm_size": "Standard_B2s"}
        });
        let p = parameters_for(&resize);
        assert_eq!(p["vm_size"], "Standard_B2s");
        assert_eq!(p["apply_immediately"], true);

        let mut idle = Recommendation::new("acct", None, RecommendationType::Idle, now);
        idle.details = json!({"suggested_action": "stop_vm"});
        assert_eq!(parameters_for(&idle)["deallocate"], true);

        let mut tags = Recommendation::new("acct", None, RecommendationType::MissingTags, now);
        tags.details = json!({"missing_tags": ["Owner", "Project"]});
        let p = parameters_for(&tags);
        assert_eq!(p["tags"]["Owner"], "Please update");
        assert_eq!(p["tags"].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn process_due_respects_schedule_and_approval() {
        let engine = engine();
        let providers = ProviderMap::new().with("acct", Arc::new(Scripted::ok()));
        let now = Utc::now();
        let new = |requires_approval, scheduled_time| NewAction {
            account_id: "acct".into(),
            resource: Some(ResourceRef::new("bucket-1", ResourceKind::S3Bucket)),
            action_type: ActionKind::OptimizeStorage,
            parameters: Map::new(),
            requires_approval,
            scheduled_time,
            recommendation_id: None,
            retry: None,
            created_by: "test".into(),
        };
        let ready = engine.create(new(false, None)).unwrap();
        let later = engine
            .create(new(false, Some(now + Duration::hours(1))))
            .unwrap();
        let gated = engine.create(new(true, None)).unwrap();
        let mut other = new(false, None);
        other.account_id = "unconfigured".into();
        let orphan = engine.create(other).unwrap();

        let results = engine.process_due(&providers, now).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action_id, ready.id);
        for id in [later.id, gated.id, orphan.id] {
            assert_eq!(engine.get(id).unwrap().status, ActionStatus::Pending);
        }

        let results = engine
            .process_due(&providers, now + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action_id, later.id);
    }

    #[tokio::test]
    async fn failed_action_retries_after_backoff() {
        let engine = engine();
        let provider = Arc::new(Scripted::new(vec![Err(CloudoptError::Provider("x".into()))]));
        let providers = ProviderMap::new().with("acct", provider.clone());
        let action = engine
            .create(NewAction {
                account_id: "acct".into(),
                resource: None,
                action_type: ActionKind::InvestigateCost,
                parameters: Map::new(),
                requires_approval: false,
                scheduled_time: None,
                recommendation_id: None,
                retry: None,
                created_by: "test".into(),
            })
            .unwrap();
        let now = Utc::now();
        let first = engine.process_due(&providers, now).await.unwrap();
        assert_eq!(first[0].status, ExecutionStatus::Failed);

        assert!(engine
            .process_due(&providers, now + Duration::seconds(60))
            .await
            .unwrap()
            .is_empty());
        let retry = engine
            .process_due(&providers, now + Duration::seconds(301))
            .await
            .unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].attempt, 2);
        assert!(retry[0].succeeded());
        assert_eq!(engine.get(action.id).unwrap().status, ActionStatus::Completed);
    }

    #[test]
    fn stale_in_progress_actions_are_recovered() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let action = engine
            .create_from_recommendation(rec.id, false, "alice", None)
            .unwrap();
        let started = Utc::now() - Duration::hours(1);
        engine.claim(action.id, "crashed", started).unwrap();

        assert_eq!(
            engine
                .recover_stale(Duration::minutes(30), started + Duration::minutes(10))
                .unwrap(),
            0
        );
        assert_eq!(engine.recover_stale(Duration::minutes(15), Utc::now()).unwrap(), 1);
        let recovered = engine.get(action.id).unwrap();
        assert_eq!(recovered.status, ActionStatus::Failed);
        let execs = engine.executions(action.id).unwrap();
        assert_eq!(execs[0].status, ExecutionStatus::Failed);
        assert!(execs[0].logs.contains("recovered from restart"));
    }

    #[tokio::test]
    async fn cancel_only_from_pending_or_failed() {
        let engine = engine();
        let rec = idle_rec(&engine);
        let action = engine
            .create_from_recommendation(rec.id, false, "alice", None)
            .unwrap();
        engine.execute(action.id, &Scripted::ok(), "x").await.unwrap();
        assert!(matches!(
            engine.cancel(action.id),
            Err(CloudoptError::InvalidTransition { .. })
        ));
    }
}
