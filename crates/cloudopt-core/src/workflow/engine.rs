//! Creates workflows and drives their executions step by step.
//!
//! The driver persists the execution after every step: results, the trail
//! of visited steps and the cursor of the next one. Before each step it
//! re-reads the execution, so a cancellation recorded by another caller
//! stops the run at the next step boundary. Long delays park the execution
//! instead of holding a task; [`WorkflowEngine::resume_due`] picks them up.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::condition::{result_key, StepContext};
use super::step::{compile, parse_steps, Edges, Next, Step, StepGraph, StepKind};
use super::{NewWorkflow, StepRecord, Workflow, WorkflowExecution, WorkflowResult};
use crate::action::Action;
use crate::config::{Config, WorkflowConfig};
use crate::error::{CloudoptError, Result};
use crate::execution::ActionEngine;
use crate::provider::ProviderMap;
use crate::store::Store;
use crate::types::{ExecutionStatus, TriggerType, WorkflowStatus};

enum StepOutcome {
    /// `branch` picks the success edge (or the true edge of a condition).
    Completed { result: Value, branch: bool },
    Failed { result: Value, message: String },
    Parked { until: DateTime<Utc> },
    Cancelled,
}

pub struct WorkflowEngine<S: Store> {
    store: Arc<S>,
    actions: Arc<ActionEngine<S>>,
    config: WorkflowConfig,
}

impl<S: Store> WorkflowEngine<S> {
    pub fn new(actions: Arc<ActionEngine<S>>, config: &Config) -> Self {
        Self {
            store: actions.store().clone(),
            actions,
            config: config.workflows.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and persist a new active workflow. Nothing is written when
    /// validation fails.
    pub fn create(&self, new: NewWorkflow) -> Result<Workflow> {
        if new.organization_id.trim().is_empty() {
            return Err(CloudoptError::Validation("organization_id is required".into()));
        }
        if new.name.trim().is_empty() {
            return Err(CloudoptError::Validation("workflow name is required".into()));
        }
        let steps = parse_steps(&new.steps)?;
        compile(&steps)?;
        if new.trigger_type == TriggerType::Scheduled {
            new.trigger_config.validate()?;
        }

        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            organization_id: new.organization_id,
            name: new.name,
            description: new.description,
            trigger_type: new.trigger_type,
            trigger_config: new.trigger_config,
            steps,
            status: WorkflowStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.store.write(|t| {
            for (i, step) in workflow.steps.iter().enumerate() {
                if let StepKind::Action { action_id, .. } = step.kind {
                    if t.get::<Action>(action_id)?.is_none() {
                        return Err(CloudoptError::InvalidWorkflow(format!(
                            "step {i}: action {action_id} not found"
                        )));
                    }
                }
            }
            t.insert(&workflow)
        })?;
        info!(workflow_id = %workflow.id, steps = workflow.steps.len(), "workflow created");
        Ok(workflow)
    }

    pub fn get(&self, id: Uuid) -> Result<Workflow> {
        self.store.require(id)
    }

    /// Workflows, oldest first, optionally for one organization.
    pub fn list(&self, organization_id: Option<&str>) -> Result<Vec<Workflow>> {
        let mut workflows = self
            .store
            .filter::<Workflow>(|w| organization_id.map_or(true, |org| w.organization_id == org))?;
        workflows.sort_by_key(|w| w.created_at);
        Ok(workflows)
    }

    pub fn set_status(&self, id: Uuid, status: WorkflowStatus) -> Result<Workflow> {
        let workflow = self.store.write(|t| {
            let mut workflow: Workflow = t.require(id)?;
            workflow.status = status;
            workflow.updated_at = Utc::now();
            t.update(&workflow)?;
            Ok(workflow)
        })?;
        info!(workflow_id = %id, status = %status, "workflow status changed");
        Ok(workflow)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run an active workflow from its first step. Returns once the run has
    /// finished or parked on a long delay.
    pub async fn execute(
        &self,
        workflow_id: Uuid,
        providers: &ProviderMap,
        initiator: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult> {
        let workflow: Workflow = self.store.require(workflow_id)?;
        if workflow.status != WorkflowStatus::Active {
            return Err(CloudoptError::Validation(format!(
                "workflow {workflow_id} is {}, not active",
                workflow.status
            )));
        }
        let graph = compile(&workflow.steps)?;

        let execution = WorkflowExecution::open(workflow_id, initiator, Utc::now());
        self.store.insert(&execution)?;
        info!(
            workflow_id = %workflow_id,
            execution_id = %execution.id,
            initiator,
            "workflow execution started"
        );
        self.drive(&workflow, &graph, execution.id, providers, cancel).await
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        graph: &StepGraph,
        execution_id: Uuid,
        providers: &ProviderMap,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult> {
        loop {
            let execution: WorkflowExecution = self.store.require(execution_id)?;
            if execution.status.is_finished() {
                return Ok(execution.summary());
            }
            if cancel.is_cancelled() {
                return self.close(execution_id, ExecutionStatus::Cancelled, "cancelled");
            }
            let Some(index) = execution.cursor else {
                return self.close(execution_id, ExecutionStatus::Completed, "completed");
            };
            let (Some(step), Some(edges)) = (workflow.steps.get(index), graph.edges(index)) else {
                return self.close(
                    execution_id,
                    ExecutionStatus::Failed,
                    &format!("step {index} does not exist"),
                );
            };

            let started = Utc::now();
            debug!(
                workflow_id = %workflow.id,
                execution_id = %execution_id,
                step = index,
                kind = step.kind_name(),
                "running step"
            );
            let outcome = self.run_step(step, &execution, providers, cancel).await?;
            let execution = self.advance(execution_id, index, step, edges, started, outcome)?;
            if execution.status.is_finished() || execution.is_parked() {
                return Ok(execution.summary());
            }
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        execution: &WorkflowExecution,
        providers: &ProviderMap,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        match &step.kind {
            StepKind::Action { action_id, .. } => {
                self.run_action(*action_id, execution.id, providers).await
            }
            StepKind::Condition { condition, .. } => {
                let passed = condition.evaluate(&StepContext::new(&execution.results));
                Ok(StepOutcome::Completed {
                    result: json!({ "condition_result": passed }),
                    branch: passed,
                })
            }
            StepKind::Delay {
                duration_seconds, ..
            } => {
                let done = StepOutcome::Completed {
                    result: json!({ "duration_seconds": duration_seconds }),
                    branch: true,
                };
                // Only due parked executions are driven again.
                if execution.resume_at.is_some() {
                    return Ok(done);
                }
                if *duration_seconds > self.config.max_inline_delay_seconds {
                    let until = Duration::from_std(StdDuration::from_secs(*duration_seconds))
                        .ok()
                        .and_then(|d| Utc::now().checked_add_signed(d));
                    return Ok(match until {
                        Some(until) => StepOutcome::Parked { until },
                        None => {
                            let message = format!("delay of {duration_seconds}s is out of range");
                            StepOutcome::Failed {
                                result: json!({ "status": "failed", "success": false, "error": message }),
                                message,
                            }
                        }
                    });
                }
                tokio::select! {
                    _ = tokio::time::sleep(StdDuration::from_secs(*duration_seconds)) => Ok(done),
                    _ = cancel.cancelled() => Ok(StepOutcome::Cancelled),
                }
            }
        }
    }

    async fn run_action(
        &self,
        action_id: Uuid,
        execution_id: Uuid,
        providers: &ProviderMap,
    ) -> Result<StepOutcome> {
        let failed = |message: String| StepOutcome::Failed {
            result: json!({ "status": "failed", "success": false, "error": message }),
            message,
        };

        let Some(action) = self.store.get::<Action>(action_id)? else {
            return Ok(failed(format!("action {action_id} not found")));
        };
        let Some(provider) = providers.get(&action.account_id) else {
            return Ok(failed(format!(
                "no provider configured for account {}",
                action.account_id
            )));
        };

        let executor = format!("workflow:{execution_id}");
        match self.actions.execute(action_id, provider.as_ref(), &executor).await {
            Ok(res) if res.succeeded() => Ok(StepOutcome::Completed {
                result: serde_json::to_value(&res)?,
                branch: true,
            }),
            Ok(res) => Ok(StepOutcome::Failed {
                result: serde_json::to_value(&res)?,
                message: res.message,
            }),
            // Store and config failures abort the run; recovery closes it.
            Err(e) if e.is_rejection() => Ok(failed(e.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Record a step outcome and move the cursor, in one transaction.
    fn advance(
        &self,
        execution_id: Uuid,
        index: usize,
        step: &Step,
        edges: Edges,
        started: DateTime<Utc>,
        outcome: StepOutcome,
    ) -> Result<WorkflowExecution> {
        let now = Utc::now();
        let execution = self.store.write(|t| {
            let mut execution: WorkflowExecution = t.require(execution_id)?;
            let record = |status, message| StepRecord {
                index,
                kind: step.kind_name().to_string(),
                status,
                message,
                started_at: started,
                finished_at: now,
            };

            let next = match outcome {
                StepOutcome::Completed { result, branch } => {
                    execution.results.entry(result_key(index)).or_insert(result);
                    execution.trail.push(record(ExecutionStatus::Completed, None));
                    execution.resume_at = None;
                    Some(if branch {
                        edges.on_success
                    } else {
                        edges.on_failure.unwrap_or(edges.on_success)
                    })
                }
                StepOutcome::Failed { result, message } => {
                    execution.results.entry(result_key(index)).or_insert(result);
                    execution
                        .trail
                        .push(record(ExecutionStatus::Failed, Some(message.clone())));
                    match edges.on_failure {
                        Some(next) => Some(next),
                        None => {
                            execution.failed_step = Some(index);
                            let error = CloudoptError::WorkflowStep {
                                step: step.label(index),
                                message,
                            };
                            execution.close(ExecutionStatus::Failed, Some(error.to_string()), now);
                            None
                        }
                    }
                }
                StepOutcome::Parked { until } => {
                    if !execution.status.is_finished() {
                        execution.resume_at = Some(until);
                        execution.updated_at = now;
                    }
                    None
                }
                StepOutcome::Cancelled => {
                    execution.close(ExecutionStatus::Cancelled, Some("cancelled".into()), now);
                    None
                }
            };

            // A concurrent cancel keeps the recorded step but stops here.
            if !execution.status.is_finished() {
                match next {
                    Some(Next::Step(to)) => {
                        execution.cursor = Some(to);
                        execution.updated_at = now;
                    }
                    Some(Next::End) => {
                        execution.close(ExecutionStatus::Completed, None, now);
                    }
                    None => {}
                }
            }
            t.update(&execution)?;
            Ok(execution)
        })?;

        match execution.status {
            ExecutionStatus::Completed => {
                info!(execution_id = %execution_id, steps = execution.trail.len(), "workflow completed")
            }
            ExecutionStatus::Failed => warn!(
                execution_id = %execution_id,
                step = index,
                message = execution.message.as_deref().unwrap_or_default(),
                "workflow failed"
            ),
            ExecutionStatus::Cancelled => info!(execution_id = %execution_id, "workflow cancelled"),
            ExecutionStatus::InProgress if execution.is_parked() => info!(
                execution_id = %execution_id,
                step = index,
                resume_at = ?execution.resume_at,
                "workflow parked on delay"
            ),
            ExecutionStatus::InProgress => {}
        }
        Ok(execution)
    }

    fn close(&self, execution_id: Uuid, status: ExecutionStatus, message: &str) -> Result<WorkflowResult> {
        let execution = self.store.write(|t| {
            let mut execution: WorkflowExecution = t.require(execution_id)?;
            execution.close(status, Some(message.to_string()), Utc::now());
            t.update(&execution)?;
            Ok(execution)
        })?;
        Ok(execution.summary())
    }

    /// Mark an in-progress execution cancelled. The driver stops before its
    /// next step.
    pub fn cancel_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
        let execution = self.store.write(|t| {
            let mut execution: WorkflowExecution = t.require(execution_id)?;
            if execution.status.is_finished() {
                return Err(CloudoptError::InvalidTransition {
                    from: execution.status.to_string(),
                    to: ExecutionStatus::Cancelled.to_string(),
                    reason: format!("workflow execution {execution_id} already finished"),
                });
            }
            execution.close(
                ExecutionStatus::Cancelled,
                Some("cancelled by request".into()),
                Utc::now(),
            );
            t.update(&execution)?;
            Ok(execution)
        })?;
        info!(execution_id = %execution_id, "workflow execution cancelled");
        Ok(execution)
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
        self.store.require(execution_id)
    }

    /// Executions of a workflow, oldest first.
    pub fn executions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowExecution>> {
        self.store.read(|t| {
            t.require::<Workflow>(workflow_id)?;
            let mut executions = t.filter::<WorkflowExecution>(|e| e.workflow_id == workflow_id)?;
            executions.sort_by_key(|e| e.start_time);
            Ok(executions)
        })
    }

    // -----------------------------------------------------------------------
    // Scheduler entry points
    // -----------------------------------------------------------------------

    /// Continue every parked execution whose delay has elapsed by `now`.
    pub async fn resume_due(
        &self,
        providers: &ProviderMap,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkflowResult>> {
        let mut parked = self
            .store
            .filter::<WorkflowExecution>(|e| e.is_parked() && e.resume_at.is_some_and(|at| at <= now))?;
        parked.sort_by_key(|e| e.resume_at);

        let mut results = Vec::with_capacity(parked.len());
        for execution in parked {
            if cancel.is_cancelled() {
                break;
            }
            let workflow: Workflow = self.store.require(execution.workflow_id)?;
            let graph = compile(&workflow.steps)?;
            info!(execution_id = %execution.id, workflow_id = %workflow.id, "resuming parked workflow");
            match self.drive(&workflow, &graph, execution.id, providers, cancel).await {
                Ok(result) => results.push(result),
                Err(e) => warn!(execution_id = %execution.id, error = %e, "resume failed"),
            }
        }
        Ok(results)
    }

    /// Resume parked runs, then start every active scheduled workflow whose
    /// trigger is due and which has no run in progress.
    pub async fn process_scheduled(
        &self,
        providers: &ProviderMap,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkflowResult>> {
        let mut results = self.resume_due(providers, now, cancel).await?;

        let window = self.config.time_window()?;
        let (workflows, running) = self.store.read(|t| {
            let workflows = t.filter::<Workflow>(|w| {
                w.status == WorkflowStatus::Active && w.trigger_type == TriggerType::Scheduled
            })?;
            let running: HashSet<Uuid> = t
                .filter::<WorkflowExecution>(|e| e.status == ExecutionStatus::InProgress)?
                .into_iter()
                .map(|e| e.workflow_id)
                .collect();
            Ok((workflows, running))
        })?;

        for workflow in workflows {
            if cancel.is_cancelled() {
                break;
            }
            if running.contains(&workflow.id) {
                debug!(workflow_id = %workflow.id, "run already in progress; skipping trigger");
                continue;
            }
            if !workflow
                .trigger_config
                .is_due(now, window, workflow.created_at)
            {
                continue;
            }
            self.stamp_last_execution(workflow.id, now)?;
            match self.execute(workflow.id, providers, "scheduler", cancel).await {
                Ok(result) => results.push(result),
                Err(e) => warn!(workflow_id = %workflow.id, error = %e, "scheduled workflow failed to start"),
            }
        }
        Ok(results)
    }

    fn stamp_last_execution(&self, workflow_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.store.write(|t| {
            let mut workflow: Workflow = t.require(workflow_id)?;
            workflow.trigger_config.last_execution = Some(now);
            workflow.updated_at = now;
            t.update(&workflow)
        })
    }

    /// Fail executions left in progress (and not parked) for longer than
    /// `max_age`, e.g. after a crash. Returns the number recovered.
    pub fn recover_stale(&self, max_age: Duration, now: DateTime<Utc>) -> Result<u32> {
        let cutoff = now - max_age;
        let recovered = self.store.write(|t| {
            let stuck = t.filter::<WorkflowExecution>(|e| {
                e.status == ExecutionStatus::InProgress && !e.is_parked() && e.updated_at < cutoff
            })?;
            let mut count = 0u32;
            for mut execution in stuck {
                execution.failed_step = execution.cursor;
                execution.close(
                    ExecutionStatus::Failed,
                    Some("recovered from restart".into()),
                    now,
                );
                t.update(&execution)?;
                count += 1;
            }
            Ok(count)
        })?;
        if recovered > 0 {
            info!(recovered, "recovered stale workflow executions");
        }
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NewAction;
    use crate::provider::{ProviderActionResult, ProviderAdapter};
    use crate::recommendation::ResourceRef;
    use crate::store::MemoryStore;
    use crate::types::{ActionKind, ActionStatus, ResourceKind};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::Mutex;

    struct Scripted {
        fail: bool,
        verbs: Mutex<Vec<String>>,
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
            if self.fail {
                Err(CloudoptError::Provider("boom".into()))
            } else {
                Ok(ProviderActionResult::ok("done"))
            }
        }
    }

    fn setup(fail: bool) -> (WorkflowEngine<MemoryStore>, ProviderMap) {
        let config = Config::default();
        let actions = Arc::new(ActionEngine::new(Arc::new(MemoryStore::new()), &config));
        let provider = Arc::new(Scripted {
            fail,
            verbs: Mutex::new(Vec::new()),
        });
        (
            WorkflowEngine::new(actions, &config),
            ProviderMap::new().with("acct", provider),
        )
    }

    fn approved_action(engine: &WorkflowEngine<MemoryStore>) -> Uuid {
        let action = engine
            .actions
            .create(NewAction {
                account_id: "acct".into(),
                resource: Some(ResourceRef::new("i-1", ResourceKind::Ec2Instance)),
                action_type: ActionKind::StopResource,
                parameters: Map::new(),
                requires_approval: false,
                scheduled_time: None,
                recommendation_id: None,
                retry: None,
                created_by: "tester".into(),
            })
            .unwrap();
        action.id
    }

    fn new_workflow(steps: Vec<Value>) -> NewWorkflow {
        NewWorkflow {
            organization_id: "org".into(),
            name: "nightly".into(),
            description: None,
            trigger_type: TriggerType::Manual,
            trigger_config: Default::default(),
            steps,
        }
    }

    #[test]
    fn create_rejects_unknown_actions_without_persisting() {
        let (engine, _) = setup(false);
        let err = engine
            .create(new_workflow(vec![json!({"type": "action", "action_id": Uuid::new_v4()})]))
            .unwrap_err();
        assert!(matches!(err, CloudoptError::InvalidWorkflow(_)), "{err}");
        assert!(engine.list(None).unwrap().is_empty());
    }

    #[test]
    fn scheduled_workflow_needs_a_trigger() {
        let (engine, _) = setup(false);
        let mut new = new_workflow(vec![json!({"type": "delay", "duration_seconds": 1})]);
        new.trigger_type = TriggerType::Scheduled;
        assert!(engine.create(new).is_err());
    }

    #[tokio::test]
    async fn action_then_condition_then_end() {
        let (engine, providers) = setup(false);
        let action_id = approved_action(&engine);
        let wf = engine
            .create(new_workflow(vec![
                json!({"type": "action", "action_id": action_id}),
                json!({
                    "type": "condition",
                    "condition": {"operator": "equals", "left": {"step_result": 0, "path": "status"}, "right": "completed"},
                    "on_true": "end",
                    "on_false": 2
                }),
                json!({"type": "delay", "duration_seconds": 0}),
            ]))
            .unwrap();

        let result = engine
            .execute(wf.id, &providers, "tester", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.succeeded(), "{result:?}");
        assert_eq!(result.steps_run, 2);

        let exec = engine.get_execution(result.execution_id).unwrap();
        assert_eq!(exec.results["step_1"], json!({"condition_result": true}));
        assert!(!exec.results.contains_key("step_2"));
        assert_eq!(engine.actions.get(action_id).unwrap().status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn failed_action_without_edge_fails_the_workflow() {
        let (engine, providers) = setup(true);
        let action_id = approved_action(&engine);
        let wf = engine
            .create(new_workflow(vec![
                json!({"type": "action", "action_id": action_id}),
                json!({"type": "delay", "duration_seconds": 0}),
            ]))
            .unwrap();

        let result = engine
            .execute(wf.id, &providers, "tester", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_step, Some(0));
        let message = result.message.as_deref().unwrap();
        assert!(message.starts_with("workflow failed at step 0: "), "{message}");
        let exec = engine.get_execution(result.execution_id).unwrap();
        assert_eq!(exec.trail.len(), 1);
        assert_eq!(exec.results["step_0"]["status"], json!("failed"));
        assert_eq!(exec.results["step_0"]["success"], json!(false));
    }

    #[tokio::test]
    async fn on_failure_edge_recovers() {
        let (engine, providers) = setup(true);
        let action_id = approved_action(&engine);
        let wf = engine
            .create(new_workflow(vec![
                json!({"type": "action", "action_id": action_id, "on_failure": "fallback"}),
                json!({"type": "delay", "duration_seconds": 0, "on_success": "end"}),
                json!({"type": "delay", "name": "fallback", "duration_seconds": 0}),
            ]))
            .unwrap();

        let result = engine
            .execute(wf.id, &providers, "tester", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.succeeded());
        let exec = engine.get_execution(result.execution_id).unwrap();
        let visited: Vec<usize> = exec.trail.iter().map(|r| r.index).collect();
        assert_eq!(visited, vec![0, 2]);
    }

    #[tokio::test]
    async fn unapproved_action_is_a_failed_step() {
        let (engine, providers) = setup(false);
        let action = engine
            .actions
            .create(NewAction {
                account_id: "acct".into(),
                resource: Some(ResourceRef::new("i-1", ResourceKind::Ec2Instance)),
                action_type: ActionKind::StopResource,
                parameters: Map::new(),
                requires_approval: true,
                scheduled_time: None,
                recommendation_id: None,
                retry: None,
                created_by: "tester".into(),
            })
            .unwrap();
        let wf = engine
            .create(new_workflow(vec![json!({"type": "action", "action_id": action.id})]))
            .unwrap();

        let result = engine
            .execute(wf.id, &providers, "tester", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(engine.actions.get(action.id).unwrap().status, ActionStatus::Pending);
    }

    #[tokio::test]
    async fn inactive_workflow_is_rejected_before_any_run() {
        let (engine, providers) = setup(false);
        let wf = engine
            .create(new_workflow(vec![json!({"type": "delay", "duration_seconds": 0})]))
            .unwrap();
        engine.set_status(wf.id, WorkflowStatus::Inactive).unwrap();
        let err = engine
            .execute(wf.id, &providers, "tester", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudoptError::Validation(_)));
        assert!(engine.executions(wf.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_delay_parks_and_resumes() {
        let (engine, providers) = setup(false);
        let wf = engine
            .create(new_workflow(vec![
                json!({"type": "delay", "duration_seconds": 3600}),
                json!({"type": "delay", "duration_seconds": 0}),
            ]))
            .unwrap();
        let cancel = CancellationToken::new();

        let parked = engine.execute(wf.id, &providers, "tester", &cancel).await.unwrap();
        assert_eq!(parked.status, ExecutionStatus::InProgress);
        let resume_at = parked.resume_at.unwrap();

        let early = engine
            .resume_due(&providers, resume_at - Duration::seconds(1), &cancel)
            .await
            .unwrap();
        assert!(early.is_empty());

        let resumed = engine.resume_due(&providers, resume_at, &cancel).await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert!(resumed[0].succeeded());
        let exec = engine.get_execution(parked.execution_id).unwrap();
        assert_eq!(exec.results["step_0"], json!({"duration_seconds": 3600}));
        assert_eq!(exec.trail.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_parked_execution_is_not_resumed() {
        let (engine, providers) = setup(false);
        let wf = engine
            .create(new_workflow(vec![json!({"type": "delay", "duration_seconds": 3600})]))
            .unwrap();
        let cancel = CancellationToken::new();
        let parked = engine.execute(wf.id, &providers, "tester", &cancel).await.unwrap();

        engine.cancel_execution(parked.execution_id).unwrap();
        let far = Utc::now() + Duration::days(1);
        assert!(engine.resume_due(&providers, far, &cancel).await.unwrap().is_empty());
        assert!(engine.cancel_execution(parked.execution_id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn token_cancels_an_inline_delay() {
        let (engine, providers) = setup(false);
        let wf = engine
            .create(new_workflow(vec![json!({"type": "delay", "duration_seconds": 120})]))
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine.execute(wf.id, &providers, "tester", &cancel).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.steps_run, 0);
    }

    #[tokio::test]
    async fn scheduled_interval_stamps_last_execution() {
        let (engine, providers) = setup(false);
        let mut new = new_workflow(vec![json!({"type": "delay", "duration_seconds": 0})]);
        new.trigger_type = TriggerType::Scheduled;
        new.trigger_config.interval_hours = Some(1.0);
        let wf = engine.create(new).unwrap();
        let cancel = CancellationToken::new();

        let now = Utc::now();
        let first = engine.process_scheduled(&providers, now, &cancel).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(engine.get(wf.id).unwrap().trigger_config.last_execution, Some(now));

        let again = engine
            .process_scheduled(&providers, now + Duration::minutes(30), &cancel)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn cron_workflow_fires_on_a_late_first_tick() {
        use chrono::Timelike;

        let (engine, providers) = setup(false);
        let target = Utc::now() + Duration::minutes(2);
        let mut new = new_workflow(vec![json!({"type": "delay", "duration_seconds": 0})]);
        new.trigger_type = TriggerType::Scheduled;
        new.trigger_config.cron = Some(format!("{} {} * * *", target.minute(), target.hour()));
        let wf = engine.create(new).unwrap();
        let cancel = CancellationToken::new();

        // The tick lands minutes after the matching minute.
        let late = target + Duration::minutes(3);
        let fired = engine.process_scheduled(&providers, late, &cancel).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(engine.get(wf.id).unwrap().trigger_config.last_execution, Some(late));

        let again = engine
            .process_scheduled(&providers, late + Duration::minutes(1), &cancel)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_time_window_is_a_config_error() {
        let mut config = Config::default();
        config.workflows.time_window_seconds = i64::MAX;
        let actions = Arc::new(ActionEngine::new(Arc::new(MemoryStore::new()), &config));
        let engine = WorkflowEngine::new(actions, &config);
        let err = engine
            .process_scheduled(&ProviderMap::new(), Utc::now(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudoptError::Config(ref m) if m.contains("time_window_seconds")));
    }

    #[test]
    fn recover_stale_skips_parked_runs() {
        let (engine, _) = setup(false);
        let then = Utc::now() - Duration::hours(2);
        let stuck = WorkflowExecution::open(Uuid::new_v4(), "tester", then);
        let mut parked = WorkflowExecution::open(Uuid::new_v4(), "tester", then);
        parked.resume_at = Some(Utc::now() + Duration::hours(1));
        engine.store.insert(&stuck).unwrap();
        engine.store.insert(&parked).unwrap();

        let n = engine.recover_stale(Duration::minutes(15), Utc::now()).unwrap();
        assert_eq!(n, 1);
        let stuck = engine.get_execution(stuck.id).unwrap();
        assert_eq!(stuck.status, ExecutionStatus::Failed);
        assert_eq!(stuck.failed_step, Some(0));
        assert!(engine.get_execution(parked.id).unwrap().is_parked());
    }
}
