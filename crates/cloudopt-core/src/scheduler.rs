//! Periodic driver: expires stale recommendations, runs due actions and
//! starts or resumes scheduled workflows.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, SchedulerConfig};
use crate::error::Result;
use crate::execution::{ActionEngine, ExecutionResult};
use crate::provider::ProviderMap;
use crate::recommend::RecommendationGenerator;
use crate::store::Store;
use crate::workflow::{WorkflowEngine, WorkflowResult};

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub expired_recommendations: Vec<Uuid>,
    pub actions: Vec<ExecutionResult>,
    pub workflows: Vec<WorkflowResult>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.expired_recommendations.is_empty()
            && self.actions.is_empty()
            && self.workflows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Recovery {
    pub actions: u32,
    pub workflow_executions: u32,
}

pub struct Scheduler<S: Store> {
    recommendations: Arc<RecommendationGenerator<S>>,
    actions: Arc<ActionEngine<S>>,
    workflows: Arc<WorkflowEngine<S>>,
    providers: ProviderMap,
    config: SchedulerConfig,
}

impl<S: Store> Scheduler<S> {
    /// Wire all three engines over one store.
    pub fn new(store: Arc<S>, providers: ProviderMap, config: &Config) -> Self {
        let actions = Arc::new(ActionEngine::new(store.clone(), config));
        Self {
            recommendations: Arc::new(RecommendationGenerator::new(
                store,
                config.recommendations.clone(),
            )),
            workflows: Arc::new(WorkflowEngine::new(actions.clone(), config)),
            actions,
            providers,
            config: config.scheduler.clone(),
        }
    }

    pub fn recommendations(&self) -> &Arc<RecommendationGenerator<S>> {
        &self.recommendations
    }

    pub fn actions(&self) -> &Arc<ActionEngine<S>> {
        &self.actions
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine<S>> {
        &self.workflows
    }

    pub fn providers(&self) -> &ProviderMap {
        &self.providers
    }

    /// Fail work left in progress by a previous process.
    pub fn startup_recovery(&self, now: DateTime<Utc>) -> Result<Recovery> {
        let max_age = Duration::seconds(self.config.recovery_max_age_seconds.min(u32::MAX as u64) as i64);
        Ok(Recovery {
            actions: self.actions.recover_stale(max_age, now)?,
            workflow_executions: self.workflows.recover_stale(max_age, now)?,
        })
    }

    pub async fn tick(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<TickReport> {
        let expired_recommendations = self.recommendations.expire_stale(now)?;
        let actions = self.actions.process_due(&self.providers, now).await?;
        let workflows = self
            .workflows
            .process_scheduled(&self.providers, now, cancel)
            .await?;
        let report = TickReport {
            expired_recommendations,
            actions,
            workflows,
        };
        if !report.is_idle() {
            info!(
                expired = report.expired_recommendations.len(),
                actions = report.actions.len(),
                workflows = report.workflows.len(),
                "tick"
            );
        }
        Ok(report)
    }

    /// Recover, then tick every `tick_seconds` until `cancel` fires. A
    /// failed tick is logged and the loop carries on.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let recovery = self.startup_recovery(Utc::now())?;
        info!(
            actions = recovery.actions,
            workflow_executions = recovery.workflow_executions,
            tick_seconds = self.config.tick_seconds,
            "scheduler started"
        );

        let period = StdDuration::from_secs(self.config.tick_seconds.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now(), &cancel).await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}
