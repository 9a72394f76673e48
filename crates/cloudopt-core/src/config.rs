use crate::error::{CloudoptError, Result};
use crate::paths;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Retry policy stamped onto newly created actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_seconds() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on a single provider call made while executing an action.
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_seconds: u64,
}

fn default_provider_timeout() -> u64 {
    120
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            provider_timeout_seconds: default_provider_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// Actions left `in_progress` longer than this at startup are failed.
    #[serde(default = "default_recovery_max_age")]
    pub recovery_max_age_seconds: u64,
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_recovery_max_age() -> u64 {
    900
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            recovery_max_age_seconds: default_recovery_max_age(),
        }
    }
}

// ---------------------------------------------------------------------------
// RecommendationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    /// Mean CPU utilization (percent, 0-100) below which a VM is idle.
    #[serde(default = "default_idle_threshold")]
    pub idle_cpu_threshold: f64,
    #[serde(default = "default_idle_lookback_days")]
    pub idle_lookback_days: i64,
    #[serde(default = "default_metric_period")]
    pub metric_period_seconds: u64,
    #[serde(default = "default_anomaly_multiplier")]
    pub anomaly_multiplier: f64,
    #[serde(default = "default_required_tags")]
    pub required_tags: Vec<String>,
    #[serde(default = "default_true")]
    pub dedupe: bool,
    #[serde(default = "default_expire_after_days")]
    pub expire_after_days: i64,
}

fn default_idle_threshold() -> f64 {
    5.0
}

fn default_idle_lookback_days() -> i64 {
    7
}

fn default_metric_period() -> u64 {
    3600
}

fn default_anomaly_multiplier() -> f64 {
    1.5
}

fn default_required_tags() -> Vec<String> {
    ["Environment", "Owner", "CostCenter", "Project"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_expire_after_days() -> i64 {
    30
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            idle_cpu_threshold: default_idle_threshold(),
            idle_lookback_days: default_idle_lookback_days(),
            metric_period_seconds: default_metric_period(),
            anomaly_multiplier: default_anomaly_multiplier(),
            required_tags: default_required_tags(),
            dedupe: true,
            expire_after_days: default_expire_after_days(),
        }
    }
}

impl RecommendationConfig {
    /// Start of the idle-detection metrics window ending at `now`.
    pub fn lookback_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        days_before(now, self.idle_lookback_days, "recommendations.idle_lookback_days")
    }

    /// Open recommendations created before this are stale.
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        days_before(now, self.expire_after_days, "recommendations.expire_after_days")
    }
}

fn days_before(now: DateTime<Utc>, days: i64, field: &str) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|d| now.checked_sub_signed(d))
        .ok_or_else(|| CloudoptError::Config(format!("{field}={days} is out of range")))
}

// ---------------------------------------------------------------------------
// WorkflowConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Delays up to this long sleep inside the running task; longer ones
    /// park the execution for the scheduler to resume.
    #[serde(default = "default_max_inline_delay")]
    pub max_inline_delay_seconds: u64,
    /// Tolerance either side of a `time` trigger.
    #[serde(default = "default_time_window")]
    pub time_window_seconds: i64,
}

fn default_max_inline_delay() -> u64 {
    300
}

fn default_time_window() -> i64 {
    300
}

impl WorkflowConfig {
    pub fn time_window(&self) -> Result<Duration> {
        Duration::try_seconds(self.time_window_seconds)
            .filter(|w| *w >= Duration::zero())
            .ok_or_else(|| {
                CloudoptError::Config(format!(
                    "workflows.time_window_seconds={} is out of range",
                    self.time_window_seconds
                ))
            })
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_inline_delay_seconds: default_max_inline_delay(),
            time_window_seconds: default_time_window(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderConfig
// ---------------------------------------------------------------------------

/// How to reach the provider adapter for one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Http {
        endpoint: String,
        /// Name of the environment variable holding the bearer token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_env: Option<String>,
    },
    DryRun,
}

/// Upper bound for the recommendation day counts (100 years).
pub const MAX_DAYS: i64 = 36_500;
/// Upper bound for the workflow windows, one day in seconds.
pub const MAX_WINDOW_SECONDS: i64 = 86_400;

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub recommendations: RecommendationConfig,
    #[serde(default)]
    pub workflows: WorkflowConfig,
    /// account id → adapter
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderConfig>,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            retry: RetryConfig::default(),
            execution: ExecutionConfig::default(),
            scheduler: SchedulerConfig::default(),
            recommendations: RecommendationConfig::default(),
            workflows: WorkflowConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Parse and validate `.cloudopt/config.yaml`. Any error-level finding
    /// from [`Config::validate`] fails the load.
    pub fn load(root: &Path) -> Result<Self> {
        let cfg = Self::read(root)?;
        let errors: Vec<String> = cfg
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(CloudoptError::Config(errors.join("; ")));
        }
        Ok(cfg)
    }

    /// Parse without validating, for `config validate` and `config show`.
    pub fn read(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(CloudoptError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&data)
            .map_err(|e| CloudoptError::Config(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn provider(&self, account_id: &str) -> Option<&ProviderConfig> {
        self.providers.get(account_id)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.retry.max_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "retry.max_attempts is 0: no action could ever execute".to_string(),
            });
        } else if self.retry.max_attempts > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "retry.max_attempts={} (>10 is unusual)",
                    self.retry.max_attempts
                ),
            });
        }

        if self.execution.provider_timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "execution.provider_timeout_seconds must be positive".to_string(),
            });
        }

        if self.scheduler.tick_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "scheduler.tick_seconds must be positive".to_string(),
            });
        }

        let rec = &self.recommendations;
        if rec.idle_cpu_threshold <= 0.0 || rec.idle_cpu_threshold > 100.0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "recommendations.idle_cpu_threshold={} is outside (0, 100]",
                    rec.idle_cpu_threshold
                ),
            });
        }
        if rec.anomaly_multiplier <= 1.0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "recommendations.anomaly_multiplier={} flags ordinary days as anomalies",
                    rec.anomaly_multiplier
                ),
            });
        }
        for (field, days) in [
            ("idle_lookback_days", rec.idle_lookback_days),
            ("expire_after_days", rec.expire_after_days),
        ] {
            if !(1..=MAX_DAYS).contains(&days) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("recommendations.{field}={days} is outside 1-{MAX_DAYS}"),
                });
            }
        }

        let wf = &self.workflows;
        if !(0..=MAX_WINDOW_SECONDS).contains(&wf.time_window_seconds) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "workflows.time_window_seconds={} is outside 0-{MAX_WINDOW_SECONDS}",
                    wf.time_window_seconds
                ),
            });
        }
        if wf.max_inline_delay_seconds > MAX_WINDOW_SECONDS as u64 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "workflows.max_inline_delay_seconds={} exceeds {MAX_WINDOW_SECONDS}; longer delays park instead",
                    wf.max_inline_delay_seconds
                ),
            });
        }

        for (account, provider) in &self.providers {
            if let ProviderConfig::Http { endpoint, token_env } = provider {
                if endpoint.trim().is_empty() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!("provider for account '{account}' has an empty endpoint"),
                    });
                }
                if let Some(var) = token_env {
                    if std::env::var(var).is_err() {
                        warnings.push(ConfigWarning {
                            level: WarnLevel::Warning,
                            message: format!(
                                "provider for account '{account}' reads token from '{var}', which is not set"
                            ),
                        });
                    }
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
