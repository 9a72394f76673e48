//! The seam between the engines and a cloud vendor.
//!
//! Engines never talk to a vendor SDK. They call a [`ProviderAdapter`]
//! resolved per account through a [`ProviderMap`]. Two bridges ship here:
//! [`HttpProvider`] forwards each call to an out-of-process adapter over
//! JSON, [`DryRunProvider`] logs and reports success.

pub mod dry_run;
pub mod http;
pub mod verbs;

pub use self::dry_run::DryRunProvider;
pub use self::http::HttpProvider;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{Config, ProviderConfig};
use crate::error::{CloudoptError, Result};
use crate::recommendation::ResourceRef;
use crate::types::{ActionKind, ResourceKind, SavingsPeriod};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A resource as reported by the provider (or supplied by the host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Vendor attributes: `instance_type`, `vm_size`, `machine_type`, ...
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Resource {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            id: self.id.clone(),
            kind: self.kind.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "stopped" | "deallocated" | "terminated"
        )
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsQuery {
    pub resource: ResourceRef,
    pub metric_names: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub average: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    #[serde(default)]
    pub datapoints: Vec<Datapoint>,
}

/// One day of spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub date: NaiveDate,
    pub amount: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub service: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// A savings opportunity reported natively by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecommendation {
    pub id: String,
    #[serde(rename = "type")]
    pub recommendation_type: String,
    #[serde(default)]
    pub resource: Option<ResourceRef>,
    #[serde(default)]
    pub estimated_savings: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub period: Option<SavingsPeriod>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderActionResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ProviderActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

/// Capability surface of one cloud account.
///
/// Only `name` and `execute_action` are mandatory. The read side defaults to
/// "nothing to report" so narrow adapters stay short.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn get_resources(&self, _kind: Option<&ResourceKind>) -> Result<Vec<Resource>> {
        Ok(Vec::new())
    }

    async fn get_resource(&self, kind: &ResourceKind, id: &str) -> Result<Resource> {
        Err(CloudoptError::not_found("resource", format!("{kind}/{id}")))
    }

    /// Metric name → series.
    async fn get_metrics(&self, _query: &MetricsQuery) -> Result<HashMap<String, MetricSeries>> {
        Ok(HashMap::new())
    }

    async fn get_cost_data(&self, _start: NaiveDate, _end: NaiveDate) -> Result<Vec<CostRecord>> {
        Ok(Vec::new())
    }

    async fn execute_action(
        &self,
        verb: &str,
        resource: Option<&ResourceRef>,
        parameters: &Map<String, Value>,
    ) -> Result<ProviderActionResult>;

    async fn tag_resource(
        &self,
        resource: &ResourceRef,
        tags: &BTreeMap<String, String>,
    ) -> Result<ProviderActionResult> {
        let mut params = Map::new();
        params.insert("tags".into(), serde_json::to_value(tags)?);
        self.execute_action("tag_resource", Some(resource), &params)
            .await
    }

    async fn get_recommendations(&self) -> Result<Vec<ProviderRecommendation>> {
        Ok(Vec::new())
    }
}

/// Perform `action_type` against `resource` through the verb table.
/// `add_tags` goes through [`ProviderAdapter::tag_resource`].
pub async fn perform(
    provider: &dyn ProviderAdapter,
    action_type: ActionKind,
    resource: Option<&ResourceRef>,
    parameters: &Map<String, Value>,
) -> Result<ProviderActionResult> {
    match verbs::resolve(resource.map(|r| &r.kind), action_type) {
        verbs::ProviderCall::Tag => {
            let resource = resource.ok_or_else(|| {
                CloudoptError::Validation("add_tags needs a target resource".to_string())
            })?;
            let tags = tags_from_parameters(parameters)?;
            provider.tag_resource(resource, &tags).await
        }
        verbs::ProviderCall::Execute(verb) => {
            provider.execute_action(verb, resource, parameters).await
        }
    }
}

fn tags_from_parameters(parameters: &Map<String, Value>) -> Result<BTreeMap<String, String>> {
    let Some(Value::Object(tags)) = parameters.get("tags") else {
        return Err(CloudoptError::Validation(
            "add_tags needs a 'tags' object parameter".to_string(),
        ));
    };
    Ok(tags
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// ProviderMap
// ---------------------------------------------------------------------------

/// Account id → adapter.
#[derive(Clone, Default)]
pub struct ProviderMap {
    inner: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, account_id: impl Into<String>, provider: Arc<dyn ProviderAdapter>) {
        self.inner.insert(account_id.into(), provider);
    }

    pub fn with(mut self, account_id: impl Into<String>, provider: Arc<dyn ProviderAdapter>) -> Self {
        self.insert(account_id, provider);
        self
    }

    pub fn get(&self, account_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.inner.get(account_id).cloned()
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.inner.contains_key(account_id)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    /// Build one adapter per `providers` entry in the config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut map = Self::new();
        for (account, provider) in &config.providers {
            let adapter: Arc<dyn ProviderAdapter> = match provider {
                ProviderConfig::Http {
                    endpoint,
                    token_env,
                } => Arc::new(HttpProvider::from_env(
                    account,
                    endpoint,
                    token_env.as_deref(),
                )?),
                ProviderConfig::DryRun => Arc::new(DryRunProvider::new(account)),
            };
            map.insert(account.clone(), adapter);
        }
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
