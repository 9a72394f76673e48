//! Recommendation generation.
//!
//! [`RecommendationGenerator::generate`] merges provider-native opportunities
//! with three local heuristics (idle VMs, missing tags, cost anomalies),
//! assigns a priority to each and persists them as `open` recommendations in
//! a single write transaction.

pub mod heuristics;
pub mod pricing;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RecommendationConfig;
use crate::error::Result;
use crate::provider::{
    verbs, CostRecord, MetricsQuery, ProviderAdapter, ProviderRecommendation, Resource,
};
use crate::recommendation::{Recommendation, RecommendationSummary, Savings};
use crate::store::Store;
use crate::types::{RecommendationStatus, RecommendationType, SavingsPeriod};

const CPU_METRIC: &str = "cpu_utilization";

/// Resource and cost lists the host supplies for one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInventory {
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Daily cost records. When empty, the provider's cost data for the
    /// anomaly window is used instead.
    #[serde(default)]
    pub costs: Vec<CostRecord>,
}

pub struct RecommendationGenerator<S: Store> {
    store: Arc<S>,
    config: RecommendationConfig,
}

impl<S: Store> RecommendationGenerator<S> {
    pub fn new(store: Arc<S>, config: RecommendationConfig) -> Self {
        Self { store, config }
    }

    pub async fn generate(
        &self,
        account_id: &str,
        provider: &dyn ProviderAdapter,
        inventory: &AccountInventory,
    ) -> Result<Vec<Recommendation>> {
        self.generate_at(account_id, provider, inventory, Utc::now())
            .await
    }

    /// [`generate`](Self::generate) against an explicit clock.
    pub async fn generate_at(
        &self,
        account_id: &str,
        provider: &dyn ProviderAdapter,
        inventory: &AccountInventory,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recommendation>> {
        let mut detected = Vec::new();

        match provider.get_recommendations().await {
            Ok(items) => detected.extend(
                items
                    .into_iter()
                    .map(|item| from_provider(account_id, item, now)),
            ),
            Err(e) => warn!(
                account = account_id,
                provider = provider.name(),
                error = %e,
                "provider recommendations unavailable; continuing with heuristics"
            ),
        }

        detected.extend(
            self.detect_idle(account_id, provider, &inventory.resources, now)
                .await?,
        );
        detected.extend(self.detect_missing_tags(account_id, &inventory.resources, now));
        detected.extend(
            self.detect_anomalies(account_id, provider, &inventory.costs, now)
                .await,
        );

        for rec in &mut detected {
            rec.priority =
                heuristics::priority_for(rec.recommendation_type, rec.estimated_savings.as_ref());
        }

        let created = self.persist(detected)?;
        info!(account = account_id, created = created.len(), "recommendations generated");
        Ok(created)
    }

    fn persist(&self, detected: Vec<Recommendation>) -> Result<Vec<Recommendation>> {
        let dedupe = self.config.dedupe;
        self.store.write(|t| {
            let mut seen: HashSet<_> = if dedupe {
                t.filter::<Recommendation>(|r| r.status == RecommendationStatus::Open)?
                    .iter()
                    .map(Recommendation::dedupe_key)
                    .collect()
            } else {
                HashSet::new()
            };

            let mut created = Vec::new();
            for rec in detected {
                if dedupe && !seen.insert(rec.dedupe_key()) {
                    debug!(
                        account = %rec.account_id,
                        kind = %rec.recommendation_type,
                        resource = rec.resource_id().unwrap_or("-"),
                        "skipping duplicate of an open recommendation"
                    );
                    continue;
                }
                t.insert(&rec)?;
                created.push(rec);
            }
            Ok(created)
        })
    }

    async fn detect_idle(
        &self,
        account_id: &str,
        provider: &dyn ProviderAdapter,
        resources: &[Resource],
        now: DateTime<Utc>,
    ) -> Result<Vec<Recommendation>> {
        let start = self.config.lookback_start(now)?;
        let mut out = Vec::new();
        for resource in resources
            .iter()
            .filter(|r| r.kind.is_compute() && !r.is_stopped())
        {
            let query = MetricsQuery {
                resource: resource.reference(),
                metric_names: vec![CPU_METRIC.to_string()],
                start,
                end: now,
                period_seconds: self.config.metric_period_seconds,
            };
            let metrics = match provider.get_metrics(&query).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        account = account_id,
                        resource = %resource.id,
                        error = %e,
                        "cpu metrics unavailable; skipping idle check"
                    );
                    continue;
                }
            };
            let Some(avg) = metrics
                .get(CPU_METRIC)
                .and_then(|s| heuristics::idle_utilization(s, self.config.idle_cpu_threshold))
            else {
                continue;
            };

            let mut rec = Recommendation::new(
                account_id,
                Some(resource.reference()),
                RecommendationType::Idle,
                now,
            );
            rec.estimated_savings = Some(Savings::monthly(pricing::monthly_price(resource), "USD"));
            rec.details = json!({
                "avg_cpu_utilization": avg,
                "lookback_days": self.config.idle_lookback_days,
                "suggested_action": verbs::stop_verb(&resource.kind),
                "resource_name": resource.name,
            });
            out.push(rec);
        }
        Ok(out)
    }

    fn detect_missing_tags(
        &self,
        account_id: &str,
        resources: &[Resource],
        now: DateTime<Utc>,
    ) -> Vec<Recommendation> {
        resources
            .iter()
            .filter_map(|resource| {
                let missing = heuristics::missing_tags(resource, &self.config.required_tags);
                if missing.is_empty() {
                    return None;
                }
                let mut rec = Recommendation::new(
                    account_id,
                    Some(resource.reference()),
                    RecommendationType::MissingTags,
                    now,
                );
                rec.details = json!({
                    "missing_tags": missing,
                    "suggested_tags": self.config.required_tags,
                    "current_tags": resource.tags,
                });
                Some(rec)
            })
            .collect()
    }

    async fn detect_anomalies(
        &self,
        account_id: &str,
        provider: &dyn ProviderAdapter,
        supplied: &[CostRecord],
        now: DateTime<Utc>,
    ) -> Vec<Recommendation> {
        let today = now.date_naive();
        let fetched;
        let records = if supplied.is_empty() {
            let (start, end) = heuristics::anomaly_window(today);
            fetched = match provider.get_cost_data(start, end).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(account = account_id, error = %e, "cost data unavailable; skipping anomaly check");
                    Vec::new()
                }
            };
            &fetched[..]
        } else {
            supplied
        };

        heuristics::detect_anomalies(records, today, self.config.anomaly_multiplier)
            .into_iter()
            .map(|anomaly| {
                let mut rec =
                    Recommendation::new(account_id, None, RecommendationType::CostAnomaly, now);
                rec.subject = Some(anomaly.date.to_string());
                rec.estimated_savings = Some(Savings::monthly(
                    anomaly.estimated_savings,
                    anomaly.currency.clone(),
                ));
                rec.details = json!({
                    "date": anomaly.date,
                    "daily_cost": anomaly.total,
                    "mean_daily_cost": anomaly.mean,
                    "threshold_multiplier": self.config.anomaly_multiplier,
                });
                rec
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Queries and status changes
    // -----------------------------------------------------------------------

    pub fn get(&self, id: Uuid) -> Result<Recommendation> {
        self.store.require(id)
    }

    /// Newest first.
    pub fn list(
        &self,
        account_id: Option<&str>,
        status: Option<RecommendationStatus>,
    ) -> Result<Vec<Recommendation>> {
        let mut recs = self.store.filter::<Recommendation>(|r| {
            account_id.map_or(true, |a| r.account_id == a) && status.map_or(true, |s| r.status == s)
        })?;
        recs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(recs)
    }

    pub fn dismiss(&self, id: Uuid, now: DateTime<Utc>) -> Result<Recommendation> {
        self.store.write(|t| {
            let mut rec: Recommendation = t.require(id)?;
            rec.transition_to(RecommendationStatus::Dismissed, now)?;
            t.update(&rec)?;
            info!(recommendation_id = %id, "recommendation dismissed");
            Ok(rec)
        })
    }

    /// Expire open recommendations older than `expire_after_days`.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let cutoff = self.config.expiry_cutoff(now)?;
        self.store.write(|t| {
            let stale = t.filter::<Recommendation>(|r| {
                r.status == RecommendationStatus::Open && r.created_at < cutoff
            })?;
            let mut expired = Vec::with_capacity(stale.len());
            for mut rec in stale {
                rec.transition_to(RecommendationStatus::Expired, now)?;
                t.update(&rec)?;
                expired.push(rec.id);
            }
            if !expired.is_empty() {
                info!(count = expired.len(), "expired stale recommendations");
            }
            Ok(expired)
        })
    }

    pub fn summary(&self, account_id: Option<&str>) -> Result<RecommendationSummary> {
        let recs = self.list(account_id, None)?;
        Ok(RecommendationSummary::from_recommendations(&recs))
    }
}

fn from_provider(account_id: &str, item: ProviderRecommendation, now: DateTime<Utc>) -> Recommendation {
    let kind = RecommendationType::from_provider(&item.recommendation_type);
    let mut rec = Recommendation::new(account_id, item.resource, kind, now);
    rec.subject = Some(item.id.clone());
    rec.estimated_savings = item.estimated_savings.map(|amount| Savings {
        amount,
        currency: item.currency.unwrap_or_else(|| "USD".to_string()),
        period: item.period.unwrap_or(SavingsPeriod::Monthly),
    });
    rec.details = json!({
        "provider_recommendation_id": item.id,
        "provider_type": item.recommendation_type,
        "description": item.description,
        "provider_details": item.details,
    });
    rec
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloudoptError;
    use crate::provider::{Datapoint, MetricSeries, ProviderActionResult};
    use crate::recommendation::ResourceRef;
    use crate::store::MemoryStore;
    use crate::types::{Priority, ResourceKind};
    use async_trait::async_trait;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use serde_json::{Map, Value};
    use std::collections::{BTreeMap, HashMap};

    struct Fake {
        cpu: f64,
        native: Vec<ProviderRecommendation>,
        fail_native: bool,
    }

    #[async_trait]
    impl ProviderAdapter for Fake {
        fn name(&self) -> &str {
            "fake"
        }

        async fn get_metrics(&self, query: &MetricsQuery) -> Result<HashMap<String, MetricSeries>> {
            let series = MetricSeries {
                datapoints: vec![Datapoint {
                    timestamp: query.end,
                    average: self.cpu,
                }],
            };
            Ok(HashMap::from([(CPU_METRIC.to_string(), series)]))
        }

        async fn execute_action(
            &self,
            _verb: &str,
            _resource: Option<&ResourceRef>,
            _parameters: &Map<String, Value>,
        ) -> Result<ProviderActionResult> {
            Ok(ProviderActionResult::ok("noop"))
        }

        async fn get_recommendations(&self) -> Result<Vec<ProviderRecommendation>> {
            if self.fail_native {
                return Err(CloudoptError::Provider("throttled".into()));
            }
            Ok(self.native.clone())
        }
    }

    fn tagged_vm(id: &str) -> Resource {
        let tags: BTreeMap<String, String> = ["Environment", "Owner", "CostCenter", "Project"]
            .iter()
            .map(|t| (t.to_string(), "x".to_string()))
            .collect();
        Resource {
            id: id.into(),
            kind: ResourceKind::Ec2Instance,
            name: None,
            status: "running".into(),
            region: None,
            tags,
            properties: Map::new(),
        }
    }

    fn generator() -> RecommendationGenerator<MemoryStore> {
        RecommendationGenerator::new(Arc::new(MemoryStore::new()), RecommendationConfig::default())
    }

    #[tokio::test]
    async fn idle_vm_becomes_high_priority_recommendation() {
        let gen = generator();
        let provider = Fake {
            cpu: 3.0,
            native: vec![],
            fail_native: false,
        };
        let inventory = AccountInventory {
            resources: vec![tagged_vm("i-1")],
            costs: vec![],
        };
        let recs = gen.generate("acct", &provider, &inventory).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].recommendation_type, RecommendationType::Idle);
        assert_eq!(recs[0].priority, Priority::High);
        assert_eq!(recs[0].details["suggested_action"], "stop_instance");
        assert_eq!(
            recs[0].estimated_savings.as_ref().unwrap().amount,
            Decimal::new(759, 2)
        );
    }

    #[tokio::test]
    async fn provider_failure_still_runs_heuristics() {
        let gen = generator();
        let provider = Fake {
            cpu: 50.0,
            native: vec![],
            fail_native: true,
        };
        let mut untagged = tagged_vm("i-2");
        untagged.tags.clear();
        let inventory = AccountInventory {
            resources: vec![untagged],
            costs: vec![],
        };
        let recs = gen.generate("acct", &provider, &inventory).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].recommendation_type, RecommendationType::MissingTags);
        assert_eq!(recs[0].details["missing_tags"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn native_items_are_normalized_and_reprioritized() {
        let gen = generator();
        let provider = Fake {
            cpu: 50.0,
            native: vec![ProviderRecommendation {
                id: "rec-123".into(),
                recommendation_type: "Rightsizing".into(),
                resource: Some(ResourceRef::new("i-3", ResourceKind::Ec2Instance)),
                estimated_savings: Some(Decimal::from(250)),
                currency: None,
                period: None,
                description: "downsize".into(),
                details: json!({"recommended_instance_type": "t3.small"}),
            }],
            fail_native: false,
        };
        let recs = gen
            .generate("acct", &provider, &AccountInventory::default())
            .await
            .unwrap();
        assert_eq!(recs.len(), 1);
        let rec = &recs[0];
        assert_eq!(rec.recommendation_type, RecommendationType::Resize);
        assert_eq!(rec.priority, Priority::High);
        assert_eq!(rec.subject.as_deref(), Some("rec-123"));
        assert_eq!(
            rec.detail("recommended_instance_type").and_then(Value::as_str),
            Some("t3.small")
        );
    }

    #[tokio::test]
    async fn repeated_generation_does_not_duplicate_open_recommendations() {
        let gen = generator();
        let provider = Fake {
            cpu: 1.0,
            native: vec![],
            fail_native: false,
        };
        let inventory = AccountInventory {
            resources: vec![tagged_vm("i-1")],
            costs: vec![],
        };
        assert_eq!(gen.generate("acct", &provider, &inventory).await.unwrap().len(), 1);
        assert!(gen.generate("acct", &provider, &inventory).await.unwrap().is_empty());
        assert_eq!(gen.list(Some("acct"), None).unwrap().len(), 1);

        // Once dismissed, the opportunity may be raised again.
        let id = gen.list(Some("acct"), None).unwrap()[0].id;
        gen.dismiss(id, Utc::now()).unwrap();
        assert_eq!(gen.generate("acct", &provider, &inventory).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_open_recommendations_expire() {
        let gen = generator();
        let provider = Fake {
            cpu: 1.0,
            native: vec![],
            fail_native: false,
        };
        let inventory = AccountInventory {
            resources: vec![tagged_vm("i-1")],
            costs: vec![],
        };
        let created_at = Utc::now() - Duration::days(45);
        gen.generate_at("acct", &provider, &inventory, created_at)
            .await
            .unwrap();
        let expired = gen.expire_stale(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(
            gen.get(expired[0]).unwrap().status,
            RecommendationStatus::Expired
        );
        assert!(gen.dismiss(expired[0], Utc::now()).is_err());
    }

    #[tokio::test]
    async fn out_of_range_day_counts_error_instead_of_panicking() {
        let config = RecommendationConfig {
            expire_after_days: i64::MAX / 1000,
            idle_lookback_days: i64::MAX / 1000,
            ..RecommendationConfig::default()
        };
        let gen = RecommendationGenerator::new(Arc::new(MemoryStore::new()), config);
        assert!(matches!(
            gen.expire_stale(Utc::now()),
            Err(CloudoptError::Config(ref m)) if m.contains("expire_after_days")
        ));

        let provider = Fake {
            cpu: 1.0,
            native: vec![],
            fail_native: false,
        };
        let inventory = AccountInventory {
            resources: vec![tagged_vm("i-1")],
            costs: vec![],
        };
        let err = gen.generate("acct", &provider, &inventory).await.unwrap_err();
        assert!(matches!(err, CloudoptError::Config(ref m) if m.contains("idle_lookback_days")));
    }
}
