use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{CloudoptError, Result};
use crate::store::Record;
use crate::types::{Priority, RecommendationStatus, RecommendationType, ResourceKind, SavingsPeriod};

// ---------------------------------------------------------------------------
// ResourceRef / Savings
// ---------------------------------------------------------------------------

/// A provider-native resource identifier plus its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    pub kind: ResourceKind,
}

impl ResourceRef {
    pub fn new(id: impl Into<String>, kind: impl Into<ResourceKind>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Savings {
    pub amount: Decimal,
    pub currency: String,
    pub period: SavingsPeriod,
}

impl Savings {
    pub fn monthly(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
            period: SavingsPeriod::Monthly,
        }
    }
}

// ---------------------------------------------------------------------------
// Recommendation
// ---------------------------------------------------------------------------

/// (account, resource id, type, subject)
pub type DedupeKey = (String, Option<String>, RecommendationType, Option<String>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    pub recommendation_type: RecommendationType,
    pub status: RecommendationStatus,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_savings: Option<Savings>,
    #[serde(default)]
    pub details: serde_json::Value,
    /// Distinguishes repeated detections on the same resource, e.g. the
    /// anomalous date or the provider's recommendation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recommendation {
    pub fn new(
        account_id: impl Into<String>,
        resource: Option<ResourceRef>,
        recommendation_type: RecommendationType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            resource,
            recommendation_type,
            status: RecommendationStatus::Open,
            priority: Priority::Medium,
            estimated_savings: None,
            details: serde_json::Value::Object(Default::default()),
            subject: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Forward-only status change. A recommendation is never re-opened and a
    /// terminal status is never replaced.
    pub fn transition_to(&mut self, target: RecommendationStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() || target == RecommendationStatus::Open {
            return Err(CloudoptError::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "recommendation status only moves forward from open".to_string(),
            });
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource.as_ref().map(|r| r.id.as_str())
    }

    /// Key two detections share when they describe the same opportunity.
    pub fn dedupe_key(&self) -> DedupeKey {
        (
            self.account_id.clone(),
            self.resource_id().map(str::to_string),
            self.recommendation_type,
            self.subject.clone(),
        )
    }

    /// Look a key up in `details`, then in `details.provider_details`.
    pub fn detail(&self, key: &str) -> Option<&serde_json::Value> {
        self.details.get(key).or_else(|| {
            self.details
                .get("provider_details")
                .and_then(|d| d.get(key))
        })
    }
}

impl Record for Recommendation {
    const TABLE: &'static str = "recommendations";

    fn id(&self) -> Uuid {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecommendationSummary {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    /// Monthly-equivalent savings of open recommendations, per currency.
    pub open_savings: BTreeMap<String, Decimal>,
    /// Monthly-equivalent savings of applied recommendations, per currency.
    pub realized_savings: BTreeMap<String, Decimal>,
}

impl RecommendationSummary {
    pub fn from_recommendations<'a>(recs: impl IntoIterator<Item = &'a Recommendation>) -> Self {
        let mut summary = Self::default();
        for rec in recs {
            summary.total += 1;
            *summary.by_status.entry(rec.status.to_string()).or_default() += 1;
            *summary.by_priority.entry(rec.priority.to_string()).or_default() += 1;
            *summary
                .by_type
                .entry(rec.recommendation_type.to_string())
                .or_default() += 1;

            let Some(savings) = &rec.estimated_savings else {
                continue;
            };
            let monthly = match savings.period {
                SavingsPeriod::Monthly => savings.amount,
                SavingsPeriod::Yearly => savings.amount / Decimal::from(12),
            };
            let bucket = match rec.status {
                RecommendationStatus::Open => &mut summary.open_savings,
                RecommendationStatus::Applied => &mut summary.realized_savings,
                _ => continue,
            };
            *bucket.entry(savings.currency.clone()).or_default() += monthly;
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
