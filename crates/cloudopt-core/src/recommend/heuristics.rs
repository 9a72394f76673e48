//! Pure detection rules. Nothing here touches the store or a provider.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use crate::provider::{CostRecord, MetricSeries, Resource};
use crate::recommendation::Savings;
use crate::types::{Priority, RecommendationType};

// ---------------------------------------------------------------------------
// Idle
// ---------------------------------------------------------------------------

/// Mean of the datapoint averages, or `None` for an empty series.
pub fn mean_utilization(series: &MetricSeries) -> Option<f64> {
    if series.datapoints.is_empty() {
        return None;
    }
    let sum: f64 = series.datapoints.iter().map(|d| d.average).sum();
    Some(sum / series.datapoints.len() as f64)
}

/// `Some(mean)` when the series shows the resource idle: mean utilization
/// strictly below `threshold` percent. An empty series is never idle.
pub fn idle_utilization(series: &MetricSeries, threshold: f64) -> Option<f64> {
    mean_utilization(series).filter(|mean| *mean < threshold)
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Required tag keys absent from the resource, in `required` order.
pub fn missing_tags(resource: &Resource, required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|tag| !resource.tags.contains_key(tag.as_str()))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Cost anomalies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub date: NaiveDate,
    pub total: Decimal,
    pub mean: Decimal,
    pub currency: String,
    /// `(total − mean) × 30`
    pub estimated_savings: Decimal,
}

/// `[first day of the previous month, today)`.
pub fn anomaly_window(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let (year, month) = if today.month() == 1 {
        (today.year() - 1, 12)
    } else {
        (today.year(), today.month() - 1)
    };
    let start = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today);
    (start, today)
}

/// Sum records per day inside the window, then flag every day whose total
/// exceeds `multiplier ×` the mean daily total.
pub fn detect_anomalies(records: &[CostRecord], today: NaiveDate, multiplier: f64) -> Vec<Anomaly> {
    let (start, end) = anomaly_window(today);
    let mut daily: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
    let mut currency = None;
    for record in records.iter().filter(|r| r.date >= start && r.date < end) {
        *daily.entry(record.date).or_default() += record.amount;
        currency.get_or_insert_with(|| record.currency.clone());
    }
    if daily.is_empty() {
        return Vec::new();
    }

    let total: Decimal = daily.values().copied().sum();
    let mean = total / Decimal::from(daily.len());
    let Ok(multiplier) = Decimal::try_from(multiplier) else {
        return Vec::new();
    };
    let threshold = mean * multiplier;
    let currency = currency.unwrap_or_else(|| "USD".to_string());

    daily
        .into_iter()
        .filter(|(_, day_total)| *day_total > threshold)
        .map(|(date, day_total)| Anomaly {
            date,
            total: day_total,
            mean,
            currency: currency.clone(),
            estimated_savings: (day_total - mean) * Decimal::from(30),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Idle is always high. Otherwise by savings: `> 100` high, `< 10` low,
/// else (or unknown) medium.
pub fn priority_for(kind: RecommendationType, savings: Option<&Savings>) -> Priority {
    if kind == RecommendationType::Idle {
        return Priority::High;
    }
    match savings.map(|s| s.amount) {
        Some(amount) if amount > Decimal::from(100) => Priority::High,
        Some(amount) if amount < Decimal::from(10) => Priority::Low,
        _ => Priority::Medium,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
