//! Daily metric snapshots and the job kinds that produce them.

use chrono::{DateTime, NaiveDate, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::id::StoreCode;

/// Kind of daily sync. Each kind has its own upstream rate budget and its own
/// snapshot series.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
    /// Shop-level performance (visitors, orders, sales).
    ShopMetrics,
    /// Advertising spend and conversion metrics.
    AdsMetrics,
}

impl SyncKind {
    pub const ALL: [SyncKind; 2] = [SyncKind::ShopMetrics, SyncKind::AdsMetrics];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::ShopMetrics => "shop-metrics",
            SyncKind::AdsMetrics => "ads-metrics",
        }
    }

    /// Name recorded in run logs for this kind's daily job.
    pub fn job_name(&self) -> &'static str {
        match self {
            SyncKind::ShopMetrics => "daily-shop-metrics-sync",
            SyncKind::AdsMetrics => "daily-ads-metrics-sync",
        }
    }
}

impl core::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::unknown("sync kind", s))
    }
}

/// Metrics of one store for one calendar day.
///
/// Unique per `(store_code, kind, snapshot_date)`; re-syncing the same day
/// replaces the stored values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub store_code: StoreCode,
    pub kind: SyncKind,
    pub snapshot_date: NaiveDate,
    /// Metric name → value object as returned upstream.
    pub metrics: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

impl MetricSnapshot {
    pub fn new(
        store_code: StoreCode,
        kind: SyncKind,
        snapshot_date: NaiveDate,
        metrics: JsonValue,
    ) -> Self {
        Self {
            store_code,
            kind,
            snapshot_date,
            metrics,
            fetched_at: Utc::now(),
        }
    }

    /// Natural key of the snapshot.
    pub fn key(&self) -> (StoreCode, SyncKind, NaiveDate) {
        (self.store_code.clone(), self.kind, self.snapshot_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_their_names() {
        for kind in SyncKind::ALL {
            assert_eq!(kind.as_str().parse::<SyncKind>().unwrap(), kind);
        }
        assert!("orders".parse::<SyncKind>().is_err());
    }

    #[test]
    fn job_names_are_distinct_per_kind() {
        assert_ne!(
            SyncKind::ShopMetrics.job_name(),
            SyncKind::AdsMetrics.job_name()
        );
    }
}
