//! Type definitions for visitor sessions and metric samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request context supplied with a visit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Explicit bot flag from an upstream classifier; OR-ed with user agent detection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_bot: Option<bool>,
}

/// First-seen assignment of a visitor within one experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorSession {
    pub experiment_id: String,
    pub visitor_id: String,
    pub variant_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub visit_count: i64,
    pub is_bot: bool,
    pub user_agent: Option<String>,
    pub device: Option<String>,
    pub referrer: Option<String>,
    pub country: Option<String>,
}

/// Result of recording a visit
#[derive(Debug, Clone, PartialEq)]
pub struct VisitRecord {
    pub session: VisitorSession,
    /// True if this call created the session
    pub created: bool,
}

/// Non-bot traffic counts for one variant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantSessionCounts {
    pub variant_id: String,
    /// Total visits (sum of visit counts)
    pub session_count: i64,
    pub unique_visitor_count: i64,
}

/// A stored metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub id: i64,
    pub experiment_id: String,
    pub variant_id: String,
    pub timestamp: DateTime<Utc>,
    /// Metric name → number or null; nested objects are addressed with dot paths
    pub metrics: serde_json::Map<String, serde_json::Value>,
}

impl MetricSample {
    /// Look up a numeric value by exact key, falling back to a dot-path walk.
    ///
    /// Null, missing and non-numeric values yield `None`.
    pub fn value(&self, path: &str) -> Option<f64> {
        if let Some(value) = self.metrics.get(path) {
            return value.as_f64();
        }

        let mut segments = path.split('.');
        let mut current = self.metrics.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        current.as_f64()
    }
}

/// Sort order for sample queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filters for `query`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleQuery {
    pub variant_id: Option<String>,
    /// Inclusive lower bound on timestamp
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on timestamp
    pub until: Option<DateTime<Utc>>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}
