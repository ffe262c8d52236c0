//! Analysis result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stats::DescriptiveStats;
use crate::experiment::{MetricDirection, VariantKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantStatistics {
    pub variant_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariantKind,
    #[serde(flatten)]
    pub stats: DescriptiveStats,
}

/// Comparison of one non-control variant against the control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub variant_id: String,
    pub t_value: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
    pub is_significant: bool,
    /// `(1 - p) * 100`
    pub confidence_level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerSummary {
    pub id: String,
    pub name: String,
    pub mean: f64,
}

/// Derived analysis of an experiment's primary metric; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub experiment_id: String,
    pub metric: String,
    pub direction: MetricDirection,
    pub confidence_threshold: f64,
    pub control_variant_id: String,
    pub variants: Vec<VariantStatistics>,
    pub test_results: Vec<TestResult>,
    pub has_winner: bool,
    pub winner: Option<WinnerSummary>,
    pub improvement_percentage: Option<f64>,
    pub sample_count: usize,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn variant(&self, variant_id: &str) -> Option<&VariantStatistics> {
        self.variants.iter().find(|v| v.variant_id == variant_id)
    }

    pub fn test_for(&self, variant_id: &str) -> Option<&TestResult> {
        self.test_results.iter().find(|t| t.variant_id == variant_id)
    }
}
