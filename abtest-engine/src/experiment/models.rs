//! Type definitions for experiments, variants and their recorded changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bucket::AllocationEntry;

/// Experiment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a variant is the baseline or a challenger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    Control,
    Variant,
}

impl VariantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Variant => "variant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "control" => Some(Self::Control),
            "variant" => Some(Self::Variant),
            _ => None,
        }
    }
}

/// Implementation progress of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantStatus {
    Created,
    Implemented,
    Active,
    Paused,
    Stopped,
}

impl VariantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Implemented => "implemented",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "implemented" => Some(Self::Implemented),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Which way the primary metric should move for a variant to win.
///
/// `Maximize` reproduces the historical "higher mean wins" policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricDirection {
    #[default]
    Maximize,
    Minimize,
}

impl MetricDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maximize => "maximize",
            Self::Minimize => "minimize",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "maximize" => Some(Self::Maximize),
            "minimize" => Some(Self::Minimize),
            _ => None,
        }
    }

    /// True if `candidate` beats `incumbent` in this direction
    pub fn prefers(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

/// A content mutation carried by a variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantChange {
    pub id: String,
    pub path: String,
    pub original: String,
    pub modified: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Commit that materialized this change, once applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    pub experiment_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariantKind,
    /// Cached share of traffic, mirrors the experiment allocation
    pub traffic_allocation: f64,
    pub status: VariantStatus,
    #[serde(default)]
    pub changes: Vec<VariantChange>,
}

impl Variant {
    pub fn is_control(&self) -> bool {
        self.kind == VariantKind::Control
    }
}

/// Experiment aggregate root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub site_id: String,
    pub description: Option<String>,
    pub hypothesis: Option<String>,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    pub traffic_allocation: Vec<AllocationEntry>,
    pub primary_metric: String,
    pub secondary_metrics: Vec<String>,
    pub metric_direction: MetricDirection,
    pub confidence_threshold: f64,
    pub duration_days: u32,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    /// The single control variant, if the experiment is well formed
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control())
    }

    pub fn control_count(&self) -> usize {
        self.variants.iter().filter(|v| v.is_control()).count()
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    pub fn variant_mut(&mut self, variant_id: &str) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id == variant_id)
    }

    pub fn variant_ids(&self) -> Vec<String> {
        self.variants.iter().map(|v| v.id.clone()).collect()
    }

    /// True once `end_date` has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| end <= now)
    }
}

// ============================================================================
// Creation and patch inputs
// ============================================================================

/// Change supplied when creating a variant or attaching one later
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeConfig {
    pub path: String,
    pub original: String,
    pub modified: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariantKind,
    #[serde(default)]
    pub changes: Vec<ChangeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default)]
    pub primary: String,
    #[serde(default)]
    pub secondary: Vec<String>,
    #[serde(default)]
    pub direction: MetricDirection,
}

/// Experiment creation request.
///
/// `traffic_allocation` entries may name a variant by id or by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hypothesis: Option<String>,
    #[serde(default)]
    pub variants: Vec<VariantConfig>,
    #[serde(default)]
    pub traffic_allocation: Option<Vec<AllocationEntry>>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    #[serde(default)]
    pub duration_days: Option<u32>,
    /// Inputs to the duration heuristic when `duration_days` is absent
    #[serde(default)]
    pub expected_daily_visitors: Option<u64>,
    #[serde(default)]
    pub minimum_detectable_effect: Option<f64>,
}

/// Field patch for `update`; identity and creation time are not patchable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hypothesis: Option<String>,
    #[serde(default)]
    pub primary_metric: Option<String>,
    #[serde(default)]
    pub secondary_metrics: Option<Vec<String>>,
    #[serde(default)]
    pub metric_direction: Option<MetricDirection>,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    #[serde(default)]
    pub duration_days: Option<u32>,
}
