//! Type definitions for winner materialization and its audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to apply one variant change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub path: String,
    pub original: String,
    pub modified: String,
    pub message: String,
    pub branch: String,
}

/// Request to revert a previously applied change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub path: String,
    pub commit_hash: String,
    pub original: String,
    /// Content the change introduced; replaced by `original` on rollback
    pub modified: String,
    pub message: String,
    pub branch: String,
}

/// Change-set identifier returned by the collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReceipt {
    pub commit_hash: String,
}

/// The external code-change system.
///
/// Implementations must be safe to call from several threads; the
/// coordinator guarantees calls for one experiment are never concurrent.
pub trait CodeChangeSink: Send + Sync {
    fn implement_change(&self, request: &ChangeRequest) -> anyhow::Result<ChangeReceipt>;
    fn rollback_change(&self, request: &RollbackRequest) -> anyhow::Result<ChangeReceipt>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Applied,
    /// Already carried a commit hash from an earlier attempt
    Skipped,
    Failed,
    RolledBack,
}

/// Per-change result of an implementation or rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOutcome {
    pub change_id: String,
    pub path: String,
    pub status: ChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    NoWinner,
    NoChangesNeeded,
    Completed,
    PartialFailure,
    Failed,
    RolledBack,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoWinner => "no_winner",
            Self::NoChangesNeeded => "no_changes_needed",
            Self::Completed => "completed",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "no_winner" => Some(Self::NoWinner),
            "no_changes_needed" => Some(Self::NoChangesNeeded),
            "completed" => Some(Self::Completed),
            "partial_failure" => Some(Self::PartialFailure),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Summarize a batch of per-change results
    pub fn from_changes(changes: &[ChangeOutcome], success: OutcomeStatus) -> Self {
        let failed = changes
            .iter()
            .filter(|c| c.status == ChangeStatus::Failed)
            .count();
        if failed == 0 {
            success
        } else if failed == changes.len() {
            Self::Failed
        } else {
            Self::PartialFailure
        }
    }
}

/// Audit record of a stop/implement or rollback run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub test_id: String,
    pub winner_variant_id: Option<String>,
    pub control_variant_id: Option<String>,
    pub changes: Vec<ChangeOutcome>,
    pub status: OutcomeStatus,
    pub branch: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Options for `stop_and_implement`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOptions {
    /// Explicit winner, overriding the analysis
    #[serde(default)]
    pub winner_variant_id: Option<String>,
    /// Target branch; defaults to the engine's configured branch
    #[serde(default)]
    pub branch: Option<String>,
}
