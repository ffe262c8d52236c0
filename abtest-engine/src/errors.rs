// errors.rs - Structured error handling for the experimentation engine
//
// Every fallible engine operation returns an `EngineError`. Errors carry a
// kind (what invariant was violated), a stable code for programmatic handling,
// and optional JSON details so the owning workflow can log or notify without
// parsing messages.
//
// Validation errors are raised before any write happens, so an `Err` from a
// mutating operation means stored state is unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds categorize errors by the invariant or subsystem that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Traffic allocation is empty, out of range, or does not sum to 1.0
    InvalidAllocation,

    /// Lifecycle state machine rejected a status change
    InvalidTransition,

    /// Experiment or variant does not exist
    NotFound,

    /// Experiment has no control variant
    MissingControl,

    /// No metric samples exist for the experiment
    InsufficientData,

    /// The code-change collaborator failed to apply or revert a change
    ExternalCollaboratorFailure,

    /// Malformed experiment config, patch, or sample input
    InvalidConfig,

    /// Operation requires a running experiment
    NotRunning,

    /// Storage backend failure (sqlite, serialization of stored documents)
    Storage,

    /// Internal errors (poisoned locks, unexpected state)
    Internal,
}

impl ErrorKind {
    /// Returns true if retrying the same call may succeed
    #[must_use]
    pub fn is_typically_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::ExternalCollaboratorFailure | ErrorKind::Storage
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidAllocation => "invalid_allocation",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::NotFound => "not_found",
            ErrorKind::MissingControl => "missing_control",
            ErrorKind::InsufficientData => "insufficient_data",
            ErrorKind::ExternalCollaboratorFailure => "external_collaborator_failure",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Stable error codes, one per concrete failure.
///
/// Format: `AREA_SPECIFIC_ERROR` (e.g. `ALLOCATION_SUM_MISMATCH`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode(pub String);

impl ErrorCode {
    // Allocation
    pub const ALLOCATION_EMPTY: &'static str = "ALLOCATION_EMPTY";
    pub const ALLOCATION_OUT_OF_RANGE: &'static str = "ALLOCATION_OUT_OF_RANGE";
    pub const ALLOCATION_SUM_MISMATCH: &'static str = "ALLOCATION_SUM_MISMATCH";
    pub const ALLOCATION_DUPLICATE_VARIANT: &'static str = "ALLOCATION_DUPLICATE_VARIANT";
    pub const ALLOCATION_VARIANT_MISMATCH: &'static str = "ALLOCATION_VARIANT_MISMATCH";

    // Lifecycle
    pub const LIFECYCLE_INVALID_TRANSITION: &'static str = "LIFECYCLE_INVALID_TRANSITION";
    pub const LIFECYCLE_NOT_RUNNING: &'static str = "LIFECYCLE_NOT_RUNNING";

    // Lookup
    pub const EXPERIMENT_NOT_FOUND: &'static str = "EXPERIMENT_NOT_FOUND";
    pub const VARIANT_NOT_FOUND: &'static str = "VARIANT_NOT_FOUND";
    pub const OUTCOME_NOT_FOUND: &'static str = "OUTCOME_NOT_FOUND";

    // Config validation
    pub const CONFIG_MISSING_FIELD: &'static str = "CONFIG_MISSING_FIELD";
    pub const CONFIG_INVALID_VALUE: &'static str = "CONFIG_INVALID_VALUE";
    pub const CONFIG_MISSING_CONTROL: &'static str = "CONFIG_MISSING_CONTROL";

    // Analysis
    pub const ANALYSIS_NO_SAMPLES: &'static str = "ANALYSIS_NO_SAMPLES";

    // Collaborator
    pub const COLLABORATOR_CHANGE_FAILED: &'static str = "COLLABORATOR_CHANGE_FAILED";

    // Storage
    pub const STORAGE_QUERY_FAILED: &'static str = "STORAGE_QUERY_FAILED";
    pub const STORAGE_CORRUPT_ROW: &'static str = "STORAGE_CORRUPT_ROW";

    // Internal
    pub const INTERNAL_MUTEX_POISONED: &'static str = "INTERNAL_MUTEX_POISONED";
    pub const INTERNAL_UNEXPECTED_STATE: &'static str = "INTERNAL_UNEXPECTED_STATE";

    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Structured engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: ErrorKind,

    /// Stable error code for programmatic handling
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Whether the error is potentially recoverable with retry
    pub recoverable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_hint: Option<String>,
}

impl EngineError {
    #[must_use]
    pub fn new(kind: ErrorKind, code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            recoverable: kind.is_typically_recoverable(),
            details: None,
            recovery_hint: None,
        }
    }

    #[must_use]
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn with_recovery_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    // =========================================================================
    // Factory methods
    // =========================================================================

    // Allocation errors
    #[must_use]
    pub fn allocation_empty() -> Self {
        Self::new(
            ErrorKind::InvalidAllocation,
            ErrorCode::ALLOCATION_EMPTY,
            "Traffic allocation has no entries",
        )
    }

    #[must_use]
    pub fn allocation_out_of_range(variant_id: &str, fraction: f64) -> Self {
        Self::new(
            ErrorKind::InvalidAllocation,
            ErrorCode::ALLOCATION_OUT_OF_RANGE,
            format!("Allocation for variant '{variant_id}' is {fraction}, expected a value in [0, 1]"),
        )
        .with_details(serde_json::json!({ "variant_id": variant_id, "fraction": fraction }))
    }

    #[must_use]
    pub fn allocation_sum_mismatch(sum: f64, tolerance: f64) -> Self {
        Self::new(
            ErrorKind::InvalidAllocation,
            ErrorCode::ALLOCATION_SUM_MISMATCH,
            format!("Traffic allocation sums to {sum:.4}, expected 1.0 (±{tolerance})"),
        )
        .with_details(serde_json::json!({ "sum": sum, "tolerance": tolerance }))
        .with_recovery_hint("Adjust the fractions so they add up to 1.0.")
    }

    #[must_use]
    pub fn allocation_duplicate_variant(variant_id: &str) -> Self {
        Self::new(
            ErrorKind::InvalidAllocation,
            ErrorCode::ALLOCATION_DUPLICATE_VARIANT,
            format!("Variant '{variant_id}' appears more than once in the allocation"),
        )
        .with_details(serde_json::json!({ "variant_id": variant_id }))
    }

    #[must_use]
    pub fn allocation_variant_mismatch(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidAllocation,
            ErrorCode::ALLOCATION_VARIANT_MISMATCH,
            reason,
        )
    }

    // Lifecycle errors
    #[must_use]
    pub fn invalid_transition(experiment_id: &str, from: &str, to: &str) -> Self {
        Self::new(
            ErrorKind::InvalidTransition,
            ErrorCode::LIFECYCLE_INVALID_TRANSITION,
            format!("Experiment '{experiment_id}' cannot move from {from} to {to}"),
        )
        .with_details(serde_json::json!({
            "experiment_id": experiment_id,
            "from": from,
            "to": to
        }))
    }

    #[must_use]
    pub fn not_running(experiment_id: &str, status: &str) -> Self {
        Self::new(
            ErrorKind::NotRunning,
            ErrorCode::LIFECYCLE_NOT_RUNNING,
            format!("Experiment '{experiment_id}' is not running (status: {status})"),
        )
        .with_details(serde_json::json!({ "experiment_id": experiment_id, "status": status }))
        .with_recovery_hint("Start or resume the experiment before assigning visitors.")
    }

    // Lookup errors
    #[must_use]
    pub fn experiment_not_found(experiment_id: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            ErrorCode::EXPERIMENT_NOT_FOUND,
            format!("Experiment '{experiment_id}' not found"),
        )
        .with_details(serde_json::json!({ "experiment_id": experiment_id }))
    }

    #[must_use]
    pub fn variant_not_found(experiment_id: &str, variant_id: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            ErrorCode::VARIANT_NOT_FOUND,
            format!("Variant '{variant_id}' not found in experiment '{experiment_id}'"),
        )
        .with_details(serde_json::json!({
            "experiment_id": experiment_id,
            "variant_id": variant_id
        }))
    }

    #[must_use]
    pub fn outcome_not_found(experiment_id: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            ErrorCode::OUTCOME_NOT_FOUND,
            format!("No implementation outcome recorded for experiment '{experiment_id}'"),
        )
        .with_details(serde_json::json!({ "experiment_id": experiment_id }))
    }

    // Config errors
    #[must_use]
    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorKind::InvalidConfig,
            ErrorCode::CONFIG_MISSING_FIELD,
            format!("Required field '{field}' is missing or blank"),
        )
        .with_details(serde_json::json!({ "field": field }))
    }

    #[must_use]
    pub fn invalid_value(field: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorKind::InvalidConfig,
            ErrorCode::CONFIG_INVALID_VALUE,
            format!("Invalid value for '{field}': {reason}"),
        )
        .with_details(serde_json::json!({ "field": field, "reason": reason }))
    }

    #[must_use]
    pub fn missing_control(experiment_id: &str, found: usize) -> Self {
        Self::new(
            ErrorKind::MissingControl,
            ErrorCode::CONFIG_MISSING_CONTROL,
            format!("Experiment '{experiment_id}' needs exactly one control variant, found {found}"),
        )
        .with_details(serde_json::json!({ "experiment_id": experiment_id, "controls": found }))
    }

    // Analysis errors
    #[must_use]
    pub fn insufficient_data(experiment_id: &str) -> Self {
        Self::new(
            ErrorKind::InsufficientData,
            ErrorCode::ANALYSIS_NO_SAMPLES,
            format!("No metric samples recorded for experiment '{experiment_id}'"),
        )
        .with_details(serde_json::json!({ "experiment_id": experiment_id }))
        .with_recovery_hint("Wait for the metric producer to append samples, then retry.")
    }

    // Collaborator errors
    #[must_use]
    pub fn collaborator_failure(path: &str, error: &str) -> Self {
        Self::new(
            ErrorKind::ExternalCollaboratorFailure,
            ErrorCode::COLLABORATOR_CHANGE_FAILED,
            format!("Code-change collaborator failed for '{path}': {error}"),
        )
        .with_details(serde_json::json!({ "path": path, "error": error }))
    }

    // Storage errors
    #[must_use]
    pub fn storage_failed(operation: &str, error: &str) -> Self {
        Self::new(
            ErrorKind::Storage,
            ErrorCode::STORAGE_QUERY_FAILED,
            format!("Failed to {operation}: {error}"),
        )
        .with_details(serde_json::json!({ "operation": operation, "error": error }))
    }

    #[must_use]
    pub fn corrupt_row(table: &str, reason: &str) -> Self {
        Self::new(
            ErrorKind::Storage,
            ErrorCode::STORAGE_CORRUPT_ROW,
            format!("Corrupt row in '{table}': {reason}"),
        )
        .recoverable(false)
    }

    // Internal errors
    #[must_use]
    pub fn internal_mutex_poisoned(resource: &str) -> Self {
        Self::new(
            ErrorKind::Internal,
            ErrorCode::INTERNAL_MUTEX_POISONED,
            format!("{resource} mutex poisoned - a thread panicked while holding the lock"),
        )
        .recoverable(false)
        .with_recovery_hint("This indicates a serious internal error. Restart the engine.")
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.kind, self.code, self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::storage_failed("query database", &err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Storage, ErrorCode::STORAGE_CORRUPT_ROW, err.to_string())
            .recoverable(false)
    }
}

/// Collaborators report failures through `anyhow`; anything that reaches the
/// engine that way is attributed to the collaborator.
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => Self::new(
                ErrorKind::ExternalCollaboratorFailure,
                ErrorCode::COLLABORATOR_CHANGE_FAILED,
                format!("{other:#}"),
            ),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
