//! Structured audit logging for experiment lifecycle events
//!
//! Emits one JSON object per event through the `log` facade on the
//! `abtest::audit` target, so the binary's `env_logger` (or any other
//! logger the embedding workflow installs) decides where entries go.
//!
//! # Example
//! ```ignore
//! log_info!("Experiment started", {
//!     experiment_id: experiment.id.clone(),
//!     end_date: experiment.end_date
//! });
//! ```

use chrono::Utc;

/// Log target used by the audit macros
pub const AUDIT_TARGET: &str = "abtest::audit";

/// ISO 8601 timestamp for log entries
pub fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Unique error ID so a logged failure can be matched to a report
pub fn generate_error_id() -> String {
    format!("ERR-{:x}", Utc::now().timestamp_millis())
}

/// Log structured INFO event
#[macro_export]
macro_rules! log_info {
    ($msg:expr, { $($key:ident: $val:expr),* $(,)? }) => {{
        let context = serde_json::json!({
            $(stringify!($key): $val,)*
        });
        let entry = serde_json::json!({
            "timestamp": $crate::logging::timestamp(),
            "level": "INFO",
            "message": $msg,
            "context": context
        });
        log::info!(target: $crate::logging::AUDIT_TARGET, "{}", entry);
    }};
}

/// Log structured WARN event
#[macro_export]
macro_rules! log_warn {
    ($msg:expr, { $($key:ident: $val:expr),* $(,)? }) => {{
        let context = serde_json::json!({
            $(stringify!($key): $val,)*
        });
        let entry = serde_json::json!({
            "timestamp": $crate::logging::timestamp(),
            "level": "WARN",
            "message": $msg,
            "context": context
        });
        log::warn!(target: $crate::logging::AUDIT_TARGET, "{}", entry);
    }};
}

/// Log structured ERROR event with a generated error id
#[macro_export]
macro_rules! log_error {
    ($msg:expr, $err:expr, { $($key:ident: $val:expr),* $(,)? }) => {{
        let error_id = $crate::logging::generate_error_id();
        let context = serde_json::json!({
            "errorId": error_id,
            "errorMessage": format!("{}", $err),
            $(stringify!($key): $val,)*
        });
        let entry = serde_json::json!({
            "timestamp": $crate::logging::timestamp(),
            "level": "ERROR",
            "message": $msg,
            "context": context
        });
        log::error!(target: $crate::logging::AUDIT_TARGET, "{}", entry);
    }};
}
