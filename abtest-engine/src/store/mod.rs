//! Persistence for experiments, sessions, samples and implementation outcomes.
//!
//! Components depend on the repository traits below, never on a concrete
//! store, so each service is handed exactly the repositories it needs.
//!
//! # Module Structure
//!
//! - [`schema`]: SQLite schema creation
//! - `experiments`, `sessions`, `samples`, `outcomes`: row-level SQL
//! - [`db`]: `SqliteStore`, which implements every repository trait
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(SqliteStore::new("experiments.db".into())?);
//! let sessions = VisitorSessionStore::new(store.clone());
//! let samples = MetricSampleStore::new(store.clone());
//! ```

mod db;
mod experiments;
mod outcomes;
mod samples;
pub mod schema;
mod sessions;

pub use db::SqliteStore;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::coordinator::ImplementationOutcome;
use crate::errors::EngineResult;
use crate::experiment::{Experiment, ExperimentStatus};
use crate::tracking::{
    MetricSample, SampleQuery, VariantSessionCounts, VisitContext, VisitRecord, VisitorSession,
};

/// Document storage for experiment aggregates (variants and changes included)
pub trait ExperimentRepository: Send + Sync {
    /// Insert a new experiment; fails if the id is taken
    fn insert_experiment(&self, experiment: &Experiment) -> EngineResult<()>;

    /// Persist the full aggregate over its previous version
    fn save_experiment(&self, experiment: &Experiment) -> EngineResult<()>;

    fn get_experiment(&self, experiment_id: &str) -> EngineResult<Option<Experiment>>;

    fn list_experiments(&self, status: Option<ExperimentStatus>) -> EngineResult<Vec<Experiment>>;
}

/// Storage for visitor sessions keyed by `(experiment_id, visitor_id)`
pub trait SessionRepository: Send + Sync {
    /// Insert the session if absent, otherwise touch it; never changes the variant
    fn record_visit(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        assigned_variant_id: &str,
        context: &VisitContext,
        is_bot: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<VisitRecord>;

    fn get_session(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> EngineResult<Option<VisitorSession>>;

    /// Non-bot counts for variants that have at least one session
    fn session_counts(&self, experiment_id: &str) -> EngineResult<Vec<VariantSessionCounts>>;
}

/// Append-only metric sample storage
pub trait SampleRepository: Send + Sync {
    fn append_sample(
        &self,
        experiment_id: &str,
        variant_id: &str,
        timestamp: DateTime<Utc>,
        metrics: &serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<i64>;

    fn query_samples(
        &self,
        experiment_id: &str,
        query: &SampleQuery,
    ) -> EngineResult<Vec<MetricSample>>;

    fn count_samples(&self, experiment_id: &str) -> EngineResult<i64>;
}

/// Audit storage for coordinator runs
pub trait OutcomeRepository: Send + Sync {
    fn record_outcome(&self, outcome: &ImplementationOutcome) -> EngineResult<i64>;

    fn latest_outcome(&self, experiment_id: &str) -> EngineResult<Option<ImplementationOutcome>>;
}

/// Fixed-width UTC timestamps so text ordering matches time ordering
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Wrap a decoding problem as a row conversion failure
pub(crate) fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(message.into())
}
