//! Metric sample ingestion and retrieval.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::models::{MetricSample, SampleQuery};
use super::sessions::require_id;
use crate::errors::{EngineError, EngineResult};
use crate::store::SampleRepository;

/// Append-only store of per-variant metric samples
pub struct MetricSampleStore {
    repo: Arc<dyn SampleRepository>,
}

impl MetricSampleStore {
    pub fn new(repo: Arc<dyn SampleRepository>) -> Self {
        Self { repo }
    }

    /// Append a sample. `metrics` must be a JSON object.
    ///
    /// The variant is not checked against the experiment; the analyzer
    /// ignores samples for variants it does not know.
    pub fn append(
        &self,
        experiment_id: &str,
        variant_id: &str,
        timestamp: DateTime<Utc>,
        metrics: &serde_json::Value,
    ) -> EngineResult<i64> {
        require_id("experimentId", experiment_id)?;
        require_id("variantId", variant_id)?;
        let metrics = metrics
            .as_object()
            .ok_or_else(|| EngineError::invalid_value("metrics", "expected a JSON object"))?;

        self.repo
            .append_sample(experiment_id, variant_id, timestamp, metrics)
    }

    pub fn query(&self, experiment_id: &str, query: &SampleQuery) -> EngineResult<Vec<MetricSample>> {
        self.repo.query_samples(experiment_id, query)
    }

    pub fn count(&self, experiment_id: &str) -> EngineResult<i64> {
        self.repo.count_samples(experiment_id)
    }
}
