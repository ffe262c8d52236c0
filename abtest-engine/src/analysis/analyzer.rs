//! Significance analysis of an experiment's primary metric.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::models::{AnalysisResult, TestResult, VariantStatistics, WinnerSummary};
use super::stats::{pooled_t_test, DescriptiveStats};
use crate::errors::{EngineError, EngineResult};
use crate::experiment::Experiment;
use crate::store::{ExperimentRepository, SampleRepository};
use crate::tracking::{MetricSample, SampleQuery, SortOrder};

/// Read-only analyzer over stored experiments and samples
pub struct SignificanceAnalyzer {
    experiments: Arc<dyn ExperimentRepository>,
    samples: Arc<dyn SampleRepository>,
    max_samples: Option<usize>,
}

impl SignificanceAnalyzer {
    pub fn new(
        experiments: Arc<dyn ExperimentRepository>,
        samples: Arc<dyn SampleRepository>,
    ) -> Self {
        Self {
            experiments,
            samples,
            max_samples: None,
        }
    }

    /// Only analyze the most recent `max` samples
    #[must_use]
    pub fn with_max_samples(mut self, max: Option<usize>) -> Self {
        self.max_samples = max;
        self
    }

    pub fn analyze(&self, experiment_id: &str) -> EngineResult<AnalysisResult> {
        let experiment = self
            .experiments
            .get_experiment(experiment_id)?
            .ok_or_else(|| EngineError::experiment_not_found(experiment_id))?;

        if experiment.control().is_none() {
            return Err(EngineError::missing_control(experiment_id, 0));
        }

        let query = SampleQuery {
            order: if self.max_samples.is_some() {
                SortOrder::Descending
            } else {
                SortOrder::Ascending
            },
            limit: self.max_samples,
            ..Default::default()
        };
        let samples = self.samples.query_samples(experiment_id, &query)?;

        analyze_samples(&experiment, &samples, Utc::now())
    }
}

/// Analyze `samples` against `experiment` without touching storage
pub fn analyze_samples(
    experiment: &Experiment,
    samples: &[MetricSample],
    now: DateTime<Utc>,
) -> EngineResult<AnalysisResult> {
    let control = experiment
        .control()
        .ok_or_else(|| EngineError::missing_control(&experiment.id, 0))?;
    if samples.is_empty() {
        return Err(EngineError::insufficient_data(&experiment.id));
    }

    let metric = experiment.primary_metric.as_str();
    let mut values: Vec<Vec<f64>> = vec![Vec::new(); experiment.variants.len()];
    for sample in samples {
        let Some(index) = experiment
            .variants
            .iter()
            .position(|v| v.id == sample.variant_id)
        else {
            continue;
        };
        if let Some(value) = sample.value(metric).filter(|v| v.is_finite()) {
            values[index].push(value);
        }
    }

    let variants: Vec<VariantStatistics> = experiment
        .variants
        .iter()
        .zip(&values)
        .map(|(variant, values)| VariantStatistics {
            variant_id: variant.id.clone(),
            name: variant.name.clone(),
            kind: variant.kind,
            stats: DescriptiveStats::from_values(values),
        })
        .collect();

    let control_stats = variants
        .iter()
        .find(|v| v.variant_id == control.id)
        .map(|v| v.stats.clone())
        .unwrap_or_default();

    let alpha = 1.0 - experiment.confidence_threshold;
    let test_results: Vec<TestResult> = variants
        .iter()
        .filter(|v| v.variant_id != control.id)
        .filter_map(|v| {
            let test = pooled_t_test(&control_stats, &v.stats)?;
            Some(TestResult {
                variant_id: v.variant_id.clone(),
                t_value: test.t_value,
                degrees_of_freedom: test.degrees_of_freedom,
                p_value: test.p_value,
                is_significant: test.p_value < alpha,
                confidence_level: (1.0 - test.p_value) * 100.0,
            })
        })
        .collect();

    let direction = experiment.metric_direction;
    let mut winner: Option<WinnerSummary> = None;
    for test in test_results.iter().filter(|t| t.is_significant) {
        let Some(stats) = variants.iter().find(|v| v.variant_id == test.variant_id) else {
            continue;
        };
        let Some(mean) = stats.stats.mean else {
            continue;
        };
        let better = winner
            .as_ref()
            .map_or(true, |current| direction.prefers(mean, current.mean));
        if better {
            winner = Some(WinnerSummary {
                id: stats.variant_id.clone(),
                name: stats.name.clone(),
                mean,
            });
        }
    }

    let improvement_percentage = match (&winner, control_stats.mean) {
        (Some(w), Some(control_mean)) if control_mean != 0.0 => {
            Some((w.mean - control_mean) / control_mean * 100.0)
        }
        _ => None,
    };

    Ok(AnalysisResult {
        experiment_id: experiment.id.clone(),
        metric: metric.to_string(),
        direction,
        confidence_threshold: experiment.confidence_threshold,
        control_variant_id: control.id.clone(),
        variants,
        test_results,
        has_winner: winner.is_some(),
        winner,
        improvement_percentage,
        sample_count: samples.len(),
        analyzed_at: now,
    })
}
