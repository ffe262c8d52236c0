//! Experiment creation and the status state machine.
//!
//! ```text
//! created ──start──▶ running ──pause──▶ paused
//!                       ▲                  │
//!                       └──────start───────┘
//! created | running | paused ──stop──▶ stopped ──complete──▶ completed
//! ```
//!
//! All methods validate first and mutate only on success, so a rejected call
//! leaves the experiment untouched.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use super::models::{
    ChangeConfig, Experiment, ExperimentConfig, ExperimentPatch, ExperimentStatus, Variant,
    VariantChange, VariantKind, VariantStatus,
};
use crate::bucket::{equal_split, validate_allocation, AllocationEntry};
use crate::errors::{EngineError, EngineResult};

/// Defaults applied when a creation request leaves fields out
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreationDefaults {
    pub confidence_threshold: f64,
    pub duration_days: u32,
    pub min_duration_days: u32,
    pub max_duration_days: u32,
}

impl Default for CreationDefaults {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.95,
            duration_days: 14,
            min_duration_days: 7,
            max_duration_days: 56,
        }
    }
}

impl ExperimentStatus {
    /// Whether the state machine permits moving to `target`
    pub fn can_transition_to(self, target: ExperimentStatus) -> bool {
        use ExperimentStatus::{Completed, Created, Paused, Running, Stopped};
        matches!(
            (self, target),
            (Created | Paused, Running)
                | (Running, Paused)
                | (Created | Running | Paused | Stopped, Stopped)
                | (Stopped, Completed)
        )
    }
}

/// Estimate how many days an experiment needs to run.
///
/// Without traffic inputs this is the configured default. With an expected
/// daily visitor count and a relative minimum detectable effect, the
/// per-variant sample size follows Lehr's rule (`16 / mde²`, 80% power at
/// α = 0.05 for a unit-variance metric) and the result is clamped to the
/// configured bounds.
pub fn estimate_duration_days(
    variant_count: usize,
    expected_daily_visitors: Option<u64>,
    minimum_detectable_effect: Option<f64>,
    defaults: &CreationDefaults,
) -> u32 {
    let estimate = match (expected_daily_visitors, minimum_detectable_effect) {
        (Some(daily), Some(mde)) if daily > 0 && mde > 0.0 && mde.is_finite() => {
            let per_variant = 16.0 / (mde * mde);
            #[allow(clippy::cast_precision_loss)]
            let days = (per_variant * variant_count as f64 / daily as f64).ceil();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let days = days.min(f64::from(u32::MAX)) as u32;
            days
        }
        _ => defaults.duration_days,
    };

    estimate.clamp(defaults.min_duration_days, defaults.max_duration_days)
}

fn require(field: &str, value: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        return Err(EngineError::missing_field(field));
    }
    Ok(())
}

fn validate_threshold(value: f64) -> EngineResult<()> {
    if !(value > 0.0 && value < 1.0) {
        return Err(EngineError::invalid_value(
            "confidenceThreshold",
            format!("{value} is not inside (0, 1)"),
        ));
    }
    Ok(())
}

fn new_change(config: ChangeConfig) -> EngineResult<VariantChange> {
    require("changes.path", &config.path)?;
    Ok(VariantChange {
        id: Uuid::new_v4().to_string(),
        path: config.path,
        original: config.original,
        modified: config.modified,
        description: config.description,
        commit_hash: None,
    })
}

/// Check that `allocation` covers exactly the experiment's variants
pub fn validate_allocation_for(
    variants: &[Variant],
    allocation: &[AllocationEntry],
) -> EngineResult<()> {
    validate_allocation(allocation)?;

    let known: HashSet<&str> = variants.iter().map(|v| v.id.as_str()).collect();
    for entry in allocation {
        if !known.contains(entry.variant_id.as_str()) {
            return Err(EngineError::allocation_variant_mismatch(format!(
                "Allocation references unknown variant '{}'",
                entry.variant_id
            )));
        }
    }
    if allocation.len() != variants.len() {
        return Err(EngineError::allocation_variant_mismatch(format!(
            "Allocation covers {} of {} variants",
            allocation.len(),
            variants.len()
        )));
    }
    Ok(())
}

/// Build a new experiment in `created` state from a creation request.
pub fn build_experiment(
    config: ExperimentConfig,
    defaults: &CreationDefaults,
    now: DateTime<Utc>,
) -> EngineResult<Experiment> {
    require("name", &config.name)?;
    require("siteId", &config.site_id)?;
    require("metrics.primary", &config.metrics.primary)?;

    if config.variants.len() < 2 {
        return Err(EngineError::invalid_value(
            "variants",
            format!("at least 2 variants required, got {}", config.variants.len()),
        ));
    }

    let experiment_id = config
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let controls = config
        .variants
        .iter()
        .filter(|v| v.kind == VariantKind::Control)
        .count();
    if controls != 1 {
        return Err(EngineError::missing_control(&experiment_id, controls));
    }

    let confidence_threshold = config
        .confidence_threshold
        .unwrap_or(defaults.confidence_threshold);
    validate_threshold(confidence_threshold)?;

    let duration_days = match config.duration_days {
        Some(0) => {
            return Err(EngineError::invalid_value("durationDays", "must be positive"));
        }
        Some(days) => days,
        None => estimate_duration_days(
            config.variants.len(),
            config.expected_daily_visitors,
            config.minimum_detectable_effect,
            defaults,
        ),
    };

    // Names double as allocation keys, so both ids and names must be unique
    let mut seen_ids = HashSet::new();
    let mut seen_names = HashSet::new();
    let mut variants = Vec::with_capacity(config.variants.len());
    for variant_config in config.variants {
        require("variants.name", &variant_config.name)?;
        let id = variant_config
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !seen_ids.insert(id.clone()) {
            return Err(EngineError::invalid_value(
                "variants.id",
                format!("duplicate variant id '{id}'"),
            ));
        }
        if !seen_names.insert(variant_config.name.clone()) {
            return Err(EngineError::invalid_value(
                "variants.name",
                format!("duplicate variant name '{}'", variant_config.name),
            ));
        }
        let changes = variant_config
            .changes
            .into_iter()
            .map(new_change)
            .collect::<EngineResult<Vec<_>>>()?;
        variants.push(Variant {
            id,
            experiment_id: experiment_id.clone(),
            name: variant_config.name,
            kind: variant_config.kind,
            traffic_allocation: 0.0,
            status: if changes.is_empty() {
                VariantStatus::Created
            } else {
                VariantStatus::Implemented
            },
            changes,
        });
    }

    let traffic_allocation = match config.traffic_allocation {
        Some(entries) => {
            // Resolve names to ids
            let resolved: Vec<AllocationEntry> = entries
                .into_iter()
                .map(|entry| {
                    let id = variants
                        .iter()
                        .find(|v| v.id == entry.variant_id || v.name == entry.variant_id)
                        .map_or(entry.variant_id.clone(), |v| v.id.clone());
                    AllocationEntry::new(id, entry.fraction)
                })
                .collect();
            validate_allocation_for(&variants, &resolved)?;
            resolved
        }
        None => {
            let ids: Vec<String> = variants.iter().map(|v| v.id.clone()).collect();
            equal_split(&ids)
        }
    };

    let mut experiment = Experiment {
        id: experiment_id,
        name: config.name,
        site_id: config.site_id,
        description: config.description,
        hypothesis: config.hypothesis,
        status: ExperimentStatus::Created,
        variants,
        traffic_allocation,
        primary_metric: config.metrics.primary,
        secondary_metrics: config.metrics.secondary,
        metric_direction: config.metrics.direction,
        confidence_threshold,
        duration_days,
        start_date: None,
        end_date: None,
        created_at: now,
        updated_at: now,
    };
    experiment.sync_variant_allocations();

    Ok(experiment)
}

impl Experiment {
    fn transition(&mut self, target: ExperimentStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(EngineError::invalid_transition(
                &self.id,
                self.status.as_str(),
                target.as_str(),
            ));
        }
        self.status = target;
        Ok(())
    }

    fn set_variant_status(&mut self, status: VariantStatus) {
        for variant in &mut self.variants {
            variant.status = status;
        }
    }

    fn sync_variant_allocations(&mut self) {
        for entry in &self.traffic_allocation {
            if let Some(variant) = self
                .variants
                .iter_mut()
                .find(|v| v.id == entry.variant_id)
            {
                variant.traffic_allocation = entry.fraction;
            }
        }
    }

    fn refresh_end_date(&mut self) {
        self.end_date = self
            .start_date
            .map(|start| start + Duration::days(i64::from(self.duration_days)));
    }

    /// Start or resume. Only from `created` or `paused`.
    pub fn start(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(ExperimentStatus::Running)?;
        if self.start_date.is_none() {
            self.start_date = Some(now);
        }
        self.refresh_end_date();
        self.set_variant_status(VariantStatus::Active);
        self.updated_at = now;
        Ok(())
    }

    /// Pause a running experiment
    pub fn pause(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(ExperimentStatus::Paused)?;
        self.set_variant_status(VariantStatus::Paused);
        self.updated_at = now;
        Ok(())
    }

    /// Stop from any state but `completed`; repeated stops are no-ops
    pub fn stop(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(ExperimentStatus::Stopped)?;
        for variant in &mut self.variants {
            if variant.status != VariantStatus::Implemented {
                variant.status = VariantStatus::Stopped;
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Mark a stopped experiment as completed
    pub fn complete(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(ExperimentStatus::Completed)?;
        self.updated_at = now;
        Ok(())
    }

    /// Apply a field patch. Always bumps `updated_at`.
    pub fn apply_patch(&mut self, patch: ExperimentPatch, now: DateTime<Utc>) -> EngineResult<()> {
        if let Some(name) = &patch.name {
            require("name", name)?;
        }
        if let Some(metric) = &patch.primary_metric {
            require("metrics.primary", metric)?;
        }
        if let Some(threshold) = patch.confidence_threshold {
            validate_threshold(threshold)?;
        }
        if patch.duration_days == Some(0) {
            return Err(EngineError::invalid_value("durationDays", "must be positive"));
        }

        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = Some(description);
        }
        if let Some(hypothesis) = patch.hypothesis {
            self.hypothesis = Some(hypothesis);
        }
        if let Some(metric) = patch.primary_metric {
            self.primary_metric = metric;
        }
        if let Some(secondary) = patch.secondary_metrics {
            self.secondary_metrics = secondary;
        }
        if let Some(direction) = patch.metric_direction {
            self.metric_direction = direction;
        }
        if let Some(threshold) = patch.confidence_threshold {
            self.confidence_threshold = threshold;
        }
        if let Some(days) = patch.duration_days {
            self.duration_days = days;
            self.refresh_end_date();
        }
        self.updated_at = now;
        Ok(())
    }

    /// Replace the traffic allocation. Rejected once stopped or completed.
    pub fn set_allocation(
        &mut self,
        allocation: Vec<AllocationEntry>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::invalid_transition(
                &self.id,
                self.status.as_str(),
                "reallocated",
            ));
        }
        validate_allocation_for(&self.variants, &allocation)?;
        self.traffic_allocation = allocation;
        self.sync_variant_allocations();
        self.updated_at = now;
        Ok(())
    }

    /// Attach a change to a variant and return its id
    pub fn add_change(
        &mut self,
        variant_id: &str,
        change: ChangeConfig,
        now: DateTime<Utc>,
    ) -> EngineResult<String> {
        let experiment_id = self.id.clone();
        let change = new_change(change)?;
        let variant = self
            .variant_mut(variant_id)
            .ok_or_else(|| EngineError::variant_not_found(&experiment_id, variant_id))?;
        let id = change.id.clone();
        variant.changes.push(change);
        if variant.status == VariantStatus::Created {
            variant.status = VariantStatus::Implemented;
        }
        self.updated_at = now;
        Ok(id)
    }
}
