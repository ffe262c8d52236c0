//! Experiment definitions: the aggregate root of the engine.
//!
//! - [`models`]: experiments, variants, changes, creation/patch inputs
//! - [`lifecycle`]: creation validation and the status state machine

mod lifecycle;
mod models;

pub use lifecycle::{
    build_experiment, estimate_duration_days, validate_allocation_for, CreationDefaults,
};
pub use models::{
    ChangeConfig, Experiment, ExperimentConfig, ExperimentPatch, ExperimentStatus,
    MetricDirection, MetricsConfig, Variant, VariantChange, VariantConfig, VariantKind,
    VariantStatus,
};
