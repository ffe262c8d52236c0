//! Stop an experiment and materialize its winner.
//!
//! Runs hold the experiment's entry in the shared [`ExperimentLocks`], the
//! same lock the service takes for every other mutation of that experiment.
//! Every applied change has its commit hash persisted immediately, so an
//! interrupted or partially failed run can be retried and already-applied
//! changes are skipped.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::locks::ExperimentLocks;
use super::models::{
    ChangeOutcome, ChangeRequest, ChangeStatus, CodeChangeSink, ImplementationOutcome,
    OutcomeStatus, RollbackRequest, StopOptions,
};
use crate::analysis::{AnalysisResult, SignificanceAnalyzer};
use crate::errors::{EngineError, EngineResult, ErrorKind};
use crate::experiment::{Experiment, ExperimentStatus, VariantStatus};
use crate::store::{ExperimentRepository, OutcomeRepository};
use crate::{log_error, log_info, log_warn};

/// Result of `stop_and_implement`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResult {
    /// `None` when no samples had been recorded
    pub analysis: Option<AnalysisResult>,
    #[serde(rename = "implementationResult")]
    pub implementation: ImplementationOutcome,
}

pub struct WinnerCoordinator {
    experiments: Arc<dyn ExperimentRepository>,
    outcomes: Arc<dyn OutcomeRepository>,
    analyzer: Arc<SignificanceAnalyzer>,
    sink: Arc<dyn CodeChangeSink>,
    default_branch: String,
    locks: Arc<ExperimentLocks>,
}

impl WinnerCoordinator {
    pub fn new(
        experiments: Arc<dyn ExperimentRepository>,
        outcomes: Arc<dyn OutcomeRepository>,
        analyzer: Arc<SignificanceAnalyzer>,
        sink: Arc<dyn CodeChangeSink>,
        locks: Arc<ExperimentLocks>,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            experiments,
            outcomes,
            analyzer,
            sink,
            default_branch: default_branch.into(),
            locks,
        }
    }

    fn load(&self, experiment_id: &str) -> EngineResult<Experiment> {
        self.experiments
            .get_experiment(experiment_id)?
            .ok_or_else(|| EngineError::experiment_not_found(experiment_id))
    }

    /// Stop the experiment and apply the winning variant's changes.
    ///
    /// The winner is `options.winner_variant_id` if given, otherwise the
    /// analysis winner. Change failures are captured in the outcome and
    /// never abort the run. The experiment is completed only when every
    /// change is in place; otherwise it stays `stopped` so the run can be
    /// retried.
    pub fn stop_and_implement(
        &self,
        experiment_id: &str,
        options: &StopOptions,
    ) -> EngineResult<StopResult> {
        self.locks
            .with_lock(experiment_id, || self.stop_locked(experiment_id, options))
    }

    fn stop_locked(&self, experiment_id: &str, options: &StopOptions) -> EngineResult<StopResult> {
        let mut experiment = self.load(experiment_id)?;
        if !experiment.status.can_transition_to(ExperimentStatus::Stopped) {
            return Err(EngineError::invalid_transition(
                experiment_id,
                experiment.status.as_str(),
                ExperimentStatus::Stopped.as_str(),
            ));
        }
        if let Some(winner_id) = &options.winner_variant_id {
            if experiment.variant(winner_id).is_none() {
                return Err(EngineError::variant_not_found(experiment_id, winner_id));
            }
        }

        let analysis = match self.analyzer.analyze(experiment_id) {
            Ok(analysis) => Some(analysis),
            Err(e) if e.kind == ErrorKind::InsufficientData => {
                log_warn!("Stopping experiment without samples", {
                    experiment_id: experiment_id
                });
                None
            }
            Err(e) => return Err(e),
        };

        experiment.stop(Utc::now())?;
        self.experiments.save_experiment(&experiment)?;
        log_info!("Experiment stopped", {
            experiment_id: experiment_id,
            has_winner: analysis.as_ref().is_some_and(|a| a.has_winner)
        });

        let winner_id = options
            .winner_variant_id
            .clone()
            .or_else(|| analysis.as_ref()?.winner.as_ref().map(|w| w.id.clone()));
        let branch = options
            .branch
            .clone()
            .unwrap_or_else(|| self.default_branch.clone());
        let control_id = experiment.control().map(|c| c.id.clone());

        let (status, changes) = match winner_id.as_deref() {
            None => (OutcomeStatus::NoWinner, Vec::new()),
            Some(id) if Some(id) == control_id.as_deref() => {
                experiment.complete(Utc::now())?;
                self.experiments.save_experiment(&experiment)?;
                (OutcomeStatus::NoChangesNeeded, Vec::new())
            }
            Some(id) => {
                let changes = self.apply_winner(&mut experiment, id, &branch)?;
                let status = OutcomeStatus::from_changes(&changes, OutcomeStatus::Completed);
                if status == OutcomeStatus::Completed {
                    if let Some(variant) = experiment.variant_mut(id) {
                        variant.status = VariantStatus::Implemented;
                    }
                    experiment.complete(Utc::now())?;
                    self.experiments.save_experiment(&experiment)?;
                } else {
                    log_warn!("Experiment left stopped for retry", {
                        experiment_id: experiment_id,
                        status: status.as_str()
                    });
                }
                (status, changes)
            }
        };

        let mut implementation = ImplementationOutcome {
            id: None,
            test_id: experiment_id.to_string(),
            winner_variant_id: winner_id,
            control_variant_id: control_id,
            changes,
            status,
            branch: Some(branch),
            recorded_at: Utc::now(),
        };
        implementation.id = Some(self.outcomes.record_outcome(&implementation)?);

        log_info!("Winner implementation finished", {
            experiment_id: experiment_id,
            winner: implementation.winner_variant_id.clone(),
            status: implementation.status.as_str(),
            changes: implementation.changes.len()
        });

        Ok(StopResult {
            analysis,
            implementation,
        })
    }

    fn apply_winner(
        &self,
        experiment: &mut Experiment,
        winner_id: &str,
        branch: &str,
    ) -> EngineResult<Vec<ChangeOutcome>> {
        let experiment_name = experiment.name.clone();
        let variant = experiment
            .variant(winner_id)
            .ok_or_else(|| EngineError::variant_not_found(&experiment.id, winner_id))?;
        let variant_name = variant.name.clone();
        let pending = variant.changes.clone();

        let mut outcomes = Vec::with_capacity(pending.len());
        for change in pending {
            if let Some(hash) = change.commit_hash {
                log::debug!("change {} already applied as {hash}", change.id);
                outcomes.push(ChangeOutcome {
                    change_id: change.id,
                    path: change.path,
                    status: ChangeStatus::Skipped,
                    commit_hash: Some(hash),
                    error: None,
                });
                continue;
            }

            let request = ChangeRequest {
                path: change.path.clone(),
                original: change.original.clone(),
                modified: change.modified.clone(),
                message: format!(
                    "A/B test '{experiment_name}': apply winning variant '{variant_name}' ({})",
                    change.description.as_deref().unwrap_or(&change.path)
                ),
                branch: branch.to_string(),
            };

            match self.sink.implement_change(&request) {
                Ok(receipt) => {
                    set_commit_hash(experiment, winner_id, &change.id, Some(&receipt.commit_hash));
                    self.experiments.save_experiment(experiment)?;
                    outcomes.push(ChangeOutcome {
                        change_id: change.id,
                        path: change.path,
                        status: ChangeStatus::Applied,
                        commit_hash: Some(receipt.commit_hash),
                        error: None,
                    });
                }
                Err(e) => {
                    let failure = EngineError::collaborator_failure(&change.path, &format!("{e:#}"));
                    log_error!("Failed to apply change", failure, {
                        experiment_id: experiment.id.clone(),
                        change_id: change.id.clone()
                    });
                    outcomes.push(ChangeOutcome {
                        change_id: change.id,
                        path: change.path,
                        status: ChangeStatus::Failed,
                        commit_hash: None,
                        error: Some(failure.message),
                    });
                }
            }
        }

        Ok(outcomes)
    }

    /// Revert the changes applied by the most recent implementation run.
    ///
    /// Changes are replayed newest first. Changes whose commit hash was
    /// already cleared are left out.
    pub fn rollback(
        &self,
        experiment_id: &str,
        branch: Option<&str>,
    ) -> EngineResult<ImplementationOutcome> {
        self.locks
            .with_lock(experiment_id, || self.rollback_locked(experiment_id, branch))
    }

    fn rollback_locked(
        &self,
        experiment_id: &str,
        branch: Option<&str>,
    ) -> EngineResult<ImplementationOutcome> {
        let mut experiment = self.load(experiment_id)?;
        let last = self
            .outcomes
            .latest_outcome(experiment_id)?
            .ok_or_else(|| EngineError::outcome_not_found(experiment_id))?;
        let winner_id = last
            .winner_variant_id
            .clone()
            .ok_or_else(|| EngineError::outcome_not_found(experiment_id))?;
        let branch = branch
            .map(str::to_string)
            .or_else(|| last.branch.clone())
            .unwrap_or_else(|| self.default_branch.clone());

        let mut results = Vec::new();
        for applied in last.changes.iter().rev() {
            let Some(change) = experiment
                .variant(&winner_id)
                .and_then(|v| v.changes.iter().find(|c| c.id == applied.change_id))
                .cloned()
            else {
                continue;
            };
            let Some(commit_hash) = change.commit_hash.clone() else {
                continue;
            };

            let request = RollbackRequest {
                path: change.path.clone(),
                commit_hash,
                original: change.original.clone(),
                modified: change.modified.clone(),
                message: format!(
                    "A/B test '{}': roll back {}",
                    experiment.name,
                    change.description.as_deref().unwrap_or(&change.path)
                ),
                branch: branch.clone(),
            };

            match self.sink.rollback_change(&request) {
                Ok(receipt) => {
                    set_commit_hash(&mut experiment, &winner_id, &change.id, None);
                    self.experiments.save_experiment(&experiment)?;
                    results.push(ChangeOutcome {
                        change_id: change.id,
                        path: change.path,
                        status: ChangeStatus::RolledBack,
                        commit_hash: Some(receipt.commit_hash),
                        error: None,
                    });
                }
                Err(e) => {
                    let failure = EngineError::collaborator_failure(&change.path, &format!("{e:#}"));
                    log_error!("Failed to roll back change", failure, {
                        experiment_id: experiment_id,
                        change_id: change.id.clone()
                    });
                    results.push(ChangeOutcome {
                        change_id: change.id,
                        path: change.path,
                        status: ChangeStatus::Failed,
                        commit_hash: None,
                        error: Some(failure.message),
                    });
                }
            }
        }

        let status = OutcomeStatus::from_changes(&results, OutcomeStatus::RolledBack);
        if status == OutcomeStatus::RolledBack {
            if let Some(variant) = experiment.variant_mut(&winner_id) {
                variant.status = VariantStatus::Stopped;
            }
            experiment.updated_at = Utc::now();
            self.experiments.save_experiment(&experiment)?;
        }

        let mut outcome = ImplementationOutcome {
            id: None,
            test_id: experiment_id.to_string(),
            winner_variant_id: Some(winner_id),
            control_variant_id: last.control_variant_id,
            changes: results,
            status,
            branch: Some(branch),
            recorded_at: Utc::now(),
        };
        outcome.id = Some(self.outcomes.record_outcome(&outcome)?);

        log_info!("Rollback finished", {
            experiment_id: experiment_id,
            status: outcome.status.as_str(),
            changes: outcome.changes.len()
        });

        Ok(outcome)
    }
}

fn set_commit_hash(
    experiment: &mut Experiment,
    variant_id: &str,
    change_id: &str,
    commit_hash: Option<&str>,
) {
    if let Some(change) = experiment
        .variant_mut(variant_id)
        .and_then(|v| v.changes.iter_mut().find(|c| c.id == change_id))
    {
        change.commit_hash = commit_hash.map(str::to_string);
    }
}
