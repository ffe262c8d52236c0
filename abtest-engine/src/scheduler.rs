//! Expiry sweep: stop running experiments whose end date has passed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::{OutcomeStatus, StopOptions};
use crate::errors::{EngineError, EngineResult, ErrorCode, ErrorKind};
use crate::experiment::ExperimentStatus;
use crate::service::ExperimentService;
use crate::{log_error, log_info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Experiment id and the resulting outcome status
    pub stopped: Vec<(String, OutcomeStatus)>,
    /// Experiment id and error message
    pub failed: Vec<(String, String)>,
}

/// Stop every running experiment with `end_date <= now`.
///
/// A failure on one experiment is logged and reported; the sweep continues.
pub fn sweep_expired(service: &ExperimentService, now: DateTime<Utc>) -> EngineResult<SweepReport> {
    let mut report = SweepReport::default();

    for experiment in service.list_experiments(Some(ExperimentStatus::Running))? {
        if !experiment.is_expired(now) {
            continue;
        }

        match service.stop_experiment(&experiment.id, &StopOptions::default()) {
            Ok(result) => {
                log_info!("Expired experiment stopped", {
                    experiment_id: experiment.id.clone(),
                    end_date: experiment.end_date,
                    outcome: result.implementation.status.as_str()
                });
                report
                    .stopped
                    .push((experiment.id, result.implementation.status));
            }
            Err(e) => {
                log_error!("Failed to stop expired experiment", e, {
                    experiment_id: experiment.id.clone()
                });
                report.failed.push((experiment.id, e.to_string()));
            }
        }
    }

    Ok(report)
}

/// Run `sweep_expired` every `interval` until Ctrl-C
pub async fn run_sweeper(service: Arc<ExperimentService>, interval: Duration) -> EngineResult<()> {
    let mut ticker = tokio::time::interval(interval);
    log::info!("expiry sweeper running every {}s", interval.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let service = Arc::clone(&service);
                let report = tokio::task::spawn_blocking(move || sweep_expired(&service, Utc::now()))
                    .await
                    .map_err(|e| EngineError::new(
                        ErrorKind::Internal,
                        ErrorCode::INTERNAL_UNEXPECTED_STATE,
                        format!("sweep task failed: {e}"),
                    ))?;
                match report {
                    Ok(report) if !report.stopped.is_empty() || !report.failed.is_empty() => {
                        log::info!(
                            "sweep stopped {} experiment(s), {} failure(s)",
                            report.stopped.len(),
                            report.failed.len()
                        );
                    }
                    Ok(_) => log::debug!("sweep found no expired experiments"),
                    Err(e) => log::warn!("sweep failed: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("expiry sweeper shutting down");
                return Ok(());
            }
        }
    }
}
