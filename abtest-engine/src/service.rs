//! Experiment API: lifecycle, assignment, ingestion and status.
//!
//! `ExperimentService` owns one instance of each component and wires them
//! to the same repositories. It is `Send + Sync` and meant to be shared
//! behind an `Arc`. Mutations of one experiment are serialized through
//! [`ExperimentLocks`], which the winner coordinator shares.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::analysis::{AnalysisResult, SignificanceAnalyzer};
use crate::bucket::{AllocationEntry, BucketCache};
use crate::config::EngineConfig;
use crate::coordinator::{
    CodeChangeSink, ExperimentLocks, ImplementationOutcome, StopOptions, StopResult,
    WinnerCoordinator,
};
use crate::errors::{EngineError, EngineResult, ErrorKind};
use crate::experiment::{
    build_experiment, ChangeConfig, CreationDefaults, Experiment, ExperimentConfig,
    ExperimentPatch, ExperimentStatus, VariantKind,
};
use crate::log_info;
use crate::store::{
    ExperimentRepository, OutcomeRepository, SampleRepository, SessionRepository, SqliteStore,
};
use crate::tracking::{MetricSampleStore, VisitContext, VisitorSessionStore};

/// Per-variant traffic in a status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantTraffic {
    pub variant_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariantKind,
    pub traffic_allocation: f64,
    pub session_count: i64,
    pub unique_visitor_count: i64,
}

/// Merged view returned by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatusReport {
    pub experiment: Experiment,
    pub traffic: Vec<VariantTraffic>,
    pub total_sessions: i64,
    pub sample_count: i64,
    /// `None` until samples exist
    pub analysis: Option<AnalysisResult>,
    pub latest_outcome: Option<ImplementationOutcome>,
}

pub struct ExperimentService {
    experiments: Arc<dyn ExperimentRepository>,
    outcomes: Arc<dyn OutcomeRepository>,
    sessions: VisitorSessionStore,
    samples: MetricSampleStore,
    analyzer: Arc<SignificanceAnalyzer>,
    coordinator: WinnerCoordinator,
    locks: Arc<ExperimentLocks>,
    buckets: BucketCache,
    defaults: CreationDefaults,
}

impl ExperimentService {
    /// Build a service over one store implementing every repository
    pub fn new<S>(store: Arc<S>, sink: Arc<dyn CodeChangeSink>, config: &EngineConfig) -> Self
    where
        S: ExperimentRepository
            + SessionRepository
            + SampleRepository
            + OutcomeRepository
            + 'static,
    {
        let experiments: Arc<dyn ExperimentRepository> = store.clone();
        let outcomes: Arc<dyn OutcomeRepository> = store.clone();
        let sessions: Arc<dyn SessionRepository> = store.clone();
        let samples: Arc<dyn SampleRepository> = store;

        let analyzer = Arc::new(
            SignificanceAnalyzer::new(experiments.clone(), samples.clone())
                .with_max_samples(config.max_analysis_samples),
        );
        let locks = Arc::new(ExperimentLocks::new());
        let coordinator = WinnerCoordinator::new(
            experiments.clone(),
            outcomes.clone(),
            analyzer.clone(),
            sink,
            Arc::clone(&locks),
            config.default_branch.clone(),
        );

        Self {
            experiments,
            outcomes,
            sessions: VisitorSessionStore::new(sessions),
            samples: MetricSampleStore::new(samples),
            analyzer,
            coordinator,
            locks,
            buckets: BucketCache::new(),
            defaults: config.creation_defaults(),
        }
    }

    /// Open the SQLite store named by `config`
    pub fn open(config: &EngineConfig, sink: Arc<dyn CodeChangeSink>) -> EngineResult<Self> {
        let store = Arc::new(SqliteStore::new(config.db_path.clone())?);
        Ok(Self::new(store, sink, config))
    }

    pub fn sessions(&self) -> &VisitorSessionStore {
        &self.sessions
    }

    pub fn samples(&self) -> &MetricSampleStore {
        &self.samples
    }

    fn load(&self, experiment_id: &str) -> EngineResult<Experiment> {
        self.experiments
            .get_experiment(experiment_id)?
            .ok_or_else(|| EngineError::experiment_not_found(experiment_id))
    }

    pub fn get_experiment(&self, experiment_id: &str) -> EngineResult<Experiment> {
        self.load(experiment_id)
    }

    pub fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> EngineResult<Vec<Experiment>> {
        self.experiments.list_experiments(status)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn create_experiment(&self, config: ExperimentConfig) -> EngineResult<Experiment> {
        let experiment = build_experiment(config, &self.defaults, Utc::now())?;
        self.experiments.insert_experiment(&experiment)?;
        log_info!("Experiment created", {
            experiment_id: experiment.id.clone(),
            site_id: experiment.site_id.clone(),
            variants: experiment.variant_ids(),
            duration_days: experiment.duration_days
        });
        Ok(experiment)
    }

    pub fn start_experiment(&self, experiment_id: &str) -> EngineResult<Experiment> {
        let experiment = self.locks.with_lock(experiment_id, || {
            let mut experiment = self.load(experiment_id)?;
            experiment.start(Utc::now())?;
            self.experiments.save_experiment(&experiment)?;
            self.buckets
                .replace(experiment_id, &experiment.traffic_allocation)?;
            Ok(experiment)
        })?;
        log_info!("Experiment started", {
            experiment_id: experiment_id,
            start_date: experiment.start_date,
            end_date: experiment.end_date
        });
        Ok(experiment)
    }

    pub fn pause_experiment(&self, experiment_id: &str) -> EngineResult<Experiment> {
        let experiment = self.locks.with_lock(experiment_id, || {
            let mut experiment = self.load(experiment_id)?;
            experiment.pause(Utc::now())?;
            self.experiments.save_experiment(&experiment)?;
            Ok(experiment)
        })?;
        log_info!("Experiment paused", { experiment_id: experiment_id });
        Ok(experiment)
    }

    pub fn update_experiment(
        &self,
        experiment_id: &str,
        patch: ExperimentPatch,
    ) -> EngineResult<Experiment> {
        self.locks.with_lock(experiment_id, || {
            let mut experiment = self.load(experiment_id)?;
            experiment.apply_patch(patch, Utc::now())?;
            self.experiments.save_experiment(&experiment)?;
            Ok(experiment)
        })
    }

    /// Replace the traffic allocation and swap the bucket table.
    ///
    /// Visitors with a session keep their variant; only new visitors see
    /// the new split.
    pub fn update_allocation(
        &self,
        experiment_id: &str,
        allocation: Vec<AllocationEntry>,
    ) -> EngineResult<Experiment> {
        let experiment = self.locks.with_lock(experiment_id, || {
            let mut experiment = self.load(experiment_id)?;
            experiment.set_allocation(allocation, Utc::now())?;
            self.experiments.save_experiment(&experiment)?;
            self.buckets
                .replace(experiment_id, &experiment.traffic_allocation)?;
            Ok(experiment)
        })?;
        log_info!("Traffic allocation updated", {
            experiment_id: experiment_id,
            allocation: experiment.traffic_allocation.clone()
        });
        Ok(experiment)
    }

    /// Attach a change to a variant; returns the new change id
    pub fn add_change(
        &self,
        experiment_id: &str,
        variant_id: &str,
        change: ChangeConfig,
    ) -> EngineResult<String> {
        self.locks.with_lock(experiment_id, || {
            let mut experiment = self.load(experiment_id)?;
            if experiment.status == ExperimentStatus::Completed {
                return Err(EngineError::invalid_transition(
                    experiment_id,
                    experiment.status.as_str(),
                    "modified",
                ));
            }
            let change_id = experiment.add_change(variant_id, change, Utc::now())?;
            self.experiments.save_experiment(&experiment)?;
            Ok(change_id)
        })
    }

    /// Stop the experiment and implement the winner
    pub fn stop_experiment(
        &self,
        experiment_id: &str,
        options: &StopOptions,
    ) -> EngineResult<StopResult> {
        let result = self.coordinator.stop_and_implement(experiment_id, options)?;
        self.buckets.invalidate(experiment_id);
        Ok(result)
    }

    pub fn rollback_experiment(
        &self,
        experiment_id: &str,
        branch: Option<&str>,
    ) -> EngineResult<ImplementationOutcome> {
        self.coordinator.rollback(experiment_id, branch)
    }

    // ========================================================================
    // Traffic and samples
    // ========================================================================

    /// Assign a visitor and record the visit.
    ///
    /// Returning visitors get their stored variant even if the allocation
    /// has changed since their first visit.
    pub fn assign_variant(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        context: &VisitContext,
    ) -> EngineResult<String> {
        let experiment = self.load(experiment_id)?;
        if experiment.status != ExperimentStatus::Running {
            return Err(EngineError::not_running(
                experiment_id,
                experiment.status.as_str(),
            ));
        }

        let table = self
            .buckets
            .get_or_build(experiment_id, &experiment.traffic_allocation)?;
        let assigned = table
            .assign(experiment_id, visitor_id)
            .ok_or_else(EngineError::allocation_empty)?;

        let record =
            self.sessions
                .record_visit(experiment_id, visitor_id, assigned, context, Utc::now())?;
        Ok(record.session.variant_id)
    }

    /// Append a metric sample; `timestamp` defaults to now
    pub fn record_sample(
        &self,
        experiment_id: &str,
        variant_id: &str,
        timestamp: Option<DateTime<Utc>>,
        metrics: &serde_json::Value,
    ) -> EngineResult<i64> {
        self.samples.append(
            experiment_id,
            variant_id,
            timestamp.unwrap_or_else(Utc::now),
            metrics,
        )
    }

    pub fn analyze(&self, experiment_id: &str) -> EngineResult<AnalysisResult> {
        self.analyzer.analyze(experiment_id)
    }

    /// Experiment, per-variant traffic, sample count, analysis and last outcome
    pub fn get_status(&self, experiment_id: &str) -> EngineResult<ExperimentStatusReport> {
        let experiment = self.load(experiment_id)?;
        let counts = self.sessions.sessions_per_variant(experiment_id)?;

        let traffic: Vec<VariantTraffic> = experiment
            .variants
            .iter()
            .map(|variant| {
                let count = counts.iter().find(|c| c.variant_id == variant.id);
                VariantTraffic {
                    variant_id: variant.id.clone(),
                    name: variant.name.clone(),
                    kind: variant.kind,
                    traffic_allocation: variant.traffic_allocation,
                    session_count: count.map_or(0, |c| c.session_count),
                    unique_visitor_count: count.map_or(0, |c| c.unique_visitor_count),
                }
            })
            .collect();

        let analysis = match self.analyzer.analyze(experiment_id) {
            Ok(analysis) => Some(analysis),
            Err(e) if e.kind == ErrorKind::InsufficientData => None,
            Err(e) => return Err(e),
        };

        Ok(ExperimentStatusReport {
            total_sessions: traffic.iter().map(|t| t.session_count).sum(),
            sample_count: self.samples.count(experiment_id)?,
            latest_outcome: self.outcomes.latest_outcome(experiment_id)?,
            experiment,
            traffic,
            analysis,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::coordinator::{ChangeReceipt, ChangeRequest, RollbackRequest};
    use crate::experiment::{MetricsConfig, VariantConfig};
    use serde_json::json;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    struct NoopSink;

    impl CodeChangeSink for NoopSink {
        fn implement_change(&self, _request: &ChangeRequest) -> anyhow::Result<ChangeReceipt> {
            Ok(ChangeReceipt {
                commit_hash: "noop".to_string(),
            })
        }

        fn rollback_change(&self, _request: &RollbackRequest) -> anyhow::Result<ChangeReceipt> {
            Ok(ChangeReceipt {
                commit_hash: "noop".to_string(),
            })
        }
    }

    /// Parks `implement_change` until the test releases it
    struct BlockingSink {
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl CodeChangeSink for BlockingSink {
        fn implement_change(&self, _request: &ChangeRequest) -> anyhow::Result<ChangeReceipt> {
            self.entered.lock().unwrap().send(())?;
            self.release.lock().unwrap().recv()?;
            Ok(ChangeReceipt {
                commit_hash: "blocked".to_string(),
            })
        }

        fn rollback_change(&self, _request: &RollbackRequest) -> anyhow::Result<ChangeReceipt> {
            anyhow::bail!("not used")
        }
    }

    /// A running experiment with one change on `short`, stopped on a
    /// background thread that is parked inside the sink
    fn stop_in_progress() -> (
        Arc<ExperimentService>,
        Sender<()>,
        std::thread::JoinHandle<EngineResult<StopResult>>,
    ) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let sink = Arc::new(BlockingSink {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = Arc::new(ExperimentService::new(store, sink, &EngineConfig::default()));

        service.create_experiment(config()).unwrap();
        service
            .add_change(
                "exp-1",
                "short",
                ChangeConfig {
                    path: "signup.html".to_string(),
                    original: "<form long>".to_string(),
                    modified: "<form short>".to_string(),
                    description: None,
                },
            )
            .unwrap();
        service.start_experiment("exp-1").unwrap();

        let stopper = {
            let service = Arc::clone(&service);
            std::thread::spawn(move || {
                service.stop_experiment(
                    "exp-1",
                    &StopOptions {
                        winner_variant_id: Some("short".to_string()),
                        branch: None,
                    },
                )
            })
        };
        entered_rx.recv().unwrap();
        (service, release_tx, stopper)
    }

    fn service() -> ExperimentService {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        ExperimentService::new(store, Arc::new(NoopSink), &EngineConfig::default())
    }

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            id: Some("exp-1".to_string()),
            name: "Signup form".to_string(),
            site_id: "site-1".to_string(),
            variants: vec![
                VariantConfig {
                    id: Some("control".to_string()),
                    name: "Control".to_string(),
                    kind: VariantKind::Control,
                    changes: Vec::new(),
                },
                VariantConfig {
                    id: Some("short".to_string()),
                    name: "Short form".to_string(),
                    kind: VariantKind::Variant,
                    changes: Vec::new(),
                },
            ],
            metrics: MetricsConfig {
                primary: "conversion".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_lifecycle_guard() -> anyhow::Result<()> {
        let service = service();
        service.create_experiment(config())?;
        service.start_experiment("exp-1")?;

        let err = service.start_experiment("exp-1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition);

        service.pause_experiment("exp-1")?;
        let resumed = service.start_experiment("exp-1")?;
        assert_eq!(resumed.status, ExperimentStatus::Running);
        Ok(())
    }

    #[test]
    fn test_assign_requires_running() -> anyhow::Result<()> {
        let service = service();
        service.create_experiment(config())?;

        let err = service
            .assign_variant("exp-1", "visitor-1", &VisitContext::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotRunning);

        let err = service
            .assign_variant("missing", "visitor-1", &VisitContext::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        Ok(())
    }

    #[test]
    fn test_allocation_swap_keeps_existing_sessions() -> anyhow::Result<()> {
        let service = service();
        service.create_experiment(config())?;
        service.start_experiment("exp-1")?;

        let ctx = VisitContext::default();
        let before: Vec<(String, String)> = (0..40)
            .map(|i| {
                let visitor = format!("early-{i}");
                let variant = service.assign_variant("exp-1", &visitor, &ctx).unwrap();
                (visitor, variant)
            })
            .collect();
        assert!(before.iter().any(|(_, v)| v == "control"));

        service.update_allocation(
            "exp-1",
            vec![
                AllocationEntry::new("control", 0.0),
                AllocationEntry::new("short", 1.0),
            ],
        )?;

        for (visitor, variant) in &before {
            assert_eq!(&service.assign_variant("exp-1", visitor, &ctx)?, variant);
        }
        for i in 0..20 {
            let visitor = format!("late-{i}");
            assert_eq!(service.assign_variant("exp-1", &visitor, &ctx)?, "short");
        }
        Ok(())
    }

    #[test]
    fn test_invalid_allocation_leaves_state_untouched() -> anyhow::Result<()> {
        let service = service();
        let created = service.create_experiment(config())?;

        let err = service
            .update_allocation(
                "exp-1",
                vec![
                    AllocationEntry::new("control", 0.7),
                    AllocationEntry::new("short", 0.7),
                ],
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAllocation);
        assert_eq!(
            service.get_experiment("exp-1")?.traffic_allocation,
            created.traffic_allocation
        );
        Ok(())
    }

    #[test]
    fn test_status_zero_fills_and_degrades() -> anyhow::Result<()> {
        let service = service();
        service.create_experiment(config())?;

        let status = service.get_status("exp-1")?;
        assert_eq!(status.traffic.len(), 2);
        assert!(status.traffic.iter().all(|t| t.session_count == 0));
        assert_eq!(status.sample_count, 0);
        assert!(status.analysis.is_none());
        assert!(status.latest_outcome.is_none());

        service.start_experiment("exp-1")?;
        service.assign_variant("exp-1", "v1", &VisitContext::default())?;
        service.assign_variant("exp-1", "v1", &VisitContext::default())?;
        service.record_sample("exp-1", "control", None, &json!({ "conversion": 1.0 }))?;

        let status = service.get_status("exp-1")?;
        assert_eq!(status.total_sessions, 2);
        assert_eq!(status.sample_count, 1);
        assert!(status.analysis.is_some());
        Ok(())
    }

    #[test]
    fn test_add_change_and_stop() -> anyhow::Result<()> {
        let service = service();
        service.create_experiment(config())?;
        let change_id = service.add_change(
            "exp-1",
            "short",
            ChangeConfig {
                path: "signup.html".to_string(),
                original: "<form long>".to_string(),
                modified: "<form short>".to_string(),
                description: None,
            },
        )?;
        service.start_experiment("exp-1")?;

        let result = service.stop_experiment(
            "exp-1",
            &StopOptions {
                winner_variant_id: Some("short".to_string()),
                branch: None,
            },
        )?;
        assert_eq!(result.implementation.changes[0].change_id, change_id);

        let err = service
            .assign_variant("exp-1", "late", &VisitContext::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotRunning);
        Ok(())
    }

    #[test]
    fn test_update_during_stop_is_not_lost() -> anyhow::Result<()> {
        let (service, release, stopper) = stop_in_progress();

        let updater = {
            let service = Arc::clone(&service);
            std::thread::spawn(move || {
                service.update_experiment(
                    "exp-1",
                    ExperimentPatch {
                        name: Some("Renamed".to_string()),
                        ..Default::default()
                    },
                )
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        release.send(())?;

        let stopped = stopper.join().unwrap()?;
        assert_eq!(
            stopped.implementation.status,
            crate::coordinator::OutcomeStatus::Completed
        );
        updater.join().unwrap()?;

        let stored = service.get_experiment("exp-1")?;
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.status, ExperimentStatus::Completed);
        Ok(())
    }

    #[test]
    fn test_allocation_during_stop_cannot_reopen() -> anyhow::Result<()> {
        let (service, release, stopper) = stop_in_progress();

        let reallocator = {
            let service = Arc::clone(&service);
            std::thread::spawn(move || {
                service.update_allocation(
                    "exp-1",
                    vec![
                        AllocationEntry::new("control", 0.2),
                        AllocationEntry::new("short", 0.8),
                    ],
                )
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        release.send(())?;

        stopper.join().unwrap()?;
        let err = reallocator.join().unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition);

        let stored = service.get_experiment("exp-1")?;
        assert_eq!(stored.status, ExperimentStatus::Completed);
        assert!((stored.traffic_allocation[0].fraction - 0.5).abs() < 1e-9);
        Ok(())
    }
}
