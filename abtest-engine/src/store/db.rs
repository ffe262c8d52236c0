//! SQLite-backed store.
//!
//! One connection behind a mutex. Each repository call holds the lock for
//! its whole read-modify-write, and aggregate saves run in a transaction.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use super::schema::init_schema;
use super::{
    experiments, outcomes, samples, sessions, ExperimentRepository, OutcomeRepository,
    SampleRepository, SessionRepository,
};
use crate::coordinator::ImplementationOutcome;
use crate::errors::{EngineError, EngineResult};
use crate::experiment::{Experiment, ExperimentStatus};
use crate::tracking::{
    MetricSample, SampleQuery, VariantSessionCounts, VisitContext, VisitRecord, VisitorSession,
};

/// Experiment database shared by every component
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the database at the given path
    pub fn new(db_path: PathBuf) -> EngineResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::storage_failed("create database directory", &e.to_string())
                })?;
            }
        }
        let conn = Connection::open(&db_path)?;
        init_schema(&conn)?;
        log::debug!("opened experiment store at {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::internal_mutex_poisoned("sqlite connection"))
    }
}

impl ExperimentRepository for SqliteStore {
    fn insert_experiment(&self, experiment: &Experiment) -> EngineResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        experiments::insert_experiment(&tx, experiment)?;
        tx.commit()?;
        Ok(())
    }

    fn save_experiment(&self, experiment: &Experiment) -> EngineResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        experiments::update_experiment(&tx, experiment)?;
        tx.commit()?;
        Ok(())
    }

    fn get_experiment(&self, experiment_id: &str) -> EngineResult<Option<Experiment>> {
        let conn = self.lock()?;
        experiments::get_experiment(&conn, experiment_id)
    }

    fn list_experiments(&self, status: Option<ExperimentStatus>) -> EngineResult<Vec<Experiment>> {
        let conn = self.lock()?;
        experiments::list_experiments(&conn, status)
    }
}

impl SessionRepository for SqliteStore {
    fn record_visit(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        assigned_variant_id: &str,
        context: &VisitContext,
        is_bot: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<VisitRecord> {
        let conn = self.lock()?;
        sessions::record_visit(
            &conn,
            experiment_id,
            visitor_id,
            assigned_variant_id,
            context,
            is_bot,
            now,
        )
    }

    fn get_session(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> EngineResult<Option<VisitorSession>> {
        let conn = self.lock()?;
        sessions::get_session(&conn, experiment_id, visitor_id)
    }

    fn session_counts(&self, experiment_id: &str) -> EngineResult<Vec<VariantSessionCounts>> {
        let conn = self.lock()?;
        sessions::session_counts(&conn, experiment_id)
    }
}

impl SampleRepository for SqliteStore {
    fn append_sample(
        &self,
        experiment_id: &str,
        variant_id: &str,
        timestamp: DateTime<Utc>,
        metrics: &serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<i64> {
        let conn = self.lock()?;
        samples::append_sample(&conn, experiment_id, variant_id, timestamp, metrics)
    }

    fn query_samples(
        &self,
        experiment_id: &str,
        query: &SampleQuery,
    ) -> EngineResult<Vec<MetricSample>> {
        let conn = self.lock()?;
        samples::query_samples(&conn, experiment_id, query)
    }

    fn count_samples(&self, experiment_id: &str) -> EngineResult<i64> {
        let conn = self.lock()?;
        samples::count_samples(&conn, experiment_id)
    }
}

impl OutcomeRepository for SqliteStore {
    fn record_outcome(&self, outcome: &ImplementationOutcome) -> EngineResult<i64> {
        let conn = self.lock()?;
        outcomes::record_outcome(&conn, outcome)
    }

    fn latest_outcome(&self, experiment_id: &str) -> EngineResult<Option<ImplementationOutcome>> {
        let conn = self.lock()?;
        outcomes::latest_outcome(&conn, experiment_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::coordinator::{ChangeOutcome, ChangeStatus, OutcomeStatus};
    use crate::errors::ErrorKind;
    use crate::experiment::{
        build_experiment, ChangeConfig, CreationDefaults, ExperimentConfig, MetricsConfig,
        VariantConfig, VariantKind,
    };
    use crate::tracking::SortOrder;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn temp_store() -> (NamedTempFile, SqliteStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = SqliteStore::new(temp_file.path().to_path_buf()).unwrap();
        (temp_file, store)
    }

    fn experiment(id: &str) -> Experiment {
        let config = ExperimentConfig {
            id: Some(id.to_string()),
            name: "Checkout button".to_string(),
            site_id: "site-1".to_string(),
            variants: vec![
                VariantConfig {
                    id: Some("control".to_string()),
                    name: "Control".to_string(),
                    kind: VariantKind::Control,
                    changes: Vec::new(),
                },
                VariantConfig {
                    id: Some("green".to_string()),
                    name: "Green".to_string(),
                    kind: VariantKind::Variant,
                    changes: vec![ChangeConfig {
                        path: "src/button.css".to_string(),
                        original: "color: blue;".to_string(),
                        modified: "color: green;".to_string(),
                        description: Some("Green button".to_string()),
                    }],
                },
            ],
            metrics: MetricsConfig {
                primary: "conversion".to_string(),
                secondary: vec!["revenue".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        build_experiment(config, &CreationDefaults::default(), Utc::now()).unwrap()
    }

    #[test]
    fn test_insert_and_get_experiment() -> anyhow::Result<()> {
        let (_temp, store) = temp_store();
        let original = experiment("exp-1");
        store.insert_experiment(&original)?;

        let loaded = store.get_experiment("exp-1")?.unwrap();
        assert_eq!(loaded.variants.len(), 2);
        assert_eq!(loaded.variants[0].id, "control");
        assert_eq!(loaded.variants[1].changes.len(), 1);
        assert_eq!(loaded.variants[1].changes[0].path, "src/button.css");
        assert_eq!(loaded.secondary_metrics, vec!["revenue".to_string()]);
        assert_eq!(loaded.traffic_allocation, original.traffic_allocation);

        assert!(store.get_experiment("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_experiment_id_rejected() -> anyhow::Result<()> {
        let (_temp, store) = temp_store();
        store.insert_experiment(&experiment("exp-1"))?;

        let err = store.insert_experiment(&experiment("exp-1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
        Ok(())
    }

    #[test]
    fn test_save_replaces_aggregate() -> anyhow::Result<()> {
        let (_temp, store) = temp_store();
        let mut exp = experiment("exp-1");
        store.insert_experiment(&exp)?;

        exp.start(Utc::now())?;
        exp.variants[1].changes[0].commit_hash = Some("abc123".to_string());
        store.save_experiment(&exp)?;

        let loaded = store.get_experiment("exp-1")?.unwrap();
        assert_eq!(loaded.status, ExperimentStatus::Running);
        assert!(loaded.end_date.is_some());
        assert_eq!(
            loaded.variants[1].changes[0].commit_hash.as_deref(),
            Some("abc123")
        );
        assert_eq!(loaded.variants[1].changes.len(), 1);
        Ok(())
    }

    #[test]
    fn test_save_unknown_experiment_fails() {
        let (_temp, store) = temp_store();
        let err = store.save_experiment(&experiment("ghost")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_list_experiments_filters_by_status() -> anyhow::Result<()> {
        let (_temp, store) = temp_store();
        let mut running = experiment("exp-a");
        running.start(Utc::now())?;
        store.insert_experiment(&running)?;
        store.insert_experiment(&experiment("exp-b"))?;

        assert_eq!(store.list_experiments(None)?.len(), 2);
        let only_running = store.list_experiments(Some(ExperimentStatus::Running))?;
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, "exp-a");
        assert!(store
            .list_experiments(Some(ExperimentStatus::Completed))?
            .is_empty());
        Ok(())
    }

    #[test]
    fn test_record_visit_keeps_first_variant() -> anyhow::Result<()> {
        let (_temp, store) = temp_store();
        let now = Utc::now();
        let ctx = VisitContext::default();

        let first = store.record_visit("exp-1", "visitor-1", "control", &ctx, false, now)?;
        assert!(first.created);
        assert_eq!(first.session.visit_count, 1);

        let later = now + Duration::minutes(5);
        let second = store.record_visit("exp-1", "visitor-1", "green", &ctx, false, later)?;
        assert!(!second.created);
        assert_eq!(second.session.variant_id, "control");
        assert_eq!(second.session.visit_count, 2);
        assert_eq!(second.session.first_seen, first.session.first_seen);
        assert!(second.session.last_seen > second.session.first_seen);
        Ok(())
    }

    #[test]
    fn test_session_counts_exclude_bots() -> anyhow::Result<()> {
        let (_temp, store) = temp_store();
        let now = Utc::now();
        let ctx = VisitContext::default();

        store.record_visit("exp-1", "v1", "control", &ctx, false, now)?;
        store.record_visit("exp-1", "v1", "control", &ctx, false, now)?;
        store.record_visit("exp-1", "v2", "control", &ctx, false, now)?;
        store.record_visit("exp-1", "crawler", "green", &ctx, true, now)?;
        store.record_visit("exp-2", "v3", "green", &ctx, false, now)?;

        let counts = store.session_counts("exp-1")?;
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].variant_id, "control");
        assert_eq!(counts[0].session_count, 3);
        assert_eq!(counts[0].unique_visitor_count, 2);
        Ok(())
    }

    #[test]
    fn test_concurrent_first_visits_agree() -> anyhow::Result<()> {
        let (_temp, store) = temp_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let assigned = if i % 2 == 0 { "control" } else { "green" };
                    store
                        .record_visit(
                            "exp-1",
                            "racer",
                            assigned,
                            &VisitContext::default(),
                            false,
                            Utc::now(),
                        )
                        .unwrap()
                })
            })
            .collect();

        let records: Vec<VisitRecord> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(records.iter().filter(|r| r.created).count(), 1);
        let winner = store.get_session("exp-1", "racer")?.unwrap();
        assert_eq!(winner.visit_count, 8);
        // Every caller after the first sees the stored variant
        for record in records.iter().filter(|r| !r.created) {
            assert_eq!(record.session.variant_id, winner.variant_id);
        }
        Ok(())
    }

    #[test]
    fn test_query_samples_filters_and_orders() -> anyhow::Result<()> {
        let (_temp, store) = temp_store();
        let base = Utc::now();
        for (i, variant) in ["control", "green", "control", "green"].iter().enumerate() {
            let metrics = json!({ "conversion": i as f64 });
            store.append_sample(
                "exp-1",
                variant,
                base + Duration::seconds(i as i64),
                metrics.as_object().unwrap(),
            )?;
        }

        let all = store.query_samples("exp-1", &SampleQuery::default())?;
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let green = store.query_samples(
            "exp-1",
            &SampleQuery {
                variant_id: Some("green".to_string()),
                order: SortOrder::Descending,
                ..Default::default()
            },
        )?;
        assert_eq!(green.len(), 2);
        assert_eq!(green[0].value("conversion"), Some(3.0));

        let window = store.query_samples(
            "exp-1",
            &SampleQuery {
                since: Some(base + Duration::seconds(1)),
                until: Some(base + Duration::seconds(2)),
                ..Default::default()
            },
        )?;
        assert_eq!(window.len(), 2);

        let limited = store.query_samples(
            "exp-1",
            &SampleQuery {
                limit: Some(1),
                ..Default::default()
            },
        )?;
        assert_eq!(limited.len(), 1);
        assert_eq!(store.count_samples("exp-1")?, 4);
        assert_eq!(store.count_samples("exp-2")?, 0);
        Ok(())
    }

    #[test]
    fn test_latest_outcome() -> anyhow::Result<()> {
        let (_temp, store) = temp_store();
        assert!(store.latest_outcome("exp-1")?.is_none());

        let mut outcome = ImplementationOutcome {
            id: None,
            test_id: "exp-1".to_string(),
            winner_variant_id: Some("green".to_string()),
            control_variant_id: Some("control".to_string()),
            changes: vec![ChangeOutcome {
                change_id: "change-1".to_string(),
                path: "src/button.css".to_string(),
                status: ChangeStatus::Applied,
                commit_hash: Some("abc123".to_string()),
                error: None,
            }],
            status: OutcomeStatus::Completed,
            branch: Some("main".to_string()),
            recorded_at: Utc::now(),
        };
        store.record_outcome(&outcome)?;
        outcome.status = OutcomeStatus::RolledBack;
        let second_id = store.record_outcome(&outcome)?;

        let latest = store.latest_outcome("exp-1")?.unwrap();
        assert_eq!(latest.id, Some(second_id));
        assert_eq!(latest.status, OutcomeStatus::RolledBack);
        assert_eq!(latest.changes[0].commit_hash.as_deref(), Some("abc123"));
        Ok(())
    }
}
