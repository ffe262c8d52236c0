use abtest_engine::coordinator::{
    ChangeReceipt, ChangeRequest, CodeChangeSink, RollbackRequest,
};
use abtest_engine::experiment::{ExperimentConfig, MetricsConfig, VariantConfig, VariantKind};
use abtest_engine::store::SqliteStore;
use abtest_engine::{EngineConfig, ExperimentService};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Code-change sink that records requests and hands out sequential hashes
#[derive(Default)]
pub struct RecordingSink {
    pub applied: Mutex<Vec<ChangeRequest>>,
    pub rolled_back: Mutex<Vec<RollbackRequest>>,
}

impl CodeChangeSink for RecordingSink {
    fn implement_change(&self, request: &ChangeRequest) -> anyhow::Result<ChangeReceipt> {
        let mut applied = self.applied.lock().unwrap();
        applied.push(request.clone());
        Ok(ChangeReceipt {
            commit_hash: format!("{:040x}", applied.len()),
        })
    }

    fn rollback_change(&self, request: &RollbackRequest) -> anyhow::Result<ChangeReceipt> {
        let mut rolled_back = self.rolled_back.lock().unwrap();
        rolled_back.push(request.clone());
        Ok(ChangeReceipt {
            commit_hash: format!("{:040x}", 1000 + rolled_back.len()),
        })
    }
}

/// Service over a throwaway database that is removed on drop
pub struct TestEngine {
    _temp_dir: TempDir,
    pub service: ExperimentService,
    pub sink: Arc<RecordingSink>,
}

impl TestEngine {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(
            SqliteStore::new(temp_dir.path().join("experiments.db"))
                .expect("Failed to open store"),
        );
        let sink = Arc::new(RecordingSink::default());
        let config = EngineConfig {
            db_path: temp_dir.path().join("experiments.db"),
            ..EngineConfig::default()
        };
        let service = ExperimentService::new(store, sink.clone(), &config);
        Self {
            _temp_dir: temp_dir,
            service,
            sink,
        }
    }
}

pub fn two_arm_config(id: &str) -> ExperimentConfig {
    ExperimentConfig {
        id: Some(id.to_string()),
        name: "Homepage hero".to_string(),
        site_id: "site-1".to_string(),
        hypothesis: Some("A shorter headline converts better".to_string()),
        variants: vec![
            VariantConfig {
                id: Some("control".to_string()),
                name: "Control".to_string(),
                kind: VariantKind::Control,
                changes: Vec::new(),
            },
            VariantConfig {
                id: Some("variant".to_string()),
                name: "Short headline".to_string(),
                kind: VariantKind::Variant,
                changes: Vec::new(),
            },
        ],
        metrics: MetricsConfig {
            primary: "conversion".to_string(),
            secondary: vec!["performance.lcp".to_string()],
            ..Default::default()
        },
        duration_days: Some(14),
        ..Default::default()
    }
}
