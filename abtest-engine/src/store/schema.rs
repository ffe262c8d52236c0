//! Database schema for the experiment store.
//!
//! Timestamps are RFC 3339 UTC text with fixed microsecond precision.
//! JSON columns hold documents the engine never queries into.

use rusqlite::Connection;

/// Create all tables and indexes.
///
/// Idempotent - uses CREATE ... IF NOT EXISTS so it can run on every open.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS experiments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                site_id TEXT NOT NULL,
                description TEXT,
                hypothesis TEXT,
                status TEXT NOT NULL DEFAULT 'created',

                -- Ordered JSON list of {variantId, fraction}
                traffic_allocation TEXT NOT NULL,

                primary_metric TEXT NOT NULL,
                secondary_metrics TEXT NOT NULL DEFAULT '[]',
                metric_direction TEXT NOT NULL DEFAULT 'maximize',
                confidence_threshold REAL NOT NULL DEFAULT 0.95,
                duration_days INTEGER NOT NULL,
                start_date TEXT,
                end_date TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status);
            CREATE INDEX IF NOT EXISTS idx_experiments_site ON experiments(site_id);

            CREATE TABLE IF NOT EXISTS experiment_variants (
                id TEXT NOT NULL,
                experiment_id TEXT NOT NULL REFERENCES experiments(id),
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                traffic_allocation REAL NOT NULL DEFAULT 0.0,
                status TEXT NOT NULL DEFAULT 'created',
                PRIMARY KEY (experiment_id, id)
            );

            CREATE TABLE IF NOT EXISTS variant_changes (
                id TEXT PRIMARY KEY,
                experiment_id TEXT NOT NULL REFERENCES experiments(id),
                variant_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                path TEXT NOT NULL,
                original TEXT NOT NULL,
                modified TEXT NOT NULL,
                description TEXT,
                commit_hash TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_changes_variant ON variant_changes(experiment_id, variant_id);

            -- One row per visitor per experiment; the unique key serializes first visits
            CREATE TABLE IF NOT EXISTS visitor_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL,
                visitor_id TEXT NOT NULL,
                variant_id TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                visit_count INTEGER NOT NULL DEFAULT 1,
                is_bot INTEGER NOT NULL DEFAULT 0,
                user_agent TEXT,
                device TEXT,
                referrer TEXT,
                country TEXT,
                UNIQUE(experiment_id, visitor_id)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_variant ON visitor_sessions(experiment_id, variant_id);

            CREATE TABLE IF NOT EXISTS metric_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL,
                variant_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metrics TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_samples_experiment_time ON metric_samples(experiment_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_samples_variant ON metric_samples(experiment_id, variant_id);

            CREATE TABLE IF NOT EXISTS implementation_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL,
                winner_variant_id TEXT,
                control_variant_id TEXT,
                status TEXT NOT NULL,
                branch TEXT,
                changes TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outcomes_experiment ON implementation_outcomes(experiment_id);
            ",
    )
}
