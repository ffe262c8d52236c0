//! Experiment aggregate persistence.
//!
//! An experiment is stored across three tables (experiments, variants,
//! changes) and always written as a whole inside the caller's transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{conversion_error, format_ts, parse_opt_ts, parse_ts};
use crate::bucket::AllocationEntry;
use crate::errors::{EngineError, EngineResult};
use crate::experiment::{
    Experiment, ExperimentStatus, MetricDirection, Variant, VariantChange, VariantKind,
    VariantStatus,
};

// ========================================================================
// Writes
// ========================================================================

/// Insert a new experiment with its variants and changes.
///
/// Uses INSERT OR IGNORE so a taken id is reported instead of overwritten.
pub(super) fn insert_experiment(conn: &Connection, experiment: &Experiment) -> EngineResult<()> {
    let allocation_json = serde_json::to_string(&experiment.traffic_allocation)?;
    let secondary_json = serde_json::to_string(&experiment.secondary_metrics)?;

    let inserted = conn.execute(
        r"
        INSERT OR IGNORE INTO experiments (
            id, name, site_id, description, hypothesis, status, traffic_allocation,
            primary_metric, secondary_metrics, metric_direction, confidence_threshold,
            duration_days, start_date, end_date, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ",
        params![
            &experiment.id,
            &experiment.name,
            &experiment.site_id,
            &experiment.description,
            &experiment.hypothesis,
            experiment.status.as_str(),
            &allocation_json,
            &experiment.primary_metric,
            &secondary_json,
            experiment.metric_direction.as_str(),
            experiment.confidence_threshold,
            experiment.duration_days,
            experiment.start_date.map(format_ts),
            experiment.end_date.map(format_ts),
            format_ts(experiment.created_at),
            format_ts(experiment.updated_at),
        ],
    )?;

    if inserted == 0 {
        return Err(EngineError::invalid_value(
            "id",
            format!("experiment {} already exists", experiment.id),
        ));
    }

    write_children(conn, experiment)
}

/// Overwrite an existing experiment and replace its variants and changes
pub(super) fn update_experiment(conn: &Connection, experiment: &Experiment) -> EngineResult<()> {
    let allocation_json = serde_json::to_string(&experiment.traffic_allocation)?;
    let secondary_json = serde_json::to_string(&experiment.secondary_metrics)?;

    let updated = conn.execute(
        r"
        UPDATE experiments
        SET name = ?2, site_id = ?3, description = ?4, hypothesis = ?5, status = ?6,
            traffic_allocation = ?7, primary_metric = ?8, secondary_metrics = ?9,
            metric_direction = ?10, confidence_threshold = ?11, duration_days = ?12,
            start_date = ?13, end_date = ?14, updated_at = ?15
        WHERE id = ?1
        ",
        params![
            &experiment.id,
            &experiment.name,
            &experiment.site_id,
            &experiment.description,
            &experiment.hypothesis,
            experiment.status.as_str(),
            &allocation_json,
            &experiment.primary_metric,
            &secondary_json,
            experiment.metric_direction.as_str(),
            experiment.confidence_threshold,
            experiment.duration_days,
            experiment.start_date.map(format_ts),
            experiment.end_date.map(format_ts),
            format_ts(experiment.updated_at),
        ],
    )?;

    if updated == 0 {
        return Err(EngineError::experiment_not_found(&experiment.id));
    }

    conn.execute(
        "DELETE FROM variant_changes WHERE experiment_id = ?1",
        params![&experiment.id],
    )?;
    conn.execute(
        "DELETE FROM experiment_variants WHERE experiment_id = ?1",
        params![&experiment.id],
    )?;

    write_children(conn, experiment)
}

fn write_children(conn: &Connection, experiment: &Experiment) -> EngineResult<()> {
    let mut variant_stmt = conn.prepare(
        r"
        INSERT INTO experiment_variants (id, experiment_id, position, name, kind, traffic_allocation, status)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
    )?;
    let mut change_stmt = conn.prepare(
        r"
        INSERT INTO variant_changes (id, experiment_id, variant_id, position, path, original, modified, description, commit_hash)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ",
    )?;

    for (position, variant) in experiment.variants.iter().enumerate() {
        variant_stmt.execute(params![
            &variant.id,
            &experiment.id,
            position as i64,
            &variant.name,
            variant.kind.as_str(),
            variant.traffic_allocation,
            variant.status.as_str(),
        ])?;

        for (change_position, change) in variant.changes.iter().enumerate() {
            change_stmt.execute(params![
                &change.id,
                &experiment.id,
                &variant.id,
                change_position as i64,
                &change.path,
                &change.original,
                &change.modified,
                &change.description,
                &change.commit_hash,
            ])?;
        }
    }

    Ok(())
}

// ========================================================================
// Reads
// ========================================================================

const EXPERIMENT_COLUMNS: &str = r"
    id, name, site_id, description, hypothesis, status, traffic_allocation,
    primary_metric, secondary_metrics, metric_direction, confidence_threshold,
    duration_days, start_date, end_date, created_at, updated_at
";

fn experiment_from_row(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    let status_str: String = row.get(5)?;
    let status = ExperimentStatus::from_str(&status_str)
        .ok_or_else(|| conversion_error(format!("Invalid experiment status: {status_str}")))?;

    let allocation_json: String = row.get(6)?;
    let traffic_allocation: Vec<AllocationEntry> = serde_json::from_str(&allocation_json)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    let secondary_json: String = row.get(8)?;
    let secondary_metrics: Vec<String> = serde_json::from_str(&secondary_json)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    let direction_str: String = row.get(9)?;
    let metric_direction = MetricDirection::from_str(&direction_str)
        .ok_or_else(|| conversion_error(format!("Invalid metric direction: {direction_str}")))?;

    let duration: i64 = row.get(11)?;
    let duration_days = u32::try_from(duration)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        site_id: row.get(2)?,
        description: row.get(3)?,
        hypothesis: row.get(4)?,
        status,
        variants: Vec::new(),
        traffic_allocation,
        primary_metric: row.get(7)?,
        secondary_metrics,
        metric_direction,
        confidence_threshold: row.get(10)?,
        duration_days,
        start_date: parse_opt_ts(row.get(12)?)?,
        end_date: parse_opt_ts(row.get(13)?)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn load_variants(conn: &Connection, experiment_id: &str) -> rusqlite::Result<Vec<Variant>> {
    let mut stmt = conn.prepare(
        r"
        SELECT id, name, kind, traffic_allocation, status
        FROM experiment_variants
        WHERE experiment_id = ?1
        ORDER BY position
        ",
    )?;

    let variants = stmt.query_map(params![experiment_id], |row| {
        let kind_str: String = row.get(2)?;
        let kind = VariantKind::from_str(&kind_str)
            .ok_or_else(|| conversion_error(format!("Invalid variant type: {kind_str}")))?;
        let status_str: String = row.get(4)?;
        let status = VariantStatus::from_str(&status_str)
            .ok_or_else(|| conversion_error(format!("Invalid variant status: {status_str}")))?;

        Ok(Variant {
            id: row.get(0)?,
            experiment_id: experiment_id.to_string(),
            name: row.get(1)?,
            kind,
            traffic_allocation: row.get(3)?,
            status,
            changes: Vec::new(),
        })
    })?;
    let mut variants = variants.collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        r"
        SELECT variant_id, id, path, original, modified, description, commit_hash
        FROM variant_changes
        WHERE experiment_id = ?1
        ORDER BY variant_id, position
        ",
    )?;
    let changes = stmt.query_map(params![experiment_id], |row| {
        let variant_id: String = row.get(0)?;
        Ok((
            variant_id,
            VariantChange {
                id: row.get(1)?,
                path: row.get(2)?,
                original: row.get(3)?,
                modified: row.get(4)?,
                description: row.get(5)?,
                commit_hash: row.get(6)?,
            },
        ))
    })?;

    for change in changes {
        let (variant_id, change) = change?;
        if let Some(variant) = variants.iter_mut().find(|v| v.id == variant_id) {
            variant.changes.push(change);
        }
    }

    Ok(variants)
}

pub(super) fn get_experiment(
    conn: &Connection,
    experiment_id: &str,
) -> EngineResult<Option<Experiment>> {
    let sql = format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE id = ?1");
    let experiment = conn
        .query_row(&sql, params![experiment_id], experiment_from_row)
        .optional()?;

    match experiment {
        Some(mut experiment) => {
            experiment.variants = load_variants(conn, experiment_id)?;
            Ok(Some(experiment))
        }
        None => Ok(None),
    }
}

/// List experiments in creation order, optionally filtered by status
pub(super) fn list_experiments(
    conn: &Connection,
    status: Option<ExperimentStatus>,
) -> EngineResult<Vec<Experiment>> {
    let sql = format!(
        "SELECT {EXPERIMENT_COLUMNS} FROM experiments
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.map(|s| s.as_str())], experiment_from_row)?;
    let mut experiments = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    for experiment in &mut experiments {
        experiment.variants = load_variants(conn, &experiment.id)?;
    }

    Ok(experiments)
}
