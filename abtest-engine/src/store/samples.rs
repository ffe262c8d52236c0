//! Append-only metric sample log.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{format_ts, parse_ts};
use crate::errors::EngineResult;
use crate::tracking::{MetricSample, SampleQuery, SortOrder};

pub(super) fn append_sample(
    conn: &Connection,
    experiment_id: &str,
    variant_id: &str,
    timestamp: DateTime<Utc>,
    metrics: &serde_json::Map<String, serde_json::Value>,
) -> EngineResult<i64> {
    let metrics_json = serde_json::to_string(metrics)?;

    conn.execute(
        r"
        INSERT INTO metric_samples (experiment_id, variant_id, timestamp, metrics)
        VALUES (?1, ?2, ?3, ?4)
        ",
        params![experiment_id, variant_id, format_ts(timestamp), &metrics_json],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Query samples with optional variant and inclusive time-range filters.
///
/// Ties on timestamp are broken by insertion order.
pub(super) fn query_samples(
    conn: &Connection,
    experiment_id: &str,
    query: &SampleQuery,
) -> EngineResult<Vec<MetricSample>> {
    let order = match query.order {
        SortOrder::Ascending => "ASC",
        SortOrder::Descending => "DESC",
    };
    // SQLite treats a negative LIMIT as unbounded
    let limit = query
        .limit
        .and_then(|l| i64::try_from(l).ok())
        .unwrap_or(-1);

    let sql = format!(
        r"
        SELECT id, experiment_id, variant_id, timestamp, metrics
        FROM metric_samples
        WHERE experiment_id = ?1
          AND (?2 IS NULL OR variant_id = ?2)
          AND (?3 IS NULL OR timestamp >= ?3)
          AND (?4 IS NULL OR timestamp <= ?4)
        ORDER BY timestamp {order}, id {order}
        LIMIT ?5
        "
    );

    let mut stmt = conn.prepare(&sql)?;
    let samples = stmt.query_map(
        params![
            experiment_id,
            &query.variant_id,
            query.since.map(format_ts),
            query.until.map(format_ts),
            limit,
        ],
        |row| {
            let timestamp: String = row.get(3)?;
            let metrics_json: String = row.get(4)?;
            let metrics: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&metrics_json)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

            Ok(MetricSample {
                id: row.get(0)?,
                experiment_id: row.get(1)?,
                variant_id: row.get(2)?,
                timestamp: parse_ts(&timestamp)?,
                metrics,
            })
        },
    )?;

    samples
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}

pub(super) fn count_samples(conn: &Connection, experiment_id: &str) -> EngineResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM metric_samples WHERE experiment_id = ?1",
        params![experiment_id],
        |row| row.get(0),
    )?;
    Ok(count)
}
