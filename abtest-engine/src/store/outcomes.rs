//! Implementation outcome audit log.

use rusqlite::{params, Connection, OptionalExtension};

use super::{conversion_error, format_ts, parse_ts};
use crate::coordinator::{ChangeOutcome, ImplementationOutcome, OutcomeStatus};
use crate::errors::EngineResult;

pub(super) fn record_outcome(
    conn: &Connection,
    outcome: &ImplementationOutcome,
) -> EngineResult<i64> {
    let changes_json = serde_json::to_string(&outcome.changes)?;

    conn.execute(
        r"
        INSERT INTO implementation_outcomes (
            experiment_id, winner_variant_id, control_variant_id, status, branch, changes, recorded_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
        params![
            &outcome.test_id,
            &outcome.winner_variant_id,
            &outcome.control_variant_id,
            outcome.status.as_str(),
            &outcome.branch,
            &changes_json,
            format_ts(outcome.recorded_at),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Most recent outcome for an experiment, by insertion order
pub(super) fn latest_outcome(
    conn: &Connection,
    experiment_id: &str,
) -> EngineResult<Option<ImplementationOutcome>> {
    let outcome = conn
        .query_row(
            r"
            SELECT id, experiment_id, winner_variant_id, control_variant_id, status, branch,
                   changes, recorded_at
            FROM implementation_outcomes
            WHERE experiment_id = ?1
            ORDER BY id DESC
            LIMIT 1
            ",
            params![experiment_id],
            |row| {
                let status_str: String = row.get(4)?;
                let status = OutcomeStatus::from_str(&status_str).ok_or_else(|| {
                    conversion_error(format!("Invalid outcome status: {status_str}"))
                })?;
                let changes_json: String = row.get(6)?;
                let changes: Vec<ChangeOutcome> = serde_json::from_str(&changes_json)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                let recorded_at: String = row.get(7)?;

                Ok(ImplementationOutcome {
                    id: Some(row.get(0)?),
                    test_id: row.get(1)?,
                    winner_variant_id: row.get(2)?,
                    control_variant_id: row.get(3)?,
                    changes,
                    status,
                    branch: row.get(5)?,
                    recorded_at: parse_ts(&recorded_at)?,
                })
            },
        )
        .optional()?;
    Ok(outcome)
}
