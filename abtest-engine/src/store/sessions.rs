//! Visitor session registry.
//!
//! First-visit races are resolved by the `UNIQUE(experiment_id, visitor_id)`
//! constraint: INSERT OR IGNORE, then read back whatever row won.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_ts, parse_ts};
use crate::errors::EngineResult;
use crate::tracking::{VariantSessionCounts, VisitContext, VisitRecord, VisitorSession};

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<VisitorSession> {
    let first_seen: String = row.get(3)?;
    let last_seen: String = row.get(4)?;

    Ok(VisitorSession {
        experiment_id: row.get(0)?,
        visitor_id: row.get(1)?,
        variant_id: row.get(2)?,
        first_seen: parse_ts(&first_seen)?,
        last_seen: parse_ts(&last_seen)?,
        visit_count: row.get(5)?,
        is_bot: row.get::<_, i64>(6)? != 0,
        user_agent: row.get(7)?,
        device: row.get(8)?,
        referrer: row.get(9)?,
        country: row.get(10)?,
    })
}

pub(super) fn get_session(
    conn: &Connection,
    experiment_id: &str,
    visitor_id: &str,
) -> EngineResult<Option<VisitorSession>> {
    let session = conn
        .query_row(
            r"
            SELECT experiment_id, visitor_id, variant_id, first_seen, last_seen, visit_count,
                   is_bot, user_agent, device, referrer, country
            FROM visitor_sessions
            WHERE experiment_id = ?1 AND visitor_id = ?2
            ",
            params![experiment_id, visitor_id],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

/// Record a visit.
///
/// A new visitor gets `assigned_variant_id`. A returning visitor keeps the
/// stored variant; `last_seen` and `visit_count` advance, supplied context
/// fields overwrite stored ones and the bot flag is OR-ed.
pub(super) fn record_visit(
    conn: &Connection,
    experiment_id: &str,
    visitor_id: &str,
    assigned_variant_id: &str,
    context: &VisitContext,
    is_bot: bool,
    now: DateTime<Utc>,
) -> EngineResult<VisitRecord> {
    let now_str = format_ts(now);

    let inserted = conn.execute(
        r"
        INSERT OR IGNORE INTO visitor_sessions (
            experiment_id, visitor_id, variant_id, first_seen, last_seen, visit_count,
            is_bot, user_agent, device, referrer, country
        )
        VALUES (?1, ?2, ?3, ?4, ?4, 1, ?5, ?6, ?7, ?8, ?9)
        ",
        params![
            experiment_id,
            visitor_id,
            assigned_variant_id,
            &now_str,
            i64::from(is_bot),
            &context.user_agent,
            &context.device,
            &context.referrer,
            &context.country,
        ],
    )?;

    let created = inserted == 1;
    if !created {
        // A visitor flagged as a bot once stays flagged
        conn.execute(
            r"
            UPDATE visitor_sessions
            SET last_seen = ?3,
                visit_count = visit_count + 1,
                is_bot = MAX(is_bot, ?4),
                user_agent = COALESCE(?5, user_agent),
                device = COALESCE(?6, device),
                referrer = COALESCE(?7, referrer),
                country = COALESCE(?8, country)
            WHERE experiment_id = ?1 AND visitor_id = ?2
            ",
            params![
                experiment_id,
                visitor_id,
                &now_str,
                i64::from(is_bot),
                &context.user_agent,
                &context.device,
                &context.referrer,
                &context.country,
            ],
        )?;
    }

    let session = conn.query_row(
        r"
        SELECT experiment_id, visitor_id, variant_id, first_seen, last_seen, visit_count,
               is_bot, user_agent, device, referrer, country
        FROM visitor_sessions
        WHERE experiment_id = ?1 AND visitor_id = ?2
        ",
        params![experiment_id, visitor_id],
        session_from_row,
    )?;

    Ok(VisitRecord { session, created })
}

/// Per-variant visit totals, excluding bot sessions
pub(super) fn session_counts(
    conn: &Connection,
    experiment_id: &str,
) -> EngineResult<Vec<VariantSessionCounts>> {
    let mut stmt = conn.prepare(
        r"
        SELECT variant_id, COALESCE(SUM(visit_count), 0), COUNT(DISTINCT visitor_id)
        FROM visitor_sessions
        WHERE experiment_id = ?1 AND is_bot = 0
        GROUP BY variant_id
        ORDER BY variant_id
        ",
    )?;

    let counts = stmt.query_map(params![experiment_id], |row| {
        Ok(VariantSessionCounts {
            variant_id: row.get(0)?,
            session_count: row.get(1)?,
            unique_visitor_count: row.get(2)?,
        })
    })?;

    counts
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Into::into)
}
