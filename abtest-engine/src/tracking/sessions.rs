//! Visitor session bookkeeping.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::bots::is_bot;
use super::models::{VariantSessionCounts, VisitContext, VisitRecord, VisitorSession};
use crate::errors::{EngineError, EngineResult};
use crate::store::SessionRepository;

/// First-seen variant registry per (experiment, visitor)
pub struct VisitorSessionStore {
    repo: Arc<dyn SessionRepository>,
}

impl VisitorSessionStore {
    pub fn new(repo: Arc<dyn SessionRepository>) -> Self {
        Self { repo }
    }

    /// Record a visit and return the committed session.
    ///
    /// For a returning visitor the stored variant wins over
    /// `assigned_variant_id`, so callers must use the returned session's
    /// variant rather than their own computation.
    pub fn record_visit(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        assigned_variant_id: &str,
        context: &VisitContext,
        now: DateTime<Utc>,
    ) -> EngineResult<VisitRecord> {
        require_id("experimentId", experiment_id)?;
        require_id("visitorId", visitor_id)?;
        require_id("variantId", assigned_variant_id)?;

        let bot = context.is_bot.unwrap_or(false) || is_bot(context.user_agent.as_deref());
        let record = self.repo.record_visit(
            experiment_id,
            visitor_id,
            assigned_variant_id,
            context,
            bot,
            now,
        )?;

        if record.created {
            log::debug!(
                "visitor {visitor_id} assigned to {} in {experiment_id}{}",
                record.session.variant_id,
                if bot { " (bot)" } else { "" }
            );
        }
        Ok(record)
    }

    pub fn get_session(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> EngineResult<Option<VisitorSession>> {
        self.repo.get_session(experiment_id, visitor_id)
    }

    /// Non-bot session and unique visitor counts for variants with traffic
    pub fn sessions_per_variant(
        &self,
        experiment_id: &str,
    ) -> EngineResult<Vec<VariantSessionCounts>> {
        self.repo.session_counts(experiment_id)
    }
}

pub(super) fn require_id(field: &str, value: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        return Err(EngineError::missing_field(field));
    }
    Ok(())
}
