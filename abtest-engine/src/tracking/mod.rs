//! Visitor session and metric sample tracking.

mod bots;
mod models;
mod samples;
mod sessions;

pub use bots::{is_bot, BOT_TOKENS};
pub use models::{
    MetricSample, SampleQuery, SortOrder, VariantSessionCounts, VisitContext, VisitRecord,
    VisitorSession,
};
pub use samples::MetricSampleStore;
pub use sessions::VisitorSessionStore;
