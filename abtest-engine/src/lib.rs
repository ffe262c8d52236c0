// Public-API clippy lints that add noise for an engine consumed mainly by its
// own binary and tests.
#![allow(clippy::must_use_candidate)]
#![allow(clippy::should_implement_trait)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::single_match_else)]
#![allow(clippy::new_without_default)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

//! Deterministic A/B experiment engine.
//!
//! Visitors are hashed into variant buckets, their sessions and metric
//! samples are recorded, and a pooled t-test against the control decides
//! whether a variant wins. A winner's content changes are then committed
//! through a [`coordinator::CodeChangeSink`].

pub mod analysis;
pub mod bucket;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod experiment;
pub mod logging;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tracking;

pub use config::EngineConfig;
pub use errors::{EngineError, EngineResult, ErrorKind};
pub use service::ExperimentService;
