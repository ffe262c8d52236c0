//! Winner materialization through the external code-change system.
//!
//! - [`models`]: requests, receipts and the persisted outcome record
//! - `winner`: `WinnerCoordinator` (stop, implement, rollback)
//! - `git`: `GitWorkspace`, the bundled git-backed `CodeChangeSink`
//! - `locks`: `ExperimentLocks`, shared with the service

mod git;
mod locks;
pub mod models;
mod winner;

pub use git::GitWorkspace;
pub use locks::ExperimentLocks;
pub use models::{
    ChangeOutcome, ChangeReceipt, ChangeRequest, ChangeStatus, CodeChangeSink,
    ImplementationOutcome, OutcomeStatus, RollbackRequest, StopOptions,
};
pub use winner::{StopResult, WinnerCoordinator};
