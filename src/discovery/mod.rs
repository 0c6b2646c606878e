//! # Discovery and Reconciliation
//!
//! Keeps local inventory aligned with what remote platforms actually hold. See
//! [`ReconciliationEngine`] for the three classifications (new, died, changed).

pub mod engine;
pub mod report;

pub use engine::{ReconciliationEngine, SyncOutcome};
pub use report::{
    ReconciledEntity, ReconciliationFailure, ReconciliationReport, SyncOptions, SyncRequest,
};
