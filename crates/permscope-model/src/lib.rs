//! Failure analysis for stack-based permission checks.
//!
//! Everything here is pure: a captured [`ContextSnapshot`] goes in, ranked
//! [`Solution`]s come out. Talking to the target lives in the `permscope`
//! crate.

mod component;
mod failure;
mod frame;
mod ledger;
mod permission;
mod report;
mod search;
mod snapshot;
mod solution;

pub use component::Component;
pub use failure::{
    Analyzed, Captured, FailureHistory, FailureOrigin, FailureRecord, Reported,
};
pub use frame::{StackFrame, ELEVATION_MARKER_LOCATION};
pub use ledger::PermissionLedger;
pub use permission::{PermissionParseError, PermissionSet, PermissionSpec};
pub use report::{render, render_record, ReportStyle};
pub use search::{solve, SearchPolicy};
pub use snapshot::{
    classify_domains, pending_domains, ContextSnapshot, FailingFrame, SnapshotBase, WalkOutcome,
};
pub use solution::Solution;
