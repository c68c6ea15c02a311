//! Simulation engine
//!
//! Applies a changeset to a sandbox and checks the result: constraints,
//! declared intent, and anything else that changed.

mod applier;
mod collateral;
mod constraints;
mod engine;
mod intent;
mod report;

pub use applier::{AppliedOperation, ApplyResult, ChangesetApplier};
pub use collateral::CollateralDetector;
pub use constraints::ConstraintValidator;
pub use engine::{BatchReport, CaseResult, RunStage, SimulationRun, ValidationEngine};
pub use intent::{record_key, record_matches_row, IntentVerifier};
pub use report::{
    Category, Finding, ReportArchive, ReportSummary, ResultAggregator, SnapshotPair, ValidationReport,
    SUGGESTIONS,
};
