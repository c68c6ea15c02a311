//! Data Snapshot Module
//!
//! Point-in-time row captures and the comparisons built on them:
//! - Snapshot capture (every row of every table, keyed by identity)
//! - Changeset diff (declared operations restated)
//! - Snapshot diff (what actually changed between two captures)

pub mod capture;
pub mod diff;
pub mod values;

pub use capture::{DataSnapshot, Row, SnapshotCapturer, SnapshotSummary, TableData};
pub use diff::{ChangeType, ChangesetDiff, DiffEngine, DiffEntry, FieldChange, OperationCounts, RowChange};
