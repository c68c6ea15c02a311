//! Changeset Module
//!
//! The declared batch of row changes, from raw JSON to something the
//! applier can execute:
//! - Typed model with placeholder references
//! - Boundary parser that reports malformed input as findings
//! - Foreign-key aware table ordering
//! - Placeholder resolution against the sandbox

pub mod model;
pub mod ordering;
pub mod parser;
pub mod resolve;

pub use model::{Changeset, OperationKind, Record, Reference, TableOperations};
pub use ordering::TableOrdering;
pub use parser::{ChangesetParser, ParsedChangeset};
pub use resolve::{PlaceholderResolver, Resolution};
