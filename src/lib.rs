//! ChangeFlow - changeset validation and simulation
//!
//! Declared row-level changes (inserts, updates, deletes grouped by table)
//! are applied to a disposable copy of a canonical SQLite database and
//! checked: schema constraints, foreign keys, unique rules, that every
//! declared change landed, and that nothing else moved. The canonical
//! database is never written.

pub mod changeset;
pub mod config;
pub mod error;
pub mod introspection;
pub mod models;
pub mod routes;
pub mod sandbox;
pub mod simulation;
pub mod snapshot;
pub mod state;

#[cfg(test)]
mod test_support;

pub use simulation::{ValidationEngine, ValidationReport};
