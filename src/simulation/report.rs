//! Validation report and result aggregation
//!
//! Every problem found during a run becomes a [`Finding`]. The aggregator
//! collects them in order and produces the one [`ValidationReport`] a caller
//! gets back.

use crate::error::SimulationError;
use crate::snapshot::{ChangesetDiff, SnapshotSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

use super::engine::RunStage;

/// Finding categories. The last three are only ever warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    SetupError,
    StructuralError,
    RequiredFieldError,
    TypeMismatchError,
    ForeignKeyViolation,
    UniqueConstraintViolation,
    ReferentialIntegrityError,
    IntentMismatchError,
    CollateralChangeError,
    ExecutionError,
    StorageIntegrityError,
    NoOpDelete,
    UnknownField,
    SkippedRule,
}

impl Category {
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            Category::NoOpDelete | Category::UnknownField | Category::SkippedRule
        )
    }
}

/// One categorized problem, with free-form context flattened into the JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub message: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl Finding {
    pub fn new(category: Category, message: impl Into<String>) -> Self {
        Self {
            category,
            table: None,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

/// Initial/final snapshot fingerprints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPair {
    pub initial: SnapshotSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#final: Option<SnapshotSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub diff: ChangesetDiff,
    pub applied_operations: usize,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stages: Vec<RunStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<SnapshotPair>,
    pub resolved_placeholders: BTreeMap<String, Value>,
}

/// The structured answer to "is this changeset safe?"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub summary: ReportSummary,
    pub suggestions: Vec<String>,
}

impl ValidationReport {
    pub fn errors_of(&self, category: Category) -> impl Iterator<Item = &Finding> {
        self.errors.iter().filter(move |f| f.category == category)
    }

    pub fn warnings_of(&self, category: Category) -> impl Iterator<Item = &Finding> {
        self.warnings.iter().filter(move |f| f.category == category)
    }
}

pub const SUGGESTIONS: [&str; 4] = [
    "Check that all referenced IDs exist in their respective tables",
    "Ensure required fields are provided for INSERT operations",
    "Verify data types match the expected schema",
    "Use placeholder IDs (starting with $) for new records that reference each other",
];

/// Collects findings from every stage, splitting errors from warnings
#[derive(Debug, Default)]
pub struct ResultAggregator {
    errors: Vec<Finding>,
    warnings: Vec<Finding>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, finding: Finding) {
        if finding.category.is_warning() {
            self.warnings.push(finding);
        } else {
            self.errors.push(finding);
        }
    }

    pub fn extend(&mut self, findings: impl IntoIterator<Item = Finding>) {
        for finding in findings {
            self.push(finding);
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn finish(self, summary: ReportSummary) -> ValidationReport {
        let valid = self.errors.is_empty();
        let suggestions = if valid {
            Vec::new()
        } else {
            SUGGESTIONS.iter().map(|s| s.to_string()).collect()
        };

        ValidationReport {
            valid,
            errors: self.errors,
            warnings: self.warnings,
            summary,
            suggestions,
        }
    }

    /// Report for a run that could not get a usable sandbox
    pub fn fatal(mut self, err: &SimulationError, summary: ReportSummary) -> ValidationReport {
        let mut finding = Finding::new(Category::SetupError, err.to_string());
        if let SimulationError::Setup { path, .. } = err {
            finding = finding.with("path", path.display().to_string());
        }
        self.push(finding);
        self.finish(summary)
    }
}

/// Writes every report to `<dir>/<run_id>_report.json`
#[derive(Debug, Clone)]
pub struct ReportArchive {
    dir: PathBuf,
}

impl ReportArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn save(&self, report: &ValidationReport) -> Result<PathBuf, SimulationError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("{}_report.json", report.summary.run_id));
        let body = serde_json::to_vec_pretty(report)
            .map_err(|e| SimulationError::Io(std::io::Error::other(e)))?;
        std::fs::write(&path, body)?;
        debug!("Report archived to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ChangesetDiff;

    fn summary() -> ReportSummary {
        ReportSummary {
            diff: ChangesetDiff::default(),
            applied_operations: 0,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_ms: 0,
            stages: vec![RunStage::Init],
            snapshots: None,
            resolved_placeholders: BTreeMap::new(),
        }
    }

    #[test]
    fn test_warnings_do_not_invalidate() {
        let mut agg = ResultAggregator::new();
        agg.push(Finding::new(Category::NoOpDelete, "nothing to delete").in_table("option_items"));
        let report = agg.finish(summary());

        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.suggestions.is_empty());
    }

    #[test]
    fn test_errors_attach_suggestions() {
        let mut agg = ResultAggregator::new();
        agg.push(
            Finding::new(Category::RequiredFieldError, "missing option_set_id")
                .in_table("option_items")
                .with("field", "option_set_id"),
        );
        let report = agg.finish(summary());

        assert!(!report.valid);
        assert_eq!(report.suggestions.len(), SUGGESTIONS.len());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["errors"][0]["category"], "RequiredFieldError");
        assert_eq!(json["errors"][0]["table"], "option_items");
        assert_eq!(json["errors"][0]["field"], "option_set_id");
        assert!(json["summary"]["applied_operations"].is_number());
    }

    #[test]
    fn test_fatal_report_names_path() {
        let err = SimulationError::setup("/missing/forms.sqlite", "source database not found");
        let report = ResultAggregator::new().fatal(&err, summary());

        assert!(!report.valid);
        let finding = report.errors_of(Category::SetupError).next().unwrap();
        assert_eq!(finding.detail("path").unwrap(), "/missing/forms.sqlite");
    }

    #[test]
    fn test_archive_writes_run_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ReportArchive::new(dir.path().join("reports"));
        let report = ResultAggregator::new().finish(summary());

        let path = archive.save(&report).unwrap();
        assert!(path.ends_with(format!("{}_report.json", report.summary.run_id)));

        let saved: ValidationReport =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(saved.valid);
    }
}
