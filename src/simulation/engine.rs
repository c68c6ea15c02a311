//! Validation Engine
//!
//! Runs one changeset through the whole pipeline:
//!
//! `Init → SandboxCreated → InitialSnapshot → Applied → Validated → Diffed → Reported → Cleaned`
//!
//! Changesets with structural, required-field or type errors are rejected
//! before a sandbox exists (`Init → Reported → Cleaned`). A fatal sandbox
//! failure also ends in `Reported`/`Cleaned`, with a single `SetupError`.
//! The sandbox is destroyed on every path.

use super::applier::ChangesetApplier;
use super::collateral::CollateralDetector;
use super::constraints::ConstraintValidator;
use super::intent::IntentVerifier;
use super::report::{
    Category, Finding, ReportArchive, ReportSummary, ResultAggregator, SnapshotPair, ValidationReport,
};
use crate::changeset::{ChangesetParser, ParsedChangeset, PlaceholderResolver, TableOrdering};
use crate::config::{EngineConfig, ValidationRules};
use crate::error::SimulationError;
use crate::introspection::{Schema, SqliteIntrospector};
use crate::sandbox::{Sandbox, SandboxManager};
use crate::snapshot::{ChangesetDiff, DataSnapshot, DiffEngine, SnapshotCapturer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pipeline stages, recorded in order in every report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStage {
    Init,
    SandboxCreated,
    InitialSnapshot,
    Applied,
    Validated,
    Diffed,
    Reported,
    Cleaned,
}

/// A finished run: the report, plus the final sandbox state when one was reached
#[derive(Debug)]
pub struct SimulationRun {
    pub report: ValidationReport,
    pub final_snapshot: Option<DataSnapshot>,
}

/// Result of one named case in a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,
    pub report: ValidationReport,
}

/// Results of validating several independent changesets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl BatchReport {
    pub fn from_results(results: Vec<CaseResult>) -> Self {
        let passed = results.iter().filter(|r| r.report.valid).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            results,
        }
    }
}

/// Bookkeeping shared by every path through a run
struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    stages: Vec<RunStage>,
    aggregator: ResultAggregator,
    diff: ChangesetDiff,
    applied_operations: usize,
    snapshots: Option<SnapshotPair>,
    resolved_placeholders: BTreeMap<String, Value>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            clock: Instant::now(),
            stages: vec![RunStage::Init],
            aggregator: ResultAggregator::new(),
            diff: ChangesetDiff::default(),
            applied_operations: 0,
            snapshots: None,
            resolved_placeholders: BTreeMap::new(),
        }
    }

    fn enter(&mut self, stage: RunStage) {
        debug!("Run {} -> {:?}", self.run_id, stage);
        self.stages.push(stage);
    }

    fn report(&mut self) -> ValidationReport {
        let summary = self.summary();
        std::mem::take(&mut self.aggregator).finish(summary)
    }

    fn fatal_report(&mut self, err: &SimulationError) -> ValidationReport {
        error!("❌ Run {} failed: {}", self.run_id, err);
        self.enter(RunStage::Reported);
        let summary = self.summary();
        std::mem::take(&mut self.aggregator).fatal(err, summary)
    }

    fn summary(&self) -> ReportSummary {
        ReportSummary {
            diff: self.diff.clone(),
            applied_operations: self.applied_operations,
            run_id: self.run_id,
            started_at: self.started_at,
            duration_ms: self.clock.elapsed().as_millis() as u64,
            stages: self.stages.clone(),
            snapshots: self.snapshots.clone(),
            resolved_placeholders: self.resolved_placeholders.clone(),
        }
    }
}

/// Validates changesets against disposable copies of a canonical database
#[derive(Debug, Clone)]
pub struct ValidationEngine {
    sandboxes: SandboxManager,
    rules: ValidationRules,
    sigil: char,
    archive: Option<ReportArchive>,
}

impl ValidationEngine {
    pub fn new(config: &EngineConfig, rules: ValidationRules) -> Self {
        Self {
            sandboxes: SandboxManager::new(config.sandbox_dir.clone()),
            rules,
            sigil: config.placeholder_sigil,
            archive: config.report_dir.clone().map(ReportArchive::new),
        }
    }

    /// Introspect `source` and validate one raw changeset against it
    pub fn validate_path(&self, source: &Path, changeset: &Value) -> ValidationReport {
        match SqliteIntrospector::introspect_path(source) {
            Ok(schema) => self.validate(source, &schema, changeset),
            Err(err) => {
                let report = RunContext::new().fatal_report(&err);
                self.finish(report)
            }
        }
    }

    /// Validate one raw changeset against `source`, whose schema is `schema`
    pub fn validate(&self, source: &Path, schema: &Schema, changeset: &Value) -> ValidationReport {
        self.run(source, schema, changeset).report
    }

    /// Validate several changesets, each in its own sandbox
    pub fn validate_batch(&self, source: &Path, schema: &Schema, cases: Vec<(String, Value)>) -> BatchReport {
        let results = cases
            .into_iter()
            .map(|(name, changeset)| {
                info!("📦 Batch case '{}'", name);
                CaseResult {
                    report: self.validate(source, schema, &changeset),
                    name,
                }
            })
            .collect();

        BatchReport::from_results(results)
    }

    /// Introspect `source` once and validate every case against it. If the
    /// source is unusable each case gets its own `SetupError` report.
    pub fn validate_batch_path(&self, source: &Path, cases: Vec<(String, Value)>) -> BatchReport {
        let err = match SqliteIntrospector::introspect_path(source) {
            Ok(schema) => return self.validate_batch(source, &schema, cases),
            Err(err) => err,
        };

        let results = cases
            .into_iter()
            .map(|(name, _)| CaseResult {
                report: self.finish(RunContext::new().fatal_report(&err)),
                name,
            })
            .collect();
        BatchReport::from_results(results)
    }

    /// Full run, also handing back the final snapshot if one was captured
    pub fn run(&self, source: &Path, schema: &Schema, input: &Value) -> SimulationRun {
        let mut ctx = RunContext::new();
        info!("🔍 Validation run {} started for {}", ctx.run_id, source.display());

        let parsed = ChangesetParser::new(schema, self.sigil).parse(input);
        ctx.diff = DiffEngine::generate_diff(&parsed.changeset);

        if self.reject_before_apply(schema, &parsed, &mut ctx) {
            info!(
                "⛔ Run {} rejected before apply with {} errors",
                ctx.run_id,
                ctx.aggregator.error_count()
            );
            let report = ctx.report();
            return SimulationRun {
                report: self.finish(report),
                final_snapshot: None,
            };
        }

        let mut sandbox = match self.sandboxes.create(source) {
            Ok(sandbox) => sandbox,
            Err(err) => {
                let report = ctx.fatal_report(&err);
                return SimulationRun {
                    report: self.finish(report),
                    final_snapshot: None,
                };
            }
        };
        ctx.enter(RunStage::SandboxCreated);

        let outcome = self.run_in_sandbox(&sandbox, schema, &parsed, &mut ctx);
        let (report, final_snapshot) = match outcome {
            Ok(final_snapshot) => {
                ctx.enter(RunStage::Reported);
                (ctx.report(), Some(final_snapshot))
            }
            Err(err) => (ctx.fatal_report(&err), None),
        };

        sandbox.destroy();
        SimulationRun {
            report: self.finish(report),
            final_snapshot,
        }
    }

    /// Structural, required-field and type checks against the canonical schema
    fn reject_before_apply(&self, schema: &Schema, parsed: &ParsedChangeset, ctx: &mut RunContext) -> bool {
        let validator = ConstraintValidator::new(schema, &self.rules);
        ctx.aggregator.extend(parsed.findings.iter().cloned());
        ctx.aggregator.extend(validator.validate_required_fields(&parsed.changeset));
        ctx.aggregator.extend(validator.validate_data_types(&parsed.changeset));

        if ctx.aggregator.has_errors() {
            ctx.enter(RunStage::Reported);
            return true;
        }
        false
    }

    fn run_in_sandbox(
        &self,
        sandbox: &Sandbox,
        schema: &Schema,
        parsed: &ParsedChangeset,
        ctx: &mut RunContext,
    ) -> Result<DataSnapshot, SimulationError> {
        let mut conn = sandbox.open()?;

        let initial = SnapshotCapturer::capture(&conn, schema)?;
        ctx.enter(RunStage::InitialSnapshot);

        let resolution = PlaceholderResolver::resolve(&parsed.changeset, schema, &conn)?;
        for (table, field, token) in &resolution.unresolved {
            ctx.aggregator.push(
                Finding::new(
                    Category::StructuralError,
                    format!("unresolved placeholder '{}' in '{}.{}'", token, table, field),
                )
                .in_table(table.as_str())
                .with("field", field.as_str())
                .with("placeholder", token.as_str()),
            );
        }
        ctx.resolved_placeholders = resolution.resolved.clone();

        let changeset = TableOrdering::apply_order(&resolution.changeset, schema);
        let applied = ChangesetApplier::apply_on(&mut conn, &changeset)?;
        ctx.applied_operations = applied.applied_operations.len();
        ctx.aggregator.extend(applied.findings().cloned());
        ctx.enter(RunStage::Applied);

        let final_snapshot = SnapshotCapturer::capture(&conn, schema)?;
        ctx.snapshots = Some(SnapshotPair {
            initial: initial.summary(),
            r#final: Some(final_snapshot.summary()),
        });

        let validator = ConstraintValidator::new(schema, &self.rules);
        ctx.aggregator.extend(validator.validate_foreign_keys(&conn)?);
        ctx.aggregator.extend(validator.validate_unique_constraints(&conn)?);
        ctx.aggregator.extend(validator.check_referential_integrity(&conn)?);
        ctx.aggregator.extend(validator.integrity_check(&conn)?);
        ctx.enter(RunStage::Validated);

        ctx.aggregator.extend(IntentVerifier::verify_intended_changes(
            &initial,
            &final_snapshot,
            &changeset,
        ));
        ctx.aggregator.extend(CollateralDetector::detect(&initial, &final_snapshot, &changeset));
        ctx.enter(RunStage::Diffed);

        Ok(final_snapshot)
    }

    /// Close out a report: mark cleanup, archive, log
    fn finish(&self, mut report: ValidationReport) -> ValidationReport {
        report.summary.stages.push(RunStage::Cleaned);

        if let Some(archive) = &self.archive {
            if let Err(e) = archive.save(&report) {
                warn!("⚠️  Could not archive report {}: {}", report.summary.run_id, e);
            }
        }

        info!(
            "✅ Run {} finished: valid={} errors={} warnings={} in {}ms",
            report.summary.run_id,
            report.valid,
            report.errors.len(),
            report.warnings.len(),
            report.summary.duration_ms
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::forms_db;
    use serde_json::json;

    fn engine() -> ValidationEngine {
        ValidationEngine::new(&EngineConfig::default(), ValidationRules::default())
    }

    #[test]
    fn test_full_pipeline_stage_trace() {
        let (_dir, path) = forms_db();
        let report = engine().validate_path(
            &path,
            &json!({"option_items": {"update": [{"id": "OPT_TOKYO", "value": "Wuhan", "label": "Wuhan"}]}}),
        );

        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(
            report.summary.stages,
            vec![
                RunStage::Init,
                RunStage::SandboxCreated,
                RunStage::InitialSnapshot,
                RunStage::Applied,
                RunStage::Validated,
                RunStage::Diffed,
                RunStage::Reported,
                RunStage::Cleaned,
            ]
        );
        assert_eq!(report.summary.applied_operations, 1);
        let snapshots = report.summary.snapshots.unwrap();
        assert_ne!(snapshots.initial.checksum, snapshots.r#final.unwrap().checksum);
    }

    #[test]
    fn test_rejected_changeset_never_gets_a_sandbox() {
        let (_dir, path) = forms_db();
        let report = engine().validate_path(&path, &json!({"option_items": {"update": [{"value": "X"}]}}));

        assert!(!report.valid);
        assert_eq!(
            report.summary.stages,
            vec![RunStage::Init, RunStage::Reported, RunStage::Cleaned]
        );
        assert!(report.summary.snapshots.is_none());
    }

    #[test]
    fn test_missing_source_is_a_setup_report() {
        let report = engine().validate_path(Path::new("/nonexistent/forms.sqlite"), &json!({}));

        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].category, Category::SetupError);
        assert_eq!(report.summary.stages.last(), Some(&RunStage::Cleaned));
    }

    #[test]
    fn test_source_is_never_modified() {
        let (_dir, path) = forms_db();
        let before = crate::sandbox::file_checksum(&path).unwrap();
        engine().validate_path(&path, &json!({"option_items": {"delete": [{"id": "OPT_TOKYO"}]}}));
        assert_eq!(crate::sandbox::file_checksum(&path).unwrap(), before);
    }

    #[test]
    fn test_batch_counts_pass_and_fail() {
        let (_dir, path) = forms_db();
        let schema = SqliteIntrospector::introspect_path(&path).unwrap();
        let batch = engine().validate_batch(
            &path,
            &schema,
            vec![
                ("rename".to_string(), json!({"option_items": {"update": [{"id": "OPT_TOKYO", "value": "Wuhan"}]}})),
                ("bad".to_string(), json!({"nope": {}})),
            ],
        );

        assert_eq!(batch.total, 2);
        assert_eq!(batch.passed, 1);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.results[1].name, "bad");
    }

    #[test]
    fn test_reports_are_archived() {
        let (_dir, path) = forms_db();
        let reports = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            report_dir: Some(reports.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let report = ValidationEngine::new(&config, ValidationRules::default())
            .validate_path(&path, &json!({}));

        let archived = reports.path().join(format!("{}_report.json", report.summary.run_id));
        assert!(archived.exists());
    }

    #[test]
    fn test_batch_against_missing_source_reports_every_case() {
        let batch = engine().validate_batch_path(
            Path::new("/nonexistent/forms.sqlite"),
            vec![("first".to_string(), json!({})), ("second".to_string(), json!({}))],
        );

        assert_eq!((batch.total, batch.passed, batch.failed), (2, 0, 2));
        assert_eq!(batch.results[1].name, "second");
        assert!(batch
            .results
            .iter()
            .all(|r| r.report.errors.len() == 1 && r.report.errors[0].category == Category::SetupError));
        assert_ne!(batch.results[0].report.summary.run_id, batch.results[1].report.summary.run_id);
    }

    #[test]
    fn test_batch_path_introspects_once_and_runs_each_case() {
        let (_dir, path) = forms_db();
        let batch = engine().validate_batch_path(
            &path,
            vec![
                ("rename".to_string(), json!({"option_items": {"update": [{"id": "OPT_TOKYO", "value": "Wuhan"}]}})),
                ("delete".to_string(), json!({"option_items": {"delete": [{"id": "OPT_KYOTO"}]}})),
            ],
        );

        assert_eq!((batch.total, batch.passed, batch.failed), (2, 2, 0));
    }
}
