//! Boundary parser: raw changeset JSON to the typed model
//!
//! Malformed input never aborts parsing. Every problem becomes a
//! `StructuralError` finding and the offending record is left out, so one
//! pass reports everything.

use super::model::{Changeset, OperationKind, Record, Reference, TableOperations};
use crate::introspection::{Schema, TableSchema};
use crate::simulation::{Category, Finding};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Parsed changeset plus the findings raised while building it
#[derive(Debug, Clone)]
pub struct ParsedChangeset {
    pub changeset: Changeset,
    pub findings: Vec<Finding>,
}

impl ParsedChangeset {
    pub fn has_structural_errors(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.category == Category::StructuralError)
    }
}

pub struct ChangesetParser<'a> {
    schema: &'a Schema,
    sigil: char,
}

impl<'a> ChangesetParser<'a> {
    pub fn new(schema: &'a Schema, sigil: char) -> Self {
        Self { schema, sigil }
    }

    pub fn parse(&self, input: &Value) -> ParsedChangeset {
        let mut findings = Vec::new();

        let Some(root) = input.as_object() else {
            findings.push(Finding::new(
                Category::StructuralError,
                "changeset must be an object mapping table names to operations",
            ));
            return ParsedChangeset {
                changeset: Changeset::new(Vec::new()),
                findings,
            };
        };

        let mut tables = Vec::with_capacity(root.len());
        for (name, block) in root {
            let Some(table) = self.schema.table(name) else {
                findings.push(
                    Finding::new(Category::StructuralError, format!("unknown table '{}'", name))
                        .in_table(name),
                );
                continue;
            };
            if let Some(ops) = self.parse_table(table, block, &mut findings) {
                tables.push(ops);
            }
        }

        self.check_placeholders(&tables, &mut findings);

        let changeset = Changeset::new(tables);
        debug!(
            "Parsed changeset: {} tables, {} operations, {} findings",
            changeset.tables().len(),
            changeset.operation_count(),
            findings.len()
        );

        ParsedChangeset { changeset, findings }
    }

    fn parse_table(
        &self,
        table: &TableSchema,
        block: &Value,
        findings: &mut Vec<Finding>,
    ) -> Option<TableOperations> {
        let Some(block) = block.as_object() else {
            findings.push(
                Finding::new(
                    Category::StructuralError,
                    format!(
                        "operations for '{}' must be an object with insert/update/delete lists",
                        table.name
                    ),
                )
                .in_table(&table.name),
            );
            return None;
        };

        let key_columns: Vec<String> = table.key_columns().iter().map(|c| c.to_string()).collect();
        let mut ops = TableOperations::new(&table.name, key_columns);

        for (op_name, records) in block {
            let kind = match op_name.as_str() {
                "insert" => OperationKind::Insert,
                "update" => OperationKind::Update,
                "delete" => OperationKind::Delete,
                other => {
                    findings.push(
                        Finding::new(
                            Category::StructuralError,
                            format!("unknown operation '{}' (expected insert, update or delete)", other),
                        )
                        .in_table(&table.name),
                    );
                    continue;
                }
            };

            let Some(records) = records.as_array() else {
                findings.push(
                    Finding::new(
                        Category::StructuralError,
                        format!("'{}.{}' must be a list of records", table.name, op_name),
                    )
                    .in_table(&table.name)
                    .with("operation", op_name.as_str()),
                );
                continue;
            };

            for (index, raw) in records.iter().enumerate() {
                let context = |msg: String| {
                    Finding::new(Category::StructuralError, msg)
                        .in_table(&table.name)
                        .with("operation", op_name.as_str())
                        .with("index", index)
                        .with("record", raw.clone())
                };

                let Some(object) = raw.as_object() else {
                    findings.push(context(format!(
                        "record {} of '{}.{}' must be an object",
                        index, table.name, op_name
                    )));
                    continue;
                };

                let record = self.build_record(table, kind, index, object, findings);

                if kind != OperationKind::Insert {
                    if let Some(problem) = Self::key_problem(&ops.key_columns, &record, kind) {
                        findings.push(context(problem));
                        continue;
                    }
                }

                ops.records_mut(kind).push(record);
            }
        }

        Some(ops)
    }

    fn build_record(
        &self,
        table: &TableSchema,
        kind: OperationKind,
        index: usize,
        object: &Map<String, Value>,
        findings: &mut Vec<Finding>,
    ) -> Record {
        let mut record = Record::new();
        for (field, value) in object {
            if table.column(field).is_some() {
                record = record.with(field.as_str(), Reference::classify(value.clone(), self.sigil));
            } else {
                findings.push(
                    Finding::new(
                        Category::UnknownField,
                        format!(
                            "field '{}' is not a column of '{}' and will not be written",
                            field, table.name
                        ),
                    )
                    .in_table(&table.name)
                    .with("field", field.as_str())
                    .with("operation", kind.key())
                    .with("index", index),
                );
                record = record.with_extra(field.as_str(), value.clone());
            }
        }
        record
    }

    /// Update/delete targets need a concrete, non-null key
    fn key_problem(key_columns: &[String], record: &Record, kind: OperationKind) -> Option<String> {
        for column in key_columns {
            match record.get(column) {
                None | Some(Reference::Concrete(Value::Null)) => {
                    return Some(format!("missing {} in {} record", column, kind.key()));
                }
                Some(Reference::Placeholder(token)) => {
                    return Some(format!(
                        "placeholder id not allowed in {}: '{}' does not exist in the store yet",
                        kind.key(),
                        token
                    ));
                }
                Some(Reference::Concrete(_)) => {}
            }
        }
        None
    }

    /// Every placeholder used as a value must be the key of exactly one insert
    fn check_placeholders(&self, tables: &[TableOperations], findings: &mut Vec<Finding>) {
        let mut defined: BTreeMap<&str, &str> = BTreeMap::new();
        for ops in tables {
            for record in &ops.insert {
                for token in record.defined_placeholders(&ops.key_columns) {
                    if let Some(first) = defined.insert(token, ops.table.as_str()) {
                        findings.push(
                            Finding::new(
                                Category::StructuralError,
                                format!(
                                    "placeholder '{}' is defined by more than one insert (first in '{}')",
                                    token, first
                                ),
                            )
                            .in_table(&ops.table)
                            .with("placeholder", token),
                        );
                    }
                }
            }
        }

        let mut reported: BTreeSet<(&str, &str)> = BTreeSet::new();
        for ops in tables {
            for kind in [OperationKind::Insert, OperationKind::Update] {
                for record in ops.records(kind) {
                    for (field, value) in record.fields() {
                        let Some(token) = value.placeholder() else {
                            continue;
                        };
                        if kind == OperationKind::Insert && ops.key_columns.contains(field) {
                            continue;
                        }
                        if defined.contains_key(token) || !reported.insert((ops.table.as_str(), token)) {
                            continue;
                        }
                        findings.push(
                            Finding::new(
                                Category::StructuralError,
                                format!(
                                    "unresolved placeholder '{}' in '{}.{}': no insert in this changeset defines it",
                                    token, ops.table, field
                                ),
                            )
                            .in_table(&ops.table)
                            .with("field", field.as_str())
                            .with("placeholder", token),
                        );
                    }
                }
            }
        }
    }
}
