//! Typed changeset model
//!
//! A [`Changeset`] is built once at the boundary (see [`super::ChangesetParser`])
//! and never mutated afterwards. Placeholder resolution produces a new value.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

static PLACEHOLDER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.:-]*$").expect("placeholder name pattern is valid")
});

/// A field value: either concrete, or a reference to the id of another
/// insert in the same changeset
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    Concrete(Value),
    /// Full token including the sigil, e.g. `$opt_paris`
    Placeholder(String),
}

impl Reference {
    /// Classify a raw JSON value. Only `<sigil><identifier>` strings are
    /// placeholders, so values like `"$5 off"` stay concrete.
    pub fn classify(value: Value, sigil: char) -> Self {
        if let Value::String(s) = &value {
            if let Some(name) = s.strip_prefix(sigil) {
                if PLACEHOLDER_NAME.is_match(name) {
                    return Reference::Placeholder(s.clone());
                }
            }
        }
        Reference::Concrete(value)
    }

    pub fn placeholder(&self) -> Option<&str> {
        match self {
            Reference::Placeholder(token) => Some(token),
            Reference::Concrete(_) => None,
        }
    }

    pub fn concrete(&self) -> Option<&Value> {
        match self {
            Reference::Concrete(v) => Some(v),
            Reference::Placeholder(_) => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Reference::Placeholder(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Reference::Concrete(Value::Null))
    }

    /// JSON form as the caller wrote it
    pub fn to_json(&self) -> Value {
        match self {
            Reference::Concrete(v) => v.clone(),
            Reference::Placeholder(token) => Value::String(token.clone()),
        }
    }
}

/// Operation kinds, applied per table in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Delete,
    ];

    pub fn key(self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        })
    }
}

/// One row-level operation's payload, keyed against the table's columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Reference>,
    /// Fields that are not columns of the table; kept, never written
    extra: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Reference) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Reference> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, Reference> {
        &self.fields
    }

    pub fn extra(&self) -> &BTreeMap<String, Value> {
        &self.extra
    }

    /// Key value(s) for `key_columns`: a scalar for single-column keys,
    /// an object for composite ones. Missing columns come back as null.
    pub fn key_value(&self, key_columns: &[String]) -> Value {
        match key_columns {
            [single] => self.get(single).map(Reference::to_json).unwrap_or(Value::Null),
            _ => Value::Object(
                key_columns
                    .iter()
                    .map(|c| (c.clone(), self.get(c).map(Reference::to_json).unwrap_or(Value::Null)))
                    .collect(),
            ),
        }
    }

    /// Placeholders this record defines as its own key
    pub fn defined_placeholders<'a>(&'a self, key_columns: &'a [String]) -> impl Iterator<Item = &'a str> + 'a {
        key_columns
            .iter()
            .filter_map(move |c| self.get(c).and_then(Reference::placeholder))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Copy with every reference passed through `f`
    pub fn map_references(&self, mut f: impl FnMut(&str, &Reference) -> Reference) -> Record {
        Record {
            fields: self
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), f(k.as_str(), v)))
                .collect(),
            extra: self.extra.clone(),
        }
    }
}

/// All operations declared for one table
#[derive(Debug, Clone, PartialEq)]
pub struct TableOperations {
    pub table: String,
    /// Columns identifying a row for update/delete
    pub key_columns: Vec<String>,
    pub insert: Vec<Record>,
    pub update: Vec<Record>,
    pub delete: Vec<Record>,
}

impl TableOperations {
    pub fn new(table: impl Into<String>, key_columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            key_columns,
            insert: Vec::new(),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }

    pub fn records(&self, kind: OperationKind) -> &[Record] {
        match kind {
            OperationKind::Insert => &self.insert,
            OperationKind::Update => &self.update,
            OperationKind::Delete => &self.delete,
        }
    }

    pub fn records_mut(&mut self, kind: OperationKind) -> &mut Vec<Record> {
        match kind {
            OperationKind::Insert => &mut self.insert,
            OperationKind::Update => &mut self.update,
            OperationKind::Delete => &mut self.delete,
        }
    }

    pub fn operation_count(&self) -> usize {
        self.insert.len() + self.update.len() + self.delete.len()
    }

    fn to_json(&self) -> Value {
        let mut block = Map::new();
        for kind in OperationKind::ALL {
            let records = self.records(kind);
            if !records.is_empty() {
                block.insert(
                    kind.key().to_string(),
                    Value::Array(records.iter().map(Record::to_json).collect()),
                );
            }
        }
        Value::Object(block)
    }
}

/// The declared batch, immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    tables: Vec<TableOperations>,
    digest: String,
}

impl Changeset {
    pub fn new(tables: Vec<TableOperations>) -> Self {
        let mut changeset = Self {
            tables,
            digest: String::new(),
        };
        changeset.digest = changeset.compute_digest();
        changeset
    }

    pub fn tables(&self) -> &[TableOperations] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableOperations> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// SHA-256 of the canonical JSON form
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn operation_count(&self) -> usize {
        self.tables.iter().map(TableOperations::operation_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.operation_count() == 0
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.tables
                .iter()
                .map(|t| (t.table.clone(), t.to_json()))
                .collect(),
        )
    }

    /// Same changeset with tables in a new order (indices into `tables()`)
    pub fn reordered(&self, order: &[usize]) -> Changeset {
        Changeset::new(order.iter().map(|&i| self.tables[i].clone()).collect())
    }

    /// Copy with every record's references passed through `f(table, field, reference)`
    pub fn map_references(&self, mut f: impl FnMut(&str, &str, &Reference) -> Reference) -> Changeset {
        let tables = self
            .tables
            .iter()
            .map(|ops| {
                let mut mapped = TableOperations::new(ops.table.clone(), ops.key_columns.clone());
                for kind in OperationKind::ALL {
                    *mapped.records_mut(kind) = ops
                        .records(kind)
                        .iter()
                        .map(|r| r.map_references(|field, v| f(ops.table.as_str(), field, v)))
                        .collect();
                }
                mapped
            })
            .collect();
        Changeset::new(tables)
    }

    fn compute_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_json().to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
