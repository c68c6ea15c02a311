//! Shared fixtures for unit tests: a small form-builder database on disk.

use rusqlite::Connection;
use std::path::PathBuf;
use tempfile::TempDir;

pub const FORMS_SCHEMA: &str = r#"
CREATE TABLE forms (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL
);
CREATE TABLE option_sets (
    id TEXT PRIMARY KEY,
    form_id TEXT REFERENCES forms(id),
    name TEXT NOT NULL
);
CREATE TABLE option_items (
    id TEXT PRIMARY KEY,
    option_set_id TEXT NOT NULL REFERENCES option_sets(id),
    value TEXT NOT NULL,
    label TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE categories (
    id INTEGER PRIMARY KEY,
    slug TEXT NOT NULL,
    name TEXT NOT NULL
);
CREATE TABLE field_option_binding (
    field_id TEXT NOT NULL,
    option_set_id TEXT NOT NULL,
    PRIMARY KEY (field_id, option_set_id)
);
CREATE TABLE audit_notes (
    note TEXT
);

INSERT INTO forms (id, slug, title) VALUES ('F1', 'travel', 'Travel survey');
INSERT INTO option_sets (id, form_id, name) VALUES ('OS1', 'F1', 'Cities');
INSERT INTO option_items (id, option_set_id, value, label, position, is_active) VALUES
    ('OPT_TOKYO', 'OS1', 'Tokyo', 'Tokyo', 1, 1),
    ('OPT_OSAKA', 'OS1', 'Osaka', 'Osaka', 2, 1),
    ('OPT_KYOTO', 'OS1', 'Kyoto', 'Kyoto', 3, 1);
INSERT INTO categories (id, slug, name) VALUES (1, 'general', 'General'), (2, 'billing', 'Billing');
INSERT INTO field_option_binding (field_id, option_set_id) VALUES ('FIELD_CITY', 'OS1');
INSERT INTO audit_notes (note) VALUES ('seeded'), ('seeded');
"#;

/// Build the fixture database inside a fresh temp dir.
/// The `TempDir` must outlive every use of the path.
pub fn forms_db() -> (TempDir, PathBuf) {
    forms_db_with("")
}

/// Same fixture plus extra SQL (triggers, rows) appended to the schema
pub fn forms_db_with(extra_sql: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forms.sqlite");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(FORMS_SCHEMA).unwrap();
    if !extra_sql.is_empty() {
        conn.execute_batch(extra_sql).unwrap();
    }
    drop(conn);
    (dir, path)
}
