//! Cross-table apply order
//!
//! Parents are applied before children among the tables present in the
//! changeset. Ties keep the caller's declared order; a cycle falls back to
//! declared order for the tables caught in it.

use super::model::Changeset;
use crate::introspection::Schema;
use tracing::debug;

pub struct TableOrdering;

impl TableOrdering {
    /// Indices into `changeset.tables()` in apply order
    pub fn order(changeset: &Changeset, schema: &Schema) -> Vec<usize> {
        let names: Vec<&str> = changeset.tables().iter().map(|t| t.table.as_str()).collect();

        // parents[i] = indices of tables in the changeset that table i references
        let parents: Vec<Vec<usize>> = names
            .iter()
            .map(|name| {
                let mut deps: Vec<usize> = schema
                    .table(name)
                    .map(|t| {
                        t.parent_tables()
                            .filter_map(|p| names.iter().position(|n| *n == p))
                            .collect()
                    })
                    .unwrap_or_default();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect();

        let mut placed = vec![false; names.len()];
        let mut order = Vec::with_capacity(names.len());

        while order.len() < names.len() {
            let ready = (0..names.len())
                .find(|&i| !placed[i] && parents[i].iter().all(|&p| placed[p]));

            // cycle: take the earliest declared table still waiting
            let next = match ready {
                Some(i) => i,
                None => {
                    let Some(i) = (0..names.len()).find(|&i| !placed[i]) else {
                        break;
                    };
                    debug!("Foreign-key cycle involving '{}', keeping declared order", names[i]);
                    i
                }
            };

            placed[next] = true;
            order.push(next);
        }

        order
    }

    /// The changeset with its tables rearranged into apply order
    pub fn apply_order(changeset: &Changeset, schema: &Schema) -> Changeset {
        let order = Self::order(changeset, schema);
        if order.iter().enumerate().all(|(pos, &i)| pos == i) {
            return changeset.clone();
        }
        changeset.reordered(&order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangesetParser;
    use crate::introspection::SqliteIntrospector;
    use crate::test_support::{forms_db, forms_db_with};
    use serde_json::json;

    fn table_names(changeset: &Changeset) -> Vec<&str> {
        changeset.tables().iter().map(|t| t.table.as_str()).collect()
    }

    #[test]
    fn test_parents_move_ahead_of_children() {
        let (_dir, path) = forms_db();
        let schema = SqliteIntrospector::introspect_path(&path).unwrap();
        let parsed = ChangesetParser::new(&schema, '$').parse(&json!({
            "option_items": {"insert": [{"id": "$i", "option_set_id": "$s", "value": "v", "label": "l"}]},
            "categories": {"insert": [{"slug": "new", "name": "New"}]},
            "option_sets": {"insert": [{"id": "$s", "form_id": "$f", "name": "n"}]},
            "forms": {"insert": [{"id": "$f", "slug": "s", "title": "t"}]}
        }));

        let ordered = TableOrdering::apply_order(&parsed.changeset, &schema);
        assert_eq!(
            table_names(&ordered),
            vec!["categories", "forms", "option_sets", "option_items"]
        );
    }

    #[test]
    fn test_independent_tables_keep_declared_order() {
        let (_dir, path) = forms_db();
        let schema = SqliteIntrospector::introspect_path(&path).unwrap();
        let parsed = ChangesetParser::new(&schema, '$').parse(&json!({
            "categories": {"delete": [{"id": 1}]},
            "audit_notes": {"insert": [{"note": "x"}]}
        }));

        assert_eq!(TableOrdering::order(&parsed.changeset, &schema), vec![0, 1]);
    }

    #[test]
    fn test_cycle_falls_back_to_declared_order() {
        let (_dir, path) = forms_db_with(
            "CREATE TABLE eggs (id TEXT PRIMARY KEY, hen_id TEXT REFERENCES hens(id));
             CREATE TABLE hens (id TEXT PRIMARY KEY, egg_id TEXT REFERENCES eggs(id));",
        );
        let schema = SqliteIntrospector::introspect_path(&path).unwrap();
        let parsed = ChangesetParser::new(&schema, '$').parse(&json!({
            "hens": {"insert": [{"id": "h1"}]},
            "eggs": {"insert": [{"id": "e1"}]}
        }));

        assert_eq!(TableOrdering::order(&parsed.changeset, &schema), vec![0, 1]);
    }
}
