//! Converts schema-log entries into ordered lists of DDL statements for a
//! downstream postgres database.

use std::sync::Arc;

use thiserror::Error;

use crate::pg::{quote_identifier, quote_qualified_identifier, Query};
use crate::schemalog::{
    compute_schema_diff, Column, Diff, LogEntry, SchemaLogError, SchemaLogStore, SchemaView,
    Table, TableDiff,
};

#[derive(Debug, Error)]
pub enum DdlError {
    #[error("schema log error: {0}")]
    SchemaLog(#[from] SchemaLogError),
}

pub struct DdlAdapter {
    schema_log: Arc<dyn SchemaLogStore>,
}

impl DdlAdapter {
    pub fn new(schema_log: Arc<dyn SchemaLogStore>) -> Self {
        Self { schema_log }
    }

    /// Queries bringing the target up to date with `entry`, diffed against
    /// the prior version of the schema. A missing prior entry means this is
    /// the initial state: every table is created, idempotently.
    pub async fn log_entry_to_queries(&self, entry: &LogEntry) -> Result<Vec<Query>, DdlError> {
        let previous = if entry.initial() {
            None
        } else {
            match self
                .schema_log
                .fetch(&entry.schema_name, entry.version - 1)
                .await
            {
                Ok(previous) => Some(previous.schema),
                Err(SchemaLogError::NotFound { .. }) => None,
                Err(err) => return Err(err.into()),
            }
        };

        let old = previous.unwrap_or_else(SchemaView::default);
        let diff = compute_schema_diff(&old, &entry.schema);
        Ok(schema_diff_to_queries(&entry.schema_name, &diff))
    }
}

/// Emits queries in a fixed order: drops, creates, renames, then column
/// modifications. Within each category the diff's ordering (lexicographic)
/// is preserved.
pub fn schema_diff_to_queries(schema: &str, diff: &Diff) -> Vec<Query> {
    let mut queries = vec![];

    for table in &diff.tables_removed {
        queries.push(drop_table_query(schema, &table.name));
    }
    for table in &diff.tables_added {
        queries.push(create_table_query(schema, table));
    }
    for table_diff in &diff.tables_changed {
        queries.extend(table_diff_to_queries(schema, table_diff));
    }

    queries
}

fn table_diff_to_queries(schema: &str, diff: &TableDiff) -> Vec<Query> {
    let mut queries = vec![];

    if let Some(change) = &diff.table_name_change {
        queries.push(Query::new(format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_qualified_identifier(schema, &change.old),
            change.new
        )));
    }

    let table = quote_qualified_identifier(schema, &diff.table_name);

    for column in &diff.columns_removed {
        queries.push(Query::new(format!(
            "ALTER TABLE {} DROP COLUMN {}",
            table,
            quote_identifier(&column.name)
        )));
    }
    for column in &diff.columns_added {
        queries.push(Query::new(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            table,
            column_definition(column)
        )));
    }
    for column_diff in &diff.columns_changed {
        if let Some(change) = &column_diff.name_change {
            queries.push(Query::new(format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table,
                quote_identifier(&change.old),
                quote_identifier(&change.new)
            )));
        }
        let column = quote_identifier(&column_diff.column_name);
        if let Some(change) = &column_diff.type_change {
            queries.push(Query::new(format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                table, column, change.new
            )));
        }
        if let Some(change) = &column_diff.null_change {
            let action = if change.new {
                "DROP NOT NULL"
            } else {
                "SET NOT NULL"
            };
            queries.push(Query::new(format!(
                "ALTER TABLE {} ALTER COLUMN {} {}",
                table, column, action
            )));
        }
        if let Some(change) = &column_diff.default_change {
            let action = match &change.new {
                Some(default) => format!("SET DEFAULT {default}"),
                None => "DROP DEFAULT".to_string(),
            };
            queries.push(Query::new(format!(
                "ALTER TABLE {} ALTER COLUMN {} {}",
                table, column, action
            )));
        }
    }

    queries
}

fn drop_table_query(schema: &str, table: &str) -> Query {
    Query::new(format!(
        "DROP TABLE IF EXISTS {}",
        quote_qualified_identifier(schema, table)
    ))
}

fn create_table_query(schema: &str, table: &Table) -> Query {
    let mut definitions: Vec<String> =
        table.columns.iter().map(column_definition).collect();

    let mut constraints = vec![];
    for column in &table.columns {
        // Primary key membership already implies uniqueness.
        if column.unique && !table.primary_key_columns.contains(&column.name) {
            constraints.push(format!("UNIQUE ({})", quote_identifier(&column.name)));
        }
    }
    if !table.primary_key_columns.is_empty() {
        let pk_columns: Vec<String> = table
            .primary_key_columns
            .iter()
            .map(|name| quote_identifier(name))
            .collect();
        constraints.push(format!("PRIMARY KEY ({})", pk_columns.join(", ")));
    }

    let body = if constraints.is_empty() {
        format!("{})", definitions.join(",\n"))
    } else {
        definitions.extend(constraints);
        format!("{}\n)", definitions.join(",\n"))
    };

    Query::new(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}",
        quote_qualified_identifier(schema, &table.name),
        body
    ))
}

fn column_definition(column: &Column) -> String {
    let mut definition = format!("{} {}", quote_identifier(&column.name), column.data_type);
    if !column.nullable {
        definition.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default_value {
        definition.push_str(&format!(" DEFAULT {default}"));
    }
    definition
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::schemalog::memory::MemorySchemaLogStore;
    use crate::schemalog::{ColumnDiff, ValueChange};

    const TEST_SCHEMA: &str = "public";

    fn sql_of(queries: &[Query]) -> Vec<&str> {
        queries.iter().map(|q| q.sql.as_str()).collect()
    }

    fn test_column(name: &str, data_type: &str, nullable: bool, unique: bool) -> Column {
        Column {
            id: format!("col-{name}"),
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
            unique,
            default_value: None,
        }
    }

    #[test]
    fn empty_diff_emits_nothing() {
        assert!(schema_diff_to_queries(TEST_SCHEMA, &Diff::default()).is_empty());
    }

    #[test]
    fn table_removed() {
        let diff = Diff {
            tables_removed: vec![Table {
                name: "test-table-1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &diff)),
            vec![r#"DROP TABLE IF EXISTS "public"."test-table-1""#]
        );
    }

    #[test]
    fn table_added_with_primary_key_and_unique() {
        let mut age = test_column("age", "int", false, false);
        age.default_value = Some("0".to_string());
        let diff = Diff {
            tables_added: vec![Table {
                oid: "1".to_string(),
                name: "t1".to_string(),
                columns: vec![
                    test_column("id", "uuid", false, true),
                    test_column("name", "text", true, true),
                    age,
                ],
                primary_key_columns: vec!["id".to_string()],
            }],
            ..Default::default()
        };

        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &diff)),
            vec![
                "CREATE TABLE IF NOT EXISTS \"public\".\"t1\" (\n\"id\" uuid NOT NULL,\n\"name\" text,\n\"age\" int NOT NULL DEFAULT 0,\nUNIQUE (\"name\"),\nPRIMARY KEY (\"id\")\n)"
            ]
        );
    }

    #[test]
    fn table_added_without_constraints() {
        let mut age = test_column("age", "int", false, false);
        age.default_value = Some("0".to_string());
        let diff = Diff {
            tables_added: vec![Table {
                oid: "1".to_string(),
                name: "t1".to_string(),
                columns: vec![
                    test_column("id", "uuid", false, false),
                    test_column("name", "text", true, false),
                    age,
                ],
                primary_key_columns: vec![],
            }],
            ..Default::default()
        };

        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &diff)),
            vec![
                "CREATE TABLE IF NOT EXISTS \"public\".\"t1\" (\n\"id\" uuid NOT NULL,\n\"name\" text,\n\"age\" int NOT NULL DEFAULT 0)"
            ]
        );
    }

    #[test]
    fn table_renamed() {
        let diff = Diff {
            tables_changed: vec![TableDiff {
                table_name: "t2".to_string(),
                table_name_change: Some(ValueChange {
                    old: "t1".to_string(),
                    new: "t2".to_string(),
                }),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &diff)),
            vec![r#"ALTER TABLE "public"."t1" RENAME TO t2"#]
        );
    }

    #[test]
    fn column_dropped() {
        let diff = Diff {
            tables_changed: vec![TableDiff {
                table_name: "t1".to_string(),
                columns_removed: vec![test_column("age", "int", true, false)],
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &diff)),
            vec![r#"ALTER TABLE "public"."t1" DROP COLUMN "age""#]
        );
    }

    #[test]
    fn column_added_with_default() {
        let mut age = test_column("age", "int", false, false);
        age.default_value = Some("0".to_string());
        let diff = Diff {
            tables_changed: vec![TableDiff {
                table_name: "t1".to_string(),
                columns_added: vec![age],
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &diff)),
            vec![r#"ALTER TABLE "public"."t1" ADD COLUMN "age" int NOT NULL DEFAULT 0"#]
        );
    }

    #[test]
    fn column_renamed() {
        let diff = Diff {
            tables_changed: vec![TableDiff {
                table_name: "t1".to_string(),
                columns_changed: vec![ColumnDiff {
                    column_name: "new_name".to_string(),
                    name_change: Some(ValueChange {
                        old: "name".to_string(),
                        new: "new_name".to_string(),
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &diff)),
            vec![r#"ALTER TABLE "public"."t1" RENAME COLUMN "name" TO "new_name""#]
        );
    }

    #[test]
    fn column_type_changed() {
        let diff = Diff {
            tables_changed: vec![TableDiff {
                table_name: "t1".to_string(),
                columns_changed: vec![ColumnDiff {
                    column_name: "name".to_string(),
                    type_change: Some(ValueChange {
                        old: "uuid".to_string(),
                        new: "int".to_string(),
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &diff)),
            vec![r#"ALTER TABLE "public"."t1" ALTER COLUMN "name" TYPE int"#]
        );
    }

    #[test]
    fn column_nullability_changes() {
        let to_nullable = Diff {
            tables_changed: vec![TableDiff {
                table_name: "t1".to_string(),
                columns_changed: vec![ColumnDiff {
                    column_name: "name".to_string(),
                    null_change: Some(ValueChange {
                        old: false,
                        new: true,
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &to_nullable)),
            vec![r#"ALTER TABLE "public"."t1" ALTER COLUMN "name" DROP NOT NULL"#]
        );

        let to_not_nullable = Diff {
            tables_changed: vec![TableDiff {
                table_name: "t1".to_string(),
                columns_changed: vec![ColumnDiff {
                    column_name: "name".to_string(),
                    null_change: Some(ValueChange {
                        old: true,
                        new: false,
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &to_not_nullable)),
            vec![r#"ALTER TABLE "public"."t1" ALTER COLUMN "name" SET NOT NULL"#]
        );
    }

    #[test]
    fn column_default_changes() {
        let removed = Diff {
            tables_changed: vec![TableDiff {
                table_name: "t1".to_string(),
                columns_changed: vec![ColumnDiff {
                    column_name: "age".to_string(),
                    default_change: Some(ValueChange {
                        old: Some("0".to_string()),
                        new: None,
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &removed)),
            vec![r#"ALTER TABLE "public"."t1" ALTER COLUMN "age" DROP DEFAULT"#]
        );

        let set = Diff {
            tables_changed: vec![TableDiff {
                table_name: "t1".to_string(),
                columns_changed: vec![ColumnDiff {
                    column_name: "age".to_string(),
                    default_change: Some(ValueChange {
                        old: None,
                        new: Some("0".to_string()),
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(
            sql_of(&schema_diff_to_queries(TEST_SCHEMA, &set)),
            vec![r#"ALTER TABLE "public"."t1" ALTER COLUMN "age" SET DEFAULT 0"#]
        );
    }

    fn log_entry(version: i64, schema: SchemaView) -> LogEntry {
        LogEntry {
            id: format!("entry-{version}"),
            version,
            schema_name: TEST_SCHEMA.to_string(),
            created_at: Utc::now(),
            schema,
            acked: false,
        }
    }

    #[tokio::test]
    async fn initial_entry_creates_every_table() {
        let store = Arc::new(MemorySchemaLogStore::new());
        let adapter = DdlAdapter::new(store);

        let entry = log_entry(
            0,
            SchemaView {
                tables: vec![Table {
                    oid: "1".to_string(),
                    name: "t1".to_string(),
                    columns: vec![test_column("id", "uuid", false, false)],
                    primary_key_columns: vec![],
                }],
            },
        );

        let queries = adapter.log_entry_to_queries(&entry).await.unwrap();
        assert_eq!(
            sql_of(&queries),
            vec!["CREATE TABLE IF NOT EXISTS \"public\".\"t1\" (\n\"id\" uuid NOT NULL)"]
        );
    }

    #[tokio::test]
    async fn later_entries_diff_against_the_prior_version() {
        let store = Arc::new(MemorySchemaLogStore::new());

        let v0 = SchemaView {
            tables: vec![Table {
                oid: "1".to_string(),
                name: "t1".to_string(),
                columns: vec![test_column("id", "uuid", false, false)],
                primary_key_columns: vec![],
            }],
        };
        store.insert(TEST_SCHEMA, v0.clone()).await.unwrap();

        let mut v1 = v0;
        v1.tables[0].name = "t2".to_string();
        let entry = store.insert(TEST_SCHEMA, v1).await.unwrap();

        let adapter = DdlAdapter::new(store);
        let queries = adapter.log_entry_to_queries(&entry).await.unwrap();
        assert_eq!(
            sql_of(&queries),
            vec![r#"ALTER TABLE "public"."t1" RENAME TO t2"#]
        );
    }

    #[tokio::test]
    async fn missing_prior_entry_takes_the_initial_path() {
        let store = Arc::new(MemorySchemaLogStore::new());
        let adapter = DdlAdapter::new(store);

        // Version 3 with no history behind it.
        let entry = log_entry(
            3,
            SchemaView {
                tables: vec![Table {
                    oid: "1".to_string(),
                    name: "t1".to_string(),
                    columns: vec![test_column("id", "uuid", false, false)],
                    primary_key_columns: vec![],
                }],
            },
        );

        let queries = adapter.log_entry_to_queries(&entry).await.unwrap();
        assert!(queries[0].sql.starts_with("CREATE TABLE IF NOT EXISTS"));
    }
}
