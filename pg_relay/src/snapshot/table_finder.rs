use std::sync::Arc;

use crate::conversions::cell::CellValue;
use crate::pg::{
    Querier, QuerierError, Query, DISCOVER_ALL_SCHEMAS_QUERY, DISCOVER_SCHEMA_TABLES_QUERY,
};
use crate::table::TableName;

/// Expands the configured table patterns into concrete tables. A pattern is
/// `schema.table`, `schema.*` for every table of a schema, or `*` for every
/// table of every non-system schema.
pub struct TableFinder {
    querier: Arc<dyn Querier>,
}

impl TableFinder {
    pub fn new(querier: Arc<dyn Querier>) -> Self {
        Self { querier }
    }

    pub async fn find(&self, patterns: &[String]) -> Result<Vec<TableName>, QuerierError> {
        let mut tables = vec![];
        for pattern in patterns {
            match pattern.split_once('.') {
                None if pattern == "*" => {
                    for schema in self.all_schemas().await? {
                        tables.extend(self.schema_tables(&schema).await?);
                    }
                }
                None => tables.push(TableName {
                    schema: "public".to_string(),
                    name: pattern.clone(),
                }),
                Some((schema, "*")) => {
                    tables.extend(self.schema_tables(schema).await?);
                }
                Some((schema, name)) => tables.push(TableName {
                    schema: schema.to_string(),
                    name: name.to_string(),
                }),
            }
        }
        Ok(tables)
    }

    async fn all_schemas(&self) -> Result<Vec<String>, QuerierError> {
        let rows = self
            .querier
            .query(&Query::new(DISCOVER_ALL_SCHEMAS_QUERY))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| match row.values.first() {
                Some((_, CellValue::String(name))) => Some(name.clone()),
                _ => None,
            })
            .collect())
    }

    async fn schema_tables(&self, schema: &str) -> Result<Vec<TableName>, QuerierError> {
        let rows = self
            .querier
            .query(&Query::with_params(
                DISCOVER_SCHEMA_TABLES_QUERY,
                vec![CellValue::String(schema.to_string())],
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| match row.values.first() {
                Some((_, CellValue::String(name))) => Some(TableName {
                    schema: schema.to_string(),
                    name: name.clone(),
                }),
                _ => None,
            })
            .collect())
    }
}
