use postgres_protocol::message::backend::RelationBody;
use tokio_postgres::types::Type;

use crate::table::{ColumnSchema, TableName, TableSchema};

// Column flag bit marking replica-identity membership.
const REPLICA_IDENTITY_FLAG: i8 = 1;

impl TryFrom<&RelationBody> for TableSchema {
    type Error = std::io::Error;

    fn try_from(relation: &RelationBody) -> Result<Self, Self::Error> {
        let schema = if relation.namespace()?.is_empty() {
            "pg_catalog".to_string()
        } else {
            relation.namespace()?.to_string()
        };

        let mut column_schemas = vec![];
        for c in relation.columns() {
            let type_id = c.type_id();
            let type_name = Type::from_oid(type_id as u32)
                .map(|t| t.name().to_string())
                .unwrap_or_else(|| type_id.to_string());
            column_schemas.push(ColumnSchema {
                name: c.name()?.to_string(),
                type_id,
                type_name,
                primary_key: c.flags() == REPLICA_IDENTITY_FLAG,
            });
        }

        Ok(TableSchema {
            table_name: TableName {
                schema,
                name: relation.name()?.to_string(),
            },
            table_id: relation.rel_id(),
            column_schemas,
        })
    }
}
