/// Oid of a relation as reported by the logical replication protocol.
pub type TableId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    /// Oid of the column's type. Resolved lazily against the type registry;
    /// unknown oids keep their raw representation downstream.
    pub type_id: i32,
    /// Declared type name as reported by the source, e.g. `int8` or `text`.
    pub type_name: String,
    /// Whether the column is part of the relation's replica identity.
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub table_id: TableId,
    pub table_name: TableName,
    pub column_schemas: Vec<ColumnSchema>,
}
