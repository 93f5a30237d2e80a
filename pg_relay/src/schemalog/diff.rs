//! Structural diff between two adjacent versions of one schema.
//!
//! Tables are matched by relation oid and columns by their immutable id, so
//! a rename shows up as a change instead of a drop-and-create. Output order
//! is stable: lexicographic by table name, then by column name.

use super::{Column, SchemaView, Table};

#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange<T> {
    pub old: T,
    pub new: T,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Diff {
    pub tables_added: Vec<Table>,
    pub tables_removed: Vec<Table>,
    pub tables_changed: Vec<TableDiff>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.tables_added.is_empty()
            && self.tables_removed.is_empty()
            && self.tables_changed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableDiff {
    /// Current (new) name of the table.
    pub table_name: String,
    pub table_name_change: Option<ValueChange<String>>,
    pub columns_added: Vec<Column>,
    pub columns_removed: Vec<Column>,
    pub columns_changed: Vec<ColumnDiff>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.table_name_change.is_none()
            && self.columns_added.is_empty()
            && self.columns_removed.is_empty()
            && self.columns_changed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColumnDiff {
    /// Current (new) name of the column.
    pub column_name: String,
    pub name_change: Option<ValueChange<String>>,
    pub type_change: Option<ValueChange<String>>,
    pub null_change: Option<ValueChange<bool>>,
    pub default_change: Option<ValueChange<Option<String>>>,
}

impl ColumnDiff {
    pub fn is_empty(&self) -> bool {
        self.name_change.is_none()
            && self.type_change.is_none()
            && self.null_change.is_none()
            && self.default_change.is_none()
    }
}

pub fn compute_schema_diff(old: &SchemaView, new: &SchemaView) -> Diff {
    let mut diff = Diff::default();

    for table in &new.tables {
        match old.table_by_oid(&table.oid) {
            None => diff.tables_added.push(table.clone()),
            Some(old_table) => {
                let table_diff = compute_table_diff(old_table, table);
                if !table_diff.is_empty() {
                    diff.tables_changed.push(table_diff);
                }
            }
        }
    }

    for table in &old.tables {
        if new.table_by_oid(&table.oid).is_none() {
            diff.tables_removed.push(table.clone());
        }
    }

    diff.tables_added.sort_by(|a, b| a.name.cmp(&b.name));
    diff.tables_removed.sort_by(|a, b| a.name.cmp(&b.name));
    diff.tables_changed
        .sort_by(|a, b| a.table_name.cmp(&b.table_name));

    diff
}

fn compute_table_diff(old: &Table, new: &Table) -> TableDiff {
    let mut table_diff = TableDiff {
        table_name: new.name.clone(),
        ..Default::default()
    };

    if old.name != new.name {
        table_diff.table_name_change = Some(ValueChange {
            old: old.name.clone(),
            new: new.name.clone(),
        });
    }

    for column in &new.columns {
        match old.column_by_id(&column.id) {
            None => table_diff.columns_added.push(column.clone()),
            Some(old_column) => {
                let column_diff = compute_column_diff(old_column, column);
                if !column_diff.is_empty() {
                    table_diff.columns_changed.push(column_diff);
                }
            }
        }
    }

    for column in &old.columns {
        if new.column_by_id(&column.id).is_none() {
            table_diff.columns_removed.push(column.clone());
        }
    }

    table_diff.columns_added.sort_by(|a, b| a.name.cmp(&b.name));
    table_diff
        .columns_removed
        .sort_by(|a, b| a.name.cmp(&b.name));
    table_diff
        .columns_changed
        .sort_by(|a, b| a.column_name.cmp(&b.column_name));

    table_diff
}

fn compute_column_diff(old: &Column, new: &Column) -> ColumnDiff {
    let mut column_diff = ColumnDiff {
        column_name: new.name.clone(),
        ..Default::default()
    };

    if old.name != new.name {
        column_diff.name_change = Some(ValueChange {
            old: old.name.clone(),
            new: new.name.clone(),
        });
    }
    if old.data_type != new.data_type {
        column_diff.type_change = Some(ValueChange {
            old: old.data_type.clone(),
            new: new.data_type.clone(),
        });
    }
    if old.nullable != new.nullable {
        column_diff.null_change = Some(ValueChange {
            old: old.nullable,
            new: new.nullable,
        });
    }
    if old.default_value != new.default_value {
        column_diff.default_change = Some(ValueChange {
            old: old.default_value.clone(),
            new: new.default_value.clone(),
        });
    }

    column_diff
}
