//! [`PgQuerySet`]: the one concrete [`cascade_core::QuerySetLike`] this crate
//! provides. It stays a lazy, composable description of a `WHERE` clause
//! until either `update_field` (the fast path) or `PgBackend::materialize`
//! (the general path) runs it — mirroring how a Django `QuerySet` builds up
//! a query without executing it until the moment it's consumed.

use crate::catalog::{ColumnSpec, TableSpec};
use crate::types::{bind_value, bind_values};
use cascade_core::{ModelId, RowValue};
use std::sync::Arc;

/// One `column = ANY(values)`-shaped clause. Several of these, accumulated
/// by repeated `union`, are OR'd together in the final `WHERE`.
#[derive(Clone)]
struct Clause {
    column: ColumnSpec,
    values: Vec<RowValue>,
}

#[derive(Clone)]
pub struct PgQuerySet {
    pool: sqlx::PgPool,
    model: ModelId,
    table: Arc<TableSpec>,
    clauses: Vec<Clause>,
    only_columns: Option<Vec<String>>,
}

impl PgQuerySet {
    pub(crate) fn new(
        pool: sqlx::PgPool,
        model: ModelId,
        table: Arc<TableSpec>,
        column: ColumnSpec,
        values: Vec<RowValue>,
    ) -> Self {
        PgQuerySet {
            pool,
            model,
            table,
            clauses: vec![Clause { column, values }],
            only_columns: None,
        }
    }

    pub(crate) fn table_spec(&self) -> &TableSpec {
        &self.table
    }

    pub(crate) fn only_columns(&self) -> Option<&[String]> {
        self.only_columns.as_deref()
    }

    /// `WHERE (col1 = ANY($k1)) OR (col2 = ANY($k2)) ...` starting at
    /// parameter index `placeholder_offset + 1`, plus the column/values
    /// pairs to bind, in the same order as the generated placeholders.
    fn where_clause(&self, placeholder_offset: usize) -> (String, Vec<(&ColumnSpec, &[RowValue])>) {
        let mut sql = String::new();
        let mut binds = Vec::with_capacity(self.clauses.len());
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            sql.push_str(&format!("\"{}\" = ANY(${})", clause.column.name, placeholder_offset + i + 1));
            binds.push((&clause.column, clause.values.as_slice()));
        }
        (sql, binds)
    }

    /// Runs `SELECT <select_list> FROM <table> WHERE <clauses>` against
    /// `pool` and returns the raw rows, for callers (like
    /// [`crate::backend::PgBackend::materialize`]) that need `SELECT` rather
    /// than `update_field`'s `UPDATE`. Executes here, rather than returning a
    /// half-built `Query`, so the dynamically formatted SQL string only has
    /// to live for the one `async` call that uses it.
    pub(crate) async fn select_rows(
        &self,
        pool: &sqlx::PgPool,
        select_list: &str,
    ) -> anyhow::Result<Vec<sqlx::postgres::PgRow>> {
        let (where_sql, binds) = self.where_clause(0);
        let sql = format!("SELECT {select_list} FROM \"{}\" WHERE {where_sql}", self.table.table);
        let mut query = sqlx::query(&sql);
        for (column, values) in binds {
            query = bind_values(query, column.ty, values)?;
        }
        Ok(query.fetch_all(pool).await?)
    }
}

impl cascade_core::QuerySetLike for PgQuerySet {
    fn model(&self) -> ModelId {
        self.model
    }

    fn has_cached_results(&self) -> bool {
        false
    }

    fn is_select_related(&self) -> bool {
        false
    }

    fn only(&self, fields: &[String]) -> Self {
        let mut qs = self.clone();
        qs.only_columns = Some(fields.to_vec());
        qs
    }

    fn union(self, other: Self) -> Self {
        debug_assert_eq!(self.model, other.model, "union across different models");
        let mut qs = self;
        qs.clauses.extend(other.clauses);
        qs.only_columns = None;
        qs
    }

    async fn update_field(&self, field: &str, value: RowValue) -> anyhow::Result<u64> {
        let column = self
            .table
            .column(field)
            .ok_or_else(|| anyhow::anyhow!("no column mapping for field {field:?} on table {:?}", self.table.table))?;

        let (where_sql, binds) = self.where_clause(1);
        let sql = format!("UPDATE \"{}\" SET \"{}\" = $1 WHERE {}", self.table.table, column.name, where_sql);

        let mut query = sqlx::query(&sql);
        query = bind_value(query, column.ty, &value)?;
        for (col, values) in binds {
            query = bind_values(query, col.ty, values)?;
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
