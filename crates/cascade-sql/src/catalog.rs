//! The piece `cascade_core::schema::SchemaGraph` deliberately leaves out:
//! which physical table and columns back each [`cascade_core::ModelId`].
//! `SchemaGraph` is the host application's already-resolved model metadata —
//! this crate never parses schema definitions itself; [`PgCatalog`]
//! is the thin additional map from that metadata to table/column names and
//! the Postgres type each column holds, which a concrete binding needs and a
//! pure-domain one has no reason to.

use cascade_core::{ModelId, SchemaGraph};
use std::collections::HashMap;

/// The handful of scalar Postgres types [`cascade_core::RowValue`] can carry.
/// Needed so a `NULL` bind picks the right typed `Option<T>::None` rather
/// than leaving Postgres to guess the parameter's type from an untyped NULL
/// (the classic "could not determine data type of parameter" error a
/// hand-rolled dynamic query layer runs into).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgColumnType {
    Int8,
    Text,
    Uuid,
    Bool,
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: PgColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: PgColumnType) -> Self {
        ColumnSpec { name: name.into(), ty }
    }
}

/// One model's physical shape: its table, its primary key column, and every
/// other column the planner may read or write.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub table: String,
    pub pk: ColumnSpec,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn new(table: impl Into<String>, pk: ColumnSpec, columns: Vec<ColumnSpec>) -> Self {
        TableSpec { table: table.into(), pk, columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        if self.pk.name == name {
            Some(&self.pk)
        } else {
            self.columns.iter().find(|c| c.name == name)
        }
    }

    /// Every column, pk first, for an unqualified `SELECT *`-style materialize.
    pub fn all_columns(&self) -> Vec<&ColumnSpec> {
        std::iter::once(&self.pk).chain(self.columns.iter()).collect()
    }
}

/// A private (polymorphic / generic-foreign-key) field's physical shape.
/// There is no separate join table — Django's `GenericRelation` dependents
/// carry `content_type_id` and `object_id` columns directly on their own
/// table, same as this: `table` is the *dependent* model's table (e.g.
/// `TaggedItem`, not `TagTarget`), and `object_id_column` points back at
/// whichever owning model's primary key `discriminator_for` resolves to.
#[derive(Debug, Clone)]
pub struct GfkSpec {
    pub dependent_model: ModelId,
    pub table: TableSpec,
    pub discriminator_column: ColumnSpec,
    pub object_id_column: ColumnSpec,
    /// The discriminator value identifying each concrete model as the
    /// owning side of this polymorphic relation.
    pub discriminator_for: HashMap<ModelId, i64>,
}

/// `SchemaGraph` plus the physical mapping `cascade-sql` needs on top of it.
pub struct PgCatalog {
    pub graph: SchemaGraph,
    tables: HashMap<ModelId, TableSpec>,
    gfks: HashMap<String, GfkSpec>,
}

impl PgCatalog {
    pub fn new(graph: SchemaGraph, tables: HashMap<ModelId, TableSpec>) -> Self {
        PgCatalog { graph, tables, gfks: HashMap::new() }
    }

    /// Registers the physical shape of a private field (keyed by its name,
    /// since [`cascade_core::PrivateField`] doesn't carry a `ModelId` of its
    /// own — the owning model is implicit in which model's `private_fields`
    /// list the caller found it on).
    pub fn with_gfk(mut self, private_field_name: impl Into<String>, spec: GfkSpec) -> Self {
        self.gfks.insert(private_field_name.into(), spec);
        self
    }

    pub fn table(&self, model: ModelId) -> anyhow::Result<&TableSpec> {
        self.tables
            .get(&model)
            .ok_or_else(|| anyhow::anyhow!("no table mapping registered for model {model:?}"))
    }

    pub fn gfk(&self, private_field_name: &str) -> anyhow::Result<&GfkSpec> {
        self.gfks
            .get(private_field_name)
            .ok_or_else(|| anyhow::anyhow!("no GFK mapping registered for private field {private_field_name:?}"))
    }
}
