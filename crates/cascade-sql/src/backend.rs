//! [`PgBackend`]: the concrete [`cascade_core::Backend`] this crate exists to
//! provide, in the spirit of `agent-sql` implementing the storage side of
//! traits that `agent` only consumes. Every method here trades the
//! compile-time-checked `query!`/`query_as!` macros the rest of this crate's
//! sibling examples use for runtime SQL built from a [`PgCatalog`] — the
//! planner's whole premise is that it doesn't know the schema until one is
//! loaded — schema DSL parsing and SQL text generation both live out here,
//! never inside `cascade-core` itself.

use crate::catalog::PgCatalog;
use crate::queryset::PgQuerySet;
use crate::types::{bind_keys, bind_value, decode_key, decode_value};
use cascade_core::{
    ConnectionRegistry, Instance, ModelId, NoopSignalBus, PrivateField, RowKey, RowValue,
    SchemaView, SignalBus,
};
use std::sync::Arc;

/// Bundles a Postgres connection pool with the physical-schema knowledge
/// `cascade-core`'s traits need filled in, plus a pluggable [`SignalBus`] so
/// callers can wire in real pre/post-save dispatch (an audit log, a cache
/// invalidator, ...) the same composable way `agent::publications` combines
/// `WithCommit` hooks — or leave it at [`NoopSignalBus`] when nothing needs
/// to observe the cascade.
pub struct PgBackend<S: SignalBus = NoopSignalBus> {
    pool: sqlx::PgPool,
    catalog: Arc<PgCatalog>,
    bulk_batch_size: usize,
    signals: S,
}

impl PgBackend<NoopSignalBus> {
    pub fn new(pool: sqlx::PgPool, catalog: PgCatalog, bulk_batch_size: usize) -> Self {
        PgBackend {
            pool,
            catalog: Arc::new(catalog),
            bulk_batch_size,
            signals: NoopSignalBus,
        }
    }
}

impl<S: SignalBus> PgBackend<S> {
    pub fn with_signals<S2: SignalBus>(self, signals: S2) -> PgBackend<S2> {
        PgBackend {
            pool: self.pool,
            catalog: self.catalog,
            bulk_batch_size: self.bulk_batch_size,
            signals,
        }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

impl<S: SignalBus> SchemaView for PgBackend<S> {
    fn graph(&self) -> &cascade_core::SchemaGraph {
        &self.catalog.graph
    }
}

impl<S: SignalBus> SignalBus for PgBackend<S> {
    fn has_listeners(&self, model: ModelId) -> bool {
        self.signals.has_listeners(model)
    }

    async fn send_pre_save(&self, model: ModelId, instance: &Instance, using: &str) -> anyhow::Result<()> {
        self.signals.send_pre_save(model, instance, using).await
    }

    async fn send_post_save(&self, model: ModelId, instance: &Instance, using: &str) -> anyhow::Result<()> {
        self.signals.send_post_save(model, instance, using).await
    }
}

impl<S: SignalBus> ConnectionRegistry for PgBackend<S> {
    fn bulk_batch_size(&self, _using: &str, _fields: &[String], _obj_count: usize) -> usize {
        self.bulk_batch_size
    }
}

impl<S: SignalBus> cascade_core::TransactionManager for PgBackend<S> {
    type Txn = sqlx::Transaction<'static, sqlx::Postgres>;

    #[tracing::instrument(skip(self))]
    async fn begin(&self, _using: &str) -> anyhow::Result<Self::Txn> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, txn: Self::Txn) -> anyhow::Result<()> {
        txn.commit().await?;
        Ok(())
    }

    /// `sqlx::Transaction` rolls back on drop, so there is nothing further
    /// to do here — kept explicit per the trait's own documented contract
    /// for backends without that guarantee.
    async fn rollback(&self, txn: Self::Txn) -> anyhow::Result<()> {
        drop(txn);
        Ok(())
    }

    /// Postgres has no separate "poison this connection" primitive outside
    /// an open transaction; the single-row fast-path escape already opens
    /// and closes its own transaction around one statement, so there is
    /// nothing further to mark.
    async fn mark_for_rollback_on_error(&self, _using: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<S: SignalBus> cascade_core::QueryCompiler for PgBackend<S> {
    type Txn = sqlx::Transaction<'static, sqlx::Postgres>;
    type QuerySet = PgQuerySet;

    #[tracing::instrument(skip(self, txn, values), fields(rows = pks.len()))]
    async fn update_batch(
        &self,
        txn: &mut Self::Txn,
        model: ModelId,
        pks: &[RowKey],
        values: &[(String, RowValue)],
    ) -> anyhow::Result<u64> {
        if pks.is_empty() || values.is_empty() {
            return Ok(0);
        }
        let table = self.catalog.table(model)?;

        let mut set_clauses = Vec::with_capacity(values.len());
        let mut columns = Vec::with_capacity(values.len());
        for (i, (field, _)) in values.iter().enumerate() {
            let column = table
                .column(field)
                .ok_or_else(|| anyhow::anyhow!("no column mapping for field {field:?} on table {:?}", table.table))?;
            set_clauses.push(format!("\"{}\" = ${}", column.name, i + 1));
            columns.push(column);
        }
        let pk_placeholder = values.len() + 1;
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ANY(${pk_placeholder})",
            table.table,
            set_clauses.join(", "),
            table.pk.name,
        );
        tracing::debug!(sql, "update_batch");

        let mut query = sqlx::query(&sql);
        for (column, (_, value)) in columns.iter().zip(values.iter()) {
            query = bind_value(query, column.ty, value)?;
        }
        query = bind_keys(query, table.pk.ty, pks)?;

        let result = query.execute(&mut **txn).await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self, _txn, objs), fields(objs = objs.len()))]
    async fn related_objects(
        &self,
        _txn: &mut Self::Txn,
        related_model: ModelId,
        fields: &[String],
        objs: &[Instance],
    ) -> anyhow::Result<PgQuerySet> {
        let table = Arc::new(self.catalog.table(related_model)?.clone());
        let field_name = &fields[0];
        let column = table
            .column(field_name)
            .ok_or_else(|| anyhow::anyhow!("no column mapping for field {field_name:?} on table {:?}", table.table))?
            .clone();

        // Mirrors a real `WHERE <field> = ANY($1)`: the value searched for
        // is whatever `field`'s own `to_field` names on the originating
        // model, which is not necessarily that row's own primary key (a
        // unique non-pk column can be the cascade target, same as Django's
        // `to_field`).
        let target_field = self
            .catalog
            .graph
            .field(related_model, field_name)
            .and_then(|f| f.remote.as_ref())
            .map(|r| r.target_field.clone());
        let values: Vec<RowValue> = objs
            .iter()
            .map(|o| match target_field.as_deref().and_then(|tf| o.get(tf)) {
                Some(v) => v,
                None => o.key().into(),
            })
            .collect();

        Ok(PgQuerySet::new(self.pool.clone(), related_model, table, column, values))
    }

    #[tracing::instrument(skip(self, txn, qs))]
    async fn materialize(&self, txn: &mut Self::Txn, qs: &PgQuerySet) -> anyhow::Result<Vec<Instance>> {
        let table = qs.table_spec();
        let select_list = match qs.only_columns() {
            Some(only) => {
                let mut cols: Vec<&str> = vec![table.pk.name.as_str()];
                cols.extend(only.iter().map(String::as_str));
                cols.into_iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ")
            }
            None => table.all_columns().iter().map(|c| format!("\"{}\"", c.name)).collect::<Vec<_>>().join(", "),
        };
        let _ = txn; // materialize runs its own statement against the pool (see PgQuerySet::select_rows).

        let rows = qs.select_rows(&self.pool, &select_list).await?;
        let model = qs.model();
        let column_types = table.all_columns();

        rows.iter()
            .map(|row| {
                let pk = decode_key(row, &table.pk.name, table.pk.ty)?;
                let mut fields = indexmap::IndexMap::new();
                for column in &column_types {
                    if column.name == table.pk.name {
                        continue;
                    }
                    if qs.only_columns().is_some_and(|only| !only.iter().any(|f| f == &column.name)) {
                        continue;
                    }
                    fields.insert(column.name.clone(), decode_value(row, &column.name, column.ty)?);
                }
                Ok(Instance::with_fields(model, pk, false, fields))
            })
            .collect()
    }

    #[tracing::instrument(skip(self, txn, objs), fields(objs = objs.len()))]
    async fn bulk_related_objects(
        &self,
        txn: &mut Self::Txn,
        field: &PrivateField,
        objs: &[Instance],
    ) -> anyhow::Result<Vec<Instance>> {
        let Some(owner) = objs.first().map(Instance::model) else {
            return Ok(Vec::new());
        };
        let gfk = self.catalog.gfk(&field.name)?;
        let discriminator = *gfk
            .discriminator_for
            .get(&owner)
            .ok_or_else(|| anyhow::anyhow!("no discriminator registered for model {owner:?} on gfk {:?}", field.name))?;

        let keys: Vec<RowKey> = objs.iter().map(Instance::key).collect();
        let select_list = gfk
            .table
            .all_columns()
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {select_list} FROM \"{table}\" WHERE \"{disc}\" = $1 AND \"{obj}\" = ANY($2)",
            table = gfk.table.table,
            disc = gfk.discriminator_column.name,
            obj = gfk.object_id_column.name,
        );

        let query = sqlx::query(&sql).bind(discriminator);
        let query = bind_keys(query, gfk.object_id_column.ty, &keys)?;
        let rows = query.fetch_all(&mut **txn).await?;

        rows.iter()
            .map(|row| {
                let pk = decode_key(row, &gfk.table.pk.name, gfk.table.pk.ty)?;
                let mut fields = indexmap::IndexMap::new();
                for column in gfk.table.all_columns() {
                    if column.name == gfk.table.pk.name {
                        continue;
                    }
                    fields.insert(column.name.clone(), decode_value(row, &column.name, column.ty)?);
                }
                Ok(Instance::with_fields(gfk.dependent_model, pk, false, fields))
            })
            .collect()
    }
}
