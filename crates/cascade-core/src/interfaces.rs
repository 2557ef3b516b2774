//! The capabilities the planner consumes from its host application.
//! Each trait here corresponds to one consumed capability:
//! schema metadata, signal dispatch, the SQL-compiling update path, queryset
//! composition, and transaction scoping. The planner is generic over a
//! single [`Backend`] bundling all of them, so one `UpdateCollector<B>` run
//! is pinned to one concrete backend for its whole (single-use) lifetime.
//!
//! Most methods here are written with `-> impl Future<...> + Send`
//! (return-position `impl Trait` in traits) rather than `async fn`, mirroring
//! how `agent`'s own composable hooks
//! (`agent::publications::commit::WithCommit`,
//! `agent::publications::initialize::Initialize`) are written — it keeps
//! these traits usable as plain generic bounds without boxing.
//!
//! [`QuerySetLike`] and [`PolicyHandler`] are the exceptions: the former is a
//! bound on `Backend::QuerySet`, a single concrete type per backend, so no
//! boxing is needed there either. `PolicyHandler` is the one place a
//! heterogeneous collection is unavoidable (`OnUpdateTag::Custom` handlers
//! are registered by id and looked up at runtime), so it follows
//! `agent::handlers::Handler`'s `#[async_trait] trait Handler: Send`
//! pattern instead.

use crate::instance::{Instance, RowKey, RowValue};
use crate::schema::{FieldRef, ModelId, PrivateField, SchemaGraph};
use std::future::Future;

/// Read-only access to the resolved schema graph.
pub trait SchemaView: Send + Sync {
    fn graph(&self) -> &SchemaGraph;
}

/// Signal dispatch, injected rather than reached through a process-wide
/// module, so the fast-path predicate's signal check is a pure query and
/// tests don't need a global registry.
pub trait SignalBus: Send + Sync {
    fn has_listeners(&self, model: ModelId) -> bool;

    fn send_pre_save(
        &self,
        model: ModelId,
        instance: &Instance,
        using: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn send_post_save(
        &self,
        model: ModelId,
        instance: &Instance,
        using: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// A `SignalBus` with no listeners and no-op dispatch, for backends that
/// don't wire up a real signal mechanism. Mirrors
/// `agent::publications::commit::NoopWithCommit`.
pub struct NoopSignalBus;

impl SignalBus for NoopSignalBus {
    fn has_listeners(&self, _model: ModelId) -> bool {
        false
    }

    async fn send_pre_save(&self, _model: ModelId, _instance: &Instance, _using: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_post_save(&self, _model: ModelId, _instance: &Instance, _using: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<'a, T: SignalBus> SignalBus for &'a T {
    fn has_listeners(&self, model: ModelId) -> bool {
        <T as SignalBus>::has_listeners(self, model)
    }

    fn send_pre_save(
        &self,
        model: ModelId,
        instance: &Instance,
        using: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        <T as SignalBus>::send_pre_save(self, model, instance, using)
    }

    fn send_post_save(
        &self,
        model: ModelId,
        instance: &Instance,
        using: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        <T as SignalBus>::send_post_save(self, model, instance, using)
    }
}

/// Combine two signal receivers (say, an audit log and a cache invalidator)
/// without an enum of hook kinds, the same composition idiom as
/// `agent::publications::commit::WithCommit for (A, B)`.
impl<A, B> SignalBus for (A, B)
where
    A: SignalBus,
    B: SignalBus,
{
    fn has_listeners(&self, model: ModelId) -> bool {
        self.0.has_listeners(model) || self.1.has_listeners(model)
    }

    async fn send_pre_save(&self, model: ModelId, instance: &Instance, using: &str) -> anyhow::Result<()> {
        self.0.send_pre_save(model, instance, using).await?;
        self.1.send_pre_save(model, instance, using).await?;
        Ok(())
    }

    async fn send_post_save(&self, model: ModelId, instance: &Instance, using: &str) -> anyhow::Result<()> {
        self.0.send_post_save(model, instance, using).await?;
        self.1.send_post_save(model, instance, using).await?;
        Ok(())
    }
}

/// `connections[using].ops.bulk_batch_size(field_names, objs)`.
pub trait ConnectionRegistry: Send + Sync {
    fn bulk_batch_size(&self, using: &str, field_names: &[String], obj_count: usize) -> usize;
}

/// A deferred bulk handle over a model's rows. `Backend::QuerySet` is the
/// single concrete implementation a given backend uses, so this trait never
/// needs to be object-safe.
pub trait QuerySetLike: Clone + Send + Sync {
    fn model(&self) -> ModelId;

    /// Analogous to `query._result_cache is not None`: true once this
    /// queryset-like has been materialized and should be treated as a plain
    /// instance collection rather than composed further.
    fn has_cached_results(&self) -> bool;

    /// Analogous to `query.select_related`.
    fn is_select_related(&self) -> bool;

    /// Restrict the selected columns to `fields`.
    fn only(&self, fields: &[String]) -> Self;

    /// Compose two queryset-likes over the same model under union (`|`).
    fn union(self, other: Self) -> Self;

    fn update_field(
        &self,
        field: &str,
        value: RowValue,
    ) -> impl Future<Output = anyhow::Result<u64>> + Send;
}

/// `transaction.atomic(using, savepoint=False)` as a scoped acquisition
/// guaranteeing commit-or-rollback on exit, plus the single-row fast-path's
/// `transaction.mark_for_rollback_on_error` marker.
pub trait TransactionManager: Send + Sync {
    type Txn: Send;

    fn begin(&self, using: &str) -> impl Future<Output = anyhow::Result<Self::Txn>> + Send;

    fn commit(&self, txn: Self::Txn) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Drops `txn` without committing. Backends built on `sqlx` can no-op
    /// here and rely on `sqlx::Transaction`'s rollback-on-drop; it is kept
    /// explicit so backends without that guarantee have a hook.
    fn rollback(&self, txn: Self::Txn) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// `transaction.mark_for_rollback_on_error(using)`: flags the connection
    /// so that an error surfacing after this point poisons whatever
    /// transaction is in effect, even the single-row fast-path escape which
    /// runs outside the planner's own multi-statement transaction.
    fn mark_for_rollback_on_error(&self, using: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// `sql.UpdateQuery(model).update_batch(...)`, plus the two read paths the
/// traversal needs: fetching dependents of a candidate relation, and
/// fetching the dependents of a polymorphic (generic-FK-like) private field.
pub trait QueryCompiler: Send + Sync {
    type Txn: Send;
    type QuerySet: QuerySetLike;

    fn update_batch(
        &self,
        txn: &mut Self::Txn,
        model: ModelId,
        pks: &[RowKey],
        values: &[(String, RowValue)],
    ) -> impl Future<Output = anyhow::Result<u64>> + Send;

    /// The rows of `related_model` whose `fields` (each an FK on
    /// `related_model`) reference any of `objs`.
    fn related_objects(
        &self,
        txn: &mut Self::Txn,
        related_model: ModelId,
        fields: &[String],
        objs: &[Instance],
    ) -> impl Future<Output = anyhow::Result<Self::QuerySet>> + Send;

    /// Fetch a queryset-like's rows as concrete instances. Only called for
    /// relations the traversal cannot resolve with a single batched
    /// statement — the fast path never materializes.
    fn materialize(
        &self,
        txn: &mut Self::Txn,
        qs: &Self::QuerySet,
    ) -> impl Future<Output = anyhow::Result<Vec<Instance>>> + Send;

    /// `field.bulk_related_objects(new_objs, using)` for a private
    /// (polymorphic) field.
    fn bulk_related_objects(
        &self,
        txn: &mut Self::Txn,
        field: &PrivateField,
        objs: &[Instance],
    ) -> impl Future<Output = anyhow::Result<Vec<Instance>>> + Send;
}

/// The capability bundle a single collector run is pinned to. Implemented
/// once per storage technology (`cascade-sql` provides the Postgres one);
/// `TransactionManager::Txn` and `QueryCompiler::Txn` are tied together so
/// the planner can thread one open transaction through both.
pub trait Backend:
    SchemaView
    + SignalBus
    + ConnectionRegistry
    + TransactionManager
    + QueryCompiler<Txn = <Self as TransactionManager>::Txn>
    + Send
    + Sync
{
}

impl<T> Backend for T where
    T: SchemaView
        + SignalBus
        + ConnectionRegistry
        + TransactionManager
        + QueryCompiler<Txn = <T as TransactionManager>::Txn>
        + Send
        + Sync
{
}

/// A custom on-update policy (`OnUpdateTag::Custom`). Mirrors
/// `agent::handlers::Handler`: `#[async_trait]` so heterogeneous
/// implementations can be stored behind `Arc<dyn PolicyHandler<B>>` and
/// looked up by [`crate::schema::HandlerId`] at traversal time.
#[async_trait::async_trait]
pub trait PolicyHandler<B: Backend>: Send + Sync {
    /// Invoked as `on_update(collector, field, sub_objs, using)`. Returning
    /// `Err` with protected rows aggregates into the traversal's
    /// `ProtectedError` the same way the built-in `Protect` policy does.
    async fn on_update(
        &self,
        collector: &mut crate::collector::UpdateCollector<B>,
        txn: &mut B::Txn,
        field: &FieldRef,
        sub_objs: Vec<Instance>,
        using: &str,
    ) -> Result<(), crate::error::ProtectedError>;

    /// Request invocation even when `sub_objs` is empty.
    fn lazy_sub_objs(&self) -> bool {
        false
    }
}
