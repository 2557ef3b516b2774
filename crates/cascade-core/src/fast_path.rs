//! The fast-path predicate. Decides whether a model (or queryset-like
//! over it) can be reconciled with a single batched `UPDATE` instead of
//! instance-level handling. Consulted twice per traversal step: once on the
//! top-level operand, once per candidate related model.

use crate::interfaces::{Backend, SchemaView, SignalBus};
use crate::schema::{Field, ModelId, OnUpdateTag};

/// Returns `true` iff all of:
///
/// 1. if `from_field` is given, its own on-update policy is `Cascade`;
/// 2. the model has no `pre_save`/`post_save` listeners;
/// 3. every multi-table-inheritance parent link of the model is the very
///    field we arrived through (or there are no parents at all);
/// 4. every candidate reverse relation of the model is `DoNothing`;
/// 5. no private field on the model exposes `bulk_related_objects`.
///
/// ("Is the value identifiable as a model or queryset-like at all" is
/// enforced by this function's typed signature: callers can only ever pass
/// a real [`ModelId`], so that case is unrepresentable rather than checked
/// at runtime.)
pub fn can_fast_update<B: Backend>(backend: &B, model: ModelId, from_field: Option<&Field>) -> bool {
    if let Some(ff) = from_field {
        let policy = ff
            .remote
            .as_ref()
            .map(|r| r.on_update)
            .unwrap_or(OnUpdateTag::DoNothing);
        if policy != OnUpdateTag::Cascade {
            return false;
        }
    }

    if backend.has_listeners(model) {
        return false;
    }

    let graph = backend.graph();
    let meta = graph.model(model);

    // Every parent pointer must be the field we arrived through — otherwise
    // a bulk UPDATE here would skip cascading into (or out of) an ancestor
    // table that the general path would have visited.
    let parents_ok = meta.parents.values().all(|p| {
        from_field
            .map(|f| f.name == p.field_name)
            .unwrap_or(false)
    });
    if !parents_ok {
        return false;
    }

    let relations_ok = graph
        .candidate_relations(model)
        .iter()
        .all(|rel| {
            graph
                .field(rel.related_model, &rel.field_name)
                .and_then(|f| f.remote.as_ref())
                .map(|r| r.on_update == OnUpdateTag::DoNothing)
                .unwrap_or(true)
        });
    if !relations_ok {
        return false;
    }

    !graph.has_private_gfk(model)
}
