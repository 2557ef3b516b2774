//! The recursive traversal that fills a [`CollectorState`] from a seed
//! set of instances: parent walk, candidate-relation walk, polymorphic
//! (generic-FK-like) walk, and the per-relation policy dispatch that may
//! recurse further.
//!
//! Nothing here says, at the type level, *which value* a `Cascade` policy
//! actually propagates to a dependent's foreign key. Read against the
//! framing "any foreign keys that reference the old value must be
//! reconciled," the only coherent reading is that cascading is always
//! anchored to one `(field, new_value)` assignment on the changing row(s) —
//! exactly the operation a caller performs via [`collect_update`]. We thread
//! that pair through the recursion as `propagate`, and a candidate relation
//! only participates when it targets the field currently changing; a
//! relation whose foreign key targets some *other*, unrelated field of the
//! same model is untouched by this update. See `DESIGN.md` for the full
//! rationale.

use crate::collector::{FastUpdate, FastUpdateTarget, UpdateCollector};
use crate::error::{CascadeError, ProtectedError};
use crate::fast_path::can_fast_update;
use crate::instance::{Instance, RowValue};
use crate::interfaces::{Backend, QuerySetLike};
use crate::schema::{Field, FieldRef, ModelId, OnUpdateTag};
use std::future::Future;
use std::pin::Pin;

/// Options threaded through a cascade run for knobs that are not implied by
/// the call site (`source`, `nullable`, and `reverse_dependency` are instead
/// derived by the traversal itself at each recursive step, from how the
/// parent/relation/GFK walks compute them).
#[derive(Clone, Copy, Debug)]
pub struct CollectOptions {
    /// Skip the multi-table-inheritance parent walk and any
    /// candidate relation whose model is one of `model`'s own parents.
    pub keep_parents: bool,
    /// Run restriction resolution and raise `RestrictedError`
    /// for anything not rescued by a concurrent cascade. `false` leaves
    /// `restricted_objects` populated for the caller to inspect instead.
    pub fail_on_restricted: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        CollectOptions {
            keep_parents: false,
            fail_on_restricted: true,
        }
    }
}

/// The field (on `model`, the model of the `objs` currently being collected)
/// and its new value — the thing actually being cascaded. `None` for
/// recursions that carry no value semantics of their own: the
/// multi-table-inheritance parent walk (ordering only) and the generic
/// foreign key walk (the host's own GFK resolution is assumed to hand back
/// already-correct dependents).
struct Propagate {
    field_name: String,
    value: RowValue,
}

/// Entry point: `objs.field = new_value` is the assignment that triggered
/// this cascade. Runs `collect` to completion, then — unless
/// `fail_on_restricted` is `false` — rescues restricted rows already
/// absorbed by a concurrent cascade path and
/// raises `RestrictedError` for whatever remains. Restriction resolution is
/// hoisted to this single outermost call rather than re-run at every
/// recursive `collect`, so that one diamond branch's `Restrict` policy
/// cannot raise before a sibling branch's `Cascade` has had a chance to
/// rescue the same rows (recursing it per-call would instead race the two
/// branches against each other).
#[tracing::instrument(skip(collector, backend, txn, objs), fields(count = objs.len()))]
pub async fn collect_update<B: Backend>(
    collector: &mut UpdateCollector<B>,
    backend: &B,
    txn: &mut B::Txn,
    objs: Vec<Instance>,
    field_name: impl Into<String>,
    new_value: RowValue,
    options: CollectOptions,
) -> Result<(), CascadeError> {
    let field_name = field_name.into();
    collect(
        collector,
        backend,
        txn,
        objs,
        None,
        Some(Propagate {
            field_name,
            value: new_value,
        }),
        options,
        true,
    )
    .await?;

    if options.fail_on_restricted {
        collector.state.clear_rescued_restrictions();
        let remaining = collector.state.remaining_restricted();
        if let Some((model, _, _)) = remaining.first().cloned() {
            let label = backend.graph().model(model).label.clone();
            let keys: Vec<String> = remaining
                .iter()
                .filter(|(m, _, _)| *m == model)
                .map(|(_, field, _)| format!("{}.{}", label, field))
                .collect();
            let objs: Vec<Instance> = remaining
                .into_iter()
                .filter(|(m, _, _)| *m == model)
                .flat_map(|(_, _, objs)| objs)
                .collect();
            return Err(CascadeError::Restricted(crate::error::RestrictedError::new(
                label, keys, objs,
            )));
        }
    }
    tracing::debug!("cascade traversal complete");
    Ok(())
}

/// Recursive step. Boxed because async fns cannot recurse directly. `objs`
/// must be non-empty and homogeneous over one model (callers guarantee
/// this — it mirrors `BaseCollector.collect`'s own precondition).
///
/// `top_level` is true only for the single call made directly by
/// [`collect_update`]. The top-level operand's own fast-path eligibility is
/// deliberately *not* resolved here — step (a) below only ever fires for a
/// recursive candidate-relation call, never for the seed — so that a seed
/// reducing to one model and one row reaches `data` and can be picked up by
/// the planner's single-row fast-path escape (spec §4.5 step 3) instead of
/// being diverted into `fast_mod_objs` before that check ever runs. A
/// multi-row top-level seed still ends up behind one batched `UPDATE`
/// either way: `can_fast_update` requires no signal listeners, so the
/// general path's per-field update (`UpdateCollector::update`) skips signal
/// dispatch for it and issues the same single `update_batch` call the fast
/// path would have.
fn collect<'a, B: Backend>(
    collector: &'a mut UpdateCollector<B>,
    backend: &'a B,
    txn: &'a mut B::Txn,
    objs: Vec<Instance>,
    from_field: Option<Field>,
    propagate: Option<Propagate>,
    options: CollectOptions,
    top_level: bool,
) -> Pin<Box<dyn Future<Output = Result<(), CascadeError>> + Send + 'a>> {
    Box::pin(async move {
        if objs.is_empty() {
            return Ok(());
        }
        let model = objs[0].model();
        let graph = backend.graph();

        // (a) Fast-path shortcut for a recursive candidate-relation call.
        // The top-level seed never takes this branch (see doc comment
        // above); every place that recurses into a relation's own
        // fast-path-eligible dependents does so directly (see the deferred
        // fast-update handling in the relation loop below) rather than
        // through this shortcut, so in practice this only re-confirms a
        // decision already made before recursing. Kept as a defensive
        // check rather than relied upon, since `new_objs` here is never
        // added to `data` — invariant 2 requires a row never be in both
        // `data` and a `fast_mod_objs` entry.
        if !top_level {
            if let Some(prop) = &propagate {
                if can_fast_update(backend, model, from_field.as_ref()) {
                    let pks: Vec<_> = objs
                        .iter()
                        .filter(|o| !o.is_adding())
                        .map(|o| o.key())
                        .collect();
                    if pks.is_empty() {
                        return Ok(());
                    }
                    collector.state.fast_mod_objs.push(FastUpdate {
                        model,
                        target: FastUpdateTarget::Pks(pks),
                        field: prop.field_name.clone(),
                        value: prop.value.clone(),
                    });
                    return Ok(());
                }
            }
        }

        // (b) Add instances. `kept` drops rows still in the "adding" state
        // (ignore_new_records) but, unlike `new_objs`, is not deduplicated
        // against rows already present in `data` — a row can be the target
        // of more than one independent field propagation reaching it by two
        // different paths through a cycle, and each such
        // assignment must still be scheduled even when the row itself was
        // first collected by an earlier leg. `new_objs` (the actual delta
        // `add` had not already seen) gates the recursive walk below: a
        // row's own relations only need walking once, the first time it is
        // collected, not once per incoming field propagation.
        let kept: Vec<Instance> = objs.into_iter().filter(|o| !o.is_adding()).collect();
        if kept.is_empty() {
            return Ok(());
        }
        if let Some(prop) = &propagate {
            collector.state.add_field_update(
                FieldRef::new(model, prop.field_name.clone()),
                prop.value.clone(),
                kept.clone(),
            );
        }
        let new_objs = collector.state.add(kept, true);
        if new_objs.is_empty() {
            return Ok(());
        }

        // (c) Parent walk: multi-table-inheritance ancestors share this
        // row's identity and must stay in sync, unless we arrived here
        // *through* that very parent link, or the caller asked to keep
        // parents untouched.
        if !options.keep_parents {
            let parents: Vec<(ModelId, String)> = graph
                .model(model)
                .parents
                .iter()
                .map(|(pid, link)| (*pid, link.field_name.clone()))
                .collect();
            for (parent_model, field_name) in parents {
                if from_field.as_ref().map(|f| f.name.as_str()) == Some(field_name.as_str()) {
                    continue;
                }
                let parent_objs: Vec<Instance> = new_objs
                    .iter()
                    .filter_map(|o| {
                        o.get(&field_name).and_then(|v| match v {
                            RowValue::Null => None,
                            other => Some(Instance::new(parent_model, row_key_of(&other)?, false)),
                        })
                    })
                    .collect();
                if parent_objs.is_empty() {
                    continue;
                }
                // `model` (the child) must be processed after `parent_model`,
                // so the parent row lands in the plan before its child.
                collector
                    .state
                    .add_dependency(backend, model, parent_model, false);
                collect(
                    collector,
                    backend,
                    txn,
                    parent_objs,
                    None,
                    None,
                    CollectOptions {
                        fail_on_restricted: false,
                        ..options
                    },
                    false,
                )
                .await?;
            }
        }

        // (d)/(e) Related-model walk. Only candidate relations that target
        // the field currently changing are in scope for this call — a
        // relation whose foreign key references some other field of `model`
        // is unaffected by this particular update.
        let Some(prop) = propagate else {
            return gfk_walk(collector, backend, txn, model, &new_objs).await;
        };

        let relations = graph.candidate_relations(model).to_vec();
        let mut protected: Vec<(String, Vec<Instance>)> = Vec::new();
        for rel in relations {
            if options.keep_parents
                && graph
                    .model(model)
                    .parents
                    .contains_key(&rel.related_model)
            {
                continue;
            }
            let Some(field) = graph.field(rel.related_model, &rel.field_name).cloned() else {
                continue;
            };
            let Some(remote) = field.remote.clone() else {
                continue;
            };
            if remote.target_field != prop.field_name {
                continue;
            }
            if remote.on_update == OnUpdateTag::DoNothing {
                continue;
            }
            let field_ref = FieldRef::new(rel.related_model, rel.field_name.clone());

            // Deferred fast path: only ever legal for `Cascade` — condition
            // 1 of `can_fast_update` requires exactly that when `from_field`
            // is given.
            if remote.on_update == OnUpdateTag::Cascade
                && can_fast_update(backend, rel.related_model, Some(&field))
            {
                let qs = related_objects_batched(
                    backend,
                    txn,
                    &collector.state.using.clone(),
                    rel.related_model,
                    &[rel.field_name.clone()],
                    &new_objs,
                )
                .await?;
                collector.state.fast_mod_objs.push(FastUpdate {
                    model: rel.related_model,
                    target: FastUpdateTarget::QuerySet(qs),
                    field: rel.field_name.clone(),
                    value: prop.value.clone(),
                });
                continue;
            }

            let qs = related_objects_batched(
                backend,
                txn,
                &collector.state.using.clone(),
                rel.related_model,
                &[rel.field_name.clone()],
                &new_objs,
            )
            .await?;
            let qs = if !qs.is_select_related() && !backend.has_listeners(rel.related_model) {
                qs.only(&future_relation_columns(graph, rel.related_model))
            } else {
                qs
            };
            let sub_objs = backend.materialize(txn, &qs).await?;

            let lazy = matches!(remote.on_update, OnUpdateTag::Custom)
                && remote
                    .custom_handler
                    .and_then(|id| collector.state.custom_handlers.get(&id))
                    .map(|h| h.lazy_sub_objs())
                    .unwrap_or(false);
            if sub_objs.is_empty() && !lazy {
                continue;
            }

            match remote.on_update {
                OnUpdateTag::Cascade => {
                    // The referencing row must land in the plan after the
                    // row whose value it is now adopting.
                    collector
                        .state
                        .add_dependency(backend, rel.related_model, model, false);
                    collect(
                        collector,
                        backend,
                        txn,
                        sub_objs,
                        Some(field.clone()),
                        Some(Propagate {
                            field_name: field_ref.name.clone(),
                            value: prop.value.clone(),
                        }),
                        options,
                        false,
                    )
                    .await?;
                }
                OnUpdateTag::DoNothing => unreachable!("filtered above"),
                OnUpdateTag::SetNull => {
                    collector
                        .state
                        .add_field_update(field_ref, RowValue::Null, sub_objs);
                }
                OnUpdateTag::SetDefault | OnUpdateTag::SetValue => {
                    let payload = remote.set_payload.clone().unwrap_or(RowValue::Null);
                    collector.state.add_field_update(field_ref, payload, sub_objs);
                }
                OnUpdateTag::Protect => {
                    let key = format!("{}.{}", graph.model(rel.related_model).label, field.name);
                    protected.push((key, sub_objs));
                }
                OnUpdateTag::Restrict => {
                    collector
                        .state
                        .add_dependency(backend, model, rel.related_model, true);
                    collector.state.add_restricted_objects(&field_ref, sub_objs);
                }
                OnUpdateTag::Custom => {
                    let Some(handler_id) = remote.custom_handler else {
                        continue;
                    };
                    let Some(handler) = collector.state.custom_handlers.get(&handler_id).cloned()
                    else {
                        continue;
                    };
                    let using = collector.state.using.clone();
                    if let Err(err) = handler
                        .on_update(collector, txn, &field_ref, sub_objs, &using)
                        .await
                    {
                        protected.push((
                            format!("{}.{}", graph.model(rel.related_model).label, field.name),
                            err.protected_objects,
                        ));
                    }
                }
            }
        }

        if !protected.is_empty() {
            let label = graph.model(model).label.clone();
            let keys: Vec<String> = protected.iter().map(|(k, _)| k.clone()).collect();
            let objs: Vec<Instance> = protected.into_iter().flat_map(|(_, o)| o).collect();
            return Err(CascadeError::Protected(ProtectedError::new(label, keys, objs)));
        }

        gfk_walk(collector, backend, txn, model, &new_objs).await
    })
}

/// (g) Polymorphic references: private fields exposing `bulk_related_objects`
/// always cascade (a generic relation has no on-update policy of its own).
async fn gfk_walk<B: Backend>(
    collector: &mut UpdateCollector<B>,
    backend: &B,
    txn: &mut B::Txn,
    model: ModelId,
    new_objs: &[Instance],
) -> Result<(), CascadeError> {
    let private_fields: Vec<_> = backend
        .graph()
        .model(model)
        .private_fields
        .iter()
        .filter(|f| f.has_bulk_related_objects)
        .cloned()
        .collect();
    for pf in private_fields {
        let sub_objs = backend.bulk_related_objects(txn, &pf, new_objs).await?;
        if sub_objs.is_empty() {
            continue;
        }
        collect(
            collector,
            backend,
            txn,
            sub_objs,
            None,
            None,
            CollectOptions {
                fail_on_restricted: false,
                ..CollectOptions::default()
            },
            false,
        )
        .await?;
    }
    Ok(())
}

/// Fetch dependents in batches sized to the connection's bulk parameter
/// limit, rather than one unbounded `IN (...)` per relation.
async fn related_objects_batched<B: Backend>(
    backend: &B,
    txn: &mut B::Txn,
    using: &str,
    related_model: ModelId,
    fields: &[String],
    new_objs: &[Instance],
) -> Result<B::QuerySet, CascadeError> {
    let batch_size = backend.bulk_batch_size(using, fields, new_objs.len()).max(1);
    let mut merged: Option<B::QuerySet> = None;
    for chunk in new_objs.chunks(batch_size) {
        let qs = backend
            .related_objects(txn, related_model, fields, chunk)
            .await?;
        merged = Some(match merged {
            None => qs,
            Some(acc) => acc.union(qs),
        });
    }
    // `new_objs` is checked non-empty by the caller (it returns
    // early otherwise), so at least one batch always runs.
    Ok(merged.expect("new_objs must be non-empty"))
}

/// The union of attnames of every foreign-related field in `related_model`'s
/// own candidate relations — the columns a further relation walk through
/// `related_model` would need, so an `only()` projection doesn't starve a
/// later traversal step.
fn future_relation_columns(graph: &crate::schema::SchemaGraph, related_model: ModelId) -> Vec<String> {
    let mut cols: Vec<String> = graph
        .candidate_relations(related_model)
        .iter()
        .filter_map(|rel| graph.field(rel.related_model, &rel.field_name))
        .filter_map(|f| f.remote.as_ref())
        .map(|r| r.target_field.clone())
        .collect();
    cols.sort();
    cols.dedup();
    cols
}

fn row_key_of(value: &RowValue) -> Option<crate::instance::RowKey> {
    match value {
        RowValue::Int(v) => Some(crate::instance::RowKey::Int(*v)),
        RowValue::Text(v) => Some(crate::instance::RowKey::Text(v.clone())),
        RowValue::Uuid(v) => Some(crate::instance::RowKey::Uuid(*v)),
        _ => None,
    }
}
