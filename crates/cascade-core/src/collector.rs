//! Collector state — the central mutable graph a cascade run accumulates
//! into — and the primitives (`add`, `add_dependency`, `add_field_update`,
//! `add_restricted_objects`) that `collect` builds on.

use crate::instance::{Instance, RowKey, RowValue};
use crate::interfaces::{Backend, QuerySetLike, SchemaView};
use crate::schema::{FieldRef, HandlerId, ModelId};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use std::sync::Arc;

/// One deferred assignment: `field = value` applied to every row in every
/// entry of `targets`, materialized during `update()`.
pub(crate) enum FieldUpdateTarget<Q> {
    QuerySet(Q),
    Instances(Vec<Instance>),
}

/// The operand of a fast-path update: either a queryset-like fetched while
/// walking a candidate relation, or a bare PK list when the fast path
/// applies to a set of already-materialized instances (the top-level
/// shortcut, and the top-level operand of a cascade).
pub(crate) enum FastUpdateTarget<Q> {
    QuerySet(Q),
    Pks(Vec<RowKey>),
}

/// An `UPDATE model SET field = value WHERE pk IN (...)` that can run
/// without per-instance signal dispatch, because [`crate::fast_path::can_fast_update`]
/// held for `model` at the point it was scheduled.
pub(crate) struct FastUpdate<Q> {
    pub model: ModelId,
    pub target: FastUpdateTarget<Q>,
    pub field: String,
    pub value: RowValue,
}

/// The single mutable owner of a cascade run's state. Single-use: built,
/// fed zero or more `collect` calls, consumed by exactly one `update` call.
pub struct CollectorState<B: Backend> {
    pub(crate) using: String,
    /// `data[m]` only ever holds instances whose class resolves to concrete
    /// model `m` (Invariant 1). Keyed by the row's primary key at the time
    /// it was collected, so membership tests don't require `Instance: Hash`.
    pub(crate) data: IndexMap<ModelId, IndexMap<RowKey, Instance>>,
    pub(crate) field_updates:
        IndexMap<(FieldRef, RowValue), Vec<FieldUpdateTarget<B::QuerySet>>>,
    pub(crate) restricted_objects: IndexMap<ModelId, IndexMap<String, Vec<Instance>>>,
    /// `dependencies[m]` = the concrete models `m` must be processed *after*
    /// (Invariant 3: concrete models only).
    pub(crate) dependencies: IndexMap<ModelId, IndexSet<ModelId>>,
    pub(crate) fast_mod_objs: Vec<FastUpdate<B::QuerySet>>,
    pub(crate) custom_handlers: HashMap<HandlerId, Arc<dyn crate::interfaces::PolicyHandler<B>>>,
}

impl<B: Backend> CollectorState<B> {
    pub fn new(using: impl Into<String>) -> Self {
        CollectorState {
            using: using.into(),
            data: IndexMap::new(),
            field_updates: IndexMap::new(),
            restricted_objects: IndexMap::new(),
            dependencies: IndexMap::new(),
            fast_mod_objs: Vec::new(),
            custom_handlers: HashMap::new(),
        }
    }

    pub fn register_handler(
        &mut self,
        id: HandlerId,
        handler: Arc<dyn crate::interfaces::PolicyHandler<B>>,
    ) {
        self.custom_handlers.insert(id, handler);
    }

    /// Add `objs` to the collection of rows to be reconciled. If
    /// `ignore_new_records`, rows still in the "adding" state (never
    /// persisted) are skipped — they have no persisted identity to cascade
    /// from. Returns the delta: the objects that were not already present.
    ///
    /// Dependency bookkeeping is a separate primitive ([`Self::add_dependency`]);
    /// callers that need an ordering edge alongside a batch of new rows call
    /// both explicitly rather than threading `source`/`reverse_dependency`
    /// through `add` itself, so the two concerns don't have to agree on a
    /// single flip convention.
    pub(crate) fn add(&mut self, objs: Vec<Instance>, ignore_new_records: bool) -> Vec<Instance> {
        if objs.is_empty() {
            return Vec::new();
        }
        let model = objs[0].model();
        let instances = self.data.entry(model).or_default();
        let mut new_objs = Vec::new();
        for obj in objs {
            let key = obj.key();
            if instances.contains_key(&key) {
                continue;
            }
            if ignore_new_records && obj.is_adding() {
                continue;
            }
            new_objs.push((key, obj));
        }
        let delta: Vec<Instance> = new_objs.iter().map(|(_, o)| o.clone()).collect();
        for (key, obj) in new_objs {
            self.data.entry(model).or_default().insert(key, obj);
        }
        delta
    }

    /// Records that `model` must be processed after `dependency` in the
    /// final plan — unless `reverse_dependency` is set, in which case it is
    /// `dependency` that must come after `model`. Also ensures `dependency`
    /// (post-flip) has an entry in `data`, even if empty, so a model that
    /// only ever shows up as a dependency edge still participates in
    /// [`Self::sort`].
    pub(crate) fn add_dependency(
        &mut self,
        backend: &B,
        model: ModelId,
        dependency: ModelId,
        reverse_dependency: bool,
    ) {
        let (model, dependency) = if reverse_dependency {
            (dependency, model)
        } else {
            (model, dependency)
        };
        let graph = backend.graph();
        self.dependencies
            .entry(graph.concrete_model(model))
            .or_default()
            .insert(graph.concrete_model(dependency));
        self.data.entry(dependency).or_default();
    }

    /// Schedule a field update. `objs` must be a homogeneous collection over
    /// one model (a queryset-like or a materialized instance list).
    pub fn add_field_update(&mut self, field: FieldRef, value: RowValue, objs: Vec<Instance>) {
        self.field_updates
            .entry((field, value))
            .or_default()
            .push(FieldUpdateTarget::Instances(objs));
    }

    pub fn add_field_update_queryset(
        &mut self,
        field: FieldRef,
        value: RowValue,
        qs: B::QuerySet,
    ) {
        self.field_updates
            .entry((field, value))
            .or_default()
            .push(FieldUpdateTarget::QuerySet(qs));
    }

    pub fn add_restricted_objects(&mut self, field: &FieldRef, objs: Vec<Instance>) {
        if objs.is_empty() {
            return;
        }
        let model = objs[0].model();
        self.restricted_objects
            .entry(model)
            .or_default()
            .entry(field.name.clone())
            .or_default()
            .extend(objs);
    }

    fn clear_restricted_objects_from_set(&mut self, model: ModelId, objs: &IndexSet<RowKey>) {
        if let Some(by_field) = self.restricted_objects.get_mut(&model) {
            for items in by_field.values_mut() {
                items.retain(|o| !objs.contains(&o.key()));
            }
        }
    }

    /// Subtract rows already collected by cascade from the
    /// restricted set — a `Restrict` path can be rescued by a concurrent
    /// `Cascade` path over the same rows.
    pub(crate) fn clear_rescued_restrictions(&mut self) {
        let collected: HashMap<ModelId, IndexSet<RowKey>> = self
            .data
            .iter()
            .map(|(m, instances)| (*m, instances.keys().cloned().collect()))
            .collect();
        for (model, keys) in &collected {
            self.clear_restricted_objects_from_set(*model, keys);
        }
        let fast: Vec<ModelId> = self.fast_mod_objs.iter().map(|u| u.model).collect();
        for model in fast {
            // A fast-path queryset has no materialized rows, so we cannot
            // subtract specific keys from it; Django instead re-filters the
            // queryset down to the restricted pks to know which ones still
            // match. We approximate by clearing the whole entry: any row in
            // `fast_mod_objs` is, by construction of the fast-path predicate,
            // one that will be reconciled by this same update.
            self.restricted_objects.shift_remove(&model);
        }
    }

    pub(crate) fn remaining_restricted(&self) -> Vec<(ModelId, String, Vec<Instance>)> {
        let mut out = Vec::new();
        for (model, by_field) in &self.restricted_objects {
            for (field, objs) in by_field {
                if !objs.is_empty() {
                    out.push((*model, field.clone(), objs.clone()));
                }
            }
        }
        out
    }

    /// Kahn's-algorithm topological sort over `dependencies`. Ties
    /// break by original insertion order. On a cycle, returns without
    /// reordering — the transaction is expected to defer constraints.
    pub(crate) fn sort(&mut self) {
        let models: Vec<ModelId> = self.data.keys().copied().collect();
        let mut sorted = Vec::with_capacity(models.len());
        let mut placed_concrete: IndexSet<ModelId> = IndexSet::new();
        let mut remaining = models.clone();

        while sorted.len() < models.len() {
            let mut found = false;
            let mut next_remaining = Vec::new();
            for model in remaining {
                if sorted.contains(&model) {
                    continue;
                }
                let ready = self
                    .dependencies
                    .get(&model)
                    .map(|deps| deps.iter().all(|d| placed_concrete.contains(d)))
                    .unwrap_or(true);
                if ready {
                    sorted.push(model);
                    placed_concrete.insert(model);
                    found = true;
                } else {
                    next_remaining.push(model);
                }
            }
            remaining = next_remaining;
            if !found {
                tracing::warn!(
                    unresolved = remaining.len(),
                    "on-update dependency cycle detected; leaving model order unchanged"
                );
                return;
            }
        }

        let mut new_data = IndexMap::with_capacity(self.data.len());
        for model in sorted {
            if let Some(instances) = self.data.shift_remove(&model) {
                new_data.insert(model, instances);
            }
        }
        self.data = new_data;
    }
}

/// Public entry point: owns a [`CollectorState`] plus the `using` alias and
/// `origin` passed to signals. See [`crate::traversal`] for `collect` and
/// [`crate::planner`] for `update`.
pub struct UpdateCollector<B: Backend> {
    pub(crate) state: CollectorState<B>,
    pub(crate) origin: Option<ModelId>,
}

impl<B: Backend> UpdateCollector<B> {
    pub fn new(using: impl Into<String>, origin: Option<ModelId>) -> Self {
        UpdateCollector {
            state: CollectorState::new(using),
            origin,
        }
    }

    pub fn register_handler(
        &mut self,
        id: HandlerId,
        handler: Arc<dyn crate::interfaces::PolicyHandler<B>>,
    ) {
        self.state.register_handler(id, handler);
    }

    pub fn add_field_update(&mut self, field: FieldRef, value: RowValue, objs: Vec<Instance>) {
        self.state.add_field_update(field, value, objs);
    }

    /// Schedule a field update over a queryset-like rather than a
    /// materialized instance list. Built-in policies never need this (their
    /// targets are either fast-pathed entirely or already materialized), but
    /// a custom [`crate::interfaces::PolicyHandler`] may have its own
    /// uncomputed queryset-like to compose under union at `update()` time.
    pub fn add_field_update_queryset(&mut self, field: FieldRef, value: RowValue, qs: B::QuerySet) {
        self.state.add_field_update_queryset(field, value, qs);
    }

    pub fn add_restricted_objects(&mut self, field: &FieldRef, objs: Vec<Instance>) {
        self.state.add_restricted_objects(field, objs);
    }

    pub fn using(&self) -> &str {
        &self.state.using
    }
}
