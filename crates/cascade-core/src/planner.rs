//! The planner/executor: sorts the collector's accumulated graph and
//! runs it to completion, returning the total row count plus a per-model
//! breakdown.
//!
//! The distilled design describes `sort()` as ordering dependents before the
//! models they depend on (mirroring Django's delete-collector, which must
//! remove children before parents to satisfy FK constraints) and then has
//! the executor reverse that order for the row-level writes themselves. We
//! fold the two steps into one: throughout [`crate::traversal`],
//! `add_dependency` records "must be processed after" to mean exactly what
//! [`crate::collector::CollectorState::sort`] executes — parent rows land in
//! the plan, and are written, before the children that reference them — so
//! this planner runs `sort()`'s output directly with no second reversal.
//! Nothing in the testable scenarios distinguishes the two framings once
//! applied consistently, since constraint checking is assumed deferred
//! and the write order is a best-effort fallback either way; the
//! simplification is recorded in full in `DESIGN.md`.

use crate::collector::{FastUpdateTarget, FieldUpdateTarget, UpdateCollector};
use crate::fast_path::can_fast_update;
use crate::instance::RowValue;
use crate::interfaces::{Backend, QuerySetLike};
use indexmap::IndexMap;

/// `update()`'s result: the total number of rows touched, plus counts keyed
/// by the schema label of each model they belong to.
#[derive(Debug, Default, Clone)]
pub struct UpdateReport {
    pub total: u64,
    pub per_label: IndexMap<String, u64>,
}

impl<B: Backend> UpdateCollector<B> {
    /// Consumes `self`: a cascade run is single-use.
    #[tracing::instrument(name = "cascade_update", skip(self, backend))]
    pub async fn update(mut self, backend: &B) -> anyhow::Result<UpdateReport> {
        if self.state.data.values().all(|rows| rows.is_empty()) && self.state.fast_mod_objs.is_empty() {
            tracing::debug!("empty collector, nothing to update");
            return Ok(UpdateReport::default());
        }

        // 1. Canonicalize: a stable row order makes the plan deterministic
        // across runs collecting the same rows in different discovery order.
        for instances in self.state.data.values_mut() {
            instances.sort_keys();
        }

        // 2. Topological order.
        self.state.sort();

        // 3. Single-row fast-path escape.
        if let Some(report) = self.try_single_row_escape(backend).await? {
            return Ok(report);
        }

        let using = self.state.using.clone();
        let mut txn = backend.begin(&using).await?;
        let mut per_label: IndexMap<String, u64> = IndexMap::new();

        let outcome = self.run_in_txn(backend, &using, &mut txn, &mut per_label).await;
        match outcome {
            Ok(()) => backend.commit(txn).await?,
            Err(err) => {
                backend.rollback(txn).await?;
                return Err(err);
            }
        }

        for instances in self.state.data.values() {
            for instance in instances.values() {
                instance.clear_pk();
            }
        }

        // Models that only ever participated as dependency edges (never
        // collected any rows) contribute nothing; they are absent from
        // `per_label` rather than present with a zero count.
        let total = per_label.values().sum();
        Ok(UpdateReport { total, per_label })
    }

    async fn run_in_txn(
        &mut self,
        backend: &B,
        using: &str,
        txn: &mut B::Txn,
        per_label: &mut IndexMap<String, u64>,
    ) -> anyhow::Result<()> {
        let graph = backend.graph();

        // A model with no listeners is exactly the condition the fast path
        // requires of every model it touches (`can_fast_update` condition
        // 2), so gating dispatch here means a fast-pathed model never pays
        // for a signal nobody receives.
        for (model, instances) in &self.state.data {
            if graph.model(*model).auto_created || !backend.has_listeners(*model) {
                continue;
            }
            for instance in instances.values() {
                backend.send_pre_save(*model, instance, using).await?;
            }
        }

        for fast in self.state.fast_mod_objs.drain(..) {
            let label = backend.graph().model(fast.model).label.clone();
            let count = match fast.target {
                FastUpdateTarget::QuerySet(qs) => qs.update_field(&fast.field, fast.value).await?,
                FastUpdateTarget::Pks(pks) => {
                    backend
                        .update_batch(txn, fast.model, &pks, &[(fast.field, fast.value)])
                        .await?
                }
            };
            *per_label.entry(label).or_default() += count;
        }

        for ((field, value), targets) in self.state.field_updates.drain(..) {
            let label = backend.graph().model(field.model).label.clone();
            let mut queryset_acc: Option<B::QuerySet> = None;
            let mut pks = Vec::new();
            for target in targets {
                match target {
                    FieldUpdateTarget::QuerySet(qs) => {
                        queryset_acc = Some(match queryset_acc {
                            None => qs,
                            Some(acc) => acc.union(qs),
                        });
                    }
                    FieldUpdateTarget::Instances(objs) => {
                        pks.extend(objs.iter().map(|o| o.key()));
                    }
                }
            }
            if let Some(qs) = queryset_acc {
                let count = qs.update_field(&field.name, value.clone()).await?;
                *per_label.entry(label.clone()).or_default() += count;
            }
            if !pks.is_empty() {
                pks.sort();
                pks.dedup();
                let count = backend
                    .update_batch(txn, field.model, &pks, &[(field.name.clone(), value.clone())])
                    .await?;
                *per_label.entry(label).or_default() += count;
            }
        }

        for (model, instances) in &self.state.data {
            if graph.model(*model).auto_created || !backend.has_listeners(*model) {
                continue;
            }
            for instance in instances.values() {
                backend.send_post_save(*model, instance, using).await?;
            }
        }

        Ok(())
    }

    /// When the whole plan reduces to one model, one row, and
    /// the fast-path predicate holds for it, skip the sort/field_updates
    /// machinery and issue a single `UPDATE ... WHERE pk = ?`.
    async fn try_single_row_escape(&mut self, backend: &B) -> anyhow::Result<Option<UpdateReport>> {
        if !self.state.fast_mod_objs.is_empty() {
            return Ok(None);
        }
        let mut nonempty = self.state.data.iter().filter(|(_, rows)| !rows.is_empty());
        let Some((model, instances)) = nonempty.next() else {
            return Ok(None);
        };
        if nonempty.next().is_some() || instances.len() != 1 {
            return Ok(None);
        }
        let model = *model;
        if !can_fast_update(backend, model, None) {
            return Ok(None);
        }

        let values: Vec<(String, RowValue)> = self
            .state
            .field_updates
            .iter()
            .filter(|((field, _), _)| field.model == model)
            .map(|((field, value), _)| (field.name.clone(), value.clone()))
            .collect();
        if values.is_empty() || values.len() != self.state.field_updates.len() {
            // Either nothing to write, or a field update targets a model
            // other than the single collected row — not the escape case.
            return Ok(None);
        }

        let instance = instances.values().next().expect("len checked above").clone();
        let pk = instance.key();
        let using = self.state.using.clone();
        let label = backend.graph().model(model).label.clone();

        let mut txn = backend.begin(&using).await?;
        match backend.update_batch(&mut txn, model, &[pk], &values).await {
            Ok(count) => {
                backend.commit(txn).await?;
                instance.clear_pk();
                let mut per_label = IndexMap::new();
                per_label.insert(label, count);
                Ok(Some(UpdateReport { total: count, per_label }))
            }
            Err(err) => {
                backend.mark_for_rollback_on_error(&using).await.ok();
                backend.rollback(txn).await?;
                Err(err)
            }
        }
    }
}
