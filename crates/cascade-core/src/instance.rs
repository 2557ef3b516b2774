//! The opaque row handle the planner accumulates and mutates. A real
//! application's ORM row (or a synthetic record built purely for this
//! planner) implements no trait here — [`Instance`] is the concrete shape
//! the planner speaks, since the cascade graph is schema-driven rather than
//! compile-time-typed (the set of fields on a "row" is only known once the
//! [`crate::schema::SchemaGraph`] is loaded).
//!
//! The collector holds instances by identity and nils their primary key
//! only after `update()` completes, so that a caller still holding the
//! instance can observe it going stale. We model that with an `Arc`-shared
//! interior so every clone of an `Instance` is the same logical row.

use crate::schema::ModelId;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A primary or unique key value. Deliberately small and `Ord` so sorting
/// each model's instance set by primary key is literal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowKey {
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

/// A field value, used both for the current contents of a row and for the
/// payload of a deferred field update (`SetNull`'s `Null`, `SetValue`'s
/// arbitrary value, a cascaded parent's new key, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RowValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

impl From<RowKey> for RowValue {
    fn from(key: RowKey) -> Self {
        match key {
            RowKey::Int(v) => RowValue::Int(v),
            RowKey::Text(v) => RowValue::Text(v),
            RowKey::Uuid(v) => RowValue::Uuid(v),
        }
    }
}

struct InstanceInner {
    model: ModelId,
    pk: Mutex<Option<RowKey>>,
    adding: bool,
    fields: Mutex<IndexMap<String, RowValue>>,
}

/// A handle to one row. Cloning is cheap and aliases the same underlying
/// row, matching the source's "weak reference by identity" semantics:
/// clearing the primary key on one handle is visible through every other
/// handle to the same row.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);

impl Instance {
    pub fn new(model: ModelId, pk: RowKey, adding: bool) -> Self {
        Instance::with_fields(model, pk, adding, IndexMap::new())
    }

    pub fn with_fields(
        model: ModelId,
        pk: RowKey,
        adding: bool,
        fields: IndexMap<String, RowValue>,
    ) -> Self {
        Instance(Arc::new(InstanceInner {
            model,
            pk: Mutex::new(Some(pk)),
            adding,
            fields: Mutex::new(fields),
        }))
    }

    pub fn model(&self) -> ModelId {
        self.0.model
    }

    /// `None` once `update()` has nilled this row's primary key.
    pub fn pk(&self) -> Option<RowKey> {
        self.0.pk.lock().unwrap().clone()
    }

    /// True iff this row has not yet been persisted (Django's `_state.adding`).
    /// Such rows have no persisted identity to cascade from and are skipped
    /// by `add(..., ignore_new_records=true)`.
    pub fn is_adding(&self) -> bool {
        self.0.adding
    }

    pub fn get(&self, field: &str) -> Option<RowValue> {
        self.0.fields.lock().unwrap().get(field).cloned()
    }

    pub fn set(&self, field: impl Into<String>, value: RowValue) {
        self.0.fields.lock().unwrap().insert(field.into(), value);
    }

    /// Reset the primary key to nil, signalling that any in-memory copy of
    /// this row's old identity is now stale. Called only after `update()`
    /// commits.
    pub fn clear_pk(&self) {
        *self.0.pk.lock().unwrap() = None;
    }

    /// Identity used for `HashMap`/`IndexMap` keys while the row is still
    /// live. Panics if called after `clear_pk` — the collector always
    /// captures this once, up front, before any mutation can occur.
    pub fn key(&self) -> RowKey {
        self.pk().expect("instance pk read after it was cleared")
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("model", &self.0.model)
            .field("pk", &*self.0.pk.lock().unwrap())
            .field("adding", &self.0.adding)
            .finish()
    }
}
