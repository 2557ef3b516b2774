//! Read-only view over model metadata: fields, parents, relations, private
//! (polymorphic) fields, and concrete model resolution. The planner never
//! mutates a [`SchemaGraph`]; it is built once by the embedding application
//! from its own model declarations and handed to the collector by reference.

use indexmap::IndexMap;
use std::collections::HashMap;

/// Opaque identity of a schema node. Two models compare equal iff their
/// concrete models do — see [`SchemaGraph::concrete_model`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelId(pub u32);

/// Identifies a registered [`crate::interfaces::PolicyHandler`] implementation
/// for an `OnUpdateTag::Custom` field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u32);

/// The on-update policy tag carried by a [`RemoteField`]. `SetDefault` and
/// `SetValue` carry their payload out-of-band in `RemoteField::set_payload`
/// rather than as enum fields, so that `RemoteField` stays `Copy`-friendly
/// metadata and the payload can be looked up only when needed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OnUpdateTag {
    Cascade,
    DoNothing,
    Protect,
    Restrict,
    SetNull,
    SetDefault,
    SetValue,
    Custom,
}

/// A reference to a field scoped to the model that declares it. Used as a
/// map key for field updates and restricted-object bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub model: ModelId,
    pub name: String,
}

impl FieldRef {
    pub fn new(model: ModelId, name: impl Into<String>) -> Self {
        FieldRef {
            model,
            name: name.into(),
        }
    }
}

/// The remote-field descriptor carried by a relational [`Field`]: the target
/// model/field, the on-update policy, nullability, and the flags that
/// classify the *reverse* relation this field induces on its target model
/// (`auto_created`, `concrete`, `one_to_one`, `one_to_many`, `hidden` — the
/// relation-iterator classification below). A forward FK field and the reverse relation it
/// induces are always a 1:1 pair here, so we fold the reverse relation's
/// classification into the forward field rather than modeling it as a
/// separate graph edge.
#[derive(Clone, Debug)]
pub struct RemoteField {
    pub target_model: ModelId,
    pub target_field: String,
    pub on_update: OnUpdateTag,
    pub nullable: bool,
    pub lazy_sub_objs: bool,
    /// Payload for `SetDefault` / `SetValue`.
    pub set_payload: Option<crate::instance::RowValue>,
    /// Populated only when `on_update == Custom`.
    pub custom_handler: Option<HandlerId>,
    pub auto_created: bool,
    pub concrete: bool,
    pub one_to_one: bool,
    pub one_to_many: bool,
    pub hidden: bool,
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub remote: Option<RemoteField>,
}

impl Field {
    pub fn local(name: impl Into<String>) -> Self {
        Field {
            name: name.into(),
            remote: None,
        }
    }
}

/// A private field not mapped to a concrete column — a generic foreign key.
/// `has_bulk_related_objects` mirrors the presence of the `bulk_related_objects`
/// capability in the source design; concretely it means the embedding
/// application can produce the dependents of this field through
/// [`crate::interfaces::QueryCompiler::bulk_related_objects`].
#[derive(Clone, Debug)]
pub struct PrivateField {
    pub name: String,
    pub has_bulk_related_objects: bool,
}

/// One multi-table-inheritance parent pointer: the name of the field on the
/// child model that holds the parent's row.
#[derive(Clone, Debug)]
pub struct ParentLink {
    pub field_name: String,
}

#[derive(Clone, Debug)]
pub struct ModelMeta {
    pub label: String,
    /// Self, unless this model is a proxy — in which case this points at the
    /// non-proxy ancestor that actually owns a database table.
    pub concrete: ModelId,
    /// Ordered so dependency resolution and parent-walk order are
    /// deterministic.
    pub parents: IndexMap<ModelId, ParentLink>,
    pub fields: Vec<Field>,
    pub private_fields: Vec<PrivateField>,
    pub auto_created: bool,
}

/// A candidate reverse relation: an auto-created, non-concrete, N-1 or 1-1
/// relation eligible for cascade consideration. `related_model` is the
/// model that owns `field_name`, i.e. the model whose rows must be
/// reconciled when the model this descriptor was enumerated for changes key.
#[derive(Clone, Debug)]
pub struct RelationDescriptor {
    pub related_model: ModelId,
    pub field_name: String,
}

/// The resolved schema graph. Construction precomputes the reverse-relation
/// index once so that the relation iterator and the fast-path
/// predicate, both called repeatedly during traversal, are O(1)
/// lookups rather than O(models × fields) scans.
pub struct SchemaGraph {
    models: Vec<ModelMeta>,
    candidate_index: HashMap<ModelId, Vec<RelationDescriptor>>,
    by_label: HashMap<String, ModelId>,
}

impl SchemaGraph {
    pub fn new(models: Vec<ModelMeta>) -> Self {
        let mut candidate_index: HashMap<ModelId, Vec<RelationDescriptor>> = HashMap::new();
        let by_label: HashMap<String, ModelId> = models
            .iter()
            .enumerate()
            .map(|(idx, meta)| (meta.label.clone(), ModelId(idx as u32)))
            .collect();
        for (idx, meta) in models.iter().enumerate() {
            let owner = ModelId(idx as u32);
            for field in &meta.fields {
                let Some(remote) = &field.remote else {
                    continue;
                };
                // Candidate relations are the N-1 and 1-1 reverse relations;
                // many-to-many is out of scope (handled elsewhere).
                if remote.auto_created
                    && !remote.concrete
                    && (remote.one_to_one || remote.one_to_many)
                {
                    candidate_index
                        .entry(remote.target_model)
                        .or_default()
                        .push(RelationDescriptor {
                            related_model: owner,
                            field_name: field.name.clone(),
                        });
                }
            }
        }
        SchemaGraph {
            models,
            candidate_index,
            by_label,
        }
    }

    /// Resolves a `"app_label.ModelName"` label string to its [`ModelId`].
    /// A label that doesn't split into exactly two dot-separated, non-empty
    /// parts is malformed input rather than merely unregistered, so it is
    /// rejected before the lookup rather than falling through to "not found".
    pub fn resolve_label(&self, label: &str) -> Result<ModelId, crate::error::CascadeError> {
        let mut parts = label.splitn(2, '.');
        match (parts.next(), parts.next()) {
            (Some(app), Some(name)) if !app.is_empty() && !name.is_empty() => {}
            _ => return Err(crate::error::CascadeError::InvalidModelReference(label.to_string())),
        }
        self.by_label
            .get(label)
            .copied()
            .ok_or_else(|| crate::error::CascadeError::InvalidModelReference(label.to_string()))
    }

    pub fn model(&self, id: ModelId) -> &ModelMeta {
        &self.models[id.0 as usize]
    }

    pub fn field(&self, model: ModelId, name: &str) -> Option<&Field> {
        self.model(model).fields.iter().find(|f| f.name == name)
    }

    /// Follows proxy chains to the concrete (table-owning) model.
    pub fn concrete_model(&self, id: ModelId) -> ModelId {
        self.model(id).concrete
    }

    /// Enumerates the candidate reverse relations of `model`. Hidden
    /// fields are included, matching `get_fields(include_hidden=True)`.
    pub fn candidate_relations(&self, model: ModelId) -> &[RelationDescriptor] {
        self.candidate_index
            .get(&model)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_private_gfk(&self, model: ModelId) -> bool {
        self.model(model)
            .private_fields
            .iter()
            .any(|f| f.has_bulk_related_objects)
    }
}
