//! On-update cascade planner and executor for a relational object-mapping
//! layer. Consumes an already-resolved [`schema::SchemaGraph`] and a
//! host-supplied [`interfaces::Backend`]; never parses model declarations or
//! emits SQL text itself — both are the host application's problem.
//!
//! [`collector`] owns the central mutable graph a cascade run accumulates
//! into. [`traversal`] walks it from a seed set of changed rows. [`planner`]
//! sorts the result and executes it inside one transaction. [`fast_path`]
//! decides, at each step, whether instance-level handling can be skipped in
//! favor of one batched `UPDATE`.

pub mod collector;
pub mod error;
pub mod fast_path;
pub mod instance;
pub mod interfaces;
pub mod planner;
pub mod schema;
pub mod traversal;

pub use collector::UpdateCollector;
pub use error::{CascadeError, ProtectedError, RestrictedError};
pub use instance::{Instance, RowKey, RowValue};
pub use interfaces::{
    Backend, ConnectionRegistry, NoopSignalBus, PolicyHandler, QueryCompiler, QuerySetLike,
    SchemaView, SignalBus, TransactionManager,
};
pub use schema::{
    Field, FieldRef, HandlerId, ModelId, ModelMeta, OnUpdateTag, ParentLink, PrivateField,
    RelationDescriptor, RemoteField, SchemaGraph,
};
pub use traversal::{collect_update, CollectOptions};

#[cfg(test)]
mod tests;
