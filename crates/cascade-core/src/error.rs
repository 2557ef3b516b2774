//! `ProtectedError` and `RestrictedError` are the
//! only two error kinds the planner raises itself; everything else
//! (`IntegrityError`-equivalents, invalid model references) is surfaced by
//! propagating the host's own `anyhow::Error` upward.

use crate::instance::Instance;

/// Raised when a `Protect` policy reports rows that reference a row being
/// updated. Accumulated per `'Model.field'` across the relation loop in a
/// single `collect` call and raised once with the union of offending relations.
#[derive(Debug, thiserror::Error)]
#[error("cannot update some instances of model {model:?} because they are referenced through protected foreign keys: {keys}")]
pub struct ProtectedError {
    pub model: String,
    /// Formatted `'Model.field'` keys, comma-joined, purely for the message.
    pub keys: String,
    pub protected_objects: Vec<Instance>,
}

impl ProtectedError {
    pub fn new(model: impl Into<String>, keys: Vec<String>, protected_objects: Vec<Instance>) -> Self {
        ProtectedError {
            model: model.into(),
            keys: keys.join(", "),
            protected_objects,
        }
    }
}

/// Raised after traversal when `restricted_objects` still holds entries not
/// rescued by a concurrent cascade.
#[derive(Debug, thiserror::Error)]
#[error("cannot update some instances of model {model:?} because they are referenced through restricted foreign keys: {keys}")]
pub struct RestrictedError {
    pub model: String,
    pub keys: String,
    pub restricted_objects: Vec<Instance>,
}

impl RestrictedError {
    pub fn new(model: impl Into<String>, keys: Vec<String>, restricted_objects: Vec<Instance>) -> Self {
        RestrictedError {
            model: model.into(),
            keys: keys.join(", "),
            restricted_objects,
        }
    }
}

/// The planner's own error surface. Orchestration code above the planner is
/// expected to match on this where it cares (e.g. to render a 409 for a
/// protected update) and otherwise propagate it through `anyhow::Context`
/// like any other error, matching how `agent`'s per-module `Error` enums are
/// composed under `anyhow::Result` at the call site.
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    #[error(transparent)]
    Protected(#[from] ProtectedError),
    #[error(transparent)]
    Restricted(#[from] RestrictedError),
    #[error("invalid model reference {0:?}: expected the form 'app_label.ModelName'")]
    InvalidModelReference(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
