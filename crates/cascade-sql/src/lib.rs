//! Postgres binding of `cascade-core`'s capability traits.
//!
//! `cascade-core` is schema- and storage-agnostic by design; this crate is
//! the one concrete place that agnosticism gets resolved, the same
//! relationship `agent-sql` has to `agent`. A [`backend::PgBackend`] pairs a
//! [`sqlx::PgPool`] with a [`catalog::PgCatalog`] describing the physical
//! tables/columns behind a host application's [`cascade_core::SchemaGraph`],
//! and implements every trait `cascade_core::UpdateCollector::update` needs
//! to run an on-update cascade for real.

mod backend;
mod catalog;
mod config;
mod queryset;
mod types;

pub use backend::PgBackend;
pub use catalog::{ColumnSpec, GfkSpec, PgCatalog, PgColumnType, TableSpec};
pub use config::Config;
pub use queryset::PgQuerySet;
