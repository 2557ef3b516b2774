//! Dynamic binding of [`cascade_core::RowValue`]/[`cascade_core::RowKey`] into
//! a runtime-built `sqlx::query`. Every other `agent-sql` query is
//! compile-time checked with `query!`/`query_as!`, which
//! can't apply here: the planner doesn't know which columns exist until a
//! [`crate::catalog::PgCatalog`] is loaded at runtime, so no schema DSL
//! parsing can happen at compile time. This module is the one place that
//! trade-off is paid, and it's paid once.

use crate::catalog::PgColumnType;
use cascade_core::{RowKey, RowValue};
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

/// Binds `value` onto `q` as `ty`, using a typed `Option<T>::None` for a
/// `Null` value so Postgres is never asked to infer a bare parameter's type.
pub fn bind_value<'q>(
    q: Query<'q, Postgres, PgArguments>,
    ty: PgColumnType,
    value: &'q RowValue,
) -> anyhow::Result<Query<'q, Postgres, PgArguments>> {
    Ok(match (ty, value) {
        (PgColumnType::Int8, RowValue::Int(v)) => q.bind(*v),
        (PgColumnType::Int8, RowValue::Null) => q.bind(None::<i64>),
        (PgColumnType::Text, RowValue::Text(v)) => q.bind(v.as_str()),
        (PgColumnType::Text, RowValue::Null) => q.bind(None::<&str>),
        (PgColumnType::Uuid, RowValue::Uuid(v)) => q.bind(*v),
        (PgColumnType::Uuid, RowValue::Null) => q.bind(None::<uuid::Uuid>),
        (PgColumnType::Bool, RowValue::Bool(v)) => q.bind(*v),
        (PgColumnType::Bool, RowValue::Null) => q.bind(None::<bool>),
        (ty, value) => {
            anyhow::bail!("value {value:?} is not assignable to a column of type {ty:?}")
        }
    })
}

/// Binds a whole column's worth of [`RowKey`]s as a typed array, for
/// `WHERE <pk> = ANY($n)`.
pub fn bind_keys<'q>(
    q: Query<'q, Postgres, PgArguments>,
    ty: PgColumnType,
    keys: &'q [RowKey],
) -> anyhow::Result<Query<'q, Postgres, PgArguments>> {
    Ok(match ty {
        PgColumnType::Int8 => {
            let values: anyhow::Result<Vec<i64>> = keys.iter().map(key_as_int).collect();
            q.bind(values?)
        }
        PgColumnType::Text => {
            let values: anyhow::Result<Vec<String>> = keys.iter().map(key_as_text).collect();
            q.bind(values?)
        }
        PgColumnType::Uuid => {
            let values: anyhow::Result<Vec<uuid::Uuid>> = keys.iter().map(key_as_uuid).collect();
            q.bind(values?)
        }
        PgColumnType::Bool => anyhow::bail!("a boolean column cannot be a primary key"),
    })
}

/// Binds a single column's worth of [`RowValue`]s as a typed array, for
/// `WHERE <fk> = ANY($n)` against a related table, used by the batched
/// `related_objects` lookup.
pub fn bind_values<'q>(
    q: Query<'q, Postgres, PgArguments>,
    ty: PgColumnType,
    values: &'q [RowValue],
) -> anyhow::Result<Query<'q, Postgres, PgArguments>> {
    Ok(match ty {
        PgColumnType::Int8 => {
            let values: anyhow::Result<Vec<i64>> = values.iter().map(value_as_int).collect();
            q.bind(values?)
        }
        PgColumnType::Text => {
            let values: anyhow::Result<Vec<String>> = values.iter().map(value_as_text).collect();
            q.bind(values?)
        }
        PgColumnType::Uuid => {
            let values: anyhow::Result<Vec<uuid::Uuid>> = values.iter().map(value_as_uuid).collect();
            q.bind(values?)
        }
        PgColumnType::Bool => anyhow::bail!("a boolean column cannot be a relation target"),
    })
}

fn key_as_int(k: &RowKey) -> anyhow::Result<i64> {
    match k {
        RowKey::Int(v) => Ok(*v),
        other => anyhow::bail!("expected an integer key, found {other:?}"),
    }
}

fn key_as_text(k: &RowKey) -> anyhow::Result<String> {
    match k {
        RowKey::Text(v) => Ok(v.clone()),
        other => anyhow::bail!("expected a text key, found {other:?}"),
    }
}

fn key_as_uuid(k: &RowKey) -> anyhow::Result<uuid::Uuid> {
    match k {
        RowKey::Uuid(v) => Ok(*v),
        other => anyhow::bail!("expected a uuid key, found {other:?}"),
    }
}

fn value_as_int(v: &RowValue) -> anyhow::Result<i64> {
    match v {
        RowValue::Int(v) => Ok(*v),
        other => anyhow::bail!("expected an integer value, found {other:?}"),
    }
}

fn value_as_text(v: &RowValue) -> anyhow::Result<String> {
    match v {
        RowValue::Text(v) => Ok(v.clone()),
        other => anyhow::bail!("expected a text value, found {other:?}"),
    }
}

fn value_as_uuid(v: &RowValue) -> anyhow::Result<uuid::Uuid> {
    match v {
        RowValue::Uuid(v) => Ok(*v),
        other => anyhow::bail!("expected a uuid value, found {other:?}"),
    }
}

/// Decodes column `name` of `row` (typed as `ty`) back into a [`RowValue`].
pub fn decode_value(row: &sqlx::postgres::PgRow, name: &str, ty: PgColumnType) -> anyhow::Result<RowValue> {
    use sqlx::Row;
    Ok(match ty {
        PgColumnType::Int8 => match row.try_get::<Option<i64>, _>(name)? {
            Some(v) => RowValue::Int(v),
            None => RowValue::Null,
        },
        PgColumnType::Text => match row.try_get::<Option<String>, _>(name)? {
            Some(v) => RowValue::Text(v),
            None => RowValue::Null,
        },
        PgColumnType::Uuid => match row.try_get::<Option<uuid::Uuid>, _>(name)? {
            Some(v) => RowValue::Uuid(v),
            None => RowValue::Null,
        },
        PgColumnType::Bool => match row.try_get::<Option<bool>, _>(name)? {
            Some(v) => RowValue::Bool(v),
            None => RowValue::Null,
        },
    })
}

/// Decodes column `name` of `row` (typed as `ty`) into a [`RowKey`]. Primary
/// keys are never actually `NULL` in Postgres, so this has no null arm.
pub fn decode_key(row: &sqlx::postgres::PgRow, name: &str, ty: PgColumnType) -> anyhow::Result<RowKey> {
    use sqlx::Row;
    Ok(match ty {
        PgColumnType::Int8 => RowKey::Int(row.try_get(name)?),
        PgColumnType::Text => RowKey::Text(row.try_get(name)?),
        PgColumnType::Uuid => RowKey::Uuid(row.try_get(name)?),
        PgColumnType::Bool => anyhow::bail!("a boolean column cannot be a primary key"),
    })
}
