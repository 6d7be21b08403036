use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityName, EntityTrait, Iterable, PrimaryKeyToColumn, QueryFilter,
    QueryOrder, QuerySelect, Value,
};
use std::future::Future;
use tracing::debug;

use super::ordering::canonical_order;
use crate::errors::ServiceError;

fn primary_key_column<E: EntityTrait>() -> Result<E::Column, ServiceError> {
    E::PrimaryKey::iter()
        .next()
        .map(|key| key.into_column())
        .ok_or_else(|| {
            ServiceError::InternalError(format!(
                "entity {} has no primary key",
                E::default().table_name()
            ))
        })
}

/// Loads and row-locks (`SELECT ... FOR UPDATE`) the rows with the given
/// primary keys, in ascending key order, inside the caller's transaction.
/// Missing ids are simply absent from the result.
pub async fn lock_rows<E, C>(conn: &C, ids: &[i64]) -> Result<Vec<E::Model>, ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let sorted = canonical_order(ids);
    if sorted.is_empty() {
        return Ok(Vec::new());
    }

    let pk = primary_key_column::<E>()?;
    debug!(table = E::default().table_name(), ids = ?sorted, "Locking rows");
    let rows = E::find()
        .filter(pk.is_in(sorted))
        .order_by_asc(pk)
        .lock_exclusive()
        .all(conn)
        .await?;
    Ok(rows)
}

/// Locks the rows in canonical order and hands the locked set to `op`.
pub async fn with_pessimistic_lock<E, C, F, Fut, T>(
    conn: &C,
    ids: &[i64],
    op: F,
) -> Result<T, ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
    F: FnOnce(Vec<E::Model>) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let rows = lock_rows::<E, C>(conn, ids).await?;
    op(rows).await
}

/// Compare-and-swap update of a single row: applies `changes` only when every
/// `(column, value)` in `expected` still matches. Returns whether the row was
/// updated. Expected values must be non-null.
pub async fn conditional_update<E, C>(
    conn: &C,
    id: i64,
    expected: Vec<(E::Column, Value)>,
    changes: Vec<(E::Column, Value)>,
) -> Result<bool, ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    if changes.is_empty() {
        return Err(ServiceError::ValidationError(
            "conditional update without changes".to_string(),
        ));
    }

    let pk = primary_key_column::<E>()?;
    let mut update = E::update_many().filter(pk.eq(id));
    for (column, value) in expected {
        update = update.filter(column.eq(value));
    }
    for (column, value) in changes {
        update = update.col_expr(column, Expr::value(value));
    }

    let result = update.exec(conn).await?;
    Ok(result.rows_affected == 1)
}
