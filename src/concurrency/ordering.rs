use std::collections::BTreeMap;
use std::future::Future;

use crate::errors::ServiceError;

/// Returns `ids` sorted ascending without duplicates: the canonical order in
/// which every multi-row lock in the crate is taken.
pub fn canonical_order(ids: &[i64]) -> Vec<i64> {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

/// Invokes `op` once per resource in ascending-id order and collects the
/// results keyed by id. The first error stops the walk.
pub async fn with_deadlock_prevention<F, Fut, T>(
    resource_ids: &[i64],
    mut op: F,
) -> Result<BTreeMap<i64, T>, ServiceError>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut results = BTreeMap::new();
    for id in canonical_order(resource_ids) {
        let value = op(id).await?;
        results.insert(id, value);
    }
    Ok(results)
}
