use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::entities::store;
use crate::errors::ServiceError;
use crate::repositories::InventoryRepository;
use crate::services::distance::{Coordinates, DistanceCalculator};

/// A store that could ship units of a variant, with its suggested share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOption {
    pub store_id: i64,
    pub store_name: String,
    pub available_qty: i32,
    pub suggested_qty: i32,
    pub distance_km: Option<f64>,
}

/// Ranked sources for covering a shortage at one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSuggestion {
    pub product_variant_id: i64,
    pub target_store_id: i64,
    pub shortage: i32,
    pub coverable_quantity: i32,
    pub fully_coverable: bool,
    pub options: Vec<TransferOption>,
}

/// Input of the ranking: one source store with positive stock.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferCandidate {
    pub store_id: i64,
    pub store_name: String,
    pub available_qty: i32,
    pub coordinates: Option<Coordinates>,
}

/// Orders source stores for a transfer and spreads `needed` across them.
///
/// With target coordinates, located sources come first by distance (ties by
/// store id) and unlocated ones follow by quantity descending. Without target
/// coordinates every source is ordered by quantity descending, ties by store
/// id. Suggested quantities are assigned greedily in that order.
pub fn rank_transfer_options(
    target: Option<Coordinates>,
    candidates: Vec<TransferCandidate>,
    needed: i32,
    calculator: &DistanceCalculator,
) -> Vec<TransferOption> {
    let by_quantity = |a: &TransferCandidate, b: &TransferCandidate| {
        b.available_qty
            .cmp(&a.available_qty)
            .then(a.store_id.cmp(&b.store_id))
    };

    let mut ordered: Vec<(TransferCandidate, Option<f64>)> = match target {
        Some(origin) => {
            let (located, mut unlocated): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|c| c.coordinates.is_some());
            let points: Vec<(i64, Coordinates)> = located
                .iter()
                .filter_map(|c| c.coordinates.map(|coords| (c.store_id, coords)))
                .collect();
            let distances = calculator.distances_from(origin, &points);

            let mut located: Vec<(TransferCandidate, Option<f64>)> = located
                .into_iter()
                .map(|c| {
                    let distance = distances.get(&c.store_id).copied();
                    (c, distance)
                })
                .collect();
            located.sort_by(|(a, da), (b, db)| {
                da.unwrap_or(f64::MAX)
                    .partial_cmp(&db.unwrap_or(f64::MAX))
                    .unwrap_or(Ordering::Equal)
                    .then(a.store_id.cmp(&b.store_id))
            });
            unlocated.sort_by(by_quantity);
            located
                .into_iter()
                .chain(unlocated.into_iter().map(|c| (c, None)))
                .collect()
        }
        None => {
            let mut all = candidates;
            all.sort_by(by_quantity);
            all.into_iter().map(|c| (c, None)).collect()
        }
    };

    let mut remaining = needed.max(0);
    ordered
        .drain(..)
        .map(|(candidate, distance_km)| {
            let suggested = candidate.available_qty.max(0).min(remaining);
            remaining -= suggested;
            TransferOption {
                store_id: candidate.store_id,
                store_name: candidate.store_name,
                available_qty: candidate.available_qty,
                suggested_qty: suggested,
                distance_km,
            }
        })
        .collect()
}

/// Finds and ranks other stores able to cover a shortage.
#[derive(Debug, Clone)]
pub struct StockTransferService {
    db: Arc<DatabaseConnection>,
    repository: Arc<InventoryRepository>,
    calculator: DistanceCalculator,
}

impl StockTransferService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            repository: Arc::new(InventoryRepository::new(db.clone())),
            db,
            calculator: DistanceCalculator::new(),
        }
    }

    /// Active stores other than the target holding positive stock of the
    /// variant, ranked for a transfer of `needed_qty` units.
    #[instrument(skip(self))]
    pub async fn find_optimal_transfer_stores(
        &self,
        target_store_id: i64,
        variant_id: i64,
        needed_qty: i32,
    ) -> Result<Vec<TransferOption>, ServiceError> {
        if needed_qty <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "needed quantity must be greater than zero, got {}",
                needed_qty
            )));
        }

        let target = store::Entity::find_by_id(target_store_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::InvalidStore(target_store_id))?;

        let stock: HashMap<i64, i32> = self
            .repository
            .find_in_stock_for_variant(variant_id)
            .await?
            .into_iter()
            .filter(|row| row.store_id != target_store_id && row.quantity > 0)
            .map(|row| (row.store_id, row.quantity))
            .collect();
        if stock.is_empty() {
            debug!(variant_id, target_store_id, "No store holds stock for transfer");
            return Ok(Vec::new());
        }

        let stores = store::Entity::find()
            .filter(store::Column::Id.is_in(stock.keys().copied().collect::<Vec<_>>()))
            .filter(store::Column::IsActive.eq(true))
            .all(&*self.db)
            .await?;

        let candidates = stores
            .into_iter()
            .filter_map(|s| {
                stock.get(&s.id).map(|qty| TransferCandidate {
                    store_id: s.id,
                    coordinates: s.coordinates(),
                    store_name: s.name,
                    available_qty: *qty,
                })
            })
            .collect();

        let options =
            rank_transfer_options(target.coordinates(), candidates, needed_qty, &self.calculator);
        debug!(
            variant_id,
            target_store_id,
            candidates = options.len(),
            "Ranked transfer sources"
        );
        Ok(options)
    }

    /// Transfer plan for a shortage, with how much of it other stores can
    /// cover.
    pub async fn get_transfer_options_for_stock_suggestion(
        &self,
        variant_id: i64,
        target_store_id: i64,
        shortage: i32,
    ) -> Result<TransferSuggestion, ServiceError> {
        let options = self
            .find_optimal_transfer_stores(target_store_id, variant_id, shortage)
            .await?;
        let coverable_quantity: i32 = options.iter().map(|o| o.suggested_qty).sum();
        Ok(TransferSuggestion {
            product_variant_id: variant_id,
            target_store_id,
            shortage,
            coverable_quantity,
            fully_coverable: coverable_quantity >= shortage,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: i64, qty: i32, coords: Option<(f64, f64)>) -> TransferCandidate {
        TransferCandidate {
            store_id: id,
            store_name: format!("store-{}", id),
            available_qty: qty,
            coordinates: coords.and_then(|(lat, lon)| Coordinates::new(lat, lon)),
        }
    }

    #[test]
    fn nearest_store_ranks_first() {
        let target = Coordinates::new(40.7128, -74.0060);
        let options = rank_transfer_options(
            target,
            vec![
                candidate(1, 10, Some((34.0522, -118.2437))), // Los Angeles
                candidate(2, 10, Some((39.9526, -75.1652))),  // Philadelphia
            ],
            5,
            &DistanceCalculator::new(),
        );
        assert_eq!(options[0].store_id, 2);
        assert_eq!(options[0].suggested_qty, 5);
        assert_eq!(options[1].suggested_qty, 0);
        assert!(options[0].distance_km.unwrap() < options[1].distance_km.unwrap());
    }

    #[test]
    fn quantity_order_without_target_coordinates() {
        let options = rank_transfer_options(
            None,
            vec![candidate(1, 5, None), candidate(2, 20, Some((1.0, 1.0)))],
            8,
            &DistanceCalculator::new(),
        );
        let ids: Vec<i64> = options.iter().map(|o| o.store_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(options[0].suggested_qty, 8);
        assert!(options.iter().all(|o| o.distance_km.is_none()));
    }

    #[test]
    fn unlocated_sources_follow_located_ones() {
        let options = rank_transfer_options(
            Coordinates::new(0.0, 0.0),
            vec![candidate(1, 50, None), candidate(2, 3, Some((0.0, 1.0)))],
            10,
            &DistanceCalculator::new(),
        );
        assert_eq!(options[0].store_id, 2);
        assert_eq!(options[0].suggested_qty, 3);
        assert_eq!(options[1].suggested_qty, 7);
    }

    #[test]
    fn equal_distance_breaks_ties_by_store_id() {
        let options = rank_transfer_options(
            Coordinates::new(0.0, 0.0),
            vec![candidate(9, 1, Some((1.0, 0.0))), candidate(4, 1, Some((1.0, 0.0)))],
            2,
            &DistanceCalculator::new(),
        );
        assert_eq!(options[0].store_id, 4);
    }
}
