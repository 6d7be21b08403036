use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "customers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub priority_tier: String,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Customer tier used by the priority allocation strategies, highest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PriorityTier {
    Vip,
    High,
    #[default]
    Normal,
}

impl PriorityTier {
    /// Rank where a lower value sorts first.
    pub fn rank(self) -> u8 {
        match self {
            PriorityTier::Vip => 0,
            PriorityTier::High => 1,
            PriorityTier::Normal => 2,
        }
    }

    /// Unknown tiers are treated as normal.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl Model {
    pub fn tier(&self) -> PriorityTier {
        PriorityTier::parse_lenient(&self.priority_tier)
    }
}
