//! DeadItem entity model: records that exhausted their retry budget.

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "dead_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub external_id: String,

    #[sea_orm(column_type = "Json")]
    pub snapshot: JsonValue,

    pub attempt_count: i32,

    pub last_error: String,

    /// When the item was declared dead.
    pub failed_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
