//! RetryItem entity model.
//!
//! One row per record whose sync failed, keyed by external id. The snapshot
//! column holds the serialized canonical record so a retry does not depend
//! on the source row still being readable.

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "retry_items")]
pub struct Model {
    /// External identifier of the failed record (primary key).
    #[sea_orm(primary_key, auto_increment = false)]
    pub external_id: String,

    /// Serialized canonical record at the time of the failure.
    #[sea_orm(column_type = "Json")]
    pub snapshot: JsonValue,

    /// When the record first entered the queue.
    pub enqueued_at: DateTimeUtc,

    /// Attempts consumed so far, the failed live attempt included.
    pub attempt_count: i32,

    /// Earliest instant the next attempt may run.
    pub next_attempt_at: DateTimeUtc,

    /// Message of the most recent failure.
    pub last_error: String,

    /// Timestamp of the last state change.
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
