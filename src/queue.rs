//! Durable retry queue and watermark persistence.
//!
//! The queue is a single-writer SQLite store opened through SeaORM.
//! Enqueueing is an upsert by external id: a newer failure replaces the
//! snapshot but keeps the attempt counter. Items beyond the size cap are
//! rejected, never evicted; an old item may be the only remaining record of
//! a failed write. The watermark lives next to the store as a one-line file
//! written with the temp-file-and-rename pattern.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::{error, info, warn};

use crate::db::{self, PoolSettings};
use crate::error::BridgeError;
use crate::models::dead_item::{ActiveModel as DeadItemActiveModel, Entity as DeadItems};
use crate::models::retry_item::{
    ActiveModel as RetryItemActiveModel, Column as RetryItemColumn, Entity as RetryItems,
    Model as RetryItemModel,
};
use crate::models::store_meta::{
    ActiveModel as StoreMetaActiveModel, Entity as StoreMeta, Model as StoreMetaModel,
};
use crate::transform::CanonicalRecord;

/// Version stamped into new stores. An unknown value on open means the file
/// was written by an incompatible build and is rejected rather than migrated
/// in place.
pub const STORE_SCHEMA_VERSION: &str = "1";

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// A queued record ready for another reconciliation attempt.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub external_id: String,
    pub record: CanonicalRecord,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: String,
}

#[derive(Debug)]
pub struct RetryQueue {
    db: DatabaseConnection,
    max_attempts: u32,
    max_size: u64,
    delays: Vec<Duration>,
}

impl RetryQueue {
    /// Open (or create) the store file, apply migrations, and verify the
    /// schema version.
    pub async fn open(
        path: &Path,
        max_attempts: u32,
        max_size: u64,
        delays: Vec<Duration>,
    ) -> Result<Self, BridgeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                BridgeError::StorageCorrupt(format!(
                    "cannot create state directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let db = db::init_pool(
            &url,
            &PoolSettings {
                max_connections: 1,
                ..PoolSettings::default()
            },
        )
        .await
        .map_err(|err| {
            BridgeError::StorageCorrupt(format!("cannot open queue store {}: {err}", path.display()))
        })?;
        Self::attach(db, max_attempts, max_size, delays).await
    }

    /// Wrap an already opened connection (tests use `sqlite::memory:`).
    pub async fn attach(
        db: DatabaseConnection,
        max_attempts: u32,
        max_size: u64,
        delays: Vec<Duration>,
    ) -> Result<Self, BridgeError> {
        Migrator::up(&db, None)
            .await
            .map_err(|err| BridgeError::StorageCorrupt(format!("store migration failed: {err}")))?;

        let version = StoreMeta::find_by_id(SCHEMA_VERSION_KEY)
            .one(&db)
            .await
            .map_err(store_err)?;
        match version {
            None => {
                StoreMetaActiveModel {
                    key: Set(SCHEMA_VERSION_KEY.to_string()),
                    value: Set(STORE_SCHEMA_VERSION.to_string()),
                }
                .insert(&db)
                .await
                .map_err(store_err)?;
            }
            Some(StoreMetaModel { value, .. }) if value == STORE_SCHEMA_VERSION => {}
            Some(StoreMetaModel { value, .. }) => {
                return Err(BridgeError::StorageCorrupt(format!(
                    "queue store has schema version {value}, expected {STORE_SCHEMA_VERSION}"
                )));
            }
        }

        Ok(Self {
            db,
            max_attempts,
            max_size,
            delays,
        })
    }

    fn delay_after(&self, attempt_count: u32) -> Duration {
        let idx = (attempt_count.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    /// Park a failed record. Returns `Ok(false)` when the queue is full and
    /// the record was rejected.
    pub async fn enqueue(
        &self,
        record: &CanonicalRecord,
        error: &BridgeError,
        now: DateTime<Utc>,
    ) -> Result<bool, BridgeError> {
        let existing = RetryItems::find_by_id(record.external_id.as_str())
            .one(&self.db)
            .await
            .map_err(store_err)?;

        let snapshot = serde_json::to_value(record)
            .map_err(|err| BridgeError::StorageCorrupt(format!("snapshot serialization: {err}")))?;

        match existing {
            Some(model) => {
                // Same id already parked: replace the snapshot, keep the
                // attempt counter and schedule.
                let mut active: RetryItemActiveModel = model.into();
                active.snapshot = Set(snapshot);
                active.last_error = Set(error.to_string());
                active.updated_at = Set(now);
                active.update(&self.db).await.map_err(store_err)?;
            }
            None => {
                if self.depth().await? >= self.max_size {
                    warn!(
                        external_id = %record.external_id,
                        max_size = self.max_size,
                        "retry queue full, rejecting enqueue"
                    );
                    metrics::counter!("queue_enqueue_rejected_total").increment(1);
                    return Ok(false);
                }
                RetryItemActiveModel {
                    external_id: Set(record.external_id.clone()),
                    snapshot: Set(snapshot),
                    enqueued_at: Set(now),
                    attempt_count: Set(1),
                    next_attempt_at: Set(now + self.delay_after(1)),
                    last_error: Set(error.to_string()),
                    updated_at: Set(now),
                }
                .insert(&self.db)
                .await
                .map_err(store_err)?;
                info!(external_id = %record.external_id, error = %error, "record enqueued for retry");
            }
        }
        Ok(true)
    }

    /// Items whose next attempt is due, in `next_attempt_at` order.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>, BridgeError> {
        let models = RetryItems::find()
            .filter(RetryItemColumn::NextAttemptAt.lte(now))
            .filter(RetryItemColumn::AttemptCount.lt(self.max_attempts as i32))
            .order_by_asc(RetryItemColumn::NextAttemptAt)
            .all(&self.db)
            .await
            .map_err(store_err)?;

        let mut items = Vec::with_capacity(models.len());
        for model in models {
            match Self::item_from_model(model) {
                Ok(item) => items.push(item),
                Err(err) => warn!(error = %err, "dropping undecodable queue item"),
            }
        }
        Ok(items)
    }

    fn item_from_model(model: RetryItemModel) -> Result<QueueItem, BridgeError> {
        let record: CanonicalRecord = serde_json::from_value(model.snapshot).map_err(|err| {
            BridgeError::StorageCorrupt(format!(
                "snapshot for {} undecodable: {err}",
                model.external_id
            ))
        })?;
        Ok(QueueItem {
            external_id: model.external_id,
            record,
            enqueued_at: model.enqueued_at,
            attempt_count: model.attempt_count as u32,
            next_attempt_at: model.next_attempt_at,
            last_error: model.last_error,
        })
    }

    /// Drop a record that made it into the CRM (or is otherwise settled).
    pub async fn mark_success(&self, external_id: &str) -> Result<(), BridgeError> {
        RetryItems::delete_by_id(external_id)
            .exec(&self.db)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// Record another failed attempt and push the schedule out by the next
    /// delay on the ladder.
    pub async fn mark_failure(
        &self,
        external_id: &str,
        error: &BridgeError,
        now: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        let Some(model) = RetryItems::find_by_id(external_id)
            .one(&self.db)
            .await
            .map_err(store_err)?
        else {
            warn!(external_id, "mark_failure on unknown queue item");
            return Ok(());
        };

        let attempts = model.attempt_count + 1;
        let mut active: RetryItemActiveModel = model.into();
        active.attempt_count = Set(attempts);
        active.next_attempt_at = Set(now + self.delay_after(attempts as u32));
        active.last_error = Set(error.to_string());
        active.updated_at = Set(now);
        active.update(&self.db).await.map_err(store_err)?;
        Ok(())
    }

    /// Move items that exhausted their attempts into the dead-letter table.
    /// Returns how many were parked.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64, BridgeError> {
        let exhausted = RetryItems::find()
            .filter(RetryItemColumn::AttemptCount.gte(self.max_attempts as i32))
            .all(&self.db)
            .await
            .map_err(store_err)?;

        let mut moved = 0;
        for model in exhausted {
            error!(
                external_id = %model.external_id,
                attempts = model.attempt_count,
                last_error = %model.last_error,
                "record exhausted its retries, moving to dead letters"
            );
            // Replace any earlier dead letter for the same id.
            DeadItems::delete_by_id(model.external_id.as_str())
                .exec(&self.db)
                .await
                .map_err(store_err)?;
            DeadItemActiveModel {
                external_id: Set(model.external_id.clone()),
                snapshot: Set(model.snapshot.clone()),
                attempt_count: Set(model.attempt_count),
                last_error: Set(model.last_error.clone()),
                failed_at: Set(now),
            }
            .insert(&self.db)
            .await
            .map_err(store_err)?;
            RetryItems::delete_by_id(model.external_id.as_str())
                .exec(&self.db)
                .await
                .map_err(store_err)?;
            moved += 1;
        }
        if moved > 0 {
            metrics::counter!("queue_dead_total").increment(moved);
        }
        Ok(moved)
    }

    /// Live queue depth.
    pub async fn depth(&self) -> Result<u64, BridgeError> {
        RetryItems::find().count(&self.db).await.map_err(store_err)
    }
}

fn store_err(err: sea_orm::DbErr) -> BridgeError {
    BridgeError::StorageCorrupt(format!("queue store: {err}"))
}

/// The watermark: a single RFC-3339 instant in its own file, replaced
/// atomically so an interrupted write can never leave a torn value.
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `Ok(None)` when no watermark has ever been persisted.
    pub fn load(&self) -> Result<Option<DateTime<Utc>>, BridgeError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let parsed = DateTime::parse_from_rfc3339(raw.trim()).map_err(|err| {
                    BridgeError::StorageCorrupt(format!(
                        "watermark file {} unreadable: {err}",
                        self.path.display()
                    ))
                })?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BridgeError::StorageCorrupt(format!(
                "watermark file {}: {err}",
                self.path.display()
            ))),
        }
    }

    pub fn save(&self, watermark: DateTime<Utc>) -> Result<(), BridgeError> {
        let io_err = |err: std::io::Error| {
            BridgeError::StorageCorrupt(format!(
                "watermark file {}: {err}",
                self.path.display()
            ))
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n", watermark.to_rfc3339())).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}
