//! Migrations for the embedded retry-queue store.
//!
//! The store is a single SQLite file holding the durable retry queue, the
//! dead-letter table, and a metadata table carrying the schema version.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000001_create_store_meta;
mod m2025_12_01_000002_create_retry_items;
mod m2025_12_01_000003_create_dead_items;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_000001_create_store_meta::Migration),
            Box::new(m2025_12_01_000002_create_retry_items::Migration),
            Box::new(m2025_12_01_000003_create_dead_items::Migration),
        ]
    }
}
