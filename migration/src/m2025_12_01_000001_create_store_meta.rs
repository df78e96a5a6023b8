//! Migration to create the store_meta table.
//!
//! Key/value metadata about the store itself. The only well-known key is
//! `schema_version`; openers reject stores whose version they do not know.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(StoreMeta::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(StoreMeta::Key)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(StoreMeta::Value).text().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(StoreMeta::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum StoreMeta {
    Table,
    Key,
    Value,
}
