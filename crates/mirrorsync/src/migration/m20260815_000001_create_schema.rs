//! Initial migration to create the mirrorsync database schema.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        self.create_sync_task(manager).await?;
        self.create_cache_record(manager).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CacheRecord::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncTask::Table).to_owned())
            .await?;
        Ok(())
    }
}

impl Migration {
    async fn create_sync_task(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncTask::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncTask::TaskId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncTask::Kind).string().not_null())
                    .col(ColumnDef::new(SyncTask::Status).string().not_null())
                    .col(ColumnDef::new(SyncTask::Target).string().not_null())
                    .col(ColumnDef::new(SyncTask::Snapshot).text().null())
                    .col(
                        ColumnDef::new(SyncTask::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncTask::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_task_status")
                    .table(SyncTask::Table)
                    .col(SyncTask::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_task_finished_at")
                    .table(SyncTask::Table)
                    .col(SyncTask::FinishedAt)
                    .to_owned(),
            )
            .await
    }

    async fn create_cache_record(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CacheRecord::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CacheRecord::Fingerprint)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CacheRecord::Source).string().not_null())
                    .col(ColumnDef::new(CacheRecord::Payload).text().not_null())
                    .col(
                        ColumnDef::new(CacheRecord::CachedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CacheRecord::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_cache_record_expires_at")
                    .table(CacheRecord::Table)
                    .col(CacheRecord::ExpiresAt)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum SyncTask {
    Table,
    TaskId,
    Kind,
    Status,
    Target,
    Snapshot,
    CreatedAt,
    FinishedAt,
}

#[derive(DeriveIden)]
enum CacheRecord {
    Table,
    Fingerprint,
    Source,
    Payload,
    CachedAt,
    ExpiresAt,
}
