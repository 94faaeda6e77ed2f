//! Migration to create the tenant membership table.
//!
//! A membership row authorizes one principal to activate one tenant schema.

use sea_orm_migration::prelude::*;

use crate::m2024_01_01_000001_create_tenants::Tenants;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TenantMembers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TenantMembers::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TenantMembers::TenantId).integer().not_null())
                    .col(ColumnDef::new(TenantMembers::PrincipalId).uuid().not_null())
                    .col(
                        ColumnDef::new(TenantMembers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tenant_members_tenant_id")
                            .from(TenantMembers::Table, TenantMembers::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tenant_members_unique_pair")
                    .table(TenantMembers::Table)
                    .col(TenantMembers::TenantId)
                    .col(TenantMembers::PrincipalId)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tenant_members_principal_id")
                    .table(TenantMembers::Table)
                    .col(TenantMembers::PrincipalId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TenantMembers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TenantMembers {
    Table,
    Id,
    TenantId,
    PrincipalId,
    CreatedAt,
}
