//! Tenant entity model
//!
//! One row per tenant. `schema_name` names the tenant's namespace and is
//! immutable once the row exists.

use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::Serialize;

/// Message carried by the `DbErr::Custom` raised when an update touches `schema_name`.
pub const IMMUTABLE_SCHEMA_NAME: &str = "tenant schema_name is immutable";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Namespace identifier, validated against the safe identifier charset
    #[sea_orm(unique)]
    pub schema_name: String,

    #[sea_orm(unique)]
    pub display_name: String,

    /// Gates new activations only
    pub is_active: bool,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tenant_member::Entity")]
    TenantMember,
}

impl Related<super::tenant_member::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TenantMember.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        if !insert && self.schema_name.is_set() {
            return Err(DbErr::Custom(IMMUTABLE_SCHEMA_NAME.to_string()));
        }
        Ok(self)
    }
}
