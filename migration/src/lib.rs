//! Database migrations for the tenant registry.
//!
//! These migrations only create the shared registry tables. Tenant schemas,
//! the template schema and the clone routine are provisioned by the
//! `tenancy` crate itself.

pub use sea_orm_migration::prelude::*;

mod m2024_01_01_000001_create_tenants;
mod m2024_01_01_000002_create_tenant_members;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2024_01_01_000001_create_tenants::Migration),
            Box::new(m2024_01_01_000002_create_tenant_members::Migration),
        ]
    }
}
