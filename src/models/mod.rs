//! # Registry Models
//!
//! SeaORM entities for the tenant registry. Both tables live in the shared
//! schema and are never fanned out.

pub mod tenant;
pub mod tenant_member;

pub use tenant::Entity as Tenant;
pub use tenant_member::Entity as TenantMember;

/// Table names owned by the registry itself.
pub const REGISTRY_TABLES: &[&str] = &["tenants", "tenant_members", "seaql_migrations"];
