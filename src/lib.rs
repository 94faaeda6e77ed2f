//! # Tenant Schema Engine
//!
//! Schema-per-tenant multi-tenancy over PostgreSQL: tenant schemas cloned
//! from a template, shared/partitioned table classification, per-unit-of-work
//! search-path routing and DDL fan-out across every tenant schema.

pub mod bulk;
pub mod classifier;
pub mod clone;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod hooks;
pub mod http;
pub mod models;
pub mod namespace;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod visibility;

pub use engine::Tenancy;
pub use error::TenancyError;
pub use migration;
