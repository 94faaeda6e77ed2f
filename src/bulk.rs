//! Scoping for bulk load and dump operations.
//!
//! Imports and exports touching a partitioned table must name the tenant (or
//! the template) they act on. Nothing is defaulted.

use serde::Serialize;

use crate::classifier::{TableClass, TableClassifier};
use crate::config::TenancyConfig;
use crate::context::{ActiveContext, Principal, UnitOfWork};
use crate::error::TenancyError;
use crate::namespace::SchemaName;
use crate::router::Router;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "schema", rename_all = "snake_case")]
pub enum BulkScope {
    /// No tenant: only shared tables may be involved
    Shared,
    Tenant(String),
    Template,
}

/// Classifies `tables` and activates the scope the operation runs in.
pub async fn prepare_bulk(
    router: &Router,
    classifier: &TableClassifier,
    settings: &TenancyConfig,
    work: &mut UnitOfWork,
    tables: &[&str],
    scope: &BulkScope,
) -> Result<ActiveContext, TenancyError> {
    let partitioned: Vec<String> = tables
        .iter()
        .filter(|table| classifier.classify(table) == TableClass::Partitioned)
        .map(|table| table.to_string())
        .collect();

    match scope {
        BulkScope::Shared if !partitioned.is_empty() => {
            tracing::warn!(tables = ?partitioned, "bulk operation needs a tenant");
            Err(TenancyError::TenantRequired {
                tables: partitioned,
            })
        }
        BulkScope::Shared => {
            router.deactivate(work).await?;
            Ok(ActiveContext::Unset)
        }
        BulkScope::Tenant(identifier) => {
            let schema = SchemaName::parse(identifier, settings)?;
            let context = router.activate_for_maintenance(work, &schema).await?;
            tracing::info!(schema = %schema, tables = tables.len(), "bulk scope activated");
            Ok(context)
        }
        BulkScope::Template => {
            router.activate_template(work, &Principal::system()).await
        }
    }
}
