//! Namespace primitive: validated schema identifiers and the handful of
//! statements that create, drop and select Postgres schemas.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use sea_orm::{ConnectionTrait, DbErr, Statement};
use serde::Serialize;

use crate::config::TenancyConfig;
use crate::error::TenancyError;

static TENANT_SCHEMA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*$").expect("Invalid tenant schema regex")
});

static RESERVED_SCHEMA_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+$").expect("Invalid reserved schema regex"));

/// A schema identifier that is safe to interpolate (quoted) into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SchemaName(String);

impl SchemaName {
    /// Validates a tenant schema identifier.
    pub fn parse(raw: &str, settings: &TenancyConfig) -> Result<Self, TenancyError> {
        let invalid = |reason: &str| TenancyError::InvalidIdentifier {
            identifier: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if raw.len() > settings.schema_name_max_length {
            return Err(invalid(&format!(
                "must be at most {} characters",
                settings.schema_name_max_length
            )));
        }
        if !TENANT_SCHEMA_PATTERN.is_match(raw) {
            return Err(invalid(
                "must start with a lowercase letter and contain only lowercase letters, digits and underscores",
            ));
        }
        if raw == settings.template_schema
            || raw == settings.shared_schema
            || raw == "public"
            || raw == "information_schema"
            || raw.starts_with("pg_")
        {
            return Err(TenancyError::ReservedIdentifier {
                identifier: raw.to_string(),
            });
        }

        Ok(Self(raw.to_string()))
    }

    /// Builds a schema name for the shared or template namespace, skipping
    /// the tenant-only rules.
    pub fn reserved(raw: &str) -> Result<Self, TenancyError> {
        if raw.len() > 63 || !RESERVED_SCHEMA_PATTERN.is_match(raw) {
            return Err(TenancyError::InvalidIdentifier {
                identifier: raw.to_string(),
                reason: "reserved schema names may only contain lowercase letters, digits and underscores"
                    .to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        quote_ident(&self.0)
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SchemaName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Double-quotes an identifier, doubling any embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Renders the `SET LOCAL search_path` statement for `path`.
pub fn search_path_sql(path: &[&SchemaName]) -> String {
    let schemas = path
        .iter()
        .map(|schema| schema.quoted())
        .collect::<Vec<_>>()
        .join(", ");
    format!("SET LOCAL search_path TO {schemas}")
}

pub async fn schema_exists<C>(conn: &C, schema: &SchemaName) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let stmt = Statement::from_sql_and_values(
        conn.get_database_backend(),
        r#"SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1) AS "exists""#,
        [schema.as_str().into()],
    );

    match conn.query_one(stmt).await? {
        Some(row) => row.try_get::<bool>("", "exists"),
        None => Ok(false),
    }
}

/// Creates an empty schema. An existing schema is reported as `AlreadyExists`.
pub async fn create_schema<C>(conn: &C, schema: &SchemaName) -> Result<(), TenancyError>
where
    C: ConnectionTrait,
{
    conn.execute_unprepared(&format!("CREATE SCHEMA {}", schema.quoted()))
        .await
        .map_err(|err| TenancyError::from_db(err, schema.as_str()))?;
    tracing::debug!(schema = %schema, "schema created");
    Ok(())
}

/// Drops a schema if present; with `cascade` every contained object goes too.
pub async fn drop_schema<C>(conn: &C, schema: &SchemaName, cascade: bool) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let mut sql = format!("DROP SCHEMA IF EXISTS {}", schema.quoted());
    if cascade {
        sql.push_str(" CASCADE");
    }
    conn.execute_unprepared(&sql).await?;
    tracing::debug!(schema = %schema, cascade, "schema dropped");
    Ok(())
}

/// Sets the transaction-local search path. The setting reverts on commit or
/// rollback, so it never outlives the unit of work.
pub async fn set_search_path<C>(conn: &C, path: &[&SchemaName]) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    conn.execute_unprepared(&search_path_sql(path)).await?;
    Ok(())
}
