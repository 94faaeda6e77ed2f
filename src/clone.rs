//! Clone procedure.
//!
//! Copying a schema is done by a PL/pgSQL routine installed once per database
//! in the shared schema. Invoking it is a single statement, so a failure part
//! way through leaves no partial destination schema behind.

use sea_orm::{ConnectionTrait, Statement};
use tracing::instrument;

use crate::error::{TenancyError, is_invalid_schema_name};
use crate::namespace::{SchemaName, schema_exists};

const CLONE_SCHEMA_SQL: &str = include_str!("sql/clone_schema.sql");

/// Renders the `CREATE OR REPLACE FUNCTION` statement for the clone routine.
pub fn install_sql(shared: &SchemaName) -> String {
    CLONE_SCHEMA_SQL.replace("{{shared_schema}}", &shared.quoted())
}

/// Installs (or replaces) the clone routine and makes sure the shared and
/// template schemas exist. Safe to run repeatedly.
#[instrument(skip(conn), fields(shared = %shared, template = %template))]
pub async fn install<C>(
    conn: &C,
    shared: &SchemaName,
    template: &SchemaName,
) -> Result<(), TenancyError>
where
    C: ConnectionTrait,
{
    conn.execute_unprepared(&format!("CREATE SCHEMA IF NOT EXISTS {}", shared.quoted()))
        .await?;
    conn.execute_unprepared(&install_sql(shared)).await?;
    conn.execute_unprepared(&format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        template.quoted()
    ))
    .await?;

    tracing::info!("clone routine installed");
    Ok(())
}

/// Copies `source` into a new schema `dest`, with rows when `copy_data` is set.
///
/// Fails with `AlreadyExists` when `dest` is already a schema, including when
/// a concurrent creator wins the race after the pre-check.
#[instrument(skip(conn), fields(source = %source, dest = %dest))]
pub async fn clone_schema<C>(
    conn: &C,
    shared: &SchemaName,
    source: &SchemaName,
    dest: &SchemaName,
    copy_data: bool,
) -> Result<(), TenancyError>
where
    C: ConnectionTrait,
{
    if schema_exists(conn, dest).await? {
        return Err(TenancyError::AlreadyExists {
            identifier: dest.to_string(),
        });
    }

    let stmt = Statement::from_sql_and_values(
        conn.get_database_backend(),
        format!("SELECT {}.clone_schema($1, $2, $3)", shared.quoted()),
        [
            source.as_str().into(),
            dest.as_str().into(),
            copy_data.into(),
        ],
    );

    conn.execute(stmt).await.map_err(|err| {
        if is_invalid_schema_name(&err) {
            TenancyError::Validation(format!("clone source schema '{source}' does not exist"))
        } else {
            TenancyError::from_db(err, dest.as_str())
        }
    })?;

    tracing::info!(copy_data, "schema cloned");
    Ok(())
}
