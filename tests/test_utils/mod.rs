//! Test utilities for database testing.
//!
//! In-memory SQLite covers the registry tables; the schema engine itself needs
//! a real Postgres server, which is started through testcontainers.

use std::sync::Arc;

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Statement};
use tenancy::{
    Tenancy,
    classifier::SchemaGraph,
    config::{AppConfig, TenancyConfig},
    db,
    hooks::Hooks,
};
use testcontainers_modules::{
    postgres::Postgres,
    testcontainers::{ContainerAsync, runners::AsyncRunner},
};

/// Sets up an in-memory SQLite database with the registry migrations applied.
#[allow(dead_code)]
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// A running Postgres container plus a pool connected to it. The container
/// stops when this is dropped.
pub struct TestPostgres {
    pub config: AppConfig,
    pub db: Arc<DatabaseConnection>,
    _container: ContainerAsync<Postgres>,
}

pub async fn start_postgres() -> Result<TestPostgres> {
    let container = Postgres::default().start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;

    let config = AppConfig {
        database_url: format!("postgres://postgres:postgres@{host}:{port}/postgres"),
        db_max_connections: 5,
        tenancy: test_settings(),
        ..Default::default()
    };
    let db = Arc::new(db::init_pool(&config).await?);

    Ok(TestPostgres {
        config,
        db,
        _container: container,
    })
}

/// `countries` is shared; everything in the template is per tenant.
pub fn test_settings() -> TenancyConfig {
    TenancyConfig {
        shared_tables: ["countries".to_string()].into(),
        ..Default::default()
    }
}

/// Installs the engine, creates the fixture tables and returns an engine
/// whose classifier knows about them.
pub async fn install_tenancy(pg: &TestPostgres) -> Result<Tenancy> {
    let bootstrap = Tenancy::with_graph(
        pg.config.tenancy.clone(),
        pg.db.clone(),
        SchemaGraph::new(),
        Hooks::new(),
    )?;
    bootstrap.install().await?;

    for sql in [
        "CREATE TABLE public.countries (id serial PRIMARY KEY, code text NOT NULL UNIQUE)",
        "INSERT INTO public.countries (code) VALUES ('NL'), ('KE')",
        r#"CREATE TABLE "__template__".invoices (
            id integer GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
            amount integer NOT NULL,
            country_id integer REFERENCES public.countries (id)
        )"#,
        r#"CREATE TABLE "__template__".line_items (
            id serial PRIMARY KEY,
            invoice_id integer NOT NULL REFERENCES "__template__".invoices (id),
            quantity integer NOT NULL
        )"#,
    ] {
        pg.db.execute_unprepared(sql).await?;
    }

    Ok(Tenancy::connect(pg.config.tenancy.clone(), pg.db.clone(), Hooks::new()).await?)
}

/// Runs a scalar `bigint` query, aliased `n`.
pub async fn count<C: ConnectionTrait>(conn: &C, sql: &str) -> Result<i64> {
    let row = conn
        .query_one(Statement::from_string(DatabaseBackend::Postgres, sql.to_string()))
        .await?
        .ok_or_else(|| anyhow::anyhow!("query returned no row: {sql}"))?;
    Ok(row.try_get::<i64>("", "n")?)
}

/// Runs an `INSERT … RETURNING id` and returns the id.
#[allow(dead_code)]
pub async fn insert_returning_id<C: ConnectionTrait>(conn: &C, sql: &str) -> Result<i32> {
    let row = conn
        .query_one(Statement::from_string(DatabaseBackend::Postgres, sql.to_string()))
        .await?
        .ok_or_else(|| anyhow::anyhow!("insert returned no row: {sql}"))?;
    Ok(row.try_get::<i32>("", "id")?)
}

/// Whether `schema.table` has a column named `column`.
#[allow(dead_code)]
pub async fn has_column<C: ConnectionTrait>(
    conn: &C,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<bool> {
    let stmt = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        "SELECT COUNT(*)::bigint AS n FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2 AND column_name = $3",
        [schema.into(), table.into(), column.into()],
    );
    let row = conn
        .query_one(stmt)
        .await?
        .ok_or_else(|| anyhow::anyhow!("column lookup returned no row"))?;
    Ok(row.try_get::<i64>("", "n")? == 1)
}
