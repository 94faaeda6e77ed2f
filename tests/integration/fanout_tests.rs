//! Structural changes replayed across tenant schemas against Postgres.

use sea_orm::ConnectionTrait;
use tenancy::{
    Tenancy, TenancyError,
    classifier::TableClass,
    fanout::StructuralChange,
    namespace::SchemaName,
    registry::CreateTenantRequest,
};

use crate::test_utils::{TestPostgres, has_column, install_tenancy, start_postgres};

async fn with_tenants(pg: &TestPostgres) -> anyhow::Result<Tenancy> {
    let tenancy = install_tenancy(pg).await?;
    for (schema, name, active) in [
        ("acme", "Acme", true),
        ("globex", "Globex", false),
        ("initech", "Initech", true),
    ] {
        let mut request = CreateTenantRequest::new(schema, name);
        request.is_active = active;
        tenancy.registry().create(tenancy.db(), request).await?;
    }
    Ok(tenancy)
}

#[tokio::test]
async fn test_partitioned_change_reaches_every_tenant_and_template() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = with_tenants(&pg).await?;

    let report = tenancy
        .apply(&StructuralChange::raw("ALTER TABLE invoices ADD COLUMN note text"))
        .await?;

    assert_eq!(report.class, TableClass::Partitioned);
    assert_eq!(
        report.schemas,
        vec!["acme", "globex", "initech", "__template__"]
    );
    for schema in ["acme", "globex", "initech", "__template__"] {
        assert!(has_column(tenancy.db(), schema, "invoices", "note").await?, "{schema}");
    }
    assert!(!has_column(tenancy.db(), "public", "invoices", "note").await?);

    // Later clones inherit the change from the template.
    tenancy
        .registry()
        .create(tenancy.db(), CreateTenantRequest::new("hooli", "Hooli"))
        .await?;
    assert!(has_column(tenancy.db(), "hooli", "invoices", "note").await?);
    Ok(())
}

#[tokio::test]
async fn test_shared_change_runs_once() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = with_tenants(&pg).await?;

    let report = tenancy
        .apply(&StructuralChange::raw("ALTER TABLE countries ADD COLUMN symbol text"))
        .await?;

    assert_eq!(report.class, TableClass::Shared);
    assert_eq!(report.schemas, vec!["public"]);
    assert!(has_column(tenancy.db(), "public", "countries", "symbol").await?);
    Ok(())
}

#[tokio::test]
async fn test_deferred_statements_are_flushed_once_per_schema() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = with_tenants(&pg).await?;

    let change = StructuralChange::add_column(
        "line_items",
        "ALTER TABLE line_items ADD COLUMN sku text",
    )
    .with_deferred("CREATE UNIQUE INDEX line_items_sku_idx ON line_items (sku)");
    let report = tenancy.apply(&change).await?;

    // A repeated CREATE UNIQUE INDEX would fail with duplicate_table.
    assert_eq!(report.deferred.len(), 1);
    assert_eq!(report.statements(), 8);
    Ok(())
}

#[tokio::test]
async fn test_failing_tenant_aborts_the_whole_fanout() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = with_tenants(&pg).await?;

    let mut work = tenancy.begin().await?;
    tenancy
        .router()
        .activate_for_maintenance(&mut work, &SchemaName::reserved("globex")?)
        .await?;
    work.connection()
        .execute_unprepared("ALTER TABLE invoices ADD COLUMN note text")
        .await?;
    work.commit().await?;

    let err = tenancy
        .apply(&StructuralChange::raw("ALTER TABLE invoices ADD COLUMN note text"))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::FanoutFailure { ref schema, .. } if schema == "globex"));

    // The unit of work rolled back, so acme did not keep the column either.
    assert!(!has_column(tenancy.db(), "acme", "invoices", "note").await?);
    assert!(!has_column(tenancy.db(), "__template__", "invoices", "note").await?);
    Ok(())
}
