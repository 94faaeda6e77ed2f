//! Tenant creation, cloning and deletion against Postgres.

use sea_orm::ConnectionTrait;
use tenancy::{
    TenancyError,
    clone,
    context::Principal,
    namespace::{SchemaName, schema_exists},
    registry::CreateTenantRequest,
};

use crate::test_utils::{count, insert_returning_id, install_tenancy, start_postgres};

#[tokio::test]
async fn test_new_tenant_starts_with_empty_partitioned_tables() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = install_tenancy(&pg).await?;

    tenancy
        .registry()
        .create(tenancy.db(), CreateTenantRequest::new("acme", "Acme"))
        .await?;

    let mut work = tenancy.begin().await?;
    tenancy
        .router()
        .activate(&mut work, Some("acme"), &Principal::system())
        .await?;

    assert_eq!(count(work.connection(), "SELECT COUNT(*)::bigint AS n FROM invoices").await?, 0);
    assert_eq!(count(work.connection(), "SELECT COUNT(*)::bigint AS n FROM line_items").await?, 0);
    // Shared tables still resolve through the search path.
    assert_eq!(count(work.connection(), "SELECT COUNT(*)::bigint AS n FROM countries").await?, 2);

    work.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_clone_with_data_copies_rows_and_detaches_sequences() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = install_tenancy(&pg).await?;
    let registry = tenancy.registry();

    registry
        .create(tenancy.db(), CreateTenantRequest::new("acme", "Acme"))
        .await?;

    let mut work = tenancy.begin().await?;
    tenancy
        .router()
        .activate(&mut work, Some("acme"), &Principal::system())
        .await?;
    for amount in [10, 20, 30] {
        let id = insert_returning_id(
            work.connection(),
            &format!("INSERT INTO invoices (amount, country_id) VALUES ({amount}, 1) RETURNING id"),
        )
        .await?;
        work.connection()
            .execute_unprepared(&format!(
                "INSERT INTO line_items (invoice_id, quantity) VALUES ({id}, 1)"
            ))
            .await?;
    }
    work.commit().await?;

    registry
        .create(
            tenancy.db(),
            CreateTenantRequest::new("acme_copy", "Acme Copy").clone_from("acme"),
        )
        .await?;

    let mut work = tenancy.begin().await?;
    let router = tenancy.router();

    router
        .activate(&mut work, Some("acme_copy"), &Principal::system())
        .await?;
    assert_eq!(count(work.connection(), "SELECT COUNT(*)::bigint AS n FROM invoices").await?, 3);
    assert_eq!(count(work.connection(), "SELECT COUNT(*)::bigint AS n FROM line_items").await?, 3);
    let copy_invoice = insert_returning_id(
        work.connection(),
        "INSERT INTO invoices (amount) VALUES (40) RETURNING id",
    )
    .await?;
    let copy_item = insert_returning_id(
        work.connection(),
        &format!("INSERT INTO line_items (invoice_id, quantity) VALUES ({copy_invoice}, 2) RETURNING id"),
    )
    .await?;

    router
        .activate(&mut work, Some("acme"), &Principal::system())
        .await?;
    let source_invoice = insert_returning_id(
        work.connection(),
        "INSERT INTO invoices (amount) VALUES (50) RETURNING id",
    )
    .await?;
    let source_item = insert_returning_id(
        work.connection(),
        &format!("INSERT INTO line_items (invoice_id, quantity) VALUES ({source_invoice}, 2) RETURNING id"),
    )
    .await?;
    work.commit().await?;

    // Both continue from the copied position without consuming each other's values.
    assert_eq!(copy_invoice, 4);
    assert_eq!(source_invoice, 4);
    assert_eq!(copy_item, 4);
    assert_eq!(source_item, 4);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_and_retired_identifiers_are_rejected() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = install_tenancy(&pg).await?;
    let registry = tenancy.registry();
    let db = tenancy.db();

    registry.create(db, CreateTenantRequest::new("acme", "Acme")).await?;

    let err = registry
        .create(db, CreateTenantRequest::new("acme", "Acme Again"))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::AlreadyExists { .. }));

    let err = registry
        .create(db, CreateTenantRequest::new("acme_two", "Acme"))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::AlreadyExists { ref identifier } if identifier == "Acme"));

    registry.delete(db, "acme").await?;
    let acme = SchemaName::reserved("acme")?;
    assert!(!schema_exists(db, &acme).await?);

    let err = registry
        .create(db, CreateTenantRequest::new("acme", "Acme Reborn"))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::AlreadyExists { .. }));
    Ok(())
}

#[tokio::test]
async fn test_clone_into_existing_schema_fails_atomically() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = install_tenancy(&pg).await?;
    let db = tenancy.db();

    db.execute_unprepared("CREATE SCHEMA squatter").await?;

    let err = tenancy
        .registry()
        .create(db, CreateTenantRequest::new("squatter", "Squatter"))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::AlreadyExists { .. }));
    assert!(tenancy.registry().get(db, "squatter").await?.is_none());

    let err = tenancy
        .registry()
        .create(
            db,
            CreateTenantRequest::new("orphan", "Orphan").clone_from("no_such_schema"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::Validation(_)));
    assert!(tenancy.registry().get(db, "orphan").await?.is_none());
    assert!(!schema_exists(db, &SchemaName::reserved("orphan")?).await?);
    Ok(())
}

#[tokio::test]
async fn test_install_and_reconcile_are_repeatable() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = install_tenancy(&pg).await?;
    let db = tenancy.db();

    tenancy.install().await?;
    clone::install(db, tenancy.router().shared(), tenancy.router().template()).await?;

    // A row imported behind the registry's back has no schema yet.
    db.execute_unprepared(
        "INSERT INTO tenants (schema_name, display_name, is_active) VALUES ('imported', 'Imported', true)",
    )
    .await?;

    let created = tenancy.registry().reconcile(db).await?;
    assert_eq!(created, vec![SchemaName::reserved("imported")?]);
    assert!(tenancy.registry().reconcile(db).await?.is_empty());

    let mut work = tenancy.begin().await?;
    tenancy
        .router()
        .activate(&mut work, Some("imported"), &Principal::system())
        .await?;
    assert_eq!(count(work.connection(), "SELECT COUNT(*)::bigint AS n FROM invoices").await?, 0);
    work.rollback().await?;
    Ok(())
}
