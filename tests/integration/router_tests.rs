//! Activation, isolation and visibility against Postgres.

use sea_orm::{ConnectionTrait, DatabaseBackend, Statement};
use tenancy::{
    TenancyError,
    context::{ActiveContext, Principal},
    registry::{CreateTenantRequest, TenantChanges},
};
use uuid::Uuid;

use crate::test_utils::{count, install_tenancy, start_postgres};

const COUNT_INVOICES: &str = "SELECT COUNT(*)::bigint AS n FROM invoices";

#[tokio::test]
async fn test_rows_never_cross_tenants() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = install_tenancy(&pg).await?;
    let router = tenancy.router();
    let system = Principal::system();

    for (schema, name) in [("acme", "Acme"), ("globex", "Globex")] {
        tenancy
            .registry()
            .create(tenancy.db(), CreateTenantRequest::new(schema, name))
            .await?;
    }

    let mut work = tenancy.begin().await?;
    router.activate(&mut work, Some("acme"), &system).await?;
    work.connection()
        .execute_unprepared("INSERT INTO invoices (amount) VALUES (99)")
        .await?;

    router.activate(&mut work, Some("globex"), &system).await?;
    assert_eq!(count(work.connection(), COUNT_INVOICES).await?, 0);

    router.activate(&mut work, Some("acme"), &system).await?;
    assert_eq!(count(work.connection(), COUNT_INVOICES).await?, 1);

    router.deactivate(&mut work).await?;
    let err = count(work.connection(), COUNT_INVOICES).await.unwrap_err();
    assert!(err.to_string().contains("invoices"));

    // The failed statement aborted the transaction; nothing was committed.
    work.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_pooled_connections_return_unscoped() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = install_tenancy(&pg).await?;
    tenancy
        .registry()
        .create(tenancy.db(), CreateTenantRequest::new("acme", "Acme"))
        .await?;

    for _ in 0..3 {
        let mut work = tenancy.begin().await?;
        tenancy
            .router()
            .activate(&mut work, Some("acme"), &Principal::system())
            .await?;
        work.commit().await?;
    }

    for _ in 0..5 {
        let row = tenancy
            .db()
            .query_one(Statement::from_string(
                DatabaseBackend::Postgres,
                "SHOW search_path".to_string(),
            ))
            .await?
            .ok_or_else(|| anyhow::anyhow!("no search_path row"))?;
        let path: String = row.try_get("", "search_path")?;
        assert!(!path.contains("acme"), "leaked search_path: {path}");
    }
    Ok(())
}

#[tokio::test]
async fn test_template_is_never_a_data_tenant() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = install_tenancy(&pg).await?;
    let router = tenancy.router();

    let mut work = tenancy.begin().await?;
    let err = router
        .activate(&mut work, Some("__template__"), &Principal::system())
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::TemplateActivationForbidden));

    let err = router
        .activate_template(&mut work, &Principal::member(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::Forbidden { .. }));

    let context = router
        .activate_template(&mut work, &Principal::system())
        .await?;
    assert_eq!(context, ActiveContext::Template);
    assert_eq!(count(work.connection(), COUNT_INVOICES).await?, 0);
    work.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_membership_and_deletion_drive_visibility() -> anyhow::Result<()> {
    let pg = start_postgres().await?;
    let tenancy = install_tenancy(&pg).await?;
    let registry = tenancy.registry();
    let router = tenancy.router();
    let db = tenancy.db();
    let alice = Uuid::new_v4();
    let member = Principal::member(alice);

    registry.create(db, CreateTenantRequest::new("acme", "Acme")).await?;
    registry.create(db, CreateTenantRequest::new("globex", "Globex")).await?;

    let mut work = tenancy.begin().await?;
    let err = router
        .activate(&mut work, Some("acme"), &member)
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::Forbidden { .. }));
    work.rollback().await?;

    registry.grant(db, "acme", alice).await?;

    // One visible tenant: selected without naming it.
    let mut work = tenancy.begin().await?;
    let context = router.activate(&mut work, None, &member).await?;
    assert_eq!(context.tenant().map(|s| s.as_str()), Some("acme"));
    work.rollback().await?;

    registry
        .update(
            db,
            "acme",
            TenantChanges {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await?;
    let mut work = tenancy.begin().await?;
    let err = router
        .activate(&mut work, Some("acme"), &member)
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::Forbidden { .. }));

    // A stored hint for an inactive tenant is still a refusal.
    let err = router
        .resume(&mut work, Some("acme"), &member)
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::Forbidden { .. }));
    work.rollback().await?;

    registry.delete(db, "acme").await?;
    assert!(!tenancy.visibility().get(&member).await?.contains("acme"));

    let mut work = tenancy.begin().await?;
    let err = router
        .activate(&mut work, Some("acme"), &member)
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::Forbidden { .. }));

    // A stale hint for a deleted tenant is cleared instead.
    let resumed = router.resume(&mut work, Some("acme"), &member).await?;
    assert_eq!(resumed.context, ActiveContext::Unset);
    assert_eq!(resumed.hint, None);
    work.rollback().await?;
    Ok(())
}
