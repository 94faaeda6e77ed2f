//! # Schema Registry
//!
//! Catalog of tenants. Persisting a registry row is what creates a tenant's
//! schema; deleting the row drops the schema with everything in it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, Condition, ConnectionTrait, DbErr,
    EntityTrait, IntoActiveModel, ModelTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::clone::clone_schema;
use crate::config::TenancyConfig;
use crate::error::{TenancyError, is_unique_violation};
use crate::hooks::Hooks;
use crate::models::tenant::{self, IMMUTABLE_SCHEMA_NAME};
use crate::models::tenant_member;
use crate::namespace::{SchemaName, drop_schema, schema_exists};
use crate::telemetry::SCHEMAS_CREATED_TOTAL;
use crate::visibility::VisibilityCache;

/// Request data for creating a tenant.
#[derive(Debug, Clone)]
pub struct CreateTenantRequest {
    pub schema_name: String,
    pub display_name: String,
    pub is_active: bool,
    /// Schema to clone from instead of the template. Rows are copied when set.
    pub clone_from: Option<String>,
}

impl CreateTenantRequest {
    pub fn new(schema_name: &str, display_name: &str) -> Self {
        Self {
            schema_name: schema_name.to_string(),
            display_name: display_name.to_string(),
            is_active: true,
            clone_from: None,
        }
    }

    pub fn clone_from(mut self, source: &str) -> Self {
        self.clone_from = Some(source.to_string());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Changes applied by [`Registry::update`]. `schema_name` exists only so an
/// attempted rename can be rejected explicitly.
#[derive(Debug, Clone, Default)]
pub struct TenantChanges {
    pub schema_name: Option<String>,
    pub display_name: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantFilter {
    Active,
    Inactive,
    #[default]
    All,
}

pub struct Registry {
    settings: TenancyConfig,
    shared: SchemaName,
    template: SchemaName,
    visibility: Arc<VisibilityCache>,
    hooks: Arc<Hooks>,
    retired: Mutex<HashSet<String>>,
}

impl Registry {
    pub fn new(
        settings: TenancyConfig,
        visibility: Arc<VisibilityCache>,
        hooks: Arc<Hooks>,
    ) -> Result<Self, TenancyError> {
        settings.validate()?;
        Ok(Self {
            shared: SchemaName::reserved(&settings.shared_schema)?,
            template: SchemaName::reserved(&settings.template_schema)?,
            settings,
            visibility,
            hooks,
            retired: Mutex::new(HashSet::new()),
        })
    }

    pub fn template(&self) -> &SchemaName {
        &self.template
    }

    /// Persists a tenant and clones its schema, all in one (possibly nested)
    /// transaction. Any failure leaves neither row nor schema behind.
    #[instrument(skip(self, db, request), fields(schema = %request.schema_name))]
    pub async fn create<C>(
        &self,
        db: &C,
        request: CreateTenantRequest,
    ) -> Result<tenant::Model, TenancyError>
    where
        C: TransactionTrait,
    {
        let schema = self.parse(&request.schema_name)?;
        let display_name = request.display_name.trim().to_string();
        if display_name.is_empty() {
            return Err(TenancyError::Validation(
                "display name cannot be empty".to_string(),
            ));
        }
        if self.is_retired(schema.as_str()) {
            return Err(TenancyError::AlreadyExists {
                identifier: schema.to_string(),
            });
        }

        let (source, copy_data) = match request.clone_from.as_deref() {
            Some(source) if source == self.shared.as_str() => {
                return Err(TenancyError::ReservedIdentifier {
                    identifier: source.to_string(),
                });
            }
            Some(source) if source != self.template.as_str() => {
                (SchemaName::reserved(source)?, true)
            }
            _ => (self.template.clone(), false),
        };

        let txn = db.begin().await?;

        let existing = tenant::Entity::find()
            .filter(
                Condition::any()
                    .add(tenant::Column::SchemaName.eq(schema.as_str()))
                    .add(tenant::Column::DisplayName.eq(display_name.as_str())),
            )
            .one(&txn)
            .await?;
        if let Some(existing) = existing {
            let identifier = if existing.schema_name == schema.as_str() {
                existing.schema_name
            } else {
                existing.display_name
            };
            return Err(TenancyError::AlreadyExists { identifier });
        }

        let model = tenant::ActiveModel {
            id: NotSet,
            schema_name: Set(schema.to_string()),
            display_name: Set(display_name),
            is_active: Set(request.is_active),
            created_at: Set(Utc::now().into()),
        }
        .insert(&txn)
        .await
        .map_err(|err| TenancyError::from_db(err, schema.as_str()))?;

        clone_schema(&txn, &self.shared, &source, &schema, copy_data).await?;
        self.hooks.after_create(&txn, &model).await?;
        txn.commit().await?;

        self.visibility.invalidate_tenant(schema.as_str()).await;
        counter!(SCHEMAS_CREATED_TOTAL).increment(1);
        tracing::info!(source = %source, copy_data, "tenant created");

        Ok(model)
    }

    /// Removes the registry row and drops the schema with all its data.
    #[instrument(skip(self, db))]
    pub async fn delete<C>(&self, db: &C, identifier: &str) -> Result<(), TenancyError>
    where
        C: TransactionTrait,
    {
        let schema = self.parse(identifier)?;

        let txn = db.begin().await?;
        let model = tenant::Entity::find()
            .filter(tenant::Column::SchemaName.eq(schema.as_str()))
            .one(&txn)
            .await?
            .ok_or_else(|| TenancyError::NotFound {
                identifier: identifier.to_string(),
            })?;

        model.delete(&txn).await?;
        drop_schema(&txn, &schema, true).await?;
        txn.commit().await?;

        self.retire(schema.as_str());
        self.visibility.invalidate_tenant(schema.as_str()).await;
        tracing::warn!("tenant deleted and schema dropped");

        Ok(())
    }

    pub async fn list<C>(
        &self,
        db: &C,
        filter: TenantFilter,
    ) -> Result<Vec<tenant::Model>, TenancyError>
    where
        C: ConnectionTrait,
    {
        let query = match filter {
            TenantFilter::Active => tenant::Entity::find().filter(tenant::Column::IsActive.eq(true)),
            TenantFilter::Inactive => {
                tenant::Entity::find().filter(tenant::Column::IsActive.eq(false))
            }
            TenantFilter::All => tenant::Entity::find(),
        };

        Ok(query
            .order_by_asc(tenant::Column::SchemaName)
            .all(db)
            .await?)
    }

    pub async fn get<C>(&self, db: &C, identifier: &str) -> Result<Option<tenant::Model>, TenancyError>
    where
        C: ConnectionTrait,
    {
        Ok(tenant::Entity::find()
            .filter(tenant::Column::SchemaName.eq(identifier))
            .one(db)
            .await?)
    }

    /// Changes display name or active flag. Renaming the schema is refused.
    #[instrument(skip(self, db, changes))]
    pub async fn update<C>(
        &self,
        db: &C,
        identifier: &str,
        changes: TenantChanges,
    ) -> Result<tenant::Model, TenancyError>
    where
        C: ConnectionTrait,
    {
        if let Some(attempted) = changes.schema_name
            && attempted != identifier
        {
            return Err(TenancyError::ImmutableIdentifier {
                identifier: identifier.to_string(),
                attempted,
            });
        }

        let model = self
            .get(db, identifier)
            .await?
            .ok_or_else(|| TenancyError::NotFound {
                identifier: identifier.to_string(),
            })?;

        if changes.display_name.is_none() && changes.is_active.is_none() {
            return Ok(model);
        }

        let mut active = model.into_active_model();
        if let Some(display_name) = changes.display_name {
            let display_name = display_name.trim().to_string();
            if display_name.is_empty() {
                return Err(TenancyError::Validation(
                    "display name cannot be empty".to_string(),
                ));
            }
            active.display_name = Set(display_name);
        }
        if let Some(is_active) = changes.is_active {
            active.is_active = Set(is_active);
        }

        let updated = active.update(db).await.map_err(|err| match err {
            DbErr::Custom(ref message) if message == IMMUTABLE_SCHEMA_NAME => {
                TenancyError::ImmutableIdentifier {
                    identifier: identifier.to_string(),
                    attempted: identifier.to_string(),
                }
            }
            other => TenancyError::from_db(other, identifier),
        })?;

        self.visibility.invalidate_tenant(identifier).await;
        tracing::info!(is_active = updated.is_active, "tenant updated");
        Ok(updated)
    }

    /// Adds an authorization edge. Granting twice is a no-op.
    #[instrument(skip(self, db))]
    pub async fn grant<C>(&self, db: &C, identifier: &str, principal: Uuid) -> Result<(), TenancyError>
    where
        C: ConnectionTrait,
    {
        let tenant = self.require(db, identifier).await?;

        let existing = tenant_member::Entity::find()
            .filter(tenant_member::Column::TenantId.eq(tenant.id))
            .filter(tenant_member::Column::PrincipalId.eq(principal))
            .one(db)
            .await?;
        if existing.is_some() {
            tracing::debug!("membership already present");
            return Ok(());
        }

        let result = tenant_member::ActiveModel {
            id: NotSet,
            tenant_id: Set(tenant.id),
            principal_id: Set(principal),
            created_at: Set(Utc::now().into()),
        }
        .insert(db)
        .await;

        match result {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                tracing::debug!("membership granted concurrently");
            }
            Err(err) => return Err(err.into()),
        }

        self.visibility.invalidate_principal(principal).await;
        Ok(())
    }

    #[instrument(skip(self, db))]
    pub async fn revoke<C>(&self, db: &C, identifier: &str, principal: Uuid) -> Result<(), TenancyError>
    where
        C: ConnectionTrait,
    {
        let tenant = self.require(db, identifier).await?;

        tenant_member::Entity::delete_many()
            .filter(tenant_member::Column::TenantId.eq(tenant.id))
            .filter(tenant_member::Column::PrincipalId.eq(principal))
            .exec(db)
            .await?;

        self.visibility.invalidate_principal(principal).await;
        Ok(())
    }

    /// Creates the schema of every registry row that lacks one, e.g. after a
    /// bulk import wrote rows directly. Returns the schemas it created.
    #[instrument(skip(self, db))]
    pub async fn reconcile<C>(&self, db: &C) -> Result<Vec<SchemaName>, TenancyError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let mut created = Vec::new();

        for model in self.list(db, TenantFilter::All).await? {
            let schema = SchemaName::reserved(&model.schema_name)?;
            if schema_exists(db, &schema).await? {
                continue;
            }

            let txn = db.begin().await?;
            clone_schema(&txn, &self.shared, &self.template, &schema, false).await?;
            self.hooks.after_create(&txn, &model).await?;
            txn.commit().await?;

            counter!(SCHEMAS_CREATED_TOTAL).increment(1);
            tracing::info!(schema = %schema, "missing schema recreated");
            created.push(schema);
        }

        if !created.is_empty() {
            self.visibility.clear().await;
        }
        Ok(created)
    }

    fn parse(&self, identifier: &str) -> Result<SchemaName, TenancyError> {
        if identifier == self.template.as_str() || identifier == self.shared.as_str() {
            return Err(TenancyError::ReservedIdentifier {
                identifier: identifier.to_string(),
            });
        }
        SchemaName::parse(identifier, &self.settings)
    }

    async fn require<C>(&self, db: &C, identifier: &str) -> Result<tenant::Model, TenancyError>
    where
        C: ConnectionTrait,
    {
        self.get(db, identifier)
            .await?
            .ok_or_else(|| TenancyError::NotFound {
                identifier: identifier.to_string(),
            })
    }

    fn is_retired(&self, schema: &str) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(schema)
    }

    fn retire(&self, schema: &str) {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(schema.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visibility::{DbVisibilitySource, VisibilitySource};
    use crate::context::Principal;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{
        Database, DatabaseBackend, DatabaseConnection, MockDatabase, MockExecResult,
    };
    use std::collections::BTreeMap;
    use std::num::NonZeroUsize;

    async fn setup_test_db() -> Arc<DatabaseConnection> {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        Arc::new(db)
    }

    /// A source for tests that never read visibility back.
    fn unread_source() -> Arc<DatabaseConnection> {
        Arc::new(MockDatabase::new(DatabaseBackend::Postgres).into_connection())
    }

    fn registry_over(db: &Arc<DatabaseConnection>) -> (Registry, Arc<VisibilityCache>) {
        let source: Arc<dyn VisibilitySource> = Arc::new(DbVisibilitySource::new(db.clone()));
        let visibility = Arc::new(VisibilityCache::new(source, NonZeroUsize::new(8).unwrap()));
        let registry = Registry::new(
            TenancyConfig::default(),
            visibility.clone(),
            Arc::new(Hooks::new()),
        )
        .unwrap();
        (registry, visibility)
    }

    async fn insert_tenant(db: &DatabaseConnection, schema: &str, active: bool) -> tenant::Model {
        tenant::ActiveModel {
            id: NotSet,
            schema_name: Set(schema.to_string()),
            display_name: Set(format!("{schema} inc")),
            is_active: Set(active),
            created_at: Set(Utc::now().into()),
        }
        .insert(db)
        .await
        .unwrap()
    }

    fn tenant_row(schema: &str) -> tenant::Model {
        tenant::Model {
            id: 1,
            schema_name: schema.to_string(),
            display_name: format!("{schema} inc"),
            is_active: true,
            created_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn test_update_refuses_schema_rename() {
        let db = setup_test_db().await;
        let (registry, _) = registry_over(&db);
        insert_tenant(db.as_ref(), "acme", true).await;

        let err = registry
            .update(
                db.as_ref(),
                "acme",
                TenantChanges {
                    schema_name: Some("acme_renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::ImmutableIdentifier { .. }));

        let updated = registry
            .update(
                db.as_ref(),
                "acme",
                TenantChanges {
                    schema_name: Some("acme".to_string()),
                    display_name: Some("Acme Holdings".to_string()),
                    is_active: Some(false),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.schema_name, "acme");
        assert_eq!(updated.display_name, "Acme Holdings");
        assert!(!updated.is_active);
    }

    #[tokio::test]
    async fn test_entity_rejects_schema_name_update() {
        let db = setup_test_db().await;
        let model = insert_tenant(db.as_ref(), "acme", true).await;

        let mut active = model.into_active_model();
        active.schema_name = Set("other".to_string());
        let err = active.update(db.as_ref()).await.unwrap_err();

        assert!(matches!(err, DbErr::Custom(ref m) if m == IMMUTABLE_SCHEMA_NAME));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let db = setup_test_db().await;
        let (registry, _) = registry_over(&db);
        insert_tenant(db.as_ref(), "beta", false).await;
        insert_tenant(db.as_ref(), "acme", true).await;

        let names = |tenants: Vec<tenant::Model>| {
            tenants
                .into_iter()
                .map(|t| t.schema_name)
                .collect::<Vec<_>>()
        };

        assert_eq!(
            names(registry.list(db.as_ref(), TenantFilter::All).await.unwrap()),
            vec!["acme", "beta"]
        );
        assert_eq!(
            names(registry.list(db.as_ref(), TenantFilter::Active).await.unwrap()),
            vec!["acme"]
        );
        assert_eq!(
            names(registry.list(db.as_ref(), TenantFilter::Inactive).await.unwrap()),
            vec!["beta"]
        );
    }

    #[tokio::test]
    async fn test_grant_and_revoke_refresh_visibility() {
        let db = setup_test_db().await;
        let (registry, visibility) = registry_over(&db);
        insert_tenant(db.as_ref(), "acme", true).await;
        let alice = Uuid::new_v4();
        let principal = Principal::member(alice);

        assert!(visibility.get(&principal).await.unwrap().is_empty());

        registry.grant(db.as_ref(), "acme", alice).await.unwrap();
        registry.grant(db.as_ref(), "acme", alice).await.unwrap();
        assert!(visibility.get(&principal).await.unwrap().contains("acme"));

        registry.revoke(db.as_ref(), "acme", alice).await.unwrap();
        assert!(visibility.get(&principal).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deactivation_hides_tenant_from_members() {
        let db = setup_test_db().await;
        let (registry, visibility) = registry_over(&db);
        insert_tenant(db.as_ref(), "acme", true).await;
        let alice = Uuid::new_v4();
        registry.grant(db.as_ref(), "acme", alice).await.unwrap();

        assert!(visibility
            .get(&Principal::member(alice))
            .await
            .unwrap()
            .contains("acme"));

        registry
            .update(
                db.as_ref(),
                "acme",
                TenantChanges {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(visibility.get(&Principal::member(alice)).await.unwrap().is_empty());
        assert!(visibility.get(&Principal::system()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_grant_unknown_tenant_is_not_found() {
        let db = setup_test_db().await;
        let (registry, _) = registry_over(&db);

        let err = registry.grant(db.as_ref(), "ghost", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, TenancyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_and_delete_validate_identifiers() {
        let db = setup_test_db().await;
        let (registry, _) = registry_over(&db);

        let err = registry
            .create(db.as_ref(), CreateTenantRequest::new("Bad-Name", "Bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::InvalidIdentifier { .. }));

        let err = registry.delete(db.as_ref(), "__template__").await.unwrap_err();
        assert!(matches!(err, TenancyError::ReservedIdentifier { .. }));

        let err = registry
            .create(db.as_ref(), CreateTenantRequest::new("pg_acme", "Acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::ReservedIdentifier { .. }));
    }

    #[tokio::test]
    async fn test_create_refuses_shared_schema_as_clone_source() {
        let db = setup_test_db().await;
        let (registry, _) = registry_over(&db);

        let err = registry
            .create(
                db.as_ref(),
                CreateTenantRequest::new("acme", "Acme").clone_from("public"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::ReservedIdentifier { ref identifier } if identifier == "public"));
        assert!(registry.list(db.as_ref(), TenantFilter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_clones_template_inside_transaction() {
        let exists_false: BTreeMap<&str, sea_orm::Value> =
            BTreeMap::from([("exists", false.into())]);
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<tenant::Model>::new()])
            .append_query_results([vec![tenant_row("acme")]])
            .append_query_results([vec![exists_false]])
            .append_exec_results([MockExecResult::default()])
            .into_connection();
        let (registry, _) = registry_over(&unread_source());

        let model = registry
            .create(&db, CreateTenantRequest::new("acme", "acme inc"))
            .await
            .unwrap();
        assert_eq!(model.schema_name, "acme");

        let log = db.into_transaction_log();
        let sql: Vec<&str> = log[0].statements().iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql.first(), Some(&"BEGIN"));
        assert!(sql.contains(&"SELECT \"public\".clone_schema($1, $2, $3)"));
        assert_eq!(sql.last(), Some(&"COMMIT"));
    }

    #[tokio::test]
    async fn test_failed_clone_rolls_back_record() {
        let exists_false: BTreeMap<&str, sea_orm::Value> =
            BTreeMap::from([("exists", false.into())]);
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<tenant::Model>::new()])
            .append_query_results([vec![tenant_row("acme")]])
            .append_query_results([vec![exists_false]])
            .append_exec_errors([DbErr::Custom("clone failed".to_string())])
            .into_connection();
        let (registry, _) = registry_over(&unread_source());

        let err = registry
            .create(&db, CreateTenantRequest::new("acme", "acme inc"))
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::Database(_)));

        let log = db.into_transaction_log();
        let last = log[0].statements().last().map(|s| s.sql.clone());
        assert_eq!(last.as_deref(), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![tenant_row("acme")]])
            .into_connection();
        let (registry, _) = registry_over(&unread_source());

        let err = registry
            .create(&db, CreateTenantRequest::new("acme", "Another Acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::AlreadyExists { ref identifier } if identifier == "acme"));
    }
}
