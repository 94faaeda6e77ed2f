//! Visibility cache: which tenants each principal may activate.
//!
//! The cache is an optimisation only. A miss recomputes from the registry
//! tables, and every invalidation path errs on the side of recomputing.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, JoinType, PaginatorTrait, QueryFilter,
    QuerySelect, RelationTrait,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::context::Principal;
use crate::models::{tenant, tenant_member};
use crate::telemetry::VISIBILITY_CACHE_TOTAL;

/// A tenant reachable by a principal through a membership edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub schema_name: String,
    pub is_active: bool,
}

/// Authoritative source the cache recomputes from.
#[async_trait]
pub trait VisibilitySource: Send + Sync {
    /// Schema names of every active tenant.
    async fn active_tenants(&self) -> Result<BTreeSet<String>, DbErr>;

    /// Every tenant the principal holds a membership in, active or not.
    async fn memberships(&self, principal: Uuid) -> Result<Vec<Membership>, DbErr>;

    /// Whether a registry row exists for `schema_name`, in any state.
    async fn tenant_exists(&self, schema_name: &str) -> Result<bool, DbErr>;
}

/// Reads the registry tables through the shared pool.
#[derive(Debug, Clone)]
pub struct DbVisibilitySource {
    db: Arc<DatabaseConnection>,
}

impl DbVisibilitySource {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VisibilitySource for DbVisibilitySource {
    async fn active_tenants(&self) -> Result<BTreeSet<String>, DbErr> {
        let names: Vec<String> = tenant::Entity::find()
            .select_only()
            .column(tenant::Column::SchemaName)
            .filter(tenant::Column::IsActive.eq(true))
            .into_tuple()
            .all(self.db.as_ref())
            .await?;
        Ok(names.into_iter().collect())
    }

    async fn memberships(&self, principal: Uuid) -> Result<Vec<Membership>, DbErr> {
        let rows: Vec<(String, bool)> = tenant::Entity::find()
            .select_only()
            .column(tenant::Column::SchemaName)
            .column(tenant::Column::IsActive)
            .join(JoinType::InnerJoin, tenant::Relation::TenantMember.def())
            .filter(tenant_member::Column::PrincipalId.eq(principal))
            .into_tuple()
            .all(self.db.as_ref())
            .await?;

        Ok(rows
            .into_iter()
            .map(|(schema_name, is_active)| Membership {
                schema_name,
                is_active,
            })
            .collect())
    }

    async fn tenant_exists(&self, schema_name: &str) -> Result<bool, DbErr> {
        let count = tenant::Entity::find()
            .filter(tenant::Column::SchemaName.eq(schema_name))
            .count(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VisibilityEntry {
    /// Every tenant the principal is a member of
    authorized: BTreeSet<String>,
    /// The active subset of `authorized`
    visible: Arc<BTreeSet<String>>,
}

/// Each invalidation bumps a generation counter while holding the matching
/// write lock. A miss only stores its result if the generation it started
/// under is still current, so a fill racing an invalidation is never cached.
pub struct VisibilityCache {
    source: Arc<dyn VisibilitySource>,
    principals: RwLock<LruCache<Uuid, VisibilityEntry>>,
    principals_generation: AtomicU64,
    all_active: RwLock<Option<Arc<BTreeSet<String>>>>,
    all_active_generation: AtomicU64,
}

impl VisibilityCache {
    pub fn new(source: Arc<dyn VisibilitySource>, capacity: NonZeroUsize) -> Self {
        Self {
            source,
            principals: RwLock::new(LruCache::new(capacity)),
            principals_generation: AtomicU64::new(0),
            all_active: RwLock::new(None),
            all_active_generation: AtomicU64::new(0),
        }
    }

    /// Tenants `principal` may activate. Privileged principals see every
    /// active tenant.
    pub async fn get(&self, principal: &Principal) -> Result<Arc<BTreeSet<String>>, DbErr> {
        if principal.privileged {
            return self.all_active().await;
        }

        let generation = {
            let mut cache = self.principals.write().await;
            if let Some(entry) = cache.get(&principal.id) {
                counter!(VISIBILITY_CACHE_TOTAL, "result" => "hit").increment(1);
                return Ok(entry.visible.clone());
            }
            self.principals_generation.load(Ordering::Acquire)
        };

        counter!(VISIBILITY_CACHE_TOTAL, "result" => "miss").increment(1);
        let memberships = self.source.memberships(principal.id).await?;
        let entry = VisibilityEntry {
            authorized: memberships.iter().map(|m| m.schema_name.clone()).collect(),
            visible: Arc::new(
                memberships
                    .into_iter()
                    .filter(|m| m.is_active)
                    .map(|m| m.schema_name)
                    .collect(),
            ),
        };
        let visible = entry.visible.clone();

        let mut cache = self.principals.write().await;
        if self.principals_generation.load(Ordering::Acquire) == generation {
            cache.put(principal.id, entry);
        } else {
            tracing::debug!(principal = %principal.id, "visibility invalidated during load, not cached");
        }
        drop(cache);
        tracing::debug!(principal = %principal.id, tenants = visible.len(), "visibility computed");

        Ok(visible)
    }

    /// Every active tenant, cached under a single global entry.
    pub async fn all_active(&self) -> Result<Arc<BTreeSet<String>>, DbErr> {
        let generation = {
            let cached = self.all_active.read().await;
            if let Some(all) = cached.as_ref() {
                counter!(VISIBILITY_CACHE_TOTAL, "result" => "hit").increment(1);
                return Ok(all.clone());
            }
            self.all_active_generation.load(Ordering::Acquire)
        };

        counter!(VISIBILITY_CACHE_TOTAL, "result" => "miss").increment(1);
        let all = Arc::new(self.source.active_tenants().await?);

        let mut cached = self.all_active.write().await;
        if self.all_active_generation.load(Ordering::Acquire) == generation {
            *cached = Some(all.clone());
        }
        Ok(all)
    }

    /// A membership edge of `principal` changed.
    pub async fn invalidate_principal(&self, principal: Uuid) {
        let mut cache = self.principals.write().await;
        self.principals_generation.fetch_add(1, Ordering::AcqRel);
        cache.pop(&principal);
        drop(cache);
        tracing::debug!(principal = %principal, "visibility entry invalidated");
    }

    /// A tenant row was created, saved or deleted: drop the global entry and
    /// every principal entry that authorizes `schema_name`.
    pub async fn invalidate_tenant(&self, schema_name: &str) {
        self.reset_all_active().await;

        let mut cache = self.principals.write().await;
        self.principals_generation.fetch_add(1, Ordering::AcqRel);
        let affected: Vec<Uuid> = cache
            .iter()
            .filter(|(_, entry)| entry.authorized.contains(schema_name))
            .map(|(principal, _)| *principal)
            .collect();
        for principal in &affected {
            cache.pop(principal);
        }

        tracing::debug!(
            schema = schema_name,
            principals = affected.len(),
            "visibility invalidated for tenant"
        );
    }

    /// Drops everything, e.g. on a maintenance-time invalidation signal.
    pub async fn clear(&self) {
        self.reset_all_active().await;
        let mut cache = self.principals.write().await;
        self.principals_generation.fetch_add(1, Ordering::AcqRel);
        cache.clear();
    }

    async fn reset_all_active(&self) {
        let mut cached = self.all_active.write().await;
        self.all_active_generation.fetch_add(1, Ordering::AcqRel);
        *cached = None;
    }
}
