//! The `Tenancy` facade: one handle wiring the classifier, visibility cache,
//! registry, router and fan-out engine over a shared pool.

use std::num::NonZeroUsize;
use std::sync::Arc;

use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tracing::Instrument;

use crate::bulk::{BulkScope, prepare_bulk};
use crate::classifier::{SchemaGraph, TableClassifier};
use crate::clone;
use crate::config::TenancyConfig;
use crate::context::{ActiveContext, UnitOfWork};
use crate::error::TenancyError;
use crate::fanout::{FanoutEngine, FanoutReport, StructuralChange};
use crate::hooks::Hooks;
use crate::namespace::SchemaName;
use crate::registry::Registry;
use crate::router::Router;
use crate::telemetry::{current_trace_id, in_trace_context};
use crate::visibility::{DbVisibilitySource, VisibilityCache, VisibilitySource};

pub struct Tenancy {
    settings: TenancyConfig,
    db: Arc<DatabaseConnection>,
    classifier: Arc<TableClassifier>,
    visibility: Arc<VisibilityCache>,
    router: Arc<Router>,
    registry: Registry,
    fanout: FanoutEngine,
}

impl Tenancy {
    /// Builds the engine, introspecting the shared and template schemas for
    /// the classifier's table graph.
    pub async fn connect(
        settings: TenancyConfig,
        db: Arc<DatabaseConnection>,
        hooks: Hooks,
    ) -> Result<Self, TenancyError> {
        settings.validate()?;
        let shared = SchemaName::reserved(&settings.shared_schema)?;
        let template = SchemaName::reserved(&settings.template_schema)?;
        let graph = SchemaGraph::load(db.as_ref(), &[&shared, &template]).await?;
        tracing::debug!(tables = graph.len(), "schema graph loaded");
        Self::with_graph(settings, db, graph, hooks)
    }

    /// Builds the engine over a caller-supplied table graph.
    pub fn with_graph(
        settings: TenancyConfig,
        db: Arc<DatabaseConnection>,
        graph: SchemaGraph,
        hooks: Hooks,
    ) -> Result<Self, TenancyError> {
        settings.validate()?;
        let shared = SchemaName::reserved(&settings.shared_schema)?;
        let template = SchemaName::reserved(&settings.template_schema)?;
        let capacity = NonZeroUsize::new(settings.visibility_cache_capacity).ok_or_else(|| {
            TenancyError::Validation("visibility cache capacity must be positive".to_string())
        })?;

        let source: Arc<dyn VisibilitySource> = Arc::new(DbVisibilitySource::new(db.clone()));
        let visibility = Arc::new(VisibilityCache::new(source.clone(), capacity));
        let hooks = Arc::new(hooks);
        let classifier = Arc::new(TableClassifier::from_config(graph, &settings));
        let router = Arc::new(Router::new(
            shared,
            template,
            visibility.clone(),
            source,
            hooks.clone(),
        ));
        let registry = Registry::new(settings.clone(), visibility.clone(), hooks)?;
        let fanout = FanoutEngine::new(classifier.clone(), router.clone());

        Ok(Self {
            settings,
            db,
            classifier,
            visibility,
            router,
            registry,
            fanout,
        })
    }

    /// Runs the registry migrations and installs the clone routine and the
    /// template schema. Safe to repeat.
    pub async fn install(&self) -> Result<(), TenancyError> {
        Migrator::up(self.db.as_ref(), None).await?;
        clone::install(self.db.as_ref(), self.router.shared(), self.router.template()).await
    }

    /// Starts a unit of work scoped to the shared schema.
    pub async fn begin(&self) -> Result<UnitOfWork, TenancyError> {
        Ok(UnitOfWork::begin(self.db.as_ref(), self.router.shared()).await?)
    }

    /// Applies one structural change in its own unit of work, under the
    /// caller's trace id or a fresh one.
    pub async fn apply(&self, change: &StructuralChange) -> Result<FanoutReport, TenancyError> {
        in_trace_context(async {
            let span = tracing::info_span!(
                "unit_of_work",
                trace_id = %current_trace_id().unwrap_or_default()
            );
            self.apply_in_work(change).instrument(span).await
        })
        .await
    }

    async fn apply_in_work(&self, change: &StructuralChange) -> Result<FanoutReport, TenancyError> {
        let mut work = self.begin().await?;
        match self.fanout.apply(&mut work, change).await {
            Ok(report) => {
                work.commit().await?;
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback) = work.rollback().await {
                    tracing::warn!(error = %rollback, "rollback after failed fan-out failed");
                }
                Err(err)
            }
        }
    }

    pub async fn prepare_bulk(
        &self,
        work: &mut UnitOfWork,
        tables: &[&str],
        scope: &BulkScope,
    ) -> Result<ActiveContext, TenancyError> {
        prepare_bulk(&self.router, &self.classifier, &self.settings, work, tables, scope).await
    }

    pub fn settings(&self) -> &TenancyConfig {
        &self.settings
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn classifier(&self) -> &TableClassifier {
        &self.classifier
    }

    pub fn visibility(&self) -> &VisibilityCache {
        &self.visibility
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn fanout(&self) -> &FanoutEngine {
        &self.fanout
    }
}
