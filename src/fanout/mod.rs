//! # DDL Fan-out Engine
//!
//! Replays structural changes. A change to a shared table runs once against
//! the shared schema; a change to a partitioned table runs in every tenant
//! schema, active or not, and finally in the template so later clones inherit
//! it. The first failing schema aborts the fan-out.

pub mod deferred;
pub mod extract;

use std::sync::Arc;

use metrics::counter;
use sea_orm::{ConnectionTrait, EntityTrait, QueryOrder};
use serde::Serialize;
use tracing::instrument;

use crate::classifier::{TableClass, TableClassifier};
use crate::context::{Principal, UnitOfWork};
use crate::error::TenancyError;
use crate::models::tenant;
use crate::namespace::SchemaName;
use crate::router::Router;
use crate::telemetry::FANOUT_STATEMENTS_TOTAL;

pub use deferred::{Deferred, DeferredQueue};
pub use extract::ChangeKind;

/// One structural statement plus the tables it touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralChange {
    pub kind: ChangeKind,
    pub tables: Vec<String>,
    pub sql: String,
    /// Statements to run once the surrounding batch is done
    pub deferred: Vec<String>,
}

impl StructuralChange {
    pub fn new(kind: ChangeKind, tables: &[&str], sql: impl Into<String>) -> Self {
        Self {
            kind,
            tables: tables.iter().map(|t| t.to_string()).collect(),
            sql: sql.into(),
            deferred: Vec::new(),
        }
    }

    pub fn create_table(table: &str, sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::CreateTable, &[table], sql)
    }

    pub fn alter_table(table: &str, sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::AlterTable, &[table], sql)
    }

    pub fn drop_table(table: &str, sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::DropTable, &[table], sql)
    }

    pub fn add_column(table: &str, sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::AddColumn, &[table], sql)
    }

    pub fn alter_column(table: &str, sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::AlterColumn, &[table], sql)
    }

    pub fn drop_column(table: &str, sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::DropColumn, &[table], sql)
    }

    pub fn create_index(table: &str, sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::CreateIndex, &[table], sql)
    }

    pub fn add_constraint(table: &str, sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::AddConstraint, &[table], sql)
    }

    pub fn create_trigger(table: &str, sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::CreateTrigger, &[table], sql)
    }

    /// A view over `tables`. It is shared only when all of them are.
    pub fn create_view(tables: &[&str], sql: impl Into<String>) -> Self {
        Self::new(ChangeKind::CreateView, tables, sql)
    }

    /// Raw SQL with the target table recognised from the statement text.
    pub fn raw(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let (kind, tables) = extract::extract(&sql);
        Self {
            kind,
            tables,
            sql,
            deferred: Vec::new(),
        }
    }

    /// Replays under the tables of the change that queued it. Statements
    /// queued without tables fall back to recognising them from the text.
    fn from_deferred(deferred: Deferred) -> Self {
        if deferred.tables.is_empty() {
            return Self::raw(deferred.sql);
        }
        let (kind, _) = extract::extract(&deferred.sql);
        Self {
            kind,
            tables: deferred.tables,
            sql: deferred.sql,
            deferred: Vec::new(),
        }
    }

    pub fn with_deferred(mut self, sql: impl Into<String>) -> Self {
        self.deferred.push(sql.into());
        self
    }
}

/// Where one change was executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub class: TableClass,
    /// Schemas the statement ran in, in execution order
    pub schemas: Vec<String>,
    /// Reports of deferred statements flushed after this change
    pub deferred: Vec<FanoutReport>,
}

impl FanoutReport {
    /// Total statement executions, deferred ones included.
    pub fn statements(&self) -> usize {
        self.schemas.len() + self.deferred.iter().map(Self::statements).sum::<usize>()
    }
}

pub struct FanoutEngine {
    classifier: Arc<TableClassifier>,
    router: Arc<Router>,
}

impl FanoutEngine {
    pub fn new(classifier: Arc<TableClassifier>, router: Arc<Router>) -> Self {
        Self { classifier, router }
    }

    pub fn classifier(&self) -> &TableClassifier {
        &self.classifier
    }

    /// Applies one change and then its deferred statements.
    pub async fn apply(
        &self,
        work: &mut UnitOfWork,
        change: &StructuralChange,
    ) -> Result<FanoutReport, TenancyError> {
        let mut batch = self.batch();
        let mut report = batch.apply(work, change).await?;
        report.deferred = batch.flush(work).await?;
        Ok(report)
    }

    /// Starts a batch whose deferred statements run once, on `flush`.
    pub fn batch(&self) -> FanoutBatch<'_> {
        FanoutBatch {
            engine: self,
            deferred: DeferredQueue::new(),
        }
    }

    #[instrument(skip(self, work, change, deferred), fields(kind = ?change.kind, tables = ?change.tables))]
    async fn replay(
        &self,
        work: &mut UnitOfWork,
        change: &StructuralChange,
        deferred: &mut DeferredQueue,
    ) -> Result<FanoutReport, TenancyError> {
        let class = self
            .classifier
            .classify_all(change.tables.iter().map(String::as_str));

        let schemas = match class {
            TableClass::Shared => {
                let shared = self.router.shared().clone();
                self.router.deactivate(work).await?;
                execute(work, &change.sql, "shared")
                    .await
                    .map_err(|err| fanout_failure(&shared, err))?;
                for statement in &change.deferred {
                    deferred.push(statement, &change.tables);
                }
                vec![shared.to_string()]
            }
            TableClass::Partitioned => self.replay_partitioned(work, change, deferred).await?,
        };

        tracing::info!(class = %class, statements = schemas.len(), "structural change applied");
        Ok(FanoutReport {
            class,
            schemas,
            deferred: Vec::new(),
        })
    }

    async fn replay_partitioned(
        &self,
        work: &mut UnitOfWork,
        change: &StructuralChange,
        deferred: &mut DeferredQueue,
    ) -> Result<Vec<String>, TenancyError> {
        // The registry lives in the shared schema; list it from there.
        self.router.deactivate(work).await?;
        let tenants = tenant::Entity::find()
            .order_by_asc(tenant::Column::SchemaName)
            .all(work.connection())
            .await?;

        let mut schemas = Vec::with_capacity(tenants.len() + 1);
        for tenant in tenants {
            let schema = SchemaName::reserved(&tenant.schema_name)?;
            self.execute_in_tenant(work, &schema, &change.sql)
                .await
                .map_err(|err| fanout_failure(&schema, err))?;
            for statement in &change.deferred {
                deferred.push(statement, &change.tables);
            }
            schemas.push(schema.to_string());
        }

        let template = self.router.template().clone();
        self.execute_in_template(work, &change.sql)
            .await
            .map_err(|err| fanout_failure(&template, err))?;
        for statement in &change.deferred {
            deferred.push(statement, &change.tables);
        }
        schemas.push(template.to_string());

        self.router.deactivate(work).await?;
        Ok(schemas)
    }

    async fn execute_in_tenant(
        &self,
        work: &mut UnitOfWork,
        schema: &SchemaName,
        sql: &str,
    ) -> Result<(), TenancyError> {
        self.router.activate_for_maintenance(work, schema).await?;
        execute(work, sql, "tenant").await
    }

    async fn execute_in_template(&self, work: &mut UnitOfWork, sql: &str) -> Result<(), TenancyError> {
        self.router
            .activate_template(work, &Principal::system())
            .await?;
        execute(work, sql, "template").await
    }
}

/// Changes applied together, sharing one deferred-statement queue.
pub struct FanoutBatch<'a> {
    engine: &'a FanoutEngine,
    deferred: DeferredQueue,
}

impl FanoutBatch<'_> {
    pub async fn apply(
        &mut self,
        work: &mut UnitOfWork,
        change: &StructuralChange,
    ) -> Result<FanoutReport, TenancyError> {
        self.engine.replay(work, change, &mut self.deferred).await
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    /// Replays every distinct deferred statement, each fanned out on its own.
    pub async fn flush(mut self, work: &mut UnitOfWork) -> Result<Vec<FanoutReport>, TenancyError> {
        let statements = self.deferred.drain();
        if !statements.is_empty() {
            tracing::debug!(statements = statements.len(), "flushing deferred statements");
        }

        let mut reports = Vec::with_capacity(statements.len());
        for statement in statements {
            let change = StructuralChange::from_deferred(statement);
            // Deferred statements do not queue further work.
            let mut nested = DeferredQueue::new();
            reports.push(self.engine.replay(work, &change, &mut nested).await?);
        }
        Ok(reports)
    }
}

async fn execute(work: &UnitOfWork, sql: &str, target: &'static str) -> Result<(), TenancyError> {
    work.connection().execute_unprepared(sql).await?;
    counter!(FANOUT_STATEMENTS_TOTAL, "target" => target).increment(1);
    Ok(())
}

fn fanout_failure(schema: &SchemaName, err: TenancyError) -> TenancyError {
    tracing::error!(schema = %schema, error = %err, "structural change failed");
    TenancyError::FanoutFailure {
        schema: schema.to_string(),
        source: Box::new(err),
    }
}
