//! Per-unit-of-work state: the principal acting, the active namespace, and the
//! transaction that pins one pooled connection for the whole unit of work.

use std::fmt;

use sea_orm::{DatabaseTransaction, DbErr, TransactionTrait};
use serde::Serialize;
use uuid::Uuid;

use crate::namespace::{SchemaName, set_search_path};

/// Which namespace the unit of work currently resolves unqualified names in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "schema", rename_all = "snake_case")]
pub enum ActiveContext {
    #[default]
    Unset,
    Tenant(SchemaName),
    Template,
}

impl ActiveContext {
    pub fn tenant(&self) -> Option<&SchemaName> {
        match self {
            ActiveContext::Tenant(schema) => Some(schema),
            _ => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, ActiveContext::Unset)
    }
}

impl fmt::Display for ActiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveContext::Unset => f.write_str("unset"),
            ActiveContext::Tenant(schema) => write!(f, "tenant:{schema}"),
            ActiveContext::Template => f.write_str("template"),
        }
    }
}

/// The identity a unit of work acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Principal {
    pub id: Uuid,
    /// Sees every active tenant and may select the template
    pub privileged: bool,
}

impl Principal {
    pub fn member(id: Uuid) -> Self {
        Self {
            id,
            privileged: false,
        }
    }

    pub fn privileged(id: Uuid) -> Self {
        Self {
            id,
            privileged: true,
        }
    }

    /// Privileged identity used by maintenance commands.
    pub fn system() -> Self {
        Self::privileged(Uuid::nil())
    }
}

/// One database transaction plus its [`ActiveContext`].
///
/// Scope changes are issued with `SET LOCAL`, so committing or rolling back
/// hands the connection back to the pool with its default search path. Only
/// the router changes the context.
pub struct UnitOfWork {
    txn: DatabaseTransaction,
    context: ActiveContext,
    shared: SchemaName,
}

impl UnitOfWork {
    /// Starts a transaction scoped to the shared schema.
    pub async fn begin<C>(db: &C, shared: &SchemaName) -> Result<Self, DbErr>
    where
        C: TransactionTrait,
    {
        let txn = db.begin().await?;
        set_search_path(&txn, &[shared]).await?;
        Ok(Self {
            txn,
            context: ActiveContext::Unset,
            shared: shared.clone(),
        })
    }

    pub fn context(&self) -> &ActiveContext {
        &self.context
    }

    pub fn shared_schema(&self) -> &SchemaName {
        &self.shared
    }

    /// The connection every statement of this unit of work must run on.
    pub fn connection(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub(crate) fn set_context(&mut self, context: ActiveContext) {
        self.context = context;
    }

    pub async fn commit(self) -> Result<(), DbErr> {
        tracing::trace!(context = %self.context, "unit of work committed");
        self.txn.commit().await
    }

    pub async fn rollback(self) -> Result<(), DbErr> {
        tracing::trace!(context = %self.context, "unit of work rolled back");
        self.txn.rollback().await
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("context", &self.context)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}
