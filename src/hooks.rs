//! Ordered activation and creation hooks.
//!
//! Hooks run sequentially in registration order. A failing `Abort` hook stops
//! the triggering operation; a failing `BestEffort` hook is logged and skipped.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::DatabaseTransaction;

use crate::context::{ActiveContext, Principal};
use crate::error::TenancyError;
use crate::models::tenant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookPolicy {
    #[default]
    Abort,
    BestEffort,
}

/// A context change the router is about to make, or has just made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ActiveContext,
    pub to: ActiveContext,
    pub principal: Principal,
}

#[async_trait]
pub trait ActivationHook: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> HookPolicy {
        HookPolicy::Abort
    }

    async fn before_activate(&self, _transition: &Transition) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_activate(&self, _transition: &Transition) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait CreationHook: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> HookPolicy {
        HookPolicy::Abort
    }

    /// Runs once the tenant's schema exists, inside the creating transaction.
    async fn after_create(
        &self,
        conn: &DatabaseTransaction,
        tenant: &tenant::Model,
    ) -> anyhow::Result<()>;
}

#[derive(Clone, Copy)]
enum Phase {
    Before,
    After,
}

#[derive(Default, Clone)]
pub struct Hooks {
    activation: Vec<Arc<dyn ActivationHook>>,
    creation: Vec<Arc<dyn CreationHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_activation(&mut self, hook: Arc<dyn ActivationHook>) -> &mut Self {
        self.activation.push(hook);
        self
    }

    pub fn on_creation(&mut self, hook: Arc<dyn CreationHook>) -> &mut Self {
        self.creation.push(hook);
        self
    }

    pub(crate) async fn before_activate(&self, transition: &Transition) -> Result<(), TenancyError> {
        self.run_activation(Phase::Before, transition).await
    }

    pub(crate) async fn after_activate(&self, transition: &Transition) -> Result<(), TenancyError> {
        self.run_activation(Phase::After, transition).await
    }

    async fn run_activation(&self, phase: Phase, transition: &Transition) -> Result<(), TenancyError> {
        for hook in &self.activation {
            let outcome = match phase {
                Phase::Before => hook.before_activate(transition).await,
                Phase::After => hook.after_activate(transition).await,
            };
            if let Err(err) = outcome {
                settle(hook.name(), hook.policy(), err)?;
            }
        }
        Ok(())
    }

    pub(crate) async fn after_create(
        &self,
        conn: &DatabaseTransaction,
        tenant: &tenant::Model,
    ) -> Result<(), TenancyError> {
        for hook in &self.creation {
            if let Err(err) = hook.after_create(conn, tenant).await {
                settle(hook.name(), hook.policy(), err)?;
            }
        }
        Ok(())
    }
}

fn settle(name: &str, policy: HookPolicy, err: anyhow::Error) -> Result<(), TenancyError> {
    match policy {
        HookPolicy::Abort => Err(TenancyError::Hook {
            hook: name.to_string(),
            source: err.into(),
        }),
        HookPolicy::BestEffort => {
            tracing::warn!(hook = name, error = %err, "best-effort hook failed");
            Ok(())
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field(
                "activation",
                &self.activation.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .field(
                "creation",
                &self.creation.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
