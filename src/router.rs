//! # Active-Context Router
//!
//! Sole owner of [`ActiveContext`] transitions. Every activation is
//! authorized against the visibility cache, and switching between tenants
//! always passes through the shared-only scope first.

use std::sync::Arc;

use metrics::counter;
use tracing::instrument;

use crate::context::{ActiveContext, Principal, UnitOfWork};
use crate::error::TenancyError;
use crate::hooks::{Hooks, Transition};
use crate::namespace::{SchemaName, set_search_path};
use crate::telemetry::ACTIVATIONS_TOTAL;
use crate::visibility::{VisibilityCache, VisibilitySource};

/// Outcome of re-deriving a context from a stored hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resumed {
    pub context: ActiveContext,
    /// The hint the caller should persist for the next unit of work
    pub hint: Option<String>,
}

pub struct Router {
    shared: SchemaName,
    template: SchemaName,
    visibility: Arc<VisibilityCache>,
    registry: Arc<dyn VisibilitySource>,
    hooks: Arc<Hooks>,
}

impl Router {
    pub fn new(
        shared: SchemaName,
        template: SchemaName,
        visibility: Arc<VisibilityCache>,
        registry: Arc<dyn VisibilitySource>,
        hooks: Arc<Hooks>,
    ) -> Self {
        Self {
            shared,
            template,
            visibility,
            registry,
            hooks,
        }
    }

    pub fn shared(&self) -> &SchemaName {
        &self.shared
    }

    pub fn template(&self) -> &SchemaName {
        &self.template
    }

    pub fn visibility(&self) -> &Arc<VisibilityCache> {
        &self.visibility
    }

    /// Activates `identifier` for `principal`.
    ///
    /// With no identifier, a principal that can see exactly one tenant gets
    /// that tenant; anyone else keeps the current context.
    #[instrument(skip(self, work), fields(principal = %principal.id, schema = identifier))]
    pub async fn activate(
        &self,
        work: &mut UnitOfWork,
        identifier: Option<&str>,
        principal: &Principal,
    ) -> Result<ActiveContext, TenancyError> {
        let result = self.authorize_and_activate(work, identifier, principal).await;

        let outcome = match &result {
            Ok(_) => "activated",
            Err(TenancyError::TemplateActivationForbidden) => "template_forbidden",
            Err(TenancyError::Forbidden { .. }) => "forbidden",
            Err(_) => "error",
        };
        counter!(ACTIVATIONS_TOTAL, "outcome" => outcome).increment(1);

        result
    }

    async fn authorize_and_activate(
        &self,
        work: &mut UnitOfWork,
        identifier: Option<&str>,
        principal: &Principal,
    ) -> Result<ActiveContext, TenancyError> {
        if identifier == Some(self.template.as_str()) {
            return Err(TenancyError::TemplateActivationForbidden);
        }

        let visible = self.visibility.get(principal).await?;

        let identifier = match identifier {
            Some(identifier) => identifier.to_string(),
            None => {
                let mut only = visible.iter();
                match (only.next(), only.next()) {
                    (Some(single), None) => single.clone(),
                    _ => {
                        tracing::debug!(visible = visible.len(), "no tenant selected");
                        return Ok(work.context().clone());
                    }
                }
            }
        };

        if !visible.contains(&identifier) {
            tracing::info!(schema = %identifier, "activation refused");
            return Err(TenancyError::Forbidden { identifier });
        }

        let schema = SchemaName::reserved(&identifier)?;
        self.transition(work, ActiveContext::Tenant(schema), *principal)
            .await
    }

    /// Selects the template. Requires a privileged principal.
    #[instrument(skip(self, work), fields(principal = %principal.id))]
    pub async fn activate_template(
        &self,
        work: &mut UnitOfWork,
        principal: &Principal,
    ) -> Result<ActiveContext, TenancyError> {
        if !principal.privileged {
            counter!(ACTIVATIONS_TOTAL, "outcome" => "forbidden").increment(1);
            return Err(TenancyError::Forbidden {
                identifier: self.template.to_string(),
            });
        }

        let result = self
            .transition(work, ActiveContext::Template, *principal)
            .await;
        counter!(ACTIVATIONS_TOTAL, "outcome" => if result.is_ok() { "activated" } else { "error" })
            .increment(1);
        result
    }

    /// Elevated activation for structural and bulk operations. Skips the
    /// visibility check, so inactive tenants can be reached, but still refuses
    /// the template identifier.
    pub async fn activate_for_maintenance(
        &self,
        work: &mut UnitOfWork,
        schema: &SchemaName,
    ) -> Result<ActiveContext, TenancyError> {
        if schema == &self.template {
            return Err(TenancyError::TemplateActivationForbidden);
        }
        self.transition(work, ActiveContext::Tenant(schema.clone()), Principal::system())
            .await
    }

    /// Returns the unit of work to the shared-only scope. Idempotent.
    pub async fn deactivate(&self, work: &mut UnitOfWork) -> Result<(), TenancyError> {
        set_search_path(work.connection(), &[&self.shared]).await?;
        work.set_context(ActiveContext::Unset);
        Ok(())
    }

    /// Re-derives the context from a hint stored by a previous unit of work.
    ///
    /// A hint naming a tenant that no longer exists is cleared and the unit of
    /// work stays unset; any other failure propagates.
    pub async fn resume(
        &self,
        work: &mut UnitOfWork,
        hint: Option<&str>,
        principal: &Principal,
    ) -> Result<Resumed, TenancyError> {
        let Some(hint) = hint else {
            let context = self.activate(work, None, principal).await?;
            let hint = context.tenant().map(SchemaName::to_string);
            return Ok(Resumed { context, hint });
        };

        match self.activate(work, Some(hint), principal).await {
            Ok(context) => Ok(Resumed {
                context,
                hint: Some(hint.to_string()),
            }),
            Err(TenancyError::Forbidden { identifier }) => {
                if self.registry.tenant_exists(&identifier).await? {
                    return Err(TenancyError::Forbidden { identifier });
                }

                let stale = TenancyError::NotFound { identifier };
                tracing::info!(error = %stale, "clearing stale tenant hint");
                self.deactivate(work).await?;
                Ok(Resumed {
                    context: ActiveContext::Unset,
                    hint: None,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn transition(
        &self,
        work: &mut UnitOfWork,
        target: ActiveContext,
        principal: Principal,
    ) -> Result<ActiveContext, TenancyError> {
        let transition = Transition {
            from: work.context().clone(),
            to: target.clone(),
            principal,
        };
        self.hooks.before_activate(&transition).await?;

        if !work.context().is_unset() {
            self.deactivate(work).await?;
        }

        match &target {
            ActiveContext::Tenant(schema) => {
                set_search_path(work.connection(), &[schema, &self.shared]).await?
            }
            ActiveContext::Template => {
                set_search_path(work.connection(), &[&self.template, &self.shared]).await?
            }
            ActiveContext::Unset => set_search_path(work.connection(), &[&self.shared]).await?,
        }
        work.set_context(target.clone());
        tracing::debug!(from = %transition.from, to = %target, "context activated");

        // A refused activation must not leave the unit of work scoped.
        if let Err(err) = self.hooks.after_activate(&transition).await {
            self.deactivate(work).await?;
            return Err(err);
        }
        Ok(target)
    }
}
