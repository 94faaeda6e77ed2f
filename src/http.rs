//! # Activation hint extraction
//!
//! Pulls the tenant a request asks for out of the request. The hint is only
//! a request: the router decides whether the switch is allowed.

use axum::{
    extract::{FromRequestParts, RawPathParams},
    http::{StatusCode, request::Parts},
};
use serde::Serialize;

use crate::error::ApiError;

/// Header carrying the requested tenant schema.
pub const TENANT_SCHEMA_HEADER: &str = "x-tenant-schema";

/// Path and query parameter name for the requested tenant schema.
pub const SCHEMA_PARAM: &str = "schema";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HintSource {
    Path,
    Header,
    Query,
}

/// The tenant a request asks to activate, if any.
///
/// Sources are checked in order: the `schema` path parameter of a dedicated
/// switch route, the `x-tenant-schema` header, then the `schema` query
/// parameter. Empty values count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationHint(pub Option<(String, HintSource)>);

impl ActivationHint {
    pub fn schema(&self) -> Option<&str> {
        self.0.as_ref().map(|(schema, _)| schema.as_str())
    }

    pub fn source(&self) -> Option<HintSource> {
        self.0.as_ref().map(|(_, source)| *source)
    }
}

impl<S> FromRequestParts<S> for ActivationHint
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Ok(params) = RawPathParams::from_request_parts(parts, state).await
            && let Some((_, value)) = params.iter().find(|(name, _)| *name == SCHEMA_PARAM)
            && !value.is_empty()
        {
            return Ok(Self(Some((value.to_string(), HintSource::Path))));
        }

        if let Some(value) = parts.headers.get(TENANT_SCHEMA_HEADER) {
            let value = value.to_str().map_err(|_| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "VALIDATION_FAILED",
                    "Invalid tenant schema header",
                )
                .with_details(serde_json::json!({ "x-tenant-schema": "must be visible ASCII" }))
            })?;
            let value = value.trim();
            if !value.is_empty() {
                return Ok(Self(Some((value.to_string(), HintSource::Header))));
            }
        }

        let from_query = parts.uri.query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(name, value)| name == SCHEMA_PARAM && !value.is_empty())
                .map(|(_, value)| value.into_owned())
        });

        Ok(Self(from_query.map(|schema| (schema, HintSource::Query))))
    }
}
