//! Host-facing resolution and authorization delegates.
//!
//! [`GatedDelegate`] decorates another delegate: gated identifiers are
//! answered here, everything else goes to the wrapped implementation.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::domain::{
    ForwardingHeaders, GateError, ResourceIdentifier, extract_credential, forwarding_headers,
};

use super::hierarchy::CacheHierarchy;
use super::sites::SiteDirectory;

/// Inbound request as seen by the image server.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub identifier: String,
    pub request_headers: HeaderMap,
}

/// Where and how the host should fetch the source resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub uri: String,
    pub headers: ForwardingHeaders,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegateError {
    #[error(transparent)]
    Gate(#[from] GateError),
}

#[async_trait]
pub trait ResourceDelegate: Send + Sync {
    async fn resource_info(&self, ctx: &RequestContext) -> Result<ResourceInfo, DelegateError>;

    async fn pre_authorize(&self, ctx: &RequestContext) -> Result<bool, DelegateError>;
}

/// Default host behaviour for identifiers outside the gated scheme.
///
/// The identifier is appended to a fixed prefix and assumed to carry its
/// own authorization, so every request is pre-authorized.
#[derive(Debug, Clone, Default)]
pub struct LegacyDelegate {
    url_prefix: String,
}

impl LegacyDelegate {
    pub fn new(url_prefix: impl Into<String>) -> Self {
        Self {
            url_prefix: url_prefix.into(),
        }
    }
}

#[async_trait]
impl ResourceDelegate for LegacyDelegate {
    async fn resource_info(&self, ctx: &RequestContext) -> Result<ResourceInfo, DelegateError> {
        let identifier = percent_decode_str(&ctx.identifier).decode_utf8_lossy();
        Ok(ResourceInfo {
            uri: format!("{}{}", self.url_prefix, identifier),
            headers: ForwardingHeaders::new(),
        })
    }

    async fn pre_authorize(&self, _ctx: &RequestContext) -> Result<bool, DelegateError> {
        Ok(true)
    }
}

pub struct GatedDelegate<D> {
    inner: D,
    hierarchy: Arc<CacheHierarchy>,
    directory: Arc<SiteDirectory>,
}

impl<D: ResourceDelegate> GatedDelegate<D> {
    pub fn new(inner: D, hierarchy: Arc<CacheHierarchy>, directory: Arc<SiteDirectory>) -> Self {
        Self {
            inner,
            hierarchy,
            directory,
        }
    }

    pub fn hierarchy(&self) -> &CacheHierarchy {
        &self.hierarchy
    }
}

#[async_trait]
impl<D: ResourceDelegate> ResourceDelegate for GatedDelegate<D> {
    async fn resource_info(&self, ctx: &RequestContext) -> Result<ResourceInfo, DelegateError> {
        let Some(identifier) = ResourceIdentifier::parse(&ctx.identifier) else {
            return self.inner.resource_info(ctx).await;
        };

        let uri = identifier.resolve(&self.directory.current())?;
        debug!(site = %identifier.site_id, uri = %uri, "Site resolved gated resource");

        let credential = extract_credential(&ctx.request_headers)?;
        Ok(ResourceInfo {
            uri,
            headers: forwarding_headers(credential.as_ref()),
        })
    }

    async fn pre_authorize(&self, ctx: &RequestContext) -> Result<bool, DelegateError> {
        match self
            .hierarchy
            .authorize(&ctx.identifier, &ctx.request_headers)
            .await?
        {
            Some(authorized) => Ok(authorized),
            None => self.inner.pre_authorize(ctx).await,
        }
    }
}
