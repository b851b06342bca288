//! Three-tier authorization cache: site → credential → resource.
//!
//! The site tier is an LRU bucket sized to the live sitemap and created on
//! first use. Each site owns a TTL bucket of credentials, and each credential
//! a TTL bucket of resource decisions populated by the upstream probe. Only
//! successful probes are cached; every denial or failure is re-probed on the
//! next request.

use std::sync::{Arc, OnceLock};

use axum::http::{HeaderMap, StatusCode};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cache::{CacheBucket, CacheConfig};
use crate::domain::{
    Credential, GateError, ResourceIdentifier, cache_key, extract_credential, forwarding_headers,
};

use super::probe::{Probe, ProbeFailure, ProbeOutcome};
use super::sites::SiteDirectory;

/// Why a resource decision was not cached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizeError {
    #[error("upstream denied access with {status}")]
    Denied { status: StatusCode },
    #[error(transparent)]
    Probe(#[from] ProbeFailure),
}

pub type ResourceBucket = CacheBucket<String, bool, AuthorizeError>;
pub type CredentialBucket = CacheBucket<String, Arc<ResourceBucket>, AuthorizeError>;
pub type SiteBucket = CacheBucket<String, Arc<CredentialBucket>, AuthorizeError>;

pub struct CacheHierarchy {
    sites: OnceLock<SiteBucket>,
    directory: Arc<SiteDirectory>,
    probe: Arc<dyn Probe>,
    config: CacheConfig,
}

impl CacheHierarchy {
    pub fn new(directory: Arc<SiteDirectory>, probe: Arc<dyn Probe>, config: CacheConfig) -> Self {
        Self {
            sites: OnceLock::new(),
            directory,
            probe,
            config,
        }
    }

    /// The site tier, if any request has created it yet.
    pub fn site_cache(&self) -> Option<&SiteBucket> {
        self.sites.get()
    }

    /// Decide whether the request may access a gated resource.
    ///
    /// Returns `Ok(None)` when the identifier is not of the gated scheme and
    /// the caller should fall back to its default authorization. Credential
    /// errors are returned before any cache is touched; every other failure
    /// is logged and denies the request.
    pub async fn authorize(
        &self,
        raw_identifier: &str,
        headers: &HeaderMap,
    ) -> Result<Option<bool>, GateError> {
        let Some(identifier) = ResourceIdentifier::parse(raw_identifier) else {
            return Ok(None);
        };
        let credential = extract_credential(headers)?;
        Ok(Some(
            self.authorize_resolved(&identifier, credential.as_ref())
                .await,
        ))
    }

    pub async fn authorize_resolved(
        &self,
        identifier: &ResourceIdentifier,
        credential: Option<&Credential>,
    ) -> bool {
        let url = match identifier.resolve(&self.directory.current()) {
            Ok(url) => url,
            Err(err) => {
                warn!(site = %identifier.site_id, error = %err, "Cannot resolve gated resource");
                return false;
            }
        };

        match self.lookup(identifier, credential, url.clone()).await {
            Ok(authorized) => authorized,
            Err(AuthorizeError::Denied { status }) => {
                warn!(
                    site = %identifier.site_id,
                    url = %url,
                    status = status.as_u16(),
                    "Upstream denied access"
                );
                false
            }
            Err(err) => {
                error!(
                    site = %identifier.site_id,
                    url = %url,
                    error = %err,
                    "Authorization probe failed"
                );
                false
            }
        }
    }

    fn site_bucket(&self) -> &SiteBucket {
        let bucket = self.sites.get_or_init(|| {
            debug!(capacity = self.directory.len(), "Creating site cache");
            SiteBucket::lru("sites", self.directory.capacity())
        });
        // Follows sitemap reloads.
        bucket.set_capacity(self.directory.capacity());
        bucket
    }

    async fn lookup(
        &self,
        identifier: &ResourceIdentifier,
        credential: Option<&Credential>,
        url: String,
    ) -> Result<bool, AuthorizeError> {
        let site_id = identifier.site_id.clone();
        let credential_capacity = self.config.credential_capacity_non_zero();
        let credential_ttl = self.config.credential_ttl();
        let credentials = self
            .site_bucket()
            .get_or_populate(site_id.clone(), move || async move {
                debug!(site = %site_id, "Creating credential bucket");
                Ok(Arc::new(CredentialBucket::ttl(
                    "credentials",
                    credential_capacity,
                    credential_ttl,
                )))
            })
            .await?;

        let site_id = identifier.site_id.clone();
        let resource_capacity = self.config.resource_capacity_non_zero();
        let resource_ttl = self.config.resource_ttl();
        let resources = credentials
            .get_or_populate(cache_key(credential), move || async move {
                debug!(site = %site_id, "Creating resource bucket for credential");
                Ok(Arc::new(ResourceBucket::ttl(
                    "resources",
                    resource_capacity,
                    resource_ttl,
                )))
            })
            .await?;

        let probe = Arc::clone(&self.probe);
        let headers = forwarding_headers(credential);
        resources
            .get_or_populate(url.clone(), move || async move {
                match probe.check(&url, &headers).await {
                    ProbeOutcome::Authorized => Ok(true),
                    ProbeOutcome::Denied { status } => Err(AuthorizeError::Denied { status }),
                    ProbeOutcome::Failed(failure) => Err(AuthorizeError::Probe(failure)),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::{Engine, engine::general_purpose::STANDARD};

    use super::*;
    use crate::domain::{ForwardingHeaders, SiteMap};

    struct ScriptedProbe {
        outcome: ProbeOutcome,
        calls: AtomicUsize,
        seen: Mutex<Vec<(String, ForwardingHeaders)>>,
    }

    impl ScriptedProbe {
        fn new(outcome: ProbeOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn check(&self, url: &str, headers: &ForwardingHeaders) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .expect("probe log lock")
                .push((url.to_string(), headers.clone()));
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.outcome.clone()
        }
    }

    fn identifier(suffix: &str, site: &str) -> String {
        format!("{}~{site}", STANDARD.encode(suffix))
    }

    fn hierarchy(sites: &[(&str, &str)], probe: Arc<ScriptedProbe>) -> CacheHierarchy {
        let map = SiteMap::from_templates(sites.iter().copied()).expect("valid sitemap");
        CacheHierarchy::new(
            Arc::new(SiteDirectory::new(map)),
            probe,
            CacheConfig::default(),
        )
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {token}").parse().expect("valid header"),
        );
        headers
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_cached() {
        let probe = ScriptedProbe::new(ProbeOutcome::Authorized);
        let gate = hierarchy(&[("siteA", "https://upstream.example/%s")], probe.clone());
        let id = identifier("img42", "siteA");

        assert_eq!(gate.authorize(&id, &bearer("tok1")).await, Ok(Some(true)));
        assert_eq!(gate.authorize(&id, &bearer("tok1")).await, Ok(Some(true)));
        assert_eq!(probe.calls(), 1);

        let seen = probe.seen.lock().expect("probe log lock");
        assert_eq!(seen[0].0, "https://upstream.example/img42");
        assert_eq!(seen[0].1["Authorization"], "Bearer tok1");
    }

    #[tokio::test(start_paused = true)]
    async fn success_expires_after_resource_ttl() {
        let probe = ScriptedProbe::new(ProbeOutcome::Authorized);
        let gate = hierarchy(&[("siteA", "https://upstream.example/%s")], probe.clone());
        let id = identifier("img42", "siteA");

        assert_eq!(gate.authorize(&id, &HeaderMap::new()).await, Ok(Some(true)));
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(gate.authorize(&id, &HeaderMap::new()).await, Ok(Some(true)));
        assert_eq!(probe.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(gate.authorize(&id, &HeaderMap::new()).await, Ok(Some(true)));
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn denial_is_never_cached() {
        let probe = ScriptedProbe::new(ProbeOutcome::Denied {
            status: StatusCode::FORBIDDEN,
        });
        let gate = hierarchy(&[("siteA", "https://upstream.example/%s")], probe.clone());
        let id = identifier("img42", "siteA");

        assert_eq!(gate.authorize(&id, &bearer("bad")).await, Ok(Some(false)));
        assert_eq!(gate.authorize(&id, &bearer("bad")).await, Ok(Some(false)));
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_have_separate_buckets() {
        let probe = ScriptedProbe::new(ProbeOutcome::Authorized);
        let gate = hierarchy(&[("siteA", "https://upstream.example/%s")], probe.clone());
        let id = identifier("img42", "siteA");

        gate.authorize(&id, &bearer("tok1")).await.expect("ok");
        gate.authorize(&id, &bearer("tok2")).await.expect("ok");
        gate.authorize(&id, &HeaderMap::new()).await.expect("ok");
        gate.authorize(&id, &HeaderMap::new()).await.expect("ok");
        assert_eq!(probe.calls(), 3);

        let sites = gate.site_cache().expect("site cache created");
        assert_eq!(sites.len(), 1);
    }

    #[tokio::test]
    async fn ambiguous_credential_touches_no_cache() {
        let probe = ScriptedProbe::new(ProbeOutcome::Authorized);
        let gate = hierarchy(&[("siteA", "https://upstream.example/%s")], probe.clone());
        let mut headers = bearer("tok1");
        headers.insert(
            "x-dgi-i8-helper-authorization-token",
            "tok1".parse().expect("valid header"),
        );

        let err = gate
            .authorize(&identifier("img42", "siteA"), &headers)
            .await
            .expect_err("ambiguous");
        assert!(matches!(err, GateError::AmbiguousCredential { .. }));
        assert!(gate.site_cache().is_none());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn foreign_identifier_is_not_handled() {
        let probe = ScriptedProbe::new(ProbeOutcome::Authorized);
        let gate = hierarchy(&[("siteA", "https://upstream.example/%s")], probe.clone());

        assert_eq!(
            gate.authorize("plainIdWithoutTilde", &HeaderMap::new()).await,
            Ok(None)
        );
        assert!(gate.site_cache().is_none());
    }

    #[tokio::test]
    async fn unknown_site_denies_without_probing() {
        let probe = ScriptedProbe::new(ProbeOutcome::Authorized);
        let gate = hierarchy(&[("siteA", "https://upstream.example/%s")], probe.clone());

        assert_eq!(
            gate.authorize(&identifier("img42", "siteB"), &HeaderMap::new())
                .await,
            Ok(Some(false))
        );
        assert_eq!(probe.calls(), 0);
        assert!(gate.site_cache().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn site_tier_tracks_sitemap_size() {
        let probe = ScriptedProbe::new(ProbeOutcome::Authorized);
        let directory = Arc::new(SiteDirectory::new(
            SiteMap::from_templates([("a", "http://a/%s"), ("b", "http://b/%s")])
                .expect("valid sitemap"),
        ));
        let gate = CacheHierarchy::new(directory.clone(), probe, CacheConfig::default());

        gate.authorize(&identifier("x", "a"), &HeaderMap::new())
            .await
            .expect("ok");
        gate.authorize(&identifier("x", "b"), &HeaderMap::new())
            .await
            .expect("ok");
        assert_eq!(gate.site_cache().map(|c| c.len()), Some(2));

        directory.replace(SiteMap::from_templates([("a", "http://a/%s")]).expect("valid"));
        gate.authorize(&identifier("x", "a"), &HeaderMap::new())
            .await
            .expect("ok");

        let sites = gate.site_cache().expect("site cache created");
        assert_eq!(sites.capacity().get(), 1);
        assert_eq!(sites.len(), 1);
    }
}
