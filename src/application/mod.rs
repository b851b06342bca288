//! Application services: the upstream probe, the cache hierarchy and the
//! delegates that expose them to the host.

pub mod delegate;
pub mod error;
pub mod hierarchy;
pub mod probe;
pub mod sites;

pub use delegate::{
    DelegateError, GatedDelegate, LegacyDelegate, RequestContext, ResourceDelegate, ResourceInfo,
};
pub use hierarchy::{AuthorizeError, CacheHierarchy, CredentialBucket, ResourceBucket, SiteBucket};
pub use probe::{HttpProbe, Probe, ProbeConfig, ProbeFailure, ProbeOutcome};
pub use sites::SiteDirectory;
