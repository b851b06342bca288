//! Domain layer: identifiers, credentials and the sitemap they resolve against.

pub mod credential;
pub mod error;
pub mod identifier;
pub mod site;

pub use credential::{
    CREDENTIAL_SCHEMES, Credential, CredentialScheme, ForwardingHeaders, cache_key,
    extract_credential, forwarding_headers,
};
pub use error::GateError;
pub use identifier::{IDENTIFIER_DELIMITER, ResourceIdentifier};
pub use site::{SiteMap, TemplateError, UrlTemplate};
