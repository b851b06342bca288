//! Credential extraction from inbound request headers.
//!
//! A request may carry at most one recognized credential header. Whichever
//! header was used, exactly one `Authorization` header is forwarded upstream.

use std::collections::BTreeMap;

use axum::http::HeaderMap;

use super::error::GateError;

/// Headers forwarded with the upstream probe and returned to the host.
pub type ForwardingHeaders = BTreeMap<String, String>;

pub const FORWARDED_HEADER: &str = "Authorization";
const VALUE_PLACEHOLDER: &str = "%{value}";

/// A recognized inbound header and the template rendering its forwarded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialScheme {
    /// Lower-cased header name.
    pub header: &'static str,
    pub template: &'static str,
}

impl CredentialScheme {
    pub fn render(&self, value: &str) -> String {
        self.template.replace(VALUE_PLACEHOLDER, value)
    }
}

pub const CREDENTIAL_SCHEMES: &[CredentialScheme] = &[
    CredentialScheme {
        header: "x-dgi-i8-helper-authorization-token",
        template: "Bearer %{value}",
    },
    CredentialScheme {
        header: "authorization",
        template: "%{value}",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub header_name: String,
    pub raw_value: String,
}

impl Credential {
    fn scheme(&self) -> Option<&'static CredentialScheme> {
        CREDENTIAL_SCHEMES
            .iter()
            .find(|scheme| scheme.header == self.header_name)
    }

    pub fn forwarding_headers(&self) -> ForwardingHeaders {
        let mut headers = ForwardingHeaders::new();
        if let Some(scheme) = self.scheme() {
            headers.insert(FORWARDED_HEADER.to_string(), scheme.render(&self.raw_value));
        }
        headers
    }

    pub fn cache_key(&self) -> String {
        format!("{}::{}", self.header_name, self.raw_value)
    }
}

/// Find the single recognized credential header, if any.
///
/// Header names compare case-insensitively. More than one recognized header
/// (or the same one repeated) is an [`GateError::AmbiguousCredential`].
pub fn extract_credential(headers: &HeaderMap) -> Result<Option<Credential>, GateError> {
    let mut matched = Vec::new();
    for (name, value) in headers {
        if CREDENTIAL_SCHEMES
            .iter()
            .any(|scheme| scheme.header == name.as_str())
        {
            matched.push((name, value));
        }
    }

    if matched.len() > 1 {
        return Err(GateError::AmbiguousCredential {
            expected: CREDENTIAL_SCHEMES.iter().map(|s| s.header).collect(),
            found: matched
                .iter()
                .map(|(name, _)| name.as_str().to_string())
                .collect(),
        });
    }

    let Some((name, value)) = matched.pop() else {
        return Ok(None);
    };
    let raw_value = value
        .to_str()
        .map_err(|_| GateError::InvalidCredential {
            header: name.as_str().to_string(),
        })?
        .to_string();

    Ok(Some(Credential {
        header_name: name.as_str().to_string(),
        raw_value,
    }))
}

/// Key of the credential-level bucket; anonymous callers share the empty key.
pub fn cache_key(credential: Option<&Credential>) -> String {
    credential.map(Credential::cache_key).unwrap_or_default()
}

pub fn forwarding_headers(credential: Option<&Credential>) -> ForwardingHeaders {
    credential
        .map(Credential::forwarding_headers)
        .unwrap_or_default()
}
