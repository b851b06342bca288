use thiserror::Error;

/// Failures raised while interpreting a gated request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("too many credential headers: only one of [{}] expected, found [{}]", expected.join(", "), found.join(", "))]
    AmbiguousCredential {
        expected: Vec<&'static str>,
        found: Vec<String>,
    },
    #[error("credential header `{header}` is not valid visible ASCII")]
    InvalidCredential { header: String },
    #[error("resource suffix `{suffix}` could not be decoded: {reason}")]
    Decode { suffix: String, reason: String },
    #[error("site `{site_id}` is not configured")]
    UnknownSite { site_id: String },
}

impl GateError {
    pub fn decode(suffix: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            suffix: suffix.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_site(site_id: impl Into<String>) -> Self {
        Self::UnknownSite {
            site_id: site_id.into(),
        }
    }
}
