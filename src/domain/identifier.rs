//! Gated resource identifiers of the form `base64(suffix) ~ site`.

use base64::{Engine, engine::general_purpose::STANDARD};
use percent_encoding::percent_decode_str;

use super::error::GateError;
use super::site::SiteMap;

pub const IDENTIFIER_DELIMITER: char = '~';

/// An identifier that routes to a configured upstream site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentifier {
    pub site_id: String,
    pub suffix_encoded: String,
}

impl ResourceIdentifier {
    /// Parse a raw (URL-escaped) identifier.
    ///
    /// Returns `None` when the identifier does not split into exactly two
    /// parts; such identifiers belong to the legacy resolution path.
    pub fn parse(raw: &str) -> Option<Self> {
        let unescaped = percent_decode_str(raw).decode_utf8_lossy();
        let mut parts: Vec<&str> = unescaped.split(IDENTIFIER_DELIMITER).collect();
        while parts.last().is_some_and(|part| part.is_empty()) {
            parts.pop();
        }

        match parts.as_slice() {
            [suffix, site_id] => Some(Self {
                site_id: (*site_id).to_string(),
                suffix_encoded: (*suffix).to_string(),
            }),
            _ => None,
        }
    }

    /// Decode the base64 suffix into the real upstream path segment.
    pub fn decode_suffix(&self) -> Result<String, GateError> {
        let bytes = STANDARD
            .decode(self.suffix_encoded.as_bytes())
            .map_err(|err| GateError::decode(&self.suffix_encoded, err.to_string()))?;
        String::from_utf8(bytes)
            .map_err(|err| GateError::decode(&self.suffix_encoded, err.to_string()))
    }

    /// Resolve the upstream URL through the site's template.
    pub fn resolve(&self, sites: &SiteMap) -> Result<String, GateError> {
        let template = sites
            .template(&self.site_id)
            .ok_or_else(|| GateError::unknown_site(&self.site_id))?;
        let suffix = self.decode_suffix()?;
        Ok(template.render(&suffix))
    }
}
