//! Sitemap: the configured upstream providers and their URL templates.

use std::collections::BTreeMap;

use thiserror::Error;

const SUFFIX_PLACEHOLDER: &str = "%{suffix}";
const POSITIONAL_PLACEHOLDER: &str = "%s";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template `{template}` has no `%{{suffix}}` or `%s` placeholder")]
    MissingPlaceholder { template: String },
    #[error("template `{template}` has {count} placeholders; exactly one is required")]
    TooManyPlaceholders { template: String, count: usize },
}

/// Upstream URL template with exactly one substitution point for the decoded suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    prefix: String,
    postfix: String,
}

impl UrlTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let count = template.matches(SUFFIX_PLACEHOLDER).count()
            + template.matches(POSITIONAL_PLACEHOLDER).count();
        if count > 1 {
            return Err(TemplateError::TooManyPlaceholders {
                template: template.to_string(),
                count,
            });
        }

        let split = template
            .split_once(SUFFIX_PLACEHOLDER)
            .or_else(|| template.split_once(POSITIONAL_PLACEHOLDER));

        match split {
            Some((prefix, postfix)) => Ok(Self {
                prefix: prefix.to_string(),
                postfix: postfix.to_string(),
            }),
            None => Err(TemplateError::MissingPlaceholder {
                template: template.to_string(),
            }),
        }
    }

    pub fn render(&self, suffix: &str) -> String {
        let mut url = String::with_capacity(self.prefix.len() + suffix.len() + self.postfix.len());
        url.push_str(&self.prefix);
        url.push_str(suffix);
        url.push_str(&self.postfix);
        url
    }
}

/// Mapping of site identifiers to their URL templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteMap {
    templates: BTreeMap<String, UrlTemplate>,
}

impl SiteMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a sitemap from raw `site -> template` pairs, rejecting malformed templates.
    pub fn from_templates<I, K, V>(entries: I) -> Result<Self, (String, TemplateError)>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut templates = BTreeMap::new();
        for (site_id, template) in entries {
            let site_id = site_id.into();
            match UrlTemplate::parse(template.as_ref()) {
                Ok(parsed) => {
                    templates.insert(site_id, parsed);
                }
                Err(err) => return Err((site_id, err)),
            }
        }
        Ok(Self { templates })
    }

    pub fn template(&self, site_id: &str) -> Option<&UrlTemplate> {
        self.templates.get(site_id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn site_ids(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}
