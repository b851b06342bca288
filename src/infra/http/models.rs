use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::ForwardingHeaders;

/// A header sent once, or several times with distinct values.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            HeaderValues::One(value) => std::slice::from_ref(value),
            HeaderValues::Many(values) => values,
        };
        values.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DelegateRequest {
    pub identifier: String,
    #[serde(default)]
    pub request_headers: BTreeMap<String, HeaderValues>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceInfoResponse {
    pub uri: String,
    pub headers: ForwardingHeaders,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreAuthorizeResponse {
    pub authorized: bool,
}
