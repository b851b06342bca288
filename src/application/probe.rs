//! Upstream authorization probe.
//!
//! Issues `HEAD` requests with the caller's forwarded credential, following
//! redirects through an explicit bounded state machine.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::LOCATION};
use metrics::{counter, histogram};
use reqwest::{Client, redirect};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::domain::ForwardingHeaders;

pub(crate) const METRIC_PROBE_TOTAL: &str = "i8gate_probe_total";
pub(crate) const METRIC_PROBE_MS: &str = "i8gate_probe_ms";

pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("redirect limit of {limit} exceeded")]
    RedirectLimitExceeded { limit: u32 },
    #[error("upstream answered {status}")]
    UnexpectedStatus { status: StatusCode },
    #[error("redirect {status} without a usable Location header")]
    MissingLocation { status: StatusCode },
    #[error("invalid upstream url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("forwarding header `{name}` cannot be sent: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Authorized,
    /// Upstream refused the credential (401/403).
    Denied { status: StatusCode },
    Failed(ProbeFailure),
}

impl ProbeOutcome {
    pub fn is_authorized(&self) -> bool {
        matches!(self, ProbeOutcome::Authorized)
    }

    fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Authorized => "authorized",
            ProbeOutcome::Denied { .. } => "denied",
            ProbeOutcome::Failed(ProbeFailure::RedirectLimitExceeded { .. }) => "redirect_limit",
            ProbeOutcome::Failed(_) => "failed",
        }
    }
}

/// Checks whether a credential grants access to an upstream URL.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, url: &str, headers: &ForwardingHeaders) -> ProbeOutcome;
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub max_redirects: u32,
    /// Per-hop timeout enforced by the transport.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            timeout: Duration::from_secs(30),
            user_agent: concat!("i8gate/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

enum ProbeState {
    Requesting { url: Url, remaining_hops: u32 },
    Done(ProbeOutcome),
}

/// [`Probe`] over HTTP(S) with manual redirect handling.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    max_redirects: u32,
}

impl HttpProbe {
    pub fn new(config: &ProbeConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect::Policy::none())
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            max_redirects: config.max_redirects,
        })
    }

    async fn step(&self, url: Url, remaining_hops: u32, headers: &HeaderMap) -> ProbeState {
        if remaining_hops == 0 {
            return ProbeState::Done(ProbeOutcome::Failed(ProbeFailure::RedirectLimitExceeded {
                limit: self.max_redirects,
            }));
        }

        debug!(url = %url, remaining_hops, "Probing upstream");
        let response = match self
            .client
            .head(url.clone())
            .headers(headers.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return ProbeState::Done(ProbeOutcome::Failed(ProbeFailure::Transport(
                    err.to_string(),
                )));
            }
        };

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "Upstream responded");

        if status.is_success() {
            return ProbeState::Done(ProbeOutcome::Authorized);
        }
        if status.is_redirection() {
            let next = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|location| url.join(location).ok());
            return match next {
                Some(url) => ProbeState::Requesting {
                    url,
                    remaining_hops: remaining_hops - 1,
                },
                None => ProbeState::Done(ProbeOutcome::Failed(ProbeFailure::MissingLocation {
                    status,
                })),
            };
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return ProbeState::Done(ProbeOutcome::Denied { status });
        }
        ProbeState::Done(ProbeOutcome::Failed(ProbeFailure::UnexpectedStatus {
            status,
        }))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, url: &str, headers: &ForwardingHeaders) -> ProbeOutcome {
        let started_at = Instant::now();
        let outcome = match (Url::parse(url), header_map(headers)) {
            (Err(err), _) => ProbeOutcome::Failed(ProbeFailure::InvalidUrl {
                url: url.to_string(),
                reason: err.to_string(),
            }),
            (_, Err(failure)) => ProbeOutcome::Failed(failure),
            (Ok(url), Ok(headers)) => {
                let mut state = ProbeState::Requesting {
                    url,
                    remaining_hops: self.max_redirects,
                };
                loop {
                    match state {
                        ProbeState::Requesting {
                            url,
                            remaining_hops,
                        } => state = self.step(url, remaining_hops, &headers).await,
                        ProbeState::Done(outcome) => break outcome,
                    }
                }
            }
        };

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        debug!(
            authorized = outcome.is_authorized(),
            outcome = outcome.label(),
            elapsed_ms,
            "Upstream check finished"
        );
        counter!(METRIC_PROBE_TOTAL, "outcome" => outcome.label()).increment(1);
        histogram!(METRIC_PROBE_MS).record(elapsed_ms);
        outcome
    }
}

fn header_map(headers: &ForwardingHeaders) -> Result<HeaderMap, ProbeFailure> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| ProbeFailure::InvalidHeader {
                name: name.clone(),
                reason: err.to_string(),
            })?;
        let header_value =
            HeaderValue::from_str(value).map_err(|err| ProbeFailure::InvalidHeader {
                name: name.clone(),
                reason: err.to_string(),
            })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_headers_become_header_map() {
        let mut headers = ForwardingHeaders::new();
        headers.insert("Authorization".to_string(), "Bearer tok1".to_string());
        let map = header_map(&headers).expect("valid headers");
        assert_eq!(map.get("authorization").map(|v| v.to_str().ok()), Some(Some("Bearer tok1")));
    }

    #[test]
    fn control_characters_in_header_are_rejected() {
        let mut headers = ForwardingHeaders::new();
        headers.insert("Authorization".to_string(), "Bearer a\nb".to_string());
        assert!(matches!(
            header_map(&headers),
            Err(ProbeFailure::InvalidHeader { .. })
        ));
    }

    #[tokio::test]
    async fn unparseable_url_fails_without_network() {
        let probe = HttpProbe::new(&ProbeConfig::default()).expect("client builds");
        let outcome = probe.check("not a url", &ForwardingHeaders::new()).await;
        assert!(matches!(
            outcome,
            ProbeOutcome::Failed(ProbeFailure::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn zero_hop_budget_fails_immediately() {
        let probe = HttpProbe::new(&ProbeConfig {
            max_redirects: 0,
            ..Default::default()
        })
        .expect("client builds");
        let outcome = probe
            .check("http://127.0.0.1:9/", &ForwardingHeaders::new())
            .await;
        assert_eq!(
            outcome,
            ProbeOutcome::Failed(ProbeFailure::RedirectLimitExceeded { limit: 0 })
        );
    }
}
