//! DNS-over-HTTPS using the JSON API (`application/dns-json`).

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Resolve, ResolveError};
use crate::validators::parse_ipv4;

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status", default)]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(default)]
    data: String,
}

/// Queries one DoH JSON endpoint, e.g. `https://dns.google/resolve`.
#[derive(Debug, Clone)]
pub struct DohJsonResolver {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl DohJsonResolver {
    /// # Errors
    ///
    /// Returns [`ResolveError::Http`] if the endpoint is not an http(s) URL or
    /// the HTTP client cannot be built.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ResolveError> {
        let http_error = |message: String| ResolveError::Http {
            server: endpoint.to_string(),
            message,
        };

        let url = reqwest::Url::parse(endpoint).map_err(|e| http_error(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(http_error(format!("unsupported scheme '{}'", url.scheme())));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| http_error(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
            timeout,
        })
    }

    fn map_request_error(&self, e: &reqwest::Error) -> ResolveError {
        if e.is_timeout() {
            ResolveError::Timeout {
                server: self.endpoint.clone(),
                timeout: self.timeout,
            }
        } else {
            ResolveError::Http {
                server: self.endpoint.clone(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl Resolve for DohJsonResolver {
    fn label(&self) -> String {
        format!("doh:{}", self.endpoint)
    }

    async fn resolve(&self, domain: &str) -> Result<Ipv4Addr, ResolveError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("name", domain), ("type", "A")])
            .header(reqwest::header::ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| self.map_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Http {
                server: self.endpoint.clone(),
                message: format!("status {status}"),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.map_request_error(&e))?;

        first_ipv4_answer(&body)
            .map_err(|message| ResolveError::Protocol {
                server: self.endpoint.clone(),
                message,
            })?
            .ok_or_else(|| ResolveError::NoAnswer {
                server: self.endpoint.clone(),
                domain: domain.to_string(),
            })
    }
}

/// Extracts the first answer whose `data` is an IPv4 address.
///
/// CNAME answers carry a name in `data` and are skipped. A non-zero `Status`
/// (NXDOMAIN, SERVFAIL) yields no answer.
pub(crate) fn first_ipv4_answer(body: &str) -> Result<Option<Ipv4Addr>, String> {
    let response: DohResponse = serde_json::from_str(body).map_err(|e| e.to_string())?;
    if response.status != 0 {
        return Ok(None);
    }
    Ok(response
        .answer
        .iter()
        .find_map(|answer| parse_ipv4(answer.data.trim())))
}
