//! Name resolution for domain destinations
//!
//! Resolution goes through the [`Resolve`] trait so the rule store and the
//! watcher never depend on a concrete transport. [`ChainResolver`] tries its
//! members strictly in order and returns the first valid IPv4 answer:
//!
//! 1. Direct DNS queries ([`DirectResolver`]) to two public resolver pairs
//! 2. DNS-over-HTTPS JSON endpoints ([`DohJsonResolver`]) as fallback
//!
//! Resolvers are stateless: they never touch the rule store, callers own the
//! write-back.

mod dns;
mod doh;

pub use dns::DirectResolver;
pub use doh::DohJsonResolver;

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::validators::parse_ipv4;

/// Default direct resolvers, in priority order (two public pairs).
pub const DEFAULT_DIRECT_RESOLVERS: [&str; 4] =
    ["1.1.1.1:53", "1.0.0.1:53", "8.8.8.8:53", "8.8.4.4:53"];

/// Default DNS-over-HTTPS JSON endpoints, in priority order.
pub const DEFAULT_DOH_ENDPOINTS: [&str; 2] = [
    "https://cloudflare-dns.com/dns-query",
    "https://dns.google/resolve",
];

/// Per-query timeout for direct DNS.
pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request timeout for DNS-over-HTTPS.
pub const DEFAULT_DOH_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolution failures
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{server}: timed out after {timeout:?}")]
    Timeout { server: String, timeout: Duration },

    #[error("{server}: I/O error: {source}")]
    Io {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{server}: malformed DNS message: {message}")]
    Protocol { server: String, message: String },

    #[error("{server}: HTTP error: {message}")]
    Http { server: String, message: String },

    #[error("{server}: no IPv4 answer for {domain}")]
    NoAnswer { server: String, domain: String },

    #[error("'{domain}' is not a valid domain name")]
    InvalidDomain { domain: String },

    #[error("all {attempts} resolvers failed for {domain}")]
    Exhausted { domain: String, attempts: usize },
}

/// Resolves a domain to one IPv4 address.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Short label for logs, e.g. `dns:1.1.1.1:53`.
    fn label(&self) -> String;

    async fn resolve(&self, domain: &str) -> Result<Ipv4Addr, ResolveError>;
}

/// Tries resolvers in priority order, first valid answer wins.
pub struct ChainResolver {
    resolvers: Vec<Box<dyn Resolve>>,
}

impl ChainResolver {
    pub fn new(resolvers: Vec<Box<dyn Resolve>>) -> Self {
        Self { resolvers }
    }

    /// Builds the chain from settings: direct resolvers first, then DoH.
    pub fn from_settings(settings: &crate::config::ResolverSettings) -> Self {
        let mut resolvers: Vec<Box<dyn Resolve>> = Vec::new();

        for server in &settings.direct {
            resolvers.push(Box::new(DirectResolver::new(
                *server,
                settings.direct_timeout(),
            )));
        }

        for endpoint in &settings.doh {
            match DohJsonResolver::new(endpoint, settings.doh_timeout()) {
                Ok(resolver) => resolvers.push(Box::new(resolver)),
                Err(e) => warn!(endpoint = %endpoint, error = %e, "skipping DoH endpoint"),
            }
        }

        Self::new(resolvers)
    }

    /// Chain with the built-in public resolvers and timeouts.
    pub fn with_defaults() -> Self {
        Self::from_settings(&crate::config::ResolverSettings::default())
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[async_trait]
impl Resolve for ChainResolver {
    fn label(&self) -> String {
        format!("chain({})", self.resolvers.len())
    }

    async fn resolve(&self, domain: &str) -> Result<Ipv4Addr, ResolveError> {
        if let Some(addr) = parse_ipv4(domain) {
            return Ok(addr);
        }

        for resolver in &self.resolvers {
            match resolver.resolve(domain).await {
                Ok(addr) => {
                    debug!(domain, resolver = %resolver.label(), %addr, "resolved");
                    return Ok(addr);
                }
                Err(e) => {
                    warn!(domain, resolver = %resolver.label(), error = %e, "resolver failed, trying next");
                }
            }
        }

        Err(ResolveError::Exhausted {
            domain: domain.to_string(),
            attempts: self.resolvers.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{MockResolver, failing, fixed};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let first = failing("dns-1");
        let second = failing("dns-2");
        let third = fixed("dns-3", Ipv4Addr::new(9, 9, 9, 9));
        let doh = fixed("doh-1", Ipv4Addr::new(8, 8, 8, 8));

        let calls = [
            Arc::clone(&first.calls),
            Arc::clone(&second.calls),
            Arc::clone(&third.calls),
            Arc::clone(&doh.calls),
        ];

        let chain = ChainResolver::new(vec![
            Box::new(first),
            Box::new(second),
            Box::new(third),
            Box::new(doh),
        ]);

        let addr = chain.resolve("example.com").await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(9, 9, 9, 9));

        let counts: Vec<usize> = calls.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(counts, vec![1, 1, 1, 0]);
    }

    #[tokio::test]
    async fn test_falls_back_to_last_resolver() {
        let chain = ChainResolver::new(vec![
            Box::new(failing("dns-1")),
            Box::new(failing("dns-2")),
            Box::new(failing("dns-3")),
            Box::new(failing("dns-4")),
            Box::new(failing("doh-1")),
            Box::new(fixed("doh-2", Ipv4Addr::new(1, 2, 3, 4))),
        ]);

        assert_eq!(
            chain.resolve("example.com").await.unwrap(),
            Ipv4Addr::new(1, 2, 3, 4)
        );
    }

    #[tokio::test]
    async fn test_exhausted() {
        let chain = ChainResolver::new(vec![Box::new(failing("a")), Box::new(failing("b"))]);
        let err = chain.resolve("example.com").await.unwrap_err();
        assert!(matches!(err, ResolveError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_ip_literal_skips_resolvers() {
        let mock = MockResolver::new("never");
        let calls = Arc::clone(&mock.calls);
        let chain = ChainResolver::new(vec![Box::new(mock)]);

        assert_eq!(
            chain.resolve("10.1.2.3").await.unwrap(),
            Ipv4Addr::new(10, 1, 2, 3)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_default_chain_order() {
        let chain = ChainResolver::with_defaults();
        assert_eq!(chain.len(), 6);
        assert_eq!(chain.resolvers[0].label(), "dns:1.1.1.1:53");
        assert_eq!(chain.resolvers[3].label(), "dns:8.8.4.4:53");
        assert!(chain.resolvers[4].label().contains("cloudflare-dns.com"));
        assert!(chain.resolvers[5].label().contains("dns.google"));
    }
}
