//! Forwarding rule data structures
//!
//! A [`Rule`] forwards traffic arriving on a listen address and source port (or
//! range) to a destination host and port (or range). Destinations given as a
//! domain carry a cached resolved address that the reconciliation watcher keeps
//! current.
//!
//! # Example
//!
//! ```
//! use portfwd::core::rule::{Protocol, Rule};
//!
//! let rule = Rule::new("0.0.0.0", "8000-9000", "10.0.0.5", "18000-19000", Protocol::Both).unwrap();
//! assert!(!rule.is_domain);
//! assert_eq!(rule.resolved_ip, "10.0.0.5");
//! ```

use std::net::Ipv4Addr;

use crate::core::error::{Error, Result};
use crate::core::ports::{self, PortSpec};
use crate::validators::{self, parse_ipv4};

/// Default recheck cadence for domain destinations.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;

/// Transport protocol(s) a rule forwards.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    /// Both TCP and UDP
    #[default]
    #[strum(serialize = "both")]
    Both,
}

impl Protocol {
    pub const fn includes_tcp(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Both)
    }

    pub const fn includes_udp(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Both)
    }

    /// Parses a protocol token, case-insensitively.
    pub fn parse(token: &str) -> Result<Self> {
        token
            .trim()
            .parse()
            .map_err(|_| Error::InvalidProtocol(token.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// `0.0.0.0` matches any local address
    pub listen_ip: Ipv4Addr,
    pub src_ports: PortSpec,
    /// IPv4 literal or domain name, as entered
    pub dst_host: String,
    pub dst_ports: PortSpec,
    pub protocol: Protocol,
    /// Address used in the DNAT target. Equals `dst_host` for IPv4 literals and
    /// for domains that have never resolved.
    pub resolved_ip: String,
    pub is_domain: bool,
    pub check_interval_secs: u64,
    /// Unix timestamp of the last resolution attempt, 0 if never
    pub last_checked_at: i64,
}

impl Rule {
    /// Creates a validated rule with the default check interval.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the listen IP, either port spec, their pairing, or the
    /// destination host is invalid.
    pub fn new(
        listen_ip: &str,
        src_ports: &str,
        dst_host: &str,
        dst_ports: &str,
        protocol: Protocol,
    ) -> Result<Self> {
        let listen_ip = validators::validate_listen_ip(listen_ip)?;
        let (src_ports, dst_ports) = ports::validate_pair(src_ports, dst_ports)?;
        let dst_host = dst_host.trim();
        let is_domain = validators::validate_dst_host(dst_host)?;

        Ok(Self {
            listen_ip,
            src_ports,
            dst_host: dst_host.to_string(),
            dst_ports,
            protocol,
            resolved_ip: dst_host.to_string(),
            is_domain,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            last_checked_at: 0,
        })
    }

    /// Sets the recheck interval.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `secs` is below the 60 second minimum.
    pub fn with_check_interval(mut self, secs: u64) -> Result<Self> {
        self.check_interval_secs = validators::validate_check_interval(secs)?;
        Ok(self)
    }

    pub fn is_wildcard_listen(&self) -> bool {
        self.listen_ip.is_unspecified()
    }

    /// The address to DNAT to, if one is known.
    pub fn resolved_addr(&self) -> Option<Ipv4Addr> {
        parse_ipv4(&self.resolved_ip)
    }

    /// True for domain rules that have no usable cached address yet.
    pub fn needs_resolution(&self) -> bool {
        self.is_domain && self.resolved_addr().is_none()
    }

    /// True when a domain rule's recheck interval has elapsed at `now`, or it
    /// has never resolved.
    pub fn is_due(&self, now: i64) -> bool {
        let interval = i64::try_from(self.check_interval_secs).unwrap_or(i64::MAX);
        self.is_domain
            && (self.needs_resolution() || now.saturating_sub(self.last_checked_at) >= interval)
    }

    /// Records a successful resolution. Returns true if the address changed.
    pub fn record_resolution(&mut self, addr: Ipv4Addr, now: i64) -> bool {
        let addr = addr.to_string();
        let changed = self.resolved_ip != addr;
        if changed {
            self.resolved_ip = addr;
        }
        self.last_checked_at = now;
        changed
    }

    /// Short human-readable form, e.g. `0.0.0.0:8080 -> example.com:80 (tcp)`.
    pub fn summary(&self) -> String {
        let target = if self.is_domain {
            format!("{}:{} [{}]", self.dst_host, self.dst_ports, self.resolved_ip)
        } else {
            format!("{}:{}", self.dst_host, self.dst_ports)
        };
        format!(
            "{}:{} -> {} ({})",
            self.listen_ip, self.src_ports, target, self.protocol
        )
    }
}
