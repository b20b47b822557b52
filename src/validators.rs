//! Input validation functions for portfwd
//!
//! This module provides centralized validation for rule inputs so that nothing
//! malformed reaches the rule file or an `iptables` argument list.

use std::net::Ipv4Addr;

use crate::core::error::{Error, Result};

/// Minimum recheck interval for domain destinations.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 60;

/// Maximum length of a DNS name in presentation format.
const MAX_DOMAIN_LEN: usize = 253;

/// Parses a dotted-quad IPv4 address.
///
/// Exactly four dot-separated octets, each made only of ASCII digits and in
/// `[0, 255]`. Leading zeros are accepted and read as decimal.
///
/// # Examples
///
/// ```
/// use portfwd::validators::parse_ipv4;
///
/// assert_eq!(parse_ipv4("10.0.0.1").unwrap().octets(), [10, 0, 0, 1]);
/// assert!(parse_ipv4("256.0.0.1").is_none());
/// assert!(parse_ipv4("example.com").is_none());
/// ```
pub fn parse_ipv4(input: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = input.split('.');

    for octet in &mut octets {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = part.parse::<u16>().ok().and_then(|v| u8::try_from(v).ok())?;
    }

    if parts.next().is_some() {
        return None;
    }

    Some(Ipv4Addr::from(octets))
}

/// Returns true when `input` is a dotted-quad IPv4 literal.
pub fn is_ipv4_literal(input: &str) -> bool {
    parse_ipv4(input).is_some()
}

/// Validates the address a rule listens on.
///
/// # Errors
///
/// Returns `Err` if the input is not a dotted-quad IPv4 address.
pub fn validate_listen_ip(input: &str) -> Result<Ipv4Addr> {
    parse_ipv4(input.trim()).ok_or_else(|| Error::InvalidListenIp(input.to_string()))
}

/// Validates a domain name.
///
/// Labels are ASCII alphanumerics and hyphens, 1-63 characters, not starting or
/// ending with a hyphen. A single trailing dot is tolerated.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_domain(input: &str) -> Result<()> {
    let invalid = |reason| Error::InvalidHost {
        host: input.to_string(),
        reason,
    };

    let name = input.strip_suffix('.').unwrap_or(input);
    if name.is_empty() {
        return Err(invalid("empty host"));
    }
    if name.len() > MAX_DOMAIN_LEN {
        return Err(invalid("name longer than 253 characters"));
    }

    for label in name.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > 63 {
            return Err(invalid("label longer than 63 characters"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("only letters, digits, '-' and '.' are allowed"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels cannot start or end with '-'"));
        }
    }

    Ok(())
}

/// Validates a destination host and reports whether it is a domain.
///
/// A host made only of digits and dots must be a valid IPv4 literal; it is
/// never handed to the resolver as a domain.
///
/// # Errors
///
/// Returns `Err` for malformed IPv4 literals and invalid domain names.
pub fn validate_dst_host(input: &str) -> Result<bool> {
    if is_ipv4_literal(input) {
        return Ok(false);
    }

    if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(Error::InvalidHost {
            host: input.to_string(),
            reason: "not a valid IPv4 address",
        });
    }

    validate_domain(input)?;
    Ok(true)
}

/// Validates a domain recheck interval.
///
/// # Errors
///
/// Returns `Err` if the interval is below [`MIN_CHECK_INTERVAL_SECS`].
pub fn validate_check_interval(secs: u64) -> Result<u64> {
    if secs < MIN_CHECK_INTERVAL_SECS {
        Err(Error::InvalidCheckInterval {
            got: secs,
            min: MIN_CHECK_INTERVAL_SECS,
        })
    } else {
        Ok(secs)
    }
}
