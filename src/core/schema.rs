//! Rule file line formats
//!
//! The rule file has gone through three line layouts, all `|`-delimited:
//!
//! | fields | layout |
//! |--------|--------|
//! | 4 | `src_port\|dst_ip\|dst_port\|protocol` |
//! | 5 | `listen_ip\|src_port\|dst_ip\|dst_port\|protocol` |
//! | 9 | `listen_ip\|src_port\|dst_host\|dst_port\|protocol\|resolved_ip\|check_interval\|last_checked\|is_domain` |
//!
//! Each layout has its own decoder. The field count picks the decoder once, and
//! every decoder produces a canonical [`Rule`]; nothing generation-specific
//! leaves this module. Only the 9-field layout is ever written.

use thiserror::Error;

use crate::core::rule::{DEFAULT_CHECK_INTERVAL_SECS, Protocol, Rule};
use crate::validators::{MIN_CHECK_INTERVAL_SECS, is_ipv4_literal};

/// Field separator
pub const SEPARATOR: char = '|';

/// Header written at the top of every saved rule file.
pub const CANONICAL_HEADER: &str = "\
# portfwd forwarding rules
# listen_ip|src_port|dst_host|dst_port|protocol|resolved_ip|check_interval|last_checked|is_domain
#   listen_ip       0.0.0.0 for any local address
#   src_port        single port or start-end range
#   dst_host        IPv4 address or domain name
#   dst_port        single port or range of the same width as src_port
#   protocol        tcp, udp or both
#   resolved_ip     address currently used for the DNAT target
#   check_interval  seconds between re-resolutions of a domain (min 60)
#   last_checked    unix timestamp of the last resolution attempt
#   is_domain       true when dst_host is a domain name
";

/// Which layout a line was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Generation {
    #[strum(serialize = "4-field")]
    Legacy,
    #[strum(serialize = "5-field")]
    Scoped,
    #[strum(serialize = "9-field")]
    Canonical,
}

/// Why a data line could not be decoded
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("expected 4, 5 or 9 fields, found {0}")]
    FieldCount(usize),

    #[error("missing {0}")]
    EmptyField(&'static str),

    #[error("invalid {field} '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{0}")]
    Rule(String),
}

/// A successfully decoded line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    pub rule: Rule,
    pub generation: Generation,
}

struct LegacyLine<'a> {
    src_port: &'a str,
    dst_ip: &'a str,
    dst_port: &'a str,
    protocol: &'a str,
}

struct ScopedLine<'a> {
    listen_ip: &'a str,
    src_port: &'a str,
    dst_ip: &'a str,
    dst_port: &'a str,
    protocol: &'a str,
}

struct CanonicalLine<'a> {
    listen_ip: &'a str,
    src_port: &'a str,
    dst_host: &'a str,
    dst_port: &'a str,
    protocol: &'a str,
    resolved_ip: &'a str,
    check_interval: &'a str,
    last_checked: &'a str,
}

enum LineFormat<'a> {
    Legacy(LegacyLine<'a>),
    Scoped(ScopedLine<'a>),
    Canonical(CanonicalLine<'a>),
}

impl<'a> LineFormat<'a> {
    fn split(line: &'a str) -> Result<Self, LineError> {
        let fields: Vec<&str> = line.split(SEPARATOR).map(str::trim).collect();

        match fields[..] {
            [src_port, dst_ip, dst_port, protocol] => Ok(LineFormat::Legacy(LegacyLine {
                src_port,
                dst_ip,
                dst_port,
                protocol,
            })),
            [listen_ip, src_port, dst_ip, dst_port, protocol] => {
                Ok(LineFormat::Scoped(ScopedLine {
                    listen_ip,
                    src_port,
                    dst_ip,
                    dst_port,
                    protocol,
                }))
            }
            // is_domain is always recomputed from dst_host
            [
                listen_ip,
                src_port,
                dst_host,
                dst_port,
                protocol,
                resolved_ip,
                check_interval,
                last_checked,
                _is_domain,
            ] => Ok(LineFormat::Canonical(CanonicalLine {
                listen_ip,
                src_port,
                dst_host,
                dst_port,
                protocol,
                resolved_ip,
                check_interval,
                last_checked,
            })),
            _ => Err(LineError::FieldCount(fields.len())),
        }
    }

    fn generation(&self) -> Generation {
        match self {
            LineFormat::Legacy(_) => Generation::Legacy,
            LineFormat::Scoped(_) => Generation::Scoped,
            LineFormat::Canonical(_) => Generation::Canonical,
        }
    }

    fn into_rule(self) -> Result<Rule, LineError> {
        match self {
            LineFormat::Legacy(line) => line.decode(),
            LineFormat::Scoped(line) => line.decode(),
            LineFormat::Canonical(line) => line.decode(),
        }
    }
}

impl LegacyLine<'_> {
    /// Predates listen addresses: forwards from every local address.
    fn decode(self) -> Result<Rule, LineError> {
        ScopedLine {
            listen_ip: "0.0.0.0",
            src_port: self.src_port,
            dst_ip: self.dst_ip,
            dst_port: self.dst_port,
            protocol: self.protocol,
        }
        .decode()
    }
}

impl ScopedLine<'_> {
    fn decode(self) -> Result<Rule, LineError> {
        build_rule(
            self.listen_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.protocol,
        )
    }
}

impl CanonicalLine<'_> {
    fn decode(self) -> Result<Rule, LineError> {
        let mut rule = build_rule(
            self.listen_ip,
            self.src_port,
            self.dst_host,
            self.dst_port,
            self.protocol,
        )?;

        if !rule.is_domain {
            rule.resolved_ip = rule.dst_host.clone();
        } else if is_ipv4_literal(self.resolved_ip) {
            rule.resolved_ip = self.resolved_ip.to_string();
        }

        rule.check_interval_secs = if self.check_interval.is_empty() {
            DEFAULT_CHECK_INTERVAL_SECS
        } else {
            self.check_interval
                .parse::<u64>()
                .map_err(|_| LineError::InvalidField {
                    field: "check_interval",
                    value: self.check_interval.to_string(),
                })?
                .max(MIN_CHECK_INTERVAL_SECS)
        };

        rule.last_checked_at = if self.last_checked.is_empty() {
            0
        } else {
            self.last_checked
                .parse::<i64>()
                .map_err(|_| LineError::InvalidField {
                    field: "last_checked",
                    value: self.last_checked.to_string(),
                })?
        };

        Ok(rule)
    }
}

fn build_rule(
    listen_ip: &str,
    src_port: &str,
    dst_host: &str,
    dst_port: &str,
    protocol: &str,
) -> Result<Rule, LineError> {
    for (field, value) in [
        ("listen_ip", listen_ip),
        ("src_port", src_port),
        ("dst_host", dst_host),
        ("dst_port", dst_port),
        ("protocol", protocol),
    ] {
        if value.is_empty() {
            return Err(LineError::EmptyField(field));
        }
    }

    let protocol = Protocol::parse(protocol).map_err(|_| LineError::InvalidField {
        field: "protocol",
        value: protocol.to_string(),
    })?;

    Rule::new(listen_ip, src_port, dst_host, dst_port, protocol)
        .map_err(|e| LineError::Rule(e.to_string()))
}

/// True for lines that carry a rule (not blank, not a `#` comment).
pub fn is_data_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// Decodes one data line in any of the three layouts.
///
/// # Errors
///
/// Returns `Err` for an unknown field count, an empty required field, or a
/// field that fails rule validation.
pub fn decode_line(line: &str) -> Result<DecodedLine, LineError> {
    let format = LineFormat::split(line.trim())?;
    let generation = format.generation();
    let rule = format.into_rule()?;
    Ok(DecodedLine { rule, generation })
}

/// Encodes a rule in the 9-field layout.
pub fn encode_rule(rule: &Rule) -> String {
    format!(
        "{listen}|{src}|{host}|{dst}|{proto}|{resolved}|{interval}|{checked}|{domain}",
        listen = rule.listen_ip,
        src = rule.src_ports,
        host = rule.dst_host,
        dst = rule.dst_ports,
        proto = rule.protocol,
        resolved = rule.resolved_ip,
        interval = rule.check_interval_secs,
        checked = rule.last_checked_at,
        domain = rule.is_domain,
    )
}
