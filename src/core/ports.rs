//! Port spec parsing and source/destination compatibility
//!
//! A port spec is either a single port (`8080`) or an inclusive range
//! (`8000-9000`, start strictly below end). Forwarding maps ports one-to-one, so
//! a rule pairs either two single ports or two ranges of equal width.

use std::fmt;
use std::str::FromStr;

use crate::core::error::{Error, Result};

/// Whether a port spec names one port or a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PortKind {
    #[strum(serialize = "single")]
    Single,
    #[strum(serialize = "range")]
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    Single(u16),
    Range { start: u16, end: u16 },
}

impl PortSpec {
    /// Parses a port token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPortSpec`] unless the token is `N` with
    /// `N in [1, 65535]`, or `A-B` with `A in [1, 65535]`, `B <= 65535` and `A < B`.
    pub fn parse(token: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidPortSpec {
            token: token.to_string(),
            reason,
        };

        if let Some((start, end)) = token.split_once('-') {
            let start = parse_port_number(start).ok_or_else(|| invalid("range start is not a number"))?;
            let end = parse_port_number(end).ok_or_else(|| invalid("range end is not a number"))?;

            if !(1..=65535).contains(&start) {
                return Err(invalid("range start must be between 1 and 65535"));
            }
            if end > 65535 {
                return Err(invalid("range end must not exceed 65535"));
            }
            if start >= end {
                return Err(invalid("range start must be lower than range end"));
            }

            return Ok(PortSpec::Range {
                start: to_port(start).ok_or_else(|| invalid("range start must be between 1 and 65535"))?,
                end: to_port(end).ok_or_else(|| invalid("range end must not exceed 65535"))?,
            });
        }

        let port = parse_port_number(token).ok_or_else(|| invalid("not a port number or range"))?;
        if !(1..=65535).contains(&port) {
            return Err(invalid("port must be between 1 and 65535"));
        }

        to_port(port)
            .map(PortSpec::Single)
            .ok_or_else(|| invalid("port must be between 1 and 65535"))
    }

    pub const fn kind(&self) -> PortKind {
        match self {
            PortSpec::Single(_) => PortKind::Single,
            PortSpec::Range { .. } => PortKind::Range,
        }
    }

    pub const fn start(&self) -> u16 {
        match *self {
            PortSpec::Single(port) => port,
            PortSpec::Range { start, .. } => start,
        }
    }

    pub const fn end(&self) -> u16 {
        match *self {
            PortSpec::Single(port) => port,
            PortSpec::Range { end, .. } => end,
        }
    }

    /// Number of ports covered (`end - start + 1`).
    pub const fn width(&self) -> u32 {
        self.end() as u32 - self.start() as u32 + 1
    }

    /// Kernel match syntax: `start:end` for ranges, the bare port otherwise.
    pub fn to_kernel_range(&self) -> String {
        match *self {
            PortSpec::Single(port) => port.to_string(),
            PortSpec::Range { start, end } => format!("{start}:{end}"),
        }
    }
}

/// Digits only, no sign or whitespace. Returns `None` on overflow.
fn parse_port_number(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn to_port(value: u32) -> Option<u16> {
    u16::try_from(value).ok()
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(port) => write!(f, "{port}"),
            PortSpec::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Checks that a source spec can be mapped onto a destination spec.
///
/// # Errors
///
/// Returns [`Error::PortArityMismatch`] with both widths unless both specs are
/// single ports, or both are ranges of the same width.
pub fn check_pair(src: &PortSpec, dst: &PortSpec) -> Result<()> {
    let compatible = match (src, dst) {
        (PortSpec::Single(_), PortSpec::Single(_)) => true,
        (PortSpec::Range { .. }, PortSpec::Range { .. }) => src.width() == dst.width(),
        _ => false,
    };

    if compatible {
        Ok(())
    } else {
        Err(Error::PortArityMismatch {
            src_len: src.width(),
            dst_len: dst.width(),
        })
    }
}

/// Parses both tokens and checks that they pair up.
pub fn validate_pair(src: &str, dst: &str) -> Result<(PortSpec, PortSpec)> {
    let src = PortSpec::parse(src)?;
    let dst = PortSpec::parse(dst)?;
    check_pair(&src, &dst)?;
    Ok((src, dst))
}

/// Rewrites `start-end` into the kernel's `start:end`; single ports pass through.
pub fn to_kernel_range(token: &str) -> String {
    token.replacen('-', ":", 1)
}
