use std::path::PathBuf;
use thiserror::Error;

use crate::core::resolver::ResolveError;
use crate::elevation::ElevationError;

/// Core error types for portfwd
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Port token is neither a single port nor a valid `start-end` range
    #[error("Invalid port spec '{token}': {reason}")]
    InvalidPortSpec { token: String, reason: &'static str },

    /// Source and destination port specs cannot be mapped one-to-one
    #[error(
        "Port arity mismatch: source covers {src_len} port(s), destination covers {dst_len} port(s)"
    )]
    PortArityMismatch { src_len: u32, dst_len: u32 },

    /// Listen address is not a dotted-quad IPv4 address
    #[error("Invalid listen IP '{0}'")]
    InvalidListenIp(String),

    /// Destination is neither an IPv4 literal nor a domain name
    #[error("Invalid destination host '{host}': {reason}")]
    InvalidHost { host: String, reason: &'static str },

    /// Recheck interval below the minimum
    #[error("Invalid check interval {got}s (minimum {min}s)")]
    InvalidCheckInterval { got: u64, min: u64 },

    /// Protocol token is not one of tcp, udp, both
    #[error("Invalid protocol '{0}' (expected tcp, udp or both)")]
    InvalidProtocol(String),

    /// 1-based rule index outside the current list
    #[error("Rule index {index} out of range (1..={len})")]
    OutOfRange { index: usize, len: usize },

    /// Every resolver failed for a domain
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolveError),

    /// iptables/sysctl command execution failed
    #[error("NAT error: {message}")]
    Nat {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] ElevationError),

    /// Another process holds the rule file
    #[error("Rule file {path} is locked by another process")]
    Locked { path: PathBuf },

    /// Rule file backup operation failed
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    /// Apply failed; the previous rules were written back and re-applied
    #[error("Apply failed, previous rules restored: {cause}")]
    RolledBack { cause: Box<Error> },

    /// Apply failed and so did re-applying the previous rules
    #[error("Apply failed ({cause}) and restoring previous rules also failed ({restore})")]
    RollbackFailed { cause: Box<Error>, restore: Box<Error> },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors caused by user input rather than the environment.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPortSpec { .. }
                | Error::PortArityMismatch { .. }
                | Error::InvalidListenIp(_)
                | Error::InvalidHost { .. }
                | Error::InvalidCheckInterval { .. }
                | Error::InvalidProtocol(_)
                | Error::OutOfRange { .. }
        )
    }

    /// The kernel-side error for apply failures, looking through rollback wrappers.
    pub fn nat_stderr(&self) -> Option<&str> {
        match self {
            Error::Nat { stderr, .. } => stderr.as_deref(),
            Error::RolledBack { cause } | Error::RollbackFailed { cause, .. } => cause.nat_stderr(),
            _ => None,
        }
    }
}

/// Rule file backup errors
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Backup not found: {0}")]
    NotFound(PathBuf),

    #[error("Backup is missing its checksum file")]
    MissingChecksum,
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct NatErrorPattern;

impl NatErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify the NAT table")
                .with_suggestion("Run portfwd as root, or allow sudo/run0 for iptables")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or set nat.iptables_path in the settings file");
        }

        if lower.contains("table does not exist") || lower.contains("can't initialize iptables table") {
            return ErrorTranslation::new("The kernel NAT table is unavailable")
                .with_suggestion("Load the NAT module: sudo modprobe iptable_nat")
                .with_suggestion("On nftables-only systems install iptables-nft");
        }

        if lower.contains("resource temporarily unavailable") || lower.contains("xtables lock") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        if lower.contains("invalid port") || lower.contains("port range") {
            return ErrorTranslation::new("Invalid port or port range")
                .with_suggestion("Port numbers must be between 1 and 65535")
                .with_suggestion("For port ranges, ensure start < end")
                .with_suggestion("Example valid ranges: 8080, 8000-9000");
        }

        if lower.contains("bad argument") || lower.contains("unknown option") {
            return ErrorTranslation::new("iptables rejected the generated command")
                .with_suggestion("Check that the xt_DNAT and multiport extensions are available")
                .with_suggestion("Run 'portfwd show' to inspect the generated commands");
        }

        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("Invalid IP address in a forwarding rule")
                .with_suggestion("Check listen_ip and resolved_ip in the rule file");
        }

        ErrorTranslation::new(format!("NAT error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -t nat -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iptables_missing_command() {
        let translation = NatErrorPattern::match_error("command not found: iptables");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3);
    }

    #[test]
    fn test_permission_error() {
        let translation = NatErrorPattern::match_error(
            "iptables v1.8.9 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)",
        );
        assert!(translation.user_message.contains("permissions"));
    }

    #[test]
    fn test_xtables_lock() {
        let translation = NatErrorPattern::match_error(
            "Another app is currently holding the xtables lock. Resource temporarily unavailable",
        );
        assert!(translation.user_message.contains("xtables lock"));
    }

    #[test]
    fn test_generic_fallback_keeps_message() {
        let translation = NatErrorPattern::match_error("something odd");
        assert!(translation.user_message.contains("something odd"));
    }

    #[test]
    fn test_validation_classification() {
        assert!(Error::PortArityMismatch { src_len: 1, dst_len: 101 }.is_validation());
        assert!(Error::OutOfRange { index: 5, len: 3 }.is_validation());
        assert!(!Error::Internal("x".into()).is_validation());
    }

    #[test]
    fn test_nat_stderr_through_rollback() {
        let err = Error::RolledBack {
            cause: Box::new(Error::Nat {
                message: "iptables failed".into(),
                stderr: Some("Bad argument".into()),
                exit_code: Some(2),
            }),
        };
        assert_eq!(err.nat_stderr(), Some("Bad argument"));
    }
}
