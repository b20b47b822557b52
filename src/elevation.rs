//! Privilege elevation for system operations
//!
//! portfwd only needs root for three things, and only those binaries can be
//! elevated:
//!
//! - **iptables**: Flushing and appending NAT table entries
//! - **sysctl**: Enabling IPv4 forwarding at runtime
//! - **install**: Writing the boot-time sysctl file
//!
//! # Elevation Strategy
//!
//! - **Root**: Commands run directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `PORTFWD_ELEVATION_METHOD`: Force `sudo`, `run0` or `pkexec`. Useful for
//!   the watcher under a sudoers NOPASSWD rule.
//!   Example: `PORTFWD_ELEVATION_METHOD=sudo portfwd watch`
//!
//! - `PORTFWD_TEST_NO_ELEVATION`: Bypass elevation entirely (testing only).
//!
//! Arguments are passed straight to the program, never through a shell.
//!
//! # Example
//!
//! ```no_run
//! use portfwd::elevation::create_elevated_iptables_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_iptables_command("iptables", &["-t", "nat", "-S"])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `PORTFWD_ELEVATION_METHOD`
    #[error("Invalid PORTFWD_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Program path is empty or contains whitespace
    #[error("Refusing to elevate program '{0}'")]
    InvalidProgram(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrap(launcher: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(launcher);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Builds an elevated command. Only the `create_elevated_*` functions call
/// this, so the set of elevated programs stays fixed.
fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if program.is_empty() || program.chars().any(char::is_whitespace) {
        return Err(ElevationError::InvalidProgram(program.to_string()));
    }

    // 1. Test mode
    if std::env::var("PORTFWD_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    // 2. Already root
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 3. Explicit method override
    if let Ok(method) = std::env::var("PORTFWD_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrap(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(wrap("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrap("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrap("pkexec", program, args))
    }
}

/// Creates an elevated `iptables` command.
///
/// `program` is the configured iptables binary (`iptables`, `iptables-legacy`,
/// an absolute path, or the `PORTFWD_IPTABLES_COMMAND` override).
pub fn create_elevated_iptables_command(
    program: &str,
    args: &[&str],
) -> Result<Command, ElevationError> {
    build_elevated_command(program, args)
}

/// Creates an elevated `sysctl` command.
pub fn create_elevated_sysctl_command(
    program: &str,
    args: &[&str],
) -> Result<Command, ElevationError> {
    build_elevated_command(program, args)
}

/// Creates an elevated `install` command, used to write system files.
pub fn create_elevated_install_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command("install", args)
}
