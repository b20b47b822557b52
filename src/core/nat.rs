//! NAT table compilation and application
//!
//! The whole forwarding state is rebuilt on every apply: both nat chains are
//! flushed, a masquerade entry is appended, then one DNAT entry per rule and
//! transport. There is no incremental diffing and no rollback at this layer;
//! callers that need one use [`crate::core::transaction`].
//!
//! Compilation is pure ([`compile`]), execution goes through [`NatBackend`] so
//! tests can record operations instead of running `iptables`.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::NatSettings;
use crate::core::error::{Error, Result};
use crate::core::rule::Rule;
use crate::elevation;

/// Persisted forwarding setting
const IP_FORWARD_LINE: &str = "net.ipv4.ip_forward=1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum NatChain {
    #[strum(serialize = "PREROUTING")]
    Prerouting,
    #[strum(serialize = "POSTROUTING")]
    Postrouting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Transport {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

/// One `iptables -t nat` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatOp {
    FlushChain(NatChain),
    Masquerade,
    Dnat {
        transport: Transport,
        /// `None` matches every local address
        listen: Option<Ipv4Addr>,
        /// Kernel match syntax, `8080` or `8000:9000`
        dport: String,
        /// `ip:port` or `ip:start-end`
        to: String,
    },
}

impl NatOp {
    /// Arguments for the iptables binary.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-t".into(), "nat".into()];

        match self {
            NatOp::FlushChain(chain) => {
                args.extend(["-F".into(), chain.to_string()]);
            }
            NatOp::Masquerade => {
                args.extend([
                    "-A".into(),
                    NatChain::Postrouting.to_string(),
                    "-j".into(),
                    "MASQUERADE".into(),
                ]);
            }
            NatOp::Dnat {
                transport,
                listen,
                dport,
                to,
            } => {
                args.extend(["-A".into(), NatChain::Prerouting.to_string()]);
                if let Some(listen) = listen {
                    args.extend(["-d".into(), listen.to_string()]);
                }
                args.extend([
                    "-p".into(),
                    transport.to_string(),
                    "--dport".into(),
                    dport.clone(),
                    "-j".into(),
                    "DNAT".into(),
                    "--to-destination".into(),
                    to.clone(),
                ]);
            }
        }

        args
    }
}

impl fmt::Display for NatOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_args().join(" "))
    }
}

/// The address a rule compiles to, or `None` for unresolved domains.
fn compile_target(rule: &Rule) -> Option<Ipv4Addr> {
    let addr = rule.resolved_addr();
    if addr.is_none() {
        warn!(
            "Skipping rule {}: {} has not resolved yet",
            rule.summary(),
            rule.dst_host
        );
    }
    addr
}

fn rule_ops(rule: &Rule, target: Ipv4Addr) -> impl Iterator<Item = NatOp> + '_ {
    let listen = (!rule.is_wildcard_listen()).then_some(rule.listen_ip);
    let dport = rule.src_ports.to_kernel_range();
    let to = format!("{target}:{}", rule.dst_ports);

    [
        rule.protocol.includes_tcp().then_some(Transport::Tcp),
        rule.protocol.includes_udp().then_some(Transport::Udp),
    ]
    .into_iter()
    .flatten()
    .map(move |transport| NatOp::Dnat {
        transport,
        listen,
        dport: dport.clone(),
        to: to.clone(),
    })
}

/// Translates rules into the full, ordered operation list.
///
/// Domain rules without a resolved address are skipped.
pub fn compile(rules: &[Rule]) -> Vec<NatOp> {
    let mut ops = vec![
        NatOp::FlushChain(NatChain::Prerouting),
        NatOp::FlushChain(NatChain::Postrouting),
        NatOp::Masquerade,
    ];

    for rule in rules {
        if let Some(target) = compile_target(rule) {
            ops.extend(rule_ops(rule, target));
        }
    }

    ops
}

/// Human-readable command listing for a dry run.
pub fn render_script(rules: &[Rule], program: &str) -> String {
    let skipped: Vec<&Rule> = rules.iter().filter(|r| r.resolved_addr().is_none()).collect();

    let mut out = format!(
        "# {} rule(s), {} skipped (unresolved)\n",
        rules.len(),
        skipped.len()
    );
    for rule in skipped {
        out.push_str(&format!("# skipped: {}\n", rule.summary()));
    }
    for op in compile(rules) {
        out.push_str(program);
        out.push(' ');
        out.push_str(&op.to_string());
        out.push('\n');
    }
    out
}

/// Runs NAT operations against the kernel
#[async_trait]
pub trait NatBackend: Send + Sync {
    async fn execute(&self, op: &NatOp) -> Result<()>;
}

/// Runs operations through the iptables binary, elevated as needed
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    program: String,
}

impl IptablesBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_settings(settings: &NatSettings) -> Self {
        Self::new(settings.iptables_program())
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl NatBackend for IptablesBackend {
    async fn execute(&self, op: &NatOp) -> Result<()> {
        let args = op.to_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        debug!("Running {} {}", self.program, op);

        let output = elevation::create_elevated_iptables_command(&self.program, &arg_refs)?
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Nat {
                message: format!("Failed to run {}: {e}", self.program),
                stderr: Some(e.to_string()),
                exit_code: None,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{} {} failed: {}", self.program, op, stderr);
            Err(Error::Nat {
                message: format!("{} {} failed", self.program, op),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

/// Keeps IPv4 forwarding on, at runtime and across reboots
#[derive(Debug, Clone)]
pub struct IpForwarding {
    pub proc_path: PathBuf,
    pub sysctl_conf: PathBuf,
    pub sysctl_program: String,
}

impl IpForwarding {
    pub fn from_settings(settings: &NatSettings) -> Self {
        Self {
            proc_path: settings.ip_forward_proc.clone(),
            sysctl_conf: settings.sysctl_conf.clone(),
            sysctl_program: settings.sysctl_path.clone(),
        }
    }

    pub async fn is_enabled(&self) -> Result<bool> {
        let value = tokio::fs::read_to_string(&self.proc_path).await?;
        Ok(value.trim() == "1")
    }

    /// Enables forwarding if it is off, and persists it if the boot file lacks it.
    pub async fn ensure(&self) -> Result<()> {
        if !self.is_enabled().await? {
            info!("Enabling IPv4 forwarding");
            self.run_sysctl().await?;
        }
        self.persist().await
    }

    async fn run_sysctl(&self) -> Result<()> {
        let output = elevation::create_elevated_sysctl_command(
            &self.sysctl_program,
            &["-w", IP_FORWARD_LINE],
        )?
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Nat {
            message: format!("Failed to run {}: {e}", self.sysctl_program),
            stderr: Some(e.to_string()),
            exit_code: None,
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Nat {
                message: "Failed to enable IPv4 forwarding".to_string(),
                stderr: Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
                exit_code: output.status.code(),
            })
        }
    }

    /// Appends the forwarding line to the boot sysctl file once.
    async fn persist(&self) -> Result<()> {
        let current = match tokio::fs::read_to_string(&self.sysctl_conf).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if current.contains(IP_FORWARD_LINE) {
            return Ok(());
        }

        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(IP_FORWARD_LINE);
        updated.push('\n');

        // Staged without privileges, installed into place as root
        let staged = tempfile::NamedTempFile::new()?;
        tokio::fs::write(staged.path(), updated.as_bytes()).await?;

        let staged_path = staged.path().to_string_lossy().to_string();
        let target = self.sysctl_conf.to_string_lossy().to_string();
        let status = elevation::create_elevated_install_command(&[
            "-m",
            "644",
            &staged_path,
            &target,
        ])?
        .stdin(std::process::Stdio::null())
        .status()
        .await?;

        if !status.success() {
            return Err(Error::Nat {
                message: format!("Failed to persist IPv4 forwarding to {target}"),
                stderr: None,
                exit_code: status.code(),
            });
        }

        info!("Persisted {} to {}", IP_FORWARD_LINE, target);
        Ok(())
    }
}

/// Outcome of a successful apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub rules_compiled: usize,
    pub rules_skipped: usize,
    pub operations: usize,
}

/// Pushes a rule list into the kernel
#[async_trait]
pub trait ApplyRules: Send + Sync {
    async fn apply(&self, rules: &[Rule]) -> Result<ApplySummary>;
}

/// Compiles rules and runs them through a backend
pub struct NatCompiler<B: NatBackend> {
    backend: B,
    forwarding: Option<IpForwarding>,
}

impl<B: NatBackend> NatCompiler<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            forwarding: None,
        }
    }

    /// Also ensure IPv4 forwarding before each apply.
    pub fn with_forwarding(mut self, forwarding: IpForwarding) -> Self {
        self.forwarding = Some(forwarding);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl NatCompiler<IptablesBackend> {
    pub fn from_settings(settings: &NatSettings) -> Self {
        let compiler = Self::new(IptablesBackend::from_settings(settings));
        if settings.manage_ip_forward {
            compiler.with_forwarding(IpForwarding::from_settings(settings))
        } else {
            compiler
        }
    }
}

#[async_trait]
impl<B: NatBackend> ApplyRules for NatCompiler<B> {
    async fn apply(&self, rules: &[Rule]) -> Result<ApplySummary> {
        if let Some(forwarding) = &self.forwarding {
            forwarding.ensure().await?;
        }

        let ops = compile(rules);
        let rules_skipped = rules.iter().filter(|r| r.resolved_addr().is_none()).count();

        info!(
            "Applying {} NAT operation(s) for {} rule(s)",
            ops.len(),
            rules.len() - rules_skipped
        );

        for op in &ops {
            self.backend.execute(op).await?;
        }

        Ok(ApplySummary {
            rules_compiled: rules.len() - rules_skipped,
            rules_skipped,
            operations: ops.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::Protocol;
    use crate::core::test_helpers::{RecordingBackend, domain_rule, setup_test_env};

    fn rule(listen: &str, src: &str, host: &str, dst: &str, protocol: Protocol) -> Rule {
        Rule::new(listen, src, host, dst, protocol).unwrap()
    }

    #[test]
    fn test_compile_prelude() {
        let ops = compile(&[]);
        assert_eq!(
            ops,
            vec![
                NatOp::FlushChain(NatChain::Prerouting),
                NatOp::FlushChain(NatChain::Postrouting),
                NatOp::Masquerade,
            ]
        );
    }

    #[test]
    fn test_compile_both_protocols_range() {
        let ops = compile(&[rule(
            "0.0.0.0",
            "8000-9000",
            "10.0.0.5",
            "18000-19000",
            Protocol::Both,
        )]);

        assert_eq!(ops.len(), 5);
        assert_eq!(
            ops[3].to_args(),
            [
                "-t",
                "nat",
                "-A",
                "PREROUTING",
                "-p",
                "tcp",
                "--dport",
                "8000:9000",
                "-j",
                "DNAT",
                "--to-destination",
                "10.0.0.5:18000-19000"
            ]
        );
        assert!(matches!(
            ops[4],
            NatOp::Dnat {
                transport: Transport::Udp,
                ..
            }
        ));
    }

    #[test]
    fn test_compile_scoped_listen() {
        let ops = compile(&[rule(
            "192.168.1.10",
            "8080",
            "10.0.0.5",
            "80",
            Protocol::Udp,
        )]);

        assert_eq!(ops.len(), 4);
        assert_eq!(
            ops[3].to_string(),
            "-t nat -A PREROUTING -d 192.168.1.10 -p udp --dport 8080 -j DNAT --to-destination 10.0.0.5:80"
        );
    }

    #[test]
    fn test_compile_skips_unresolved_domain() {
        let unresolved = domain_rule("443", "example.com", "443");
        let ops = compile(&[unresolved]);
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_compile_uses_resolved_address() {
        let mut resolved = domain_rule("443", "example.com", "8443");
        resolved.record_resolution(Ipv4Addr::new(93, 184, 216, 34), 1);
        let ops = compile(&[resolved]);

        assert_eq!(ops.len(), 5);
        assert!(ops[3].to_string().ends_with("--to-destination 93.184.216.34:8443"));
    }

    #[test]
    fn test_flush_and_masquerade_args() {
        assert_eq!(
            NatOp::FlushChain(NatChain::Postrouting).to_string(),
            "-t nat -F POSTROUTING"
        );
        assert_eq!(
            NatOp::Masquerade.to_string(),
            "-t nat -A POSTROUTING -j MASQUERADE"
        );
    }

    #[test]
    fn test_render_script() {
        let script = render_script(
            &[
                rule("0.0.0.0", "22", "10.0.0.2", "2222", Protocol::Tcp),
                domain_rule("443", "example.com", "443"),
            ],
            "iptables",
        );

        assert!(script.starts_with("# 2 rule(s), 1 skipped (unresolved)\n"));
        assert!(script.contains("# skipped: 0.0.0.0:443 -> example.com:443"));
        assert!(script.contains("iptables -t nat -F PREROUTING\n"));
        assert!(script.contains(
            "iptables -t nat -A PREROUTING -p tcp --dport 22 -j DNAT --to-destination 10.0.0.2:2222\n"
        ));
    }

    #[tokio::test]
    async fn test_apply_runs_ops_in_order() {
        let backend = RecordingBackend::new();
        let ops = std::sync::Arc::clone(&backend.ops);
        let compiler = NatCompiler::new(backend);

        let rules = [
            rule("0.0.0.0", "22", "10.0.0.2", "2222", Protocol::Both),
            domain_rule("443", "example.com", "443"),
        ];
        let summary = compiler.apply(&rules).await.unwrap();

        assert_eq!(
            summary,
            ApplySummary {
                rules_compiled: 1,
                rules_skipped: 1,
                operations: 5,
            }
        );
        assert_eq!(*ops.lock().unwrap(), compile(&rules));
    }

    #[tokio::test]
    async fn test_apply_stops_at_first_failure() {
        let backend = RecordingBackend::failing_at(3);
        let ops = std::sync::Arc::clone(&backend.ops);
        let compiler = NatCompiler::new(backend);

        let rules = [
            rule("0.0.0.0", "22", "10.0.0.2", "22", Protocol::Tcp),
            rule("0.0.0.0", "80", "10.0.0.3", "80", Protocol::Tcp),
        ];
        let err = compiler.apply(&rules).await.unwrap_err();

        assert!(matches!(err, Error::Nat { .. }));
        // Flushes, masquerade, then the failing op; the second DNAT never runs
        assert_eq!(ops.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_iptables_backend_exit_status() {
        setup_test_env();

        let op = NatOp::FlushChain(NatChain::Prerouting);
        assert!(IptablesBackend::new("true").execute(&op).await.is_ok());

        let err = IptablesBackend::new("false").execute(&op).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Nat {
                exit_code: Some(1),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_iptables_backend_missing_binary() {
        setup_test_env();

        let err = IptablesBackend::new("portfwd-no-such-iptables")
            .execute(&NatOp::Masquerade)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Nat { exit_code: None, .. }));
    }

    #[tokio::test]
    async fn test_forwarding_already_enabled() {
        setup_test_env();
        let dir = tempfile::tempdir().unwrap();
        let proc_path = dir.path().join("ip_forward");
        let sysctl_conf = dir.path().join("sysctl.conf");
        std::fs::write(&proc_path, "1\n").unwrap();
        std::fs::write(&sysctl_conf, "net.ipv4.ip_forward=1\n").unwrap();

        // sysctl would fail if it were called
        let forwarding = IpForwarding {
            proc_path,
            sysctl_conf: sysctl_conf.clone(),
            sysctl_program: "false".to_string(),
        };
        forwarding.ensure().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&sysctl_conf).unwrap(),
            "net.ipv4.ip_forward=1\n"
        );
    }

    #[tokio::test]
    async fn test_forwarding_enable_and_persist_once() {
        setup_test_env();
        let dir = tempfile::tempdir().unwrap();
        let proc_path = dir.path().join("ip_forward");
        let sysctl_conf = dir.path().join("sysctl.conf");
        std::fs::write(&proc_path, "0\n").unwrap();
        std::fs::write(&sysctl_conf, "vm.swappiness=10").unwrap();

        let forwarding = IpForwarding {
            proc_path,
            sysctl_conf: sysctl_conf.clone(),
            sysctl_program: "true".to_string(),
        };
        forwarding.ensure().await.unwrap();
        forwarding.ensure().await.unwrap();

        let content = std::fs::read_to_string(&sysctl_conf).unwrap();
        assert_eq!(content, "vm.swappiness=10\nnet.ipv4.ip_forward=1\n");
    }

    #[tokio::test]
    async fn test_forwarding_sysctl_failure() {
        setup_test_env();
        let dir = tempfile::tempdir().unwrap();
        let proc_path = dir.path().join("ip_forward");
        std::fs::write(&proc_path, "0").unwrap();

        let forwarding = IpForwarding {
            proc_path,
            sysctl_conf: dir.path().join("sysctl.conf"),
            sysctl_program: "false".to_string(),
        };
        assert!(matches!(
            forwarding.ensure().await,
            Err(Error::Nat { .. })
        ));
    }
}
