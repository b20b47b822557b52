//! portfwd - declarative port forwarding on top of the kernel NAT table
//!
//! # Usage
//!
//! ```bash
//! portfwd list                                   # Numbered rule list
//! portfwd add 8080 10.0.0.5 80                   # Forward :8080 to 10.0.0.5:80 (tcp+udp)
//! portfwd add 8000-9000 app.example 18000-19000 --proto tcp --interval 120
//! portfwd edit 2 --dst-host 10.0.0.6             # Change one field of rule 2
//! portfwd remove 2                               # Delete rule 2 and re-apply
//! portfwd clear                                  # Delete every rule
//! portfwd apply                                  # Rebuild the NAT table from the file
//! portfwd show                                   # Print the iptables commands (dry run)
//! portfwd resolve app.example                    # Resolve through the resolver chain
//! portfwd tick                                   # One reconciliation pass (for cron/timers)
//! portfwd watch --interval 60                    # Reconcile forever
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portfwd::audit::{self, AuditLog, EventType};
use portfwd::config::{self, Settings};
use portfwd::core::error::NatErrorPattern;
use portfwd::core::nat::{self, ApplyRules, NatCompiler};
use portfwd::core::resolver::{ChainResolver, Resolve};
use portfwd::core::store::{LoadReport, RuleStore, resolve_pending};
use portfwd::core::transaction::Transaction;
use portfwd::core::watcher::Watcher;
use portfwd::utils::{self, unix_now};
use portfwd::{Error, Protocol, Rule};

#[derive(Parser)]
#[command(name = "portfwd", version)]
#[command(about = "Declarative port forwarding on the kernel NAT table", long_about = None)]
struct Cli {
    /// Settings file (default: ~/.config/portfwd/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Rule file, overrides the settings
    #[arg(long, global = true, value_name = "PATH")]
    rules: Option<PathBuf>,

    /// Also write logs to portfwd.log in the state directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ApplyFlag {
    /// Save the rule file without touching the NAT table
    #[arg(long)]
    no_apply: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List rules with their 1-based index
    List,
    /// Add a forwarding rule
    Add {
        /// Source port or range (8080, 8000-9000)
        src_port: String,
        /// Destination IPv4 address or domain name
        dst_host: String,
        /// Destination port or range, same width as the source
        dst_port: String,
        /// Local address to match, 0.0.0.0 for any
        #[arg(long, default_value = "0.0.0.0")]
        listen: String,
        /// tcp, udp or both
        #[arg(long, default_value = "both", value_parser = parse_protocol)]
        proto: Protocol,
        /// Seconds between re-resolutions of a domain (min 60)
        #[arg(long)]
        interval: Option<u64>,
        #[command(flatten)]
        apply: ApplyFlag,
    },
    /// Change fields of an existing rule
    Edit {
        /// 1-based rule index
        index: usize,
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        src_port: Option<String>,
        #[arg(long)]
        dst_host: Option<String>,
        #[arg(long)]
        dst_port: Option<String>,
        #[arg(long, value_parser = parse_protocol)]
        proto: Option<Protocol>,
        #[arg(long)]
        interval: Option<u64>,
        #[command(flatten)]
        apply: ApplyFlag,
    },
    /// Remove a rule by 1-based index
    Remove {
        index: usize,
        #[command(flatten)]
        apply: ApplyFlag,
    },
    /// Remove every rule
    Clear {
        #[command(flatten)]
        apply: ApplyFlag,
    },
    /// Rebuild the NAT table from the rule file
    Apply,
    /// Print the iptables commands apply would run
    Show,
    /// Resolve a domain through the configured resolver chain
    Resolve { domain: String },
    /// Run one reconciliation pass
    Tick,
    /// Reconcile domain destinations until interrupted
    Watch {
        /// Seconds between passes
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Restore rules from a backup left by an interrupted apply
    Recover,
    /// Print the effective settings
    Config {
        /// Write them to the settings file
        #[arg(long)]
        write: bool,
    },
}

fn parse_protocol(s: &str) -> Result<Protocol, String> {
    Protocol::parse(s).map_err(|e| e.to_string())
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Everything a command needs, built once from settings
struct Context {
    settings: Settings,
    settings_path: PathBuf,
    rules_path: PathBuf,
    resolver: Arc<ChainResolver>,
    applier: Arc<NatCompiler<nat::IptablesBackend>>,
}

impl Context {
    async fn new(config: Option<PathBuf>, rules: Option<PathBuf>) -> Result<Self, Box<dyn std::error::Error>> {
        let settings_path = match config {
            Some(path) => path,
            None => config::default_settings_path()?,
        };
        let settings = config::load_settings(&settings_path).await?;
        let rules_path = rules.unwrap_or_else(|| settings.rules_path.clone());

        Ok(Self {
            resolver: Arc::new(ChainResolver::from_settings(&settings.resolvers)),
            applier: Arc::new(NatCompiler::from_settings(&settings.nat)),
            settings,
            settings_path,
            rules_path,
        })
    }

    async fn open_store(&self) -> Result<RuleStore, Error> {
        let (store, report) = RuleStore::open(&self.rules_path, self.resolver.as_ref()).await?;
        print_load_report(&report);
        Ok(store)
    }

    fn backup_dir(&self) -> Option<&Path> {
        self.settings.backup_dir.as_deref()
    }

    async fn warn_pending_backup(&self) {
        if let Some(dir) = self.backup_dir()
            && Transaction::pending(dir).await
        {
            eprintln!(
                "Warning: a previous apply was interrupted. Run 'portfwd recover' to restore the rules it replaced."
            );
        }
    }
}

fn print_load_report(report: &LoadReport) {
    for dropped in &report.dropped {
        eprintln!(
            "Warning: ignored line {} ({}): {}",
            dropped.line_no, dropped.reason, dropped.content
        );
    }
    if report.unresolved > 0 {
        eprintln!(
            "Warning: {} domain rule(s) could not be resolved and will not be forwarded yet",
            report.unresolved
        );
    }
}

fn format_timestamp(ts: i64) -> String {
    if ts == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp(ts, 0).map_or_else(
        || ts.to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

fn init_logging(log_file: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if log_file
        && let Some(state_dir) = utils::get_state_dir()
        && let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(state_dir.join("portfwd.log"))
    {
        builder
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = utils::ensure_dirs();
    init_logging(cli.log_file);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(err) = e.downcast_ref::<Error>() {
                if let Some(stderr) = err.nat_stderr() {
                    let translation = NatErrorPattern::match_error(stderr);
                    eprintln!("{}", translation.user_message);
                    for suggestion in translation.suggestions {
                        eprintln!("  - {suggestion}");
                    }
                } else if err.is_validation() {
                    eprintln!("See 'portfwd help add' for accepted ports, hosts and protocols.");
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(cli: Cli) -> CliResult {
    let ctx = Context::new(cli.config, cli.rules).await?;

    match cli.command {
        Commands::List => list(&ctx).await,
        Commands::Add {
            src_port,
            dst_host,
            dst_port,
            listen,
            proto,
            interval,
            apply,
        } => {
            let interval = interval.unwrap_or(ctx.settings.default_check_interval_secs);
            let rule = Rule::new(&listen, &src_port, &dst_host, &dst_port, proto)?
                .with_check_interval(interval)?;
            add(&ctx, rule, apply.no_apply).await
        }
        Commands::Edit {
            index,
            listen,
            src_port,
            dst_host,
            dst_port,
            proto,
            interval,
            apply,
        } => {
            let changes = RuleChanges {
                listen,
                src_port,
                dst_host,
                dst_port,
                proto,
                interval,
            };
            edit(&ctx, index, changes, apply.no_apply).await
        }
        Commands::Remove { index, apply } => remove(&ctx, index, apply.no_apply).await,
        Commands::Clear { apply } => clear(&ctx, apply.no_apply).await,
        Commands::Apply => apply_all(&ctx).await,
        Commands::Show => {
            let store = ctx.open_store().await?;
            print!(
                "{}",
                nat::render_script(store.rules(), ctx.applier.backend().program())
            );
            Ok(())
        }
        Commands::Resolve { domain } => {
            let addr = ctx.resolver.resolve(&domain).await.map_err(Error::from)?;
            println!("{domain} -> {addr}");
            Ok(())
        }
        Commands::Tick => {
            let report = watcher(&ctx).tick(&ctx.rules_path).await?;
            println!(
                "{} due, {} changed, {} failed, NAT {}",
                report.due,
                report.changed.len(),
                report.failed,
                if report.applied { "re-applied" } else { "unchanged" }
            );
            for change in &report.changed {
                println!(
                    "  #{} {}: {} -> {}",
                    change.index, change.domain, change.old, change.new
                );
            }
            Ok(())
        }
        Commands::Watch { interval } => {
            let interval = interval.max(1);
            let watcher = watcher(&ctx);
            tokio::select! {
                () = watcher.run_forever(&ctx.rules_path, Duration::from_secs(interval)) => {}
                res = tokio::signal::ctrl_c() => {
                    res?;
                    info!("Interrupted, stopping watcher");
                }
            }
            Ok(())
        }
        Commands::Recover => recover(&ctx).await,
        Commands::Config { write } => {
            println!("# {}", ctx.settings_path.display());
            println!("{}", serde_json::to_string_pretty(&ctx.settings)?);
            if write {
                config::save_settings(&ctx.settings_path, &ctx.settings).await?;
                println!("✓ Settings written");
            }
            Ok(())
        }
    }
}

fn watcher(ctx: &Context) -> Watcher {
    let watcher = Watcher::new(ctx.resolver.clone(), ctx.applier.clone());
    match AuditLog::new() {
        Ok(audit) => watcher.with_audit(audit),
        Err(e) => {
            warn!("Audit log unavailable: {}", e);
            watcher
        }
    }
}

async fn list(ctx: &Context) -> CliResult {
    let store = ctx.open_store().await?;
    if store.is_empty() {
        println!("No forwarding rules in {}", store.path().display());
        return Ok(());
    }

    println!("Rules in {}:", store.path().display());
    for (i, rule) in store.rules().iter().enumerate() {
        println!("  {:>3}  {}", i + 1, rule.summary());
        if rule.is_domain {
            println!(
                "       every {}s, last checked {}",
                rule.check_interval_secs,
                format_timestamp(rule.last_checked_at)
            );
        }
    }
    Ok(())
}

/// Applies the store's rules inside a staged transaction, with audit entries.
async fn finish(ctx: &Context, tx: Transaction, store: &mut RuleStore, no_apply: bool) -> CliResult {
    if no_apply {
        tx.discard().await;
        println!("✓ Saved. Run 'portfwd apply' to update the NAT table.");
        return Ok(());
    }

    let rule_count = store.len();
    match tx.apply(store, ctx.applier.as_ref()).await {
        Ok(summary) => {
            audit::log_apply(
                summary.rules_compiled,
                summary.rules_skipped,
                summary.operations,
                true,
                None,
            )
            .await;
            println!(
                "✓ Applied {} rule(s) ({} NAT operations)",
                summary.rules_compiled, summary.operations
            );
            if summary.rules_skipped > 0 {
                println!(
                    "  {} domain rule(s) skipped until they resolve",
                    summary.rules_skipped
                );
            }
            Ok(())
        }
        Err(e) => {
            audit::log_apply(rule_count, 0, 0, false, Some(e.to_string())).await;
            match &e {
                Error::RolledBack { .. } => audit::log_rollback(true, None).await,
                Error::RollbackFailed { restore, .. } => {
                    audit::log_rollback(false, Some(restore.to_string())).await;
                }
                _ => {}
            }
            Err(e.into())
        }
    }
}

async fn add(ctx: &Context, mut rule: Rule, no_apply: bool) -> CliResult {
    ctx.warn_pending_backup().await;
    let mut store = ctx.open_store().await?;

    let (_, unresolved) = resolve_pending(
        std::slice::from_mut(&mut rule),
        ctx.resolver.as_ref(),
        unix_now(),
    )
    .await;
    if unresolved > 0 {
        eprintln!(
            "Warning: {} did not resolve; the rule is saved but not forwarded until it does",
            rule.dst_host
        );
    }

    let summary = rule.summary();
    let tx = Transaction::stage(&store, ctx.backup_dir()).await?;
    let index = match store.add(rule).await {
        Ok(index) => index,
        Err(e) => {
            tx.discard().await;
            return Err(e.into());
        }
    };

    audit::log_rule_change(
        EventType::AddRule,
        serde_json::json!({ "index": index, "rule": summary }),
    )
    .await;
    println!("✓ Added rule {index}: {summary}");

    finish(ctx, tx, &mut store, no_apply).await
}

/// Fields to change on `edit`; `None` keeps the current value
struct RuleChanges {
    listen: Option<String>,
    src_port: Option<String>,
    dst_host: Option<String>,
    dst_port: Option<String>,
    proto: Option<Protocol>,
    interval: Option<u64>,
}

impl RuleChanges {
    fn merge(self, current: &Rule) -> Result<Rule, Error> {
        let listen = self.listen.unwrap_or_else(|| current.listen_ip.to_string());
        let src_port = self.src_port.unwrap_or_else(|| current.src_ports.to_string());
        let dst_host = self.dst_host.unwrap_or_else(|| current.dst_host.clone());
        let dst_port = self.dst_port.unwrap_or_else(|| current.dst_ports.to_string());
        let proto = self.proto.unwrap_or(current.protocol);
        let interval = self.interval.unwrap_or(current.check_interval_secs);

        let mut rule = Rule::new(&listen, &src_port, &dst_host, &dst_port, proto)?
            .with_check_interval(interval)?;

        // Same destination: keep what the watcher already learned
        if rule.dst_host == current.dst_host {
            rule.resolved_ip.clone_from(&current.resolved_ip);
            rule.last_checked_at = current.last_checked_at;
        }
        Ok(rule)
    }
}

async fn edit(ctx: &Context, index: usize, changes: RuleChanges, no_apply: bool) -> CliResult {
    ctx.warn_pending_backup().await;
    let mut store = ctx.open_store().await?;

    let mut rule = changes.merge(store.get(index)?)?;
    resolve_pending(
        std::slice::from_mut(&mut rule),
        ctx.resolver.as_ref(),
        unix_now(),
    )
    .await;

    let summary = rule.summary();
    let tx = Transaction::stage(&store, ctx.backup_dir()).await?;
    if let Err(e) = store.edit(index, rule).await {
        tx.discard().await;
        return Err(e.into());
    }

    audit::log_rule_change(
        EventType::EditRule,
        serde_json::json!({ "index": index, "rule": summary }),
    )
    .await;
    println!("✓ Updated rule {index}: {summary}");

    finish(ctx, tx, &mut store, no_apply).await
}

async fn remove(ctx: &Context, index: usize, no_apply: bool) -> CliResult {
    ctx.warn_pending_backup().await;
    let mut store = ctx.open_store().await?;

    let tx = Transaction::stage(&store, ctx.backup_dir()).await?;
    let removed = match store.remove(index).await {
        Ok(rule) => rule,
        Err(e) => {
            tx.discard().await;
            return Err(e.into());
        }
    };

    audit::log_rule_change(
        EventType::RemoveRule,
        serde_json::json!({ "index": index, "rule": removed.summary() }),
    )
    .await;
    println!("✓ Removed rule {index}: {}", removed.summary());

    finish(ctx, tx, &mut store, no_apply).await
}

async fn clear(ctx: &Context, no_apply: bool) -> CliResult {
    ctx.warn_pending_backup().await;
    let mut store = ctx.open_store().await?;

    let tx = Transaction::stage(&store, ctx.backup_dir()).await?;
    let count = match store.remove_all().await {
        Ok(count) => count,
        Err(e) => {
            tx.discard().await;
            return Err(e.into());
        }
    };

    audit::log_rule_change(EventType::ClearRules, serde_json::json!({ "count": count })).await;
    println!("✓ Removed {count} rule(s)");

    finish(ctx, tx, &mut store, no_apply).await
}

async fn apply_all(ctx: &Context) -> CliResult {
    ctx.warn_pending_backup().await;
    let store = ctx.open_store().await?;

    if !nix::unistd::getuid().is_root() {
        println!("Note: Not running as root. Will use run0/sudo/pkexec for iptables.");
    }

    match ctx.applier.apply(store.rules()).await {
        Ok(summary) => {
            audit::log_apply(
                summary.rules_compiled,
                summary.rules_skipped,
                summary.operations,
                true,
                None,
            )
            .await;
            println!(
                "✓ Applied {} rule(s) ({} NAT operations)",
                summary.rules_compiled, summary.operations
            );
            Ok(())
        }
        Err(e) => {
            audit::log_apply(store.len(), 0, 0, false, Some(e.to_string())).await;
            Err(e.into())
        }
    }
}

async fn recover(ctx: &Context) -> CliResult {
    let Some(dir) = ctx.backup_dir() else {
        return Err("Backups are disabled (backup_dir is null in the settings)".into());
    };

    let rules = Transaction::recover(dir).await?;
    let mut store = ctx.open_store().await?;
    let count = rules.len();
    store.replace_all(rules).await?;
    drop(store);
    Transaction::clear_backup(dir).await;

    audit::AuditLog::new()?
        .record(audit::AuditEvent::new(
            EventType::RecoverBackup,
            true,
            serde_json::json!({ "rule_count": count }),
            None,
        ))
        .await;
    println!("✓ Restored {count} rule(s) from backup");

    apply_all(ctx).await
}
