//! Rule file persistence
//!
//! The rule file is the single source of truth for forwarding rules. A
//! [`RuleStore`] owns an exclusive advisory lock on it for its whole lifetime,
//! so the CLI and the watcher take turns instead of interleaving
//! load-mutate-save cycles.
//!
//! Reads accept every historical line layout (see [`crate::core::schema`]);
//! writes always produce the canonical layout, atomically.
//!
//! Rules are addressed by 1-based position.

use std::fs::File;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info, warn};

use crate::core::error::{Error, Result};
use crate::core::resolver::Resolve;
use crate::core::rule::Rule;
use crate::core::schema::{
    CANONICAL_HEADER, Generation, LineError, decode_line, encode_rule, is_data_line,
};
use crate::utils::{unix_now, write_atomic_async};

/// A data line that could not be decoded and was left out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedLine {
    /// 1-based line number in the file
    pub line_no: usize,
    pub content: String,
    pub reason: LineError,
}

/// What happened while loading the rule file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub dropped: Vec<DroppedLine>,
    /// Rules read from a 4- or 5-field line
    pub migrated: usize,
    /// Domain rules that had no cached address and resolved during load
    pub resolved: usize,
    /// Domain rules that still have no usable address
    pub unresolved: usize,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty() && self.migrated == 0 && self.unresolved == 0
    }
}

/// Exclusive `flock` on `<rules file>.lock`, released on drop.
pub struct StoreLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock").field("path", &self.path).finish()
    }
}

impl StoreLock {
    /// Lock file path for a rule file.
    pub fn lock_path(rules_path: &Path) -> PathBuf {
        let mut name = rules_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn open_lock_file(path: &Path) -> std::io::Result<File> {
        let mut options = std::fs::OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        options.open(path)
    }

    /// Takes the lock if it is free.
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(rules_path: &Path) -> Result<Option<Self>> {
        let path = Self::lock_path(rules_path);
        let file = Self::open_lock_file(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(Self {
                path,
                _flock: flock,
            })),
            Err((_, Errno::EAGAIN)) => Ok(None),
            Err((_, errno)) => Err(Error::Io(std::io::Error::from(errno))),
        }
    }

    /// Takes the lock, waiting for the current holder to release it.
    pub async fn acquire(rules_path: &Path) -> Result<Self> {
        if let Some(lock) = Self::try_acquire(rules_path)? {
            return Ok(lock);
        }

        info!(
            "Rule file {} is in use, waiting for lock",
            rules_path.display()
        );

        let path = Self::lock_path(rules_path);
        tokio::task::spawn_blocking(move || {
            let file = Self::open_lock_file(&path)?;
            Flock::lock(file, FlockArg::LockExclusive)
                .map(|flock| Self {
                    path,
                    _flock: flock,
                })
                .map_err(|(_, errno)| Error::Io(std::io::Error::from(errno)))
        })
        .await
        .map_err(|e| Error::Internal(format!("Lock task failed: {e}")))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The locked, in-memory view of a rule file
#[derive(Debug)]
pub struct RuleStore {
    path: PathBuf,
    rules: Vec<Rule>,
    _lock: StoreLock,
}

impl RuleStore {
    /// Locks and loads the rule file at `path`.
    ///
    /// A missing file is an empty rule list. Domain rules without a cached
    /// address are resolved best-effort through `resolver`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the parent directory cannot be created, the lock
    /// cannot be taken, or the file cannot be read.
    pub async fn open(path: impl AsRef<Path>, resolver: &dyn Resolve) -> Result<(Self, LoadReport)> {
        let path = path.as_ref().to_path_buf();
        create_parent_dir(&path).await?;
        let lock = StoreLock::acquire(&path).await?;
        Self::load_locked(path, lock, Some(resolver)).await
    }

    /// Like [`RuleStore::open`], but leaves never-resolved domain rules as
    /// placeholders.
    pub async fn open_unresolved(path: impl AsRef<Path>) -> Result<(Self, LoadReport)> {
        let path = path.as_ref().to_path_buf();
        create_parent_dir(&path).await?;
        let lock = StoreLock::acquire(&path).await?;
        Self::load_locked(path, lock, None).await
    }

    /// Like [`RuleStore::open`], but fails with [`Error::Locked`] instead of waiting.
    pub async fn try_open(
        path: impl AsRef<Path>,
        resolver: &dyn Resolve,
    ) -> Result<(Self, LoadReport)> {
        let path = path.as_ref().to_path_buf();
        create_parent_dir(&path).await?;
        let lock = StoreLock::try_acquire(&path)?.ok_or_else(|| Error::Locked {
            path: path.clone(),
        })?;
        Self::load_locked(path, lock, Some(resolver)).await
    }

    async fn load_locked(
        path: PathBuf,
        lock: StoreLock,
        resolver: Option<&dyn Resolve>,
    ) -> Result<(Self, LoadReport)> {
        let (rules, report) = load_rules(&path, resolver).await?;
        Ok((
            Self {
                path,
                rules,
                _lock: lock,
            },
            report,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule at a 1-based position.
    pub fn get(&self, index: usize) -> Result<&Rule> {
        let slot = check_index(index, self.rules.len())?;
        Ok(&self.rules[slot])
    }

    /// Writes the current rules to disk.
    pub async fn save(&self) -> Result<()> {
        save_rules(&self.path, &self.rules).await
    }

    /// Applies `mutate` and saves; the in-memory list is rolled back if the save fails.
    async fn mutate_and_save<T>(&mut self, mutate: impl FnOnce(&mut Vec<Rule>) -> T) -> Result<T> {
        let previous = self.rules.clone();
        let out = mutate(&mut self.rules);

        if let Err(e) = self.save().await {
            self.rules = previous;
            return Err(e);
        }
        Ok(out)
    }

    /// Appends a rule and saves. Returns its 1-based position.
    pub async fn add(&mut self, rule: Rule) -> Result<usize> {
        debug!("Adding rule: {}", rule.summary());
        self.mutate_and_save(|rules| {
            rules.push(rule);
            rules.len()
        })
        .await
    }

    /// Replaces the rule at a 1-based position and saves. Returns the old rule.
    pub async fn edit(&mut self, index: usize, rule: Rule) -> Result<Rule> {
        let slot = check_index(index, self.rules.len())?;
        self.mutate_and_save(|rules| std::mem::replace(&mut rules[slot], rule))
            .await
    }

    /// Removes the rule at a 1-based position and saves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] without touching the list or the file when
    /// `index` is not in `1..=len`.
    pub async fn remove(&mut self, index: usize) -> Result<Rule> {
        let slot = check_index(index, self.rules.len())?;
        self.mutate_and_save(|rules| rules.remove(slot)).await
    }

    /// Removes every rule and saves. Returns how many were removed.
    pub async fn remove_all(&mut self) -> Result<usize> {
        self.mutate_and_save(|rules| {
            let count = rules.len();
            rules.clear();
            count
        })
        .await
    }

    /// Replaces the whole list and saves.
    pub async fn replace_all(&mut self, rules: Vec<Rule>) -> Result<()> {
        self.mutate_and_save(|current| *current = rules).await
    }
}

async fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Converts a 1-based index into a slot.
fn check_index(index: usize, len: usize) -> Result<usize> {
    if index == 0 || index > len {
        return Err(Error::OutOfRange { index, len });
    }
    Ok(index - 1)
}

/// Decodes rule file contents, skipping comments and undecodable lines.
pub fn parse_rules(content: &str) -> (Vec<Rule>, LoadReport) {
    let mut rules = Vec::new();
    let mut report = LoadReport::default();

    for (i, line) in content.lines().enumerate() {
        if !is_data_line(line) {
            continue;
        }

        match decode_line(line) {
            Ok(decoded) => {
                if decoded.generation != Generation::Canonical {
                    report.migrated += 1;
                }
                rules.push(decoded.rule);
            }
            Err(reason) => {
                warn!("Dropping rule file line {}: {} ({})", i + 1, line.trim(), reason);
                report.dropped.push(DroppedLine {
                    line_no: i + 1,
                    content: line.trim().to_string(),
                    reason,
                });
            }
        }
    }

    report.loaded = rules.len();
    (rules, report)
}

/// Resolves every domain rule that has no usable address yet.
///
/// Failures leave the rule untouched. Returns `(resolved, unresolved)`.
pub async fn resolve_pending(rules: &mut [Rule], resolver: &dyn Resolve, now: i64) -> (usize, usize) {
    let mut resolved = 0;
    let mut unresolved = 0;

    for rule in rules.iter_mut().filter(|r| r.needs_resolution()) {
        match resolver.resolve(&rule.dst_host).await {
            Ok(addr) => {
                info!("Resolved {} -> {}", rule.dst_host, addr);
                rule.record_resolution(addr, now);
                resolved += 1;
            }
            Err(e) => {
                warn!("Could not resolve {}: {}", rule.dst_host, e);
                unresolved += 1;
            }
        }
    }

    (resolved, unresolved)
}

/// Reads the rule file at `path`. A missing file is an empty list.
///
/// With a `resolver`, never-resolved domain rules are resolved best-effort.
pub async fn load_rules(
    path: &Path,
    resolver: Option<&dyn Resolve>,
) -> Result<(Vec<Rule>, LoadReport)> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Rule file {} does not exist yet", path.display());
            String::new()
        }
        Err(e) => return Err(e.into()),
    };

    let (mut rules, mut report) = parse_rules(&content);
    if let Some(resolver) = resolver {
        let (resolved, unresolved) = resolve_pending(&mut rules, resolver, unix_now()).await;
        report.resolved = resolved;
        report.unresolved = unresolved;
    } else {
        report.unresolved = rules.iter().filter(|r| r.needs_resolution()).count();
    }

    if report.migrated > 0 {
        info!(
            "{} rule(s) in {} use an older layout and will be rewritten on next save",
            report.migrated,
            path.display()
        );
    }

    Ok((rules, report))
}

/// Renders rules in the canonical file layout, header included.
pub fn render_rules(rules: &[Rule]) -> String {
    let mut out = String::from(CANONICAL_HEADER);
    for rule in rules {
        out.push_str(&encode_rule(rule));
        out.push('\n');
    }
    out
}

/// Atomically rewrites the rule file.
pub async fn save_rules(path: &Path, rules: &[Rule]) -> Result<()> {
    let content = render_rules(rules);
    write_atomic_async(path, content.into_bytes()).await?;
    debug!("Saved {} rule(s) to {}", rules.len(), path.display());
    Ok(())
}
