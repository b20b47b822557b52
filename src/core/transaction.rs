//! Stage, apply, commit-or-restore around rule changes
//!
//! The NAT compiler rebuilds the table from scratch and has no undo, so the
//! CLI wraps every mutating command in a [`Transaction`]:
//!
//! 1. [`Transaction::stage`] snapshots the current rules, in memory and as a
//!    checksummed backup file
//! 2. The caller mutates and saves the store
//! 3. [`Transaction::apply`] pushes the new rules to the kernel. On success the
//!    backup is dropped. On failure the snapshot is written back to the rule
//!    file and re-applied, and the caller gets [`Error::RolledBack`]
//!
//! A backup left on disk means a previous run died between saving and
//! applying; [`Transaction::recover`] reads it back after verifying its
//! checksum.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::core::error::{BackupError, Error, Result};
use crate::core::nat::{ApplyRules, ApplySummary};
use crate::core::rule::Rule;
use crate::core::store::{RuleStore, parse_rules, render_rules};
use crate::utils::{sha256_hex, write_atomic_async};

/// Backup file name inside the backup directory
pub const BACKUP_FILE: &str = "rules.backup";

/// Checksum sidecar suffix
const CHECKSUM_SUFFIX: &str = "sha256";

fn backup_paths(dir: &Path) -> (PathBuf, PathBuf) {
    let path = dir.join(BACKUP_FILE);
    let mut checksum = path.clone().into_os_string();
    checksum.push(".");
    checksum.push(CHECKSUM_SUFFIX);
    (path, PathBuf::from(checksum))
}

/// A staged rule snapshot
#[derive(Debug)]
pub struct Transaction {
    snapshot: Vec<Rule>,
    backup: Option<(PathBuf, PathBuf)>,
}

impl Transaction {
    /// Snapshots the store's current rules.
    ///
    /// With a `backup_dir`, the snapshot is also written there with a SHA-256
    /// sidecar.
    pub async fn stage(store: &RuleStore, backup_dir: Option<&Path>) -> Result<Self> {
        let snapshot = store.rules().to_vec();

        let backup = match backup_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let (path, checksum_path) = backup_paths(dir);
                let content = render_rules(&snapshot);
                let checksum = sha256_hex(content.as_bytes());

                write_atomic_async(&path, content.into_bytes()).await?;
                write_atomic_async(&checksum_path, checksum.into_bytes()).await?;
                info!("Staged {} rule(s) to {}", snapshot.len(), path.display());
                Some((path, checksum_path))
            }
            None => None,
        };

        Ok(Self { snapshot, backup })
    }

    /// The rules as they were when staged.
    pub fn snapshot(&self) -> &[Rule] {
        &self.snapshot
    }

    pub fn backup_path(&self) -> Option<&Path> {
        self.backup.as_ref().map(|(path, _)| path.as_path())
    }

    /// Applies the store's current rules, restoring the snapshot on failure.
    ///
    /// # Errors
    ///
    /// - [`Error::RolledBack`] when the apply failed and the snapshot was
    ///   written back and re-applied
    /// - [`Error::RollbackFailed`] when restoring failed too; the backup file
    ///   is kept for [`Transaction::recover`]
    pub async fn apply(
        self,
        store: &mut RuleStore,
        applier: &dyn ApplyRules,
    ) -> Result<ApplySummary> {
        let cause = match applier.apply(store.rules()).await {
            Ok(summary) => {
                self.commit().await;
                return Ok(summary);
            }
            Err(e) => e,
        };

        error!("Apply failed, restoring previous rules: {}", cause);

        let restored = match store.replace_all(self.snapshot.clone()).await {
            Ok(()) => applier.apply(&self.snapshot).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match restored {
            Ok(()) => {
                info!("Previous rules restored");
                self.commit().await;
                Err(Error::RolledBack {
                    cause: Box::new(cause),
                })
            }
            Err(restore) => {
                error!("Restoring previous rules failed: {}", restore);
                if let Some(path) = self.backup_path() {
                    warn!("Backup kept at {}", path.display());
                }
                Err(Error::RollbackFailed {
                    cause: Box::new(cause),
                    restore: Box::new(restore),
                })
            }
        }
    }

    /// Drops the snapshot without applying (e.g. the mutation itself failed).
    pub async fn discard(self) {
        self.commit().await;
    }

    async fn commit(self) {
        if let Some((path, checksum_path)) = self.backup {
            for file in [&path, &checksum_path] {
                if let Err(e) = tokio::fs::remove_file(file).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to remove backup {}: {}", file.display(), e);
                }
            }
        }
    }

    /// True when a backup from an interrupted run exists.
    pub async fn pending(backup_dir: &Path) -> bool {
        let (path, _) = backup_paths(backup_dir);
        tokio::fs::try_exists(&path).await.unwrap_or(false)
    }

    /// Reads a leftover backup after verifying its checksum.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] if the backup or its checksum is missing, or the
    /// checksum does not match.
    pub async fn recover(backup_dir: &Path) -> Result<Vec<Rule>> {
        let (path, checksum_path) = backup_paths(backup_dir);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(path).into());
            }
            Err(e) => return Err(e.into()),
        };

        let expected = match tokio::fs::read_to_string(&checksum_path).await {
            Ok(checksum) => checksum.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::MissingChecksum.into());
            }
            Err(e) => return Err(e.into()),
        };

        let actual = sha256_hex(content.as_bytes());
        if expected != actual {
            return Err(BackupError::ChecksumMismatch { expected, actual }.into());
        }

        let (rules, report) = parse_rules(&content);
        if !report.dropped.is_empty() {
            return Err(Error::Internal(format!(
                "Backup {} has {} undecodable line(s)",
                path.display(),
                report.dropped.len()
            )));
        }
        Ok(rules)
    }

    /// Removes a leftover backup once it has been dealt with.
    pub async fn clear_backup(backup_dir: &Path) {
        let backup = Some(backup_paths(backup_dir));
        Self {
            snapshot: Vec::new(),
            backup,
        }
        .commit()
        .await;
    }
}
