//! Per-account copies of the vendor's live save-state directory.
//!
//! The live directory belongs to the game. Its name carries a per-install
//! suffix, so it is located by prefix under a fixed parent. A snapshot for
//! account `A1` keeps the live directory under its own name:
//! `<backup_root>/A1/<live dir name>/...`, so restoring is a mirror of the
//! account dir onto the live parent.

use anyhow::{Context, Result};
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

use crate::{error::LaunchError, fs_ops};

/// Finds the candidate live data directories.
pub trait LiveDirResolver {
    /// Directory the live data directory lives in.
    fn parent(&self) -> &Path;
    /// Every current match, in a stable order.
    fn matches(&self) -> Result<Vec<PathBuf>>;
}

/// Matches child directories of `parent` whose name starts with `prefix`.
#[derive(Debug, Clone)]
pub struct PrefixResolver {
    parent: PathBuf,
    prefix: String,
}

impl PrefixResolver {
    pub fn new(parent: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            prefix: prefix.into(),
        }
    }
}

impl LiveDirResolver for PrefixResolver {
    fn parent(&self) -> &Path {
        &self.parent
    }

    fn matches(&self) -> Result<Vec<PathBuf>> {
        if !self.parent.is_dir() {
            return Ok(Vec::new());
        }
        let mut found: Vec<PathBuf> = fs::read_dir(&self.parent)
            .with_context(|| format!("read_dir {}", self.parent.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(&self.prefix))
            .map(|entry| entry.path())
            .collect();
        found.sort();
        Ok(found)
    }
}

/// Zero matches is `None`; more than one is an error rather than a guess.
pub fn resolve_single(resolver: &dyn LiveDirResolver) -> Result<Option<PathBuf>> {
    let mut matches = resolver.matches()?;
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => Err(LaunchError::AmbiguousLiveDir { matches }.into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// No live directory yet; the game has not written any state.
    NoLiveData,
    Saved(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    NoSnapshot,
    Restored,
}

pub struct SnapshotManager {
    backup_root: PathBuf,
    resolver: Box<dyn LiveDirResolver + Send + Sync>,
}

impl SnapshotManager {
    pub fn new(backup_root: impl Into<PathBuf>, resolver: Box<dyn LiveDirResolver + Send + Sync>) -> Self {
        Self {
            backup_root: backup_root.into(),
            resolver,
        }
    }

    pub fn snapshot_dir(&self, account_id: &str) -> PathBuf {
        self.backup_root.join(account_id)
    }

    /// True once a backup has been taken; the empty directory created with
    /// the account does not count.
    pub fn has_snapshot(&self, account_id: &str) -> bool {
        fs_ops::dir_has_entries(&self.snapshot_dir(account_id))
    }

    pub fn live_dir(&self) -> Result<Option<PathBuf>> {
        resolve_single(self.resolver.as_ref())
    }

    /// Creates the empty snapshot directory for a new account.
    pub fn prepare(&self, account_id: &str) -> Result<()> {
        let dir = self.snapshot_dir(account_id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))
    }

    /// Replaces the account's snapshot with the current live directory.
    pub fn backup(&self, account_id: &str) -> Result<BackupOutcome> {
        let Some(live) = self.live_dir()? else {
            info!(account = account_id, "no live data directory, nothing to back up");
            return Ok(BackupOutcome::NoLiveData);
        };
        let name = live.file_name().context("live directory has no name")?;
        let account_dir = self.snapshot_dir(account_id);
        prune_except(&account_dir, name)?;
        let dest = account_dir.join(name);
        fs_ops::replace(&live, &dest)?;
        info!(account = account_id, from = %live.display(), to = %dest.display(), "account backed up");
        Ok(BackupOutcome::Saved(dest))
    }

    /// Deletes the current live directory, then writes the account's snapshot
    /// back under the live parent if one exists.
    pub fn restore(&self, account_id: &str) -> Result<RestoreOutcome> {
        if let Some(live) = self.live_dir()? {
            fs_ops::remove_dir_if_exists(&live)?;
            info!(account = account_id, removed = %live.display(), "live data directory cleared");
        }
        if !self.has_snapshot(account_id) {
            info!(account = account_id, "no snapshot, nothing to restore");
            return Ok(RestoreOutcome::NoSnapshot);
        }
        let parent = self.resolver.parent();
        fs_ops::mirror(&self.snapshot_dir(account_id), parent)?;
        info!(account = account_id, to = %parent.display(), "account restored");
        Ok(RestoreOutcome::Restored)
    }

    /// Removes the account's snapshot tree. Missing snapshots are fine.
    pub fn delete(&self, account_id: &str) -> Result<()> {
        fs_ops::remove_dir_if_exists(&self.snapshot_dir(account_id))
    }
}

/// Drops everything in `dir` except the entry called `keep`, so a live
/// directory whose suffix changed leaves no old copy behind.
fn prune_except(dir: &Path, keep: &OsStr) -> Result<()> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        if entry.file_name().as_os_str() == keep {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            fs_ops::remove_dir_if_exists(&path)?;
        } else {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
    }
    Ok(())
}
