use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::fs_ops;

pub const DEFAULT_ACCOUNT_ID: &str = "A1";
pub const DEFAULT_ACCOUNT_LABEL: &str = "Default account";

/// The persisted launcher configuration.
///
/// Every field defaults when absent so older or newer files still load.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigRecord {
    /// Game installation root; empty until the user picks one.
    pub root_path: String,
    /// Auxiliary executables keyed by variant id; empty means unset.
    pub tool_paths: BTreeMap<String, String>,
    /// Account id -> display label.
    pub accounts: BTreeMap<String, String>,
    /// Empty, or a key of `accounts`.
    pub default_account: String,
}

impl ConfigRecord {
    pub fn tool_path(&self, variant_id: &str) -> &str {
        self.tool_paths.get(variant_id).map(String::as_str).unwrap_or("")
    }

    pub fn set_tool_path(&mut self, variant_id: &str, path: &Path) {
        self.tool_paths
            .insert(variant_id.to_string(), path.to_string_lossy().to_string());
    }

    /// Creates the single default account when none exist. Returns whether
    /// the record changed and needs saving.
    pub fn ensure_default_account(&mut self) -> bool {
        if !self.accounts.is_empty() {
            return false;
        }
        self.accounts.insert(
            DEFAULT_ACCOUNT_ID.to_string(),
            DEFAULT_ACCOUNT_LABEL.to_string(),
        );
        self.default_account = DEFAULT_ACCOUNT_ID.to_string();
        true
    }

    pub fn default_account(&self) -> Option<&str> {
        let id = self.default_account.as_str();
        (!id.is_empty() && self.accounts.contains_key(id)).then_some(id)
    }

    /// Accounts with the default first, the rest in id order.
    pub fn ordered_accounts(&self) -> Vec<(&str, &str)> {
        let default = self.default_account();
        let mut out = Vec::with_capacity(self.accounts.len());
        if let Some(id) = default {
            out.push((id, self.accounts[id].as_str()));
        }
        out.extend(
            self.accounts
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != default)
                .map(|(id, label)| (id.as_str(), label.as_str())),
        );
        out
    }

    /// Smallest unused id of the form `A<n>`.
    pub fn next_account_id(&self) -> String {
        let mut index = 1;
        while self.accounts.contains_key(&format!("A{index}")) {
            index += 1;
        }
        format!("A{index}")
    }
}

/// Loads and saves the [`ConfigRecord`] at a fixed path.
///
/// There is no locking: callers do load, mutate and save within one
/// operation, and the last writer wins.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing or unreadable file yields a default record.
    pub fn load(&self) -> ConfigRecord {
        if !self.path.exists() {
            return ConfigRecord::default();
        }
        match read_record(&self.path) {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %self.path.display(), error = %format!("{err:#}"), "config unreadable, using defaults");
                ConfigRecord::default()
            }
        }
    }

    pub fn save(&self, record: &ConfigRecord) -> Result<()> {
        let contents = serde_json::to_string_pretty(record).context("serialize config.json")?;
        fs_ops::write_bytes_with_retry(&self.path, contents.as_bytes(), 3)
            .with_context(|| format!("save {}", self.path.display()))?;
        info!(path = %self.path.display(), "config saved");
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<ConfigRecord> {
    let s = fs::read_to_string(path).context("read config.json")?;
    serde_json::from_str(&s).context("parse config.json")
}
