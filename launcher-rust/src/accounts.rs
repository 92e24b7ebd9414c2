use anyhow::Result;
use tracing::info;

use crate::{
    error::LaunchError,
    snapshot::{BackupOutcome, RestoreOutcome, SnapshotManager},
    store::{ConfigRecord, ConfigStore},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEntry {
    pub id: String,
    pub label: String,
    pub is_default: bool,
}

/// Account bookkeeping: every call loads the record, changes it and saves it.
///
/// Only the record and the per-account backup directories are touched,
/// except for `backup` and `restore` which move live data on request.
pub struct Accounts<'a> {
    store: &'a ConfigStore,
    snapshots: &'a SnapshotManager,
}

impl<'a> Accounts<'a> {
    pub fn new(store: &'a ConfigStore, snapshots: &'a SnapshotManager) -> Self {
        Self { store, snapshots }
    }

    /// Loads the record, creating and saving the default account if the
    /// account map is empty.
    pub fn load(&self) -> Result<ConfigRecord> {
        let mut record = self.store.load();
        if record.ensure_default_account() {
            self.snapshots.prepare(&record.default_account)?;
            self.store.save(&record)?;
            info!(account = %record.default_account, "created default account");
        }
        Ok(record)
    }

    pub fn list(&self) -> Result<Vec<AccountEntry>> {
        let record = self.load()?;
        let default = record.default_account().map(str::to_string);
        Ok(record
            .ordered_accounts()
            .into_iter()
            .map(|(id, label)| AccountEntry {
                id: id.to_string(),
                label: label.to_string(),
                is_default: default.as_deref() == Some(id),
            })
            .collect())
    }

    /// The account to swap in: `requested` if given, else the default one,
    /// else the first listed.
    pub fn select(&self, requested: Option<&str>) -> Result<Option<String>> {
        let record = self.load()?;
        match requested {
            Some(id) => {
                ensure_known(&record, id)?;
                Ok(Some(id.to_string()))
            }
            None => Ok(record
                .ordered_accounts()
                .first()
                .map(|(id, _)| id.to_string())),
        }
    }

    pub fn add(&self, label: &str) -> Result<String> {
        let label = clean_label(label)?;
        let mut record = self.load()?;
        let id = record.next_account_id();
        record.accounts.insert(id.clone(), label);
        self.store.save(&record)?;
        self.snapshots.prepare(&id)?;
        info!(account = %id, "account added");
        Ok(id)
    }

    pub fn rename(&self, id: &str, label: &str) -> Result<()> {
        let label = clean_label(label)?;
        let mut record = self.load()?;
        ensure_known(&record, id)?;
        record.accounts.insert(id.to_string(), label);
        self.store.save(&record)?;
        info!(account = id, "account renamed");
        Ok(())
    }

    pub fn set_default(&self, id: &str) -> Result<()> {
        let mut record = self.load()?;
        ensure_known(&record, id)?;
        record.default_account = id.to_string();
        self.store.save(&record)?;
        info!(account = id, "default account changed");
        Ok(())
    }

    /// Removes the account and its snapshot. Returns `false` when `confirm`
    /// declines; the last remaining account is never removed.
    pub fn delete(&self, id: &str, confirm: impl FnOnce(&str) -> bool) -> Result<bool> {
        let mut record = self.load()?;
        ensure_known(&record, id)?;
        if record.accounts.len() <= 1 {
            return Err(LaunchError::LastAccount.into());
        }
        if !confirm(&record.accounts[id]) {
            return Ok(false);
        }
        record.accounts.remove(id);
        if record.default_account == id {
            record.default_account.clear();
        }
        self.store.save(&record)?;
        self.snapshots.delete(id)?;
        info!(account = id, "account deleted");
        Ok(true)
    }

    pub fn backup(&self, id: &str) -> Result<BackupOutcome> {
        let record = self.load()?;
        ensure_known(&record, id)?;
        self.snapshots.backup(id)
    }

    /// Swaps the account's snapshot in. Without a snapshot the live data is
    /// left alone. `release_live` runs first and must make sure the game no
    /// longer holds the live directory.
    pub fn restore(&self, id: &str, release_live: impl FnOnce() -> Result<()>) -> Result<RestoreOutcome> {
        let record = self.load()?;
        ensure_known(&record, id)?;
        if !self.snapshots.has_snapshot(id) {
            info!(account = id, "no snapshot, live data kept");
            return Ok(RestoreOutcome::NoSnapshot);
        }
        release_live()?;
        self.snapshots.restore(id)
    }
}

fn ensure_known(record: &ConfigRecord, id: &str) -> Result<()> {
    if record.accounts.contains_key(id) {
        Ok(())
    } else {
        Err(LaunchError::UnknownAccount(id.to_string()).into())
    }
}

fn clean_label(label: &str) -> Result<String> {
    let label = label.trim();
    if label.is_empty() {
        return Err(LaunchError::EmptyLabel.into());
    }
    Ok(label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::PrefixResolver;
    use std::{fs, path::Path};

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: ConfigStore,
        snapshots: SnapshotManager,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root: &Path = tmp.path();
        let store = ConfigStore::new(root.join("config.json"));
        let snapshots = SnapshotManager::new(
            root.join("AccountBackups"),
            Box::new(PrefixResolver::new(root.join("vendor"), "sdk_data_")),
        );
        Fixture {
            _tmp: tmp,
            store,
            snapshots,
        }
    }

    #[test]
    fn first_load_creates_and_persists_default_account() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);

        let list = accounts.list().unwrap();

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "A1");
        assert!(list[0].is_default);
        assert!(f.snapshots.snapshot_dir("A1").is_dir());
        assert_eq!(f.store.load().default_account, "A1");
    }

    #[test]
    fn add_assigns_next_id_and_creates_backup_dir() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);

        let id = accounts.add("  alt  ").unwrap();

        assert_eq!(id, "A2");
        assert_eq!(f.store.load().accounts.get("A2").map(String::as_str), Some("alt"));
        assert!(f.snapshots.snapshot_dir("A2").is_dir());
    }

    #[test]
    fn blank_labels_are_rejected() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);
        assert!(accounts.add("   ").is_err());
        assert!(accounts.rename("A1", "").is_err());
    }

    #[test]
    fn rename_and_set_default_require_known_ids() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);
        accounts.add("alt").unwrap();

        accounts.rename("A2", "second").unwrap();
        accounts.set_default("A2").unwrap();

        let record = f.store.load();
        assert_eq!(record.accounts["A2"], "second");
        assert_eq!(record.default_account, "A2");
        let err = accounts.set_default("A7").unwrap_err();
        assert!(matches!(err.downcast_ref::<LaunchError>(), Some(LaunchError::UnknownAccount(id)) if id == "A7"));
    }

    #[test]
    fn delete_keeps_last_account() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);
        accounts.load().unwrap();

        let err = accounts.delete("A1", |_| true).unwrap_err();
        assert!(matches!(err.downcast_ref::<LaunchError>(), Some(LaunchError::LastAccount)));
    }

    #[test]
    fn delete_honours_confirmation_and_clears_default() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);
        accounts.add("alt").unwrap();

        assert!(!accounts.delete("A1", |_| false).unwrap());
        assert!(f.store.load().accounts.contains_key("A1"));

        let mut asked = String::new();
        assert!(accounts
            .delete("A1", |label| {
                asked = label.to_string();
                true
            })
            .unwrap());

        let record = f.store.load();
        assert_eq!(asked, "Default account");
        assert!(!record.accounts.contains_key("A1"));
        assert_eq!(record.default_account, "");
        assert!(!f.snapshots.snapshot_dir("A1").exists());
    }

    #[test]
    fn select_without_default_takes_first_listed() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);
        accounts.add("alt").unwrap();
        accounts.add("event").unwrap();
        accounts.delete("A1", |_| true).unwrap();

        assert_eq!(accounts.select(None).unwrap().as_deref(), Some("A2"));
    }

    #[test]
    fn restore_without_snapshot_keeps_live_data_and_game() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);
        let live = f._tmp.path().join("vendor").join("sdk_data_1");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("login.dat"), "current").unwrap();

        let outcome = accounts
            .restore("A1", || panic!("nothing to release without a snapshot"))
            .unwrap();

        assert_eq!(outcome, RestoreOutcome::NoSnapshot);
        assert_eq!(fs::read_to_string(live.join("login.dat")).unwrap(), "current");
    }

    #[test]
    fn restore_releases_live_dir_before_touching_it() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);
        accounts.load().unwrap();
        let saved = f.snapshots.snapshot_dir("A1").join("sdk_data_1");
        fs::create_dir_all(&saved).unwrap();
        fs::write(saved.join("login.dat"), "saved").unwrap();
        let live = f._tmp.path().join("vendor").join("sdk_data_1");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("login.dat"), "current").unwrap();

        let mut released = false;
        let outcome = accounts
            .restore("A1", || {
                assert_eq!(fs::read_to_string(live.join("login.dat")).unwrap(), "current");
                released = true;
                Ok(())
            })
            .unwrap();

        assert!(released);
        assert_eq!(outcome, RestoreOutcome::Restored);
        assert_eq!(fs::read_to_string(live.join("login.dat")).unwrap(), "saved");
    }

    #[test]
    fn restore_stops_when_release_fails() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);
        accounts.load().unwrap();
        let saved = f.snapshots.snapshot_dir("A1").join("sdk_data_1");
        fs::create_dir_all(&saved).unwrap();
        fs::write(saved.join("login.dat"), "saved").unwrap();
        let live = f._tmp.path().join("vendor").join("sdk_data_1");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("login.dat"), "current").unwrap();

        assert!(accounts.restore("A1", || anyhow::bail!("declined")).is_err());
        assert_eq!(fs::read_to_string(live.join("login.dat")).unwrap(), "current");
    }

    #[test]
    fn select_falls_back_to_default() {
        let f = fixture();
        let accounts = Accounts::new(&f.store, &f.snapshots);
        accounts.add("alt").unwrap();

        assert_eq!(accounts.select(None).unwrap().as_deref(), Some("A1"));
        assert_eq!(accounts.select(Some("A2")).unwrap().as_deref(), Some("A2"));
        assert!(accounts.select(Some("B1")).is_err());
    }
}
