use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{io::Write, time::Duration};

use crate::{
    accounts::Accounts,
    collaborator::{Collaborator, ConsoleCollaborator, Notice},
    config,
    launch::{self, LaunchOutcome, LaunchRequest, Variant, DEFAULT_EXIT_TIMEOUT},
    paths::Paths,
    process::SystemProcesses,
    snapshot::{BackupOutcome, PrefixResolver, RestoreOutcome, SnapshotManager},
    store::ConfigStore,
};

#[derive(Debug, Parser)]
#[command(name = config::NAME, version, about = "Arknights server and account launcher")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Close the running game, prepare the install and start it
    Launch {
        #[arg(value_enum)]
        variant: Variant,
        /// Account to switch to (official server only); defaults to the default account
        #[arg(long)]
        account: Option<String>,
        /// Return as soon as the target is started
        #[arg(long)]
        no_settle: bool,
    },
    /// Manage saved accounts
    #[command(subcommand)]
    Accounts(AccountsCmd),
    /// Show paths and the saved configuration
    Config,
}

#[derive(Debug, Subcommand)]
pub enum AccountsCmd {
    List,
    /// Prompts for the label when it is omitted
    Add { label: Option<String> },
    Rename { id: String, label: Option<String> },
    Delete {
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    Default { id: String },
    /// Save the current live data as this account's snapshot
    Backup { id: String },
    /// Close the game and replace the live data with this account's snapshot
    Restore {
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

/// Process exit code for a finished command.
pub fn run(cli: Cli, paths: &Paths) -> Result<i32> {
    let store = ConfigStore::new(&paths.config_file);
    let snapshots = SnapshotManager::new(
        &paths.backup_root,
        Box::new(PrefixResolver::new(&paths.live_parent, crate::paths::LIVE_DIR_PREFIX)),
    );
    let mut console = ConsoleCollaborator::stdio();

    match cli.cmd {
        Command::Launch {
            variant,
            account,
            no_settle,
        } => {
            let mut request = LaunchRequest::new(variant);
            request.account = account;
            if no_settle {
                request.settle = Duration::ZERO;
            }
            Ok(match launch::run(&store, &snapshots, &request, &mut console) {
                LaunchOutcome::Launched => 0,
                LaunchOutcome::Cancelled => {
                    console.notify(Notice::Info, "launch cancelled");
                    0
                }
                LaunchOutcome::Failed(_) => 1,
            })
        }
        Command::Accounts(cmd) => {
            accounts(&Accounts::new(&store, &snapshots), cmd, &mut console)?;
            Ok(0)
        }
        Command::Config => {
            show_config(paths, &store)?;
            Ok(0)
        }
    }
}

fn accounts(accounts: &Accounts<'_>, cmd: AccountsCmd, console: &mut dyn Collaborator) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match cmd {
        AccountsCmd::List => {
            for entry in accounts.list()? {
                let mark = if entry.is_default { '*' } else { ' ' };
                writeln!(out, "{mark} {}\t{}", entry.id, entry.label)?;
            }
        }
        AccountsCmd::Add { label } => {
            let Some(label) = label.or_else(|| console.prompt_text("Label for the new account", "New account"))
            else {
                console.notify(Notice::Info, "nothing added");
                return Ok(());
            };
            let id = accounts.add(&label)?;
            writeln!(out, "{id}")?;
        }
        AccountsCmd::Rename { id, label } => {
            let current = accounts
                .list()?
                .into_iter()
                .find(|entry| entry.id == id)
                .map(|entry| entry.label)
                .unwrap_or_default();
            let Some(label) = label.or_else(|| console.prompt_text(&format!("New label for {id}"), &current))
            else {
                console.notify(Notice::Info, "nothing renamed");
                return Ok(());
            };
            accounts.rename(&id, &label)?;
        }
        AccountsCmd::Default { id } => accounts.set_default(&id)?,
        AccountsCmd::Delete { id, yes } => {
            let deleted = accounts.delete(&id, |label| {
                yes || console.confirm(&format!("Delete account {id} ({label}) and its backup?"))
            })?;
            if !deleted {
                console.notify(Notice::Info, "nothing deleted");
            }
        }
        AccountsCmd::Backup { id } => match accounts.backup(&id)? {
            BackupOutcome::Saved(dest) => {
                console.notify(Notice::Info, &format!("backed up to {}", dest.display()))
            }
            BackupOutcome::NoLiveData => console.notify(
                Notice::Warning,
                "no game data found, start the official server once first",
            ),
        },
        AccountsCmd::Restore { id, yes } => {
            let question = format!("Close the game and replace its login data with the backup of {id}?");
            if !yes && !console.confirm(&question) {
                console.notify(Notice::Info, "nothing restored");
                return Ok(());
            }
            let mut warnings = Vec::new();
            let outcome = accounts.restore(&id, || {
                warnings = launch::close_game(&SystemProcesses, config::GAME_EXE, DEFAULT_EXIT_TIMEOUT);
                Ok(())
            })?;
            for message in &warnings {
                console.notify(Notice::Warning, message);
            }
            match outcome {
                RestoreOutcome::Restored => console.notify(Notice::Info, &format!("restored {id}")),
                RestoreOutcome::NoSnapshot => {
                    console.notify(Notice::Warning, &format!("{id} has no backup yet, live data kept"))
                }
            }
        }
    }
    Ok(())
}

fn show_config(paths: &Paths, store: &ConfigStore) -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "home:     {}", paths.config_dir.display())?;
    writeln!(out, "config:   {}", store.path().display())?;
    writeln!(out, "backups:  {}", paths.backup_root.display())?;
    writeln!(out, "logs:     {}", paths.logs_dir.display())?;
    writeln!(out, "sdk data: {}", paths.live_parent.display())?;
    let record = store.load();
    let json = serde_json::to_string_pretty(&record).context("serialize config")?;
    writeln!(out, "{json}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_launch_flags() {
        let cli = Cli::try_parse_from([
            "ark-launcher",
            "launch",
            "official",
            "--account",
            "A2",
            "--no-settle",
        ])
        .unwrap();
        match cli.cmd {
            Command::Launch {
                variant,
                account,
                no_settle,
            } => {
                assert_eq!(variant, Variant::Official);
                assert_eq!(account.as_deref(), Some("A2"));
                assert!(no_settle);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_account_subcommands() {
        let cli = Cli::try_parse_from(["ark-launcher", "accounts", "rename", "A2", "alt main"]).unwrap();
        assert!(matches!(
            cli.cmd,
            Command::Accounts(AccountsCmd::Rename { ref id, label: Some(ref label) }) if id == "A2" && label == "alt main"
        ));
        let cli = Cli::try_parse_from(["ark-launcher", "accounts", "add"]).unwrap();
        assert!(matches!(cli.cmd, Command::Accounts(AccountsCmd::Add { label: None })));
        let cli = Cli::try_parse_from(["ark-launcher", "accounts", "restore", "A2", "--yes"]).unwrap();
        assert!(matches!(cli.cmd, Command::Accounts(AccountsCmd::Restore { yes: true, .. })));
        assert!(Cli::try_parse_from(["ark-launcher", "launch", "global"]).is_err());
    }
}
