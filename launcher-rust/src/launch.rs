//! One launch attempt, from picking the target to starting it.
//!
//! Resolution prompts on the caller's thread. Everything after it runs on a
//! scoped worker that reports each stage back over a channel, so the caller
//! keeps driving its collaborator while files move.

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use std::{
    path::{Path, PathBuf},
    sync::mpsc::{self, Sender},
    thread,
    time::Duration,
};
use tracing::{error, info, warn};

use crate::{
    accounts::Accounts,
    collaborator::{Collaborator, Notice},
    config,
    payload::{EmbeddedResources, PayloadDeployer, ResourceSource},
    process::{self, ProcessControl, SystemProcesses},
    snapshot::SnapshotManager,
    store::ConfigStore,
};

pub const GAME_FOLDER_NAME: &str = "ArknightsGame";
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Variant {
    /// Official server, with account switching.
    Official,
    /// Bilibili server.
    Bilibili,
    /// MAA configured for the official server.
    MaaOfficial,
    /// MAA configured for the Bilibili server.
    MaaBilibili,
}

impl Variant {
    /// Payload set deployed into the installation; `None` for tools.
    pub fn payload_set(self) -> Option<&'static str> {
        match self {
            Variant::Official => Some("Payload"),
            Variant::Bilibili => Some("Payload_B"),
            Variant::MaaOfficial | Variant::MaaBilibili => None,
        }
    }

    /// Key under `toolPaths`; `None` for installation variants.
    pub fn tool_key(self) -> Option<&'static str> {
        match self {
            Variant::MaaOfficial => Some("maa_official"),
            Variant::MaaBilibili => Some("maa_bilibili"),
            Variant::Official | Variant::Bilibili => None,
        }
    }

    pub fn is_installation(self) -> bool {
        self.payload_set().is_some()
    }

    pub fn supports_accounts(self) -> bool {
        self == Variant::Official
    }

    pub fn settle_delay(self) -> Duration {
        if self.is_installation() {
            Duration::from_millis(2500)
        } else {
            Duration::from_secs(1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolvingTarget,
    TerminatingConflictingProcess,
    AccountSwap,
    DeployingPayload,
    Starting,
    SettlingDelay,
    Closed,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::ResolvingTarget => "resolving target",
            Stage::TerminatingConflictingProcess => "closing running game",
            Stage::AccountSwap => "switching account",
            Stage::DeployingPayload => "deploying payload",
            Stage::Starting => "starting",
            Stage::SettlingDelay => "launching...",
            Stage::Closed => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Launched,
    /// A selection prompt was declined before anything was touched.
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub variant: Variant,
    /// Account to swap in; the default account when `None`.
    pub account: Option<String>,
    pub settle: Duration,
}

impl LaunchRequest {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            account: None,
            settle: variant.settle_delay(),
        }
    }
}

pub type StartFn<'a> = dyn Fn(&Path) -> Result<()> + Sync + 'a;

/// Everything a launch touches, injected so tests can fake the OS.
pub struct LaunchDeps<'a> {
    pub store: &'a ConfigStore,
    pub snapshots: &'a SnapshotManager,
    pub processes: &'a (dyn ProcessControl + Sync),
    pub resources: &'a (dyn ResourceSource + Sync),
    pub namespace: &'a str,
    pub game_exe: &'a str,
    pub tool_exe: &'a str,
    pub start: &'a StartFn<'a>,
    pub exit_timeout: Duration,
}

/// What resolution settled on.
#[derive(Debug, Clone)]
struct LaunchPlan {
    variant: Variant,
    /// Installation root; `None` for tools.
    root: Option<PathBuf>,
    exe: PathBuf,
    account: Option<String>,
    settle: Duration,
}

enum Event {
    Stage(Stage),
    Warning(String),
}

pub fn run(
    store: &ConfigStore,
    snapshots: &SnapshotManager,
    request: &LaunchRequest,
    collaborator: &mut dyn Collaborator,
) -> LaunchOutcome {
    let resources = EmbeddedResources::bundled();
    let start = |exe: &Path| process::start_detached(exe);
    let deps = LaunchDeps {
        store,
        snapshots,
        processes: &SystemProcesses,
        resources: &resources,
        namespace: config::RESOURCE_NAMESPACE,
        game_exe: config::GAME_EXE,
        tool_exe: config::TOOL_EXE,
        start: &start,
        exit_timeout: DEFAULT_EXIT_TIMEOUT,
    };
    run_with_deps(&deps, request, collaborator)
}

pub fn run_with_deps(
    deps: &LaunchDeps<'_>,
    request: &LaunchRequest,
    collaborator: &mut dyn Collaborator,
) -> LaunchOutcome {
    info!(variant = ?request.variant, "launch requested");
    collaborator.progress(Stage::ResolvingTarget);
    let plan = match resolve(deps, request, collaborator) {
        Ok(Some(plan)) => plan,
        Ok(None) => {
            info!("launch cancelled during target selection");
            collaborator.progress(Stage::Closed);
            return LaunchOutcome::Cancelled;
        }
        Err(err) => return fail(collaborator, err),
    };

    let (tx, rx) = mpsc::channel();
    let joined = thread::scope(|scope| {
        let plan = &plan;
        let worker = scope.spawn(move || execute(deps, plan, &tx));
        for event in rx {
            match event {
                Event::Stage(stage) => collaborator.progress(stage),
                Event::Warning(message) => collaborator.notify(Notice::Warning, &message),
            }
        }
        worker.join()
    });

    match joined {
        Ok(Ok(())) => {
            info!(exe = %plan.exe.display(), "launch finished");
            collaborator.progress(Stage::Closed);
            LaunchOutcome::Launched
        }
        Ok(Err(err)) => fail(collaborator, err),
        Err(_) => fail(collaborator, anyhow!("launch worker panicked")),
    }
}

fn fail(collaborator: &mut dyn Collaborator, err: anyhow::Error) -> LaunchOutcome {
    let message = format!("{err:#}");
    error!(error = %message, "launch failed");
    collaborator.notify(Notice::Error, &message);
    collaborator.progress(Stage::Closed);
    LaunchOutcome::Failed(message)
}

fn resolve(
    deps: &LaunchDeps<'_>,
    request: &LaunchRequest,
    collaborator: &mut dyn Collaborator,
) -> Result<Option<LaunchPlan>> {
    let variant = request.variant;
    let (root, exe) = match variant.tool_key() {
        None => {
            let Some(root) = resolve_root(deps.store, collaborator)? else {
                return Ok(None);
            };
            let exe = root.join(deps.game_exe);
            (Some(root), exe)
        }
        Some(key) => {
            let Some(exe) = resolve_tool(deps.store, key, deps.tool_exe, collaborator)? else {
                return Ok(None);
            };
            (None, exe)
        }
    };

    let account = if variant.supports_accounts() {
        Accounts::new(deps.store, deps.snapshots).select(request.account.as_deref())?
    } else {
        None
    };

    Ok(Some(LaunchPlan {
        variant,
        root,
        exe,
        account,
        settle: request.settle,
    }))
}

/// Folder name check for a freshly picked installation root.
pub fn is_game_folder(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let squashed: String = name
                .to_string_lossy()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            squashed.eq_ignore_ascii_case(GAME_FOLDER_NAME)
        })
        .unwrap_or(false)
}

fn resolve_root(store: &ConfigStore, collaborator: &mut dyn Collaborator) -> Result<Option<PathBuf>> {
    let saved = store.load().root_path;
    if !saved.is_empty() && Path::new(&saved).is_dir() {
        return Ok(Some(PathBuf::from(saved)));
    }
    if !saved.is_empty() {
        warn!(root = %saved, "saved game root is gone");
    }

    loop {
        let Some(picked) = collaborator.select_folder(&format!(
            "Select the {GAME_FOLDER_NAME} folder of your Arknights installation"
        )) else {
            return Ok(None);
        };
        if !picked.is_dir() {
            collaborator.notify(Notice::Error, &format!("{} is not a folder", picked.display()));
            continue;
        }
        if !is_game_folder(&picked) {
            collaborator.notify(
                Notice::Error,
                &format!("{} is not the {GAME_FOLDER_NAME} folder", picked.display()),
            );
            continue;
        }
        let mut record = store.load();
        record.root_path = picked.to_string_lossy().to_string();
        store.save(&record)?;
        info!(root = %picked.display(), "game root saved");
        return Ok(Some(picked));
    }
}

fn resolve_tool(
    store: &ConfigStore,
    key: &str,
    tool_exe: &str,
    collaborator: &mut dyn Collaborator,
) -> Result<Option<PathBuf>> {
    let saved = store.load().tool_path(key).to_string();
    if !saved.is_empty() && Path::new(&saved).is_file() {
        return Ok(Some(PathBuf::from(saved)));
    }

    loop {
        let Some(picked) = collaborator.select_file(&format!("Select {tool_exe} for {key}")) else {
            return Ok(None);
        };
        let named_right = picked
            .file_name()
            .map(|n| n.to_string_lossy().eq_ignore_ascii_case(tool_exe))
            .unwrap_or(false);
        if !named_right || !picked.is_file() {
            collaborator.notify(Notice::Error, &format!("please select {tool_exe}"));
            continue;
        }
        let mut record = store.load();
        record.set_tool_path(key, &picked);
        store.save(&record)?;
        info!(tool = key, path = %picked.display(), "tool path saved");
        return Ok(Some(picked));
    }
}

/// Closes every running copy of the game and waits for each to exit.
/// Returns one message per process that may still hold files open.
pub fn close_game(processes: &dyn ProcessControl, game_exe: &str, timeout: Duration) -> Vec<String> {
    let name = conflicting_process(game_exe);
    match process::terminate_all(processes, &name, timeout) {
        Ok(report) => report
            .failures
            .into_iter()
            .map(|(pid, reason)| format!("could not close {name} (pid {pid}): {reason}"))
            .collect(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "listing processes failed");
            vec![format!("could not look for running {name}: {err:#}")]
        }
    }
}

fn conflicting_process(game_exe: &str) -> String {
    Path::new(game_exe)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| game_exe.to_string())
}

fn execute(deps: &LaunchDeps<'_>, plan: &LaunchPlan, tx: &Sender<Event>) -> Result<()> {
    // The receiver lives until this returns.
    let stage = |s: Stage| {
        let _ = tx.send(Event::Stage(s));
    };

    if let Some(root) = &plan.root {
        stage(Stage::TerminatingConflictingProcess);
        for message in close_game(deps.processes, deps.game_exe, deps.exit_timeout) {
            let _ = tx.send(Event::Warning(message));
        }

        if let Some(account) = &plan.account {
            stage(Stage::AccountSwap);
            if deps.snapshots.has_snapshot(account) {
                deps.snapshots.restore(account)?;
            } else {
                info!(account = %account, "no snapshot, keeping live data");
            }
        }

        if let Some(set) = plan.variant.payload_set() {
            stage(Stage::DeployingPayload);
            PayloadDeployer::new(deps.resources, deps.namespace).deploy(root, set)?;
        }
    }

    stage(Stage::Starting);
    (deps.start)(&plan.exe)?;

    stage(Stage::SettlingDelay);
    if !plan.settle.is_zero() {
        thread::sleep(plan.settle);
    }
    Ok(())
}
