use std::path::PathBuf;

use thiserror::Error;

/// Failures the launcher distinguishes when reporting to the user.
///
/// These travel inside `anyhow::Error` chains and are recovered with
/// `downcast_ref` where a caller needs to tell them apart.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no embedded resources found under `{prefix}` (the launcher was packaged without this payload set)")]
    MissingPayload { prefix: String },

    #[error("embedded resource `{name}` decodes to an unsafe path")]
    InvalidResourceName { name: String },

    #[error("{name} not found at {}", path.display())]
    MissingTarget { name: String, path: PathBuf },

    #[error("found {} live data directories, refusing to guess: {}", matches.len(), join_paths(matches))]
    AmbiguousLiveDir { matches: Vec<PathBuf> },

    #[error("unknown account `{0}`")]
    UnknownAccount(String),

    #[error("at least one account must be kept")]
    LastAccount,

    #[error("account label must not be empty")]
    EmptyLabel,
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
