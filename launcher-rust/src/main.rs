mod accounts;
mod cli;
mod collaborator;
mod config;
mod error;
mod fs_ops;
mod launch;
mod logging;
mod paths;
mod payload;
mod process;
mod snapshot;
mod store;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let paths = paths::Paths::detect()?;
    logging::init(&paths.logs_dir)?;
    info!(version = config::VERSION, app = config::APP_ID, "starting {}", config::PRODUCT_NAME);

    let code = cli::run(args, &paths).inspect_err(|err| error!(error = %format!("{err:#}"), "command failed"))?;
    std::process::exit(code)
}
