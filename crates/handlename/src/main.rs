//! `hn`: command-line front end for handlename-core.

mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use handlename_core::config::Config;
use handlename_core::logging::{LogConfig, init_logging};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    init_logging(&LogConfig::from(&config.general)).map_err(handlename_core::Error::from)?;
    tracing::debug!(version = handlename_core::VERSION, "hn starting");

    match cli.command {
        Commands::Resolve(args) => commands::resolve::run(&config, args).await,
        Commands::Extract { file } => commands::extract::run(file.as_deref()),
        Commands::Cache { action } => commands::cache::run(&config, action).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .map_err(handlename_core::Error::from)?;

    if let Some(level) = &cli.log_level {
        config.general.log_level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    Ok(config)
}

fn report(err: &anyhow::Error) {
    eprintln!("error: {err:#}");
    if let Some(remediation) = err
        .downcast_ref::<handlename_core::Error>()
        .and_then(handlename_core::Error::remediation)
    {
        eprint!("\n{}", remediation.render_plain());
    }
}
