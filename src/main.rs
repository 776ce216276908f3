use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use sourcegate::cli::{Cli, Command};
use sourcegate::commands;
use sourcegate::config::CurationConfig;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    sourcegate::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = CurationConfig::load(cli.config.as_deref()).context("load config")?;

    match cli.command {
        Command::Check(args) => {
            commands::check(&config, args).await.context("check")?;
        }
        Command::Init(args) => {
            commands::init(args).await.context("init")?;
        }
        Command::Curate(args) => {
            commands::curate(&config, args).await.context("curate")?;
        }
        Command::Gaps(args) => {
            commands::gaps(&config, args).await.context("gaps")?;
        }
        Command::Dod(args) => {
            commands::dod(&config, args).await.context("dod")?;
        }
        Command::Validate(args) => {
            commands::validate(&config, args).await.context("validate")?;
        }
    }

    Ok(())
}
