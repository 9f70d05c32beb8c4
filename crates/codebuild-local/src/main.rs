use anyhow::Result;
use clap::Parser;
use codebuild_local_core::errors::{exit_codes, BuildError};

mod cli;
mod commands;
mod ui;

#[tokio::main]
async fn main() -> Result<()> {
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Run finished and its summary is already printed
            if let Some(exit) = err.downcast_ref::<commands::run::RunExitCode>() {
                std::process::exit(exit.0);
            }

            if let Some(build_error) = err.downcast_ref::<BuildError>() {
                eprintln!("Error: {}", build_error);
                std::process::exit(build_error.exit_code());
            }

            eprintln!("Error: {:#}", err);
            std::process::exit(exit_codes::INTERNAL);
        }
    }
}
