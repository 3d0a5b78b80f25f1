use std::process::ExitCode;

use clap::Parser;
use review_metrics_cli::{run_cli, Cli};
use review_metrics_store_sqlite::error_code;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {err:#}", error_code(&err));
            ExitCode::FAILURE
        }
    }
}
