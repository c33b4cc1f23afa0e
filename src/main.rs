//! `session-governor` binary.

use std::process::ExitCode;

use clap::Parser;
use session_governor::runtime::{execute, Cli, EXIT_FATAL};
use session_governor::util::init_tracing;

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "session failed");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
