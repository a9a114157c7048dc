// file: src/main.rs
// version: 2.0.0
// guid: a909d796-a8c9-4faa-a566-cb11628b6514

//! ubautoiso - main entry point

use clap::Parser;
use colored::*;
use std::error::Error as _;
use std::process::ExitCode;
use tokio::signal;
use tracing::warn;
use ubautoiso::{
    cli::{build_command, Cli},
    logging::{init_json_logger, init_logger},
    AutoInstallError,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logger = if cli.json_logs {
        init_json_logger(cli.verbose, cli.quiet)
    } else {
        init_logger(cli.verbose, cli.quiet)
    };
    if let Err(e) = logger {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    let shutdown_signal = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        warn!("Received Ctrl+C, stopping; partial downloads are kept for resume, no image is written");
    };

    tokio::select! {
        result = build_command(&cli) => match result {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                report_error(&e);
                ExitCode::FAILURE
            }
        },
        _ = shutdown_signal => ExitCode::from(130),
    }
}

/// Operational failures get one line; anything unexpected gets the chain
fn report_error(error: &AutoInstallError) {
    eprintln!();
    if error.is_expected() {
        eprintln!("{} {}", "✗".red().bold(), error.to_string().red().bold());
    } else {
        eprintln!(
            "{}",
            "Something totally unexpected has happened. Details follow."
                .red()
                .bold()
        );
        eprintln!("  {:?}", error);
        let mut source = error.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
    }
    eprintln!();
}
