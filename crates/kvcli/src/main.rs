#![warn(missing_docs)]

//! kvcli binary entry point.

use clap::Parser;
use kvcli::{report, Cli, KvcliConfig};
use kvcli_storage::StorageError;
use std::io::Write;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match KvcliConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let result = cli.run(&config, &mut out).await;
    let result = result.and_then(|outcome| {
        report(&outcome, &mut out)?;
        out.flush()?;
        Ok(outcome)
    });

    match result {
        Ok(outcome) => {
            tracing::debug!("Finished: {:?}", outcome);
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let Some(StorageError::UnknownStatus { .. }) = e.downcast_ref::<StorageError>() {
                let _ = writeln!(out, "Unknown error.");
            }
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
