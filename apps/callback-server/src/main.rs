mod app;
mod cli;
mod settings;
mod telemetry;

use std::process::ExitCode;

use anyhow::Result;
use callback_receiver::ShutdownOutcome;
use clap::Parser;
use tracing::{error, info, warn};

use crate::app::App;
use crate::cli::Args;
use crate::telemetry::init_telemetry;

/// Exit status after connections had to be force-closed
const EXIT_FORCED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let args = Args::parse();
    init_telemetry(&args)?;

    info!("Starting callback server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match run_application(args).await {
        Ok(ShutdownOutcome::Graceful) => {
            info!("Server shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
        Ok(ShutdownOutcome::Forced) => {
            warn!("Server shutdown forced");
            Ok(ExitCode::from(EXIT_FORCED))
        }
        Err(e) => {
            error!("Application error: {:#}", e);
            Err(e)
        }
    }
}

async fn run_application(args: Args) -> Result<ShutdownOutcome> {
    let config = settings::load(&args)?;
    let app = App::build(&args, config)?;

    let report = app.run().await?;
    info!(
        reason = ?report.reason,
        outcome = ?report.outcome,
        elapsed_ms = report.elapsed.as_millis() as u64,
        detached_batches = report.detached_batches,
        "Shutdown report"
    );

    Ok(report.outcome)
}
