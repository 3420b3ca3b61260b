//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "callback-server",
    about = "Delivery-status callback server",
    version,
    long_about = "Receives delivery-status callbacks pushed by the messaging provider, \
                  authenticates them and logs every event."
)]
pub struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "CALLBACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8081
    #[arg(long)]
    pub listen: Option<String>,

    /// Callback path
    #[arg(long)]
    pub path: Option<String>,

    /// Accept callbacks without checking credentials
    #[arg(long)]
    pub no_auth: bool,

    /// Log whole batches through one handler instead of one handler per event type
    #[arg(long)]
    pub unified: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Enable JSON log format (useful for production)
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}
