use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sundial", version, about = "Sundial sync and triage service")]
pub struct Cli {
    /// Log output: `json` or `pretty`.
    #[arg(long, env = "SUNDIAL_LOG_FORMAT", default_value = "json", global = true)]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default if no subcommand given).
    Serve {
        #[arg(long, env = "SUNDIAL_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "SUNDIAL_PORT", default_value = "8000")]
        port: u16,

        /// Run a background sync of every linked user at this interval.
        #[arg(long, env = "SUNDIAL_SYNC_INTERVAL_SECS")]
        sync_interval_secs: Option<u64>,
    },

    /// Sync every linked user once and print the per-user results.
    SyncAll,

    /// Print a fresh base64 master key for SUNDIAL_MASTER_KEY.
    GenerateKey,
}
