use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "safebox")]
#[command(version, about = "Run untrusted programs under a monitored execution policy", long_about = None)]
#[command(after_help = "EXAMPLES:
    safebox run /bin/echo hello
    safebox run --memory 128M --timeout 10 --strict python3 script.py
    safebox run --json -- sh -c 'sleep 1 & wait'
    safebox show ./sandbox-reports/reports/1a2b3c4d_20240101_120000.json
    safebox quarantine ./dropper.bin --reason 'flagged by scanner'
    safebox check
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory for reports and quarantine (default: $SAFEBOX_STORAGE_DIR or ./sandbox-reports)
    #[arg(long, value_name = "PATH", global = true)]
    pub storage: Option<PathBuf>,

    /// Parent directory of sandbox workspaces
    #[arg(long, value_name = "PATH", global = true)]
    pub workspace: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program in a fresh sandbox and print its report
    Run {
        /// Program to run
        program: String,

        /// Program arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Sandbox ID (auto-generated if not provided)
        #[arg(short, long, value_name = "ID")]
        id: Option<String>,

        /// Memory limit (100M, 1G)
        #[arg(short, long, value_name = "SIZE")]
        memory: Option<String>,

        /// CPU limit percentage
        #[arg(short, long, value_name = "PERCENT")]
        cpu: Option<f64>,

        /// Timeout in seconds
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<u64>,

        /// Maximum descendant processes
        #[arg(short = 'p', long, value_name = "COUNT")]
        max_processes: Option<u32>,

        /// Terminate on the first anomaly
        #[arg(long)]
        strict: bool,

        /// Sampling interval in milliseconds
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a persisted report
    Show {
        /// Report file
        report: PathBuf,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Move a file into quarantine
    Quarantine {
        /// File to quarantine
        file: PathBuf,

        /// Reason recorded in the quarantine log
        #[arg(short, long, default_value = "manual")]
        reason: String,
    },

    /// Check that the host exposes what the monitor needs
    Check,
}
