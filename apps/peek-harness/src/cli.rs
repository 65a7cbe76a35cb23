use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "peek-harness")]
#[command(about = "Drives the peek coordination core through a scripted scenario")]
pub struct Cli {
    /// Ticks to run after the scripted steps
    #[arg(long, default_value_t = 200)]
    pub ticks: u64,

    /// Directory for persisted pre-peek snapshots
    #[arg(long, env = "PEEK_SNAPSHOT_DIR")]
    pub snapshot_dir: Option<PathBuf>,

    /// Treat one tick as one second and shorten the settle windows
    #[arg(long)]
    pub fast: bool,

    /// Tracing filter
    #[arg(long, env = "RUST_LOG", default_value = crate::telemetry::DEFAULT_FILTER)]
    pub log_filter: String,
}
