use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "biosync",
    version,
    about = "Multi-device physiological signal acquisition runner",
    long_about = "Start a synchronized acquisition session: producers stream into a \
                  shared time grid, rows are exported to CSV, and event/spike markers \
                  are recorded in a sidecar file. Without --config, a built-in demo \
                  configuration with synthetic sine devices is used."
)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults overlay missing keys)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Stop the session after this many seconds (default: run until Ctrl-C)
    #[arg(long)]
    pub duration: Option<f64>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
