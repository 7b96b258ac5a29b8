use crate::sim_tracing;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Path to a TOML simulation config. The built-in config is used if this
    /// is not set.
    #[clap(long, short, env = "SLAVESPI_SIM_CONFIG")]
    pub config: Option<PathBuf>,

    #[clap(flatten)]
    pub sim: SimOptions,

    #[clap(flatten)]
    pub tracing: sim_tracing::TracingOpts,
}

#[derive(Debug, clap::Args)]
pub struct SimOptions {
    /// Number of exchanges each simulated master clocks. Overrides the
    /// config file.
    #[clap(long, short = 'n')]
    pub exchanges: Option<usize>,

    /// Milliseconds between exchanges. Overrides the config file.
    #[clap(long)]
    pub period_ms: Option<u64>,
}
