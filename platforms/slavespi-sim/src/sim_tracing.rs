use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, clap::Args)]
pub struct TracingOpts {
    /// A `tracing` filter, in `EnvFilter` syntax.
    ///
    /// For example, `slavespi=trace` shows every re-arm and completion.
    #[clap(long = "trace", env = "SLAVESPI_TRACE", default_value = "info")]
    pub filter: String,
}

impl TracingOpts {
    pub fn setup_tracing(&self) {
        let filter = EnvFilter::builder().parse_lossy(&self.filter);
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(filter))
            .init();
    }
}
