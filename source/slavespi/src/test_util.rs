use crate::{dma::HeapDma, sim::SimBus, PinRoles, SlaveSpi};

pub(crate) static DMA: HeapDma = HeapDma::new();

/// A fresh registry on a fresh simulated bus.
///
/// Leaked, like the real thing; tests are short-lived.
pub(crate) fn leak_spi() -> &'static SlaveSpi<SimBus> {
    Box::leak(Box::new(SlaveSpi::new(SimBus::new(), &DMA)))
}

pub(crate) fn pins() -> PinRoles {
    PinRoles {
        miso: 12,
        mosi: 13,
        sclk: 14,
        cs: 15,
    }
}

pub(crate) fn trace_init() {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        prelude::*,
    };
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse("slavespi=trace").unwrap()
    } else {
        builder.parse_lossy(env)
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .without_time()
        .finish()
        .try_init();
}
