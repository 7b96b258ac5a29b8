use std::time::Duration;

use clap::Parser;
use slavespi_sim::{cli, config};

fn main() -> miette::Result<()> {
    let args = cli::Args::parse();
    args.tracing.setup_tracing();
    let _span = tracing::info_span!("SlaveSpiSim").entered();

    let config = config::load_config(args.config.as_deref())?;
    tracing::info!(settings = ?config, "Loaded settings");

    let reports = slavespi_sim::run(
        &config,
        args.sim.exchanges,
        args.sim.period_ms.map(Duration::from_millis),
    )?;

    println!("========================================");
    for report in &reports {
        let s = &report.stats;
        println!(
            "{}: {} exchanges, {} bytes in, {} bytes out, {} echoed, {} overrun, {} callbacks",
            report.host,
            s.exchanges,
            s.bytes_received,
            s.bytes_sent,
            report.echoed,
            s.overrun_bytes,
            report.notifications,
        );
        println!("    master read: {:?}", String::from_utf8_lossy(&report.miso));
    }
    println!("========================================");
    Ok(())
}
