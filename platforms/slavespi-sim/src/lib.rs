//! A desktop simulator for `slavespi`.
//!
//! Each configured channel gets a simulated master thread clocking exchanges
//! on its host, and a loopback application thread echoing back whatever the
//! channel receives.

pub mod app;
pub mod cli;
pub mod config;
pub mod master;
pub mod sim_tracing;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use miette::{miette, Result};
use slavespi::{dma::HeapDma, sim::SimBus, ChannelStats, HostId, SlaveSpi};

use crate::{app::Loopback, config::SimConfig, master::SimMaster};

static DMA: HeapDma = HeapDma::new();

/// How one channel fared.
#[derive(Debug)]
pub struct ChannelReport {
    pub host: HostId,
    pub stats: ChannelStats,
    /// Everything the master read from the slave.
    pub miso: Vec<u8>,
    /// Bytes the application echoed back.
    pub echoed: usize,
    /// Completion callbacks delivered.
    pub notifications: usize,
}

/// Run every channel in `config` to completion.
///
/// `exchanges` and `period` override the config's values.
#[tracing::instrument(name = "Sim", level = tracing::Level::INFO, skip_all)]
pub fn run(
    config: &SimConfig,
    exchanges: Option<usize>,
    period: Option<Duration>,
) -> Result<Vec<ChannelReport>> {
    let exchanges = exchanges.unwrap_or(config.exchanges);
    let period = period.unwrap_or_else(|| config.period());
    let spi: &'static SlaveSpi<SimBus> = Box::leak(Box::new(SlaveSpi::new(SimBus::new(), &DMA)));

    let mut running = Vec::with_capacity(config.channels.len());
    for cfg in &config.channels {
        let host = cfg.host;
        let chan = spi
            .register(host)
            .map_err(|error| miette!("failed to register a channel on {host}: {error}"))?;

        if let Some(greeting) = &cfg.greeting {
            chan.write(greeting.as_bytes())
                .map_err(|error| miette!("failed to queue greeting on {host}: {error}"))?;
        }

        let notifications = Arc::new(AtomicUsize::new(0));
        let callback = {
            let notifications = notifications.clone();
            move || {
                notifications.fetch_add(1, Ordering::Relaxed);
                0
            }
        };
        chan.configure(cfg.pins, cfg.capacity, callback, cfg.settings)
            .map_err(|error| miette!("failed to configure {host}: {error}"))?;

        let app = Loopback::new(chan.clone()).spawn()?;
        let master = SimMaster::new(cfg, exchanges, period).spawn(spi)?;
        running.push((chan, app, master, notifications));
    }
    tracing::info!(channels = running.len(), exchanges, ?period, "simulation running");

    let mut reports = Vec::with_capacity(running.len());
    for (chan, app, master, notifications) in running {
        let host = chan.host();
        let master = master
            .join()
            .map_err(|_| miette!("master thread for {host} panicked"))??;

        // wakes the loopback with an error once it has drained what is left
        spi.deregister(chan.id());
        let echoed = app
            .join()
            .map_err(|_| miette!("application thread for {host} panicked"))?;

        reports.push(ChannelReport {
            host,
            stats: chan.stats(),
            miso: master.miso,
            echoed,
            notifications: notifications.load(Ordering::Relaxed),
        });
    }
    Ok(reports)
}
