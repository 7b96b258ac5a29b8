//! The simulated SPI master.

use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use miette::{IntoDiagnostic, Result};
use slavespi::{sim::SimBus, HostId, SlaveSpi};

use crate::config::ChannelConfig;

/// Clocks a fixed number of exchanges against one host.
#[derive(Debug)]
pub struct SimMaster {
    host: HostId,
    capacity: usize,
    script: Vec<u8>,
    exchanges: usize,
    period: Duration,
}

/// What one master saw.
#[derive(Debug, Default)]
pub struct MasterReport {
    pub exchanges: usize,
    /// Everything the slave sent back, in order.
    pub miso: Vec<u8>,
}

impl SimMaster {
    pub fn new(config: &ChannelConfig, exchanges: usize, period: Duration) -> Self {
        Self {
            host: config.host,
            capacity: config.capacity,
            script: config.script.clone().into_bytes(),
            exchanges,
            period,
        }
    }

    /// The MOSI bytes for exchange number `n`: the matching slice of the
    /// script, zero-padded to a full transfer.
    fn mosi(&self, n: usize) -> Vec<u8> {
        let mut mosi = vec![0; self.capacity];
        let start = n.saturating_mul(self.capacity).min(self.script.len());
        let chunk = &self.script[start..];
        let len = chunk.len().min(self.capacity);
        mosi[..len].copy_from_slice(&chunk[..len]);
        mosi
    }

    #[tracing::instrument(
        name = "SimMaster::run",
        level = tracing::Level::INFO,
        skip(self, spi),
        fields(host = %self.host),
    )]
    pub fn run(self, spi: &SlaveSpi<SimBus>) -> Result<MasterReport> {
        let mut report = MasterReport::default();
        for n in 0..self.exchanges {
            if n > 0 && !self.period.is_zero() {
                thread::sleep(self.period);
            }
            let miso = spi.bus().exchange(self.host, &self.mosi(n)).into_diagnostic()?;
            tracing::debug!(n, miso = ?String::from_utf8_lossy(&miso), "exchanged");
            report.miso.extend(miso);
            report.exchanges += 1;
        }
        Ok(report)
    }

    pub fn spawn(self, spi: &'static SlaveSpi<SimBus>) -> Result<JoinHandle<Result<MasterReport>>> {
        thread::Builder::new()
            .name(format!("master-{}", self.host))
            .spawn(move || self.run(spi))
            .into_diagnostic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slavespi::{ChannelSettings, PinRoles};

    fn config(capacity: usize, script: &str) -> ChannelConfig {
        ChannelConfig {
            host: HostId(1),
            pins: PinRoles {
                miso: 1,
                mosi: 2,
                sclk: 3,
                cs: 4,
            },
            capacity,
            settings: ChannelSettings::default(),
            script: script.to_owned(),
            greeting: None,
        }
    }

    #[test]
    fn script_is_sliced_and_padded() {
        let master = SimMaster::new(&config(4, "abcdef"), 3, Duration::ZERO);
        assert_eq!(master.mosi(0), b"abcd");
        assert_eq!(master.mosi(1), b"ef\0\0");
        assert_eq!(master.mosi(2), [0; 4]);
        assert_eq!(master.mosi(usize::MAX), [0; 4]);
    }
}
