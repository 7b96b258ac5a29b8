//! The application side of a simulated channel.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use miette::{IntoDiagnostic, Result};
use slavespi::{sim::SimBus, Channel, WriteError};

/// Echoes everything a channel receives back to the master.
///
/// Runs until the channel is deregistered, then returns the number of bytes
/// it echoed.
pub struct Loopback {
    chan: Arc<Channel<SimBus>>,
}

impl Loopback {
    pub fn new(chan: Arc<Channel<SimBus>>) -> Self {
        Self { chan }
    }

    pub async fn run(self) -> usize {
        let host = self.chan.host();
        let mut echoed = 0;
        while let Ok(bytes) = self.chan.read_async().await {
            tracing::trace!(%host, len = bytes.len(), "echoing");
            match self.chan.write(&bytes) {
                Ok(()) => echoed += bytes.len(),
                Err(WriteError::Full(full)) => {
                    tracing::warn!(%host, %full, "outgoing stream full; dropping echo");
                }
                Err(error) => {
                    tracing::info!(%host, %error, "channel stopped; loopback exiting");
                    break;
                }
            }
        }
        echoed
    }

    pub fn spawn(self) -> Result<JoinHandle<usize>> {
        thread::Builder::new()
            .name(format!("app-{}", self.chan.host()))
            .spawn(move || futures::executor::block_on(self.run()))
            .into_diagnostic()
    }
}
