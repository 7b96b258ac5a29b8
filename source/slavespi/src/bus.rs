//! # Bus collaborator
//!
//! The interface this crate needs from a platform's SPI slave driver. The
//! driver owns everything physical: pin muxing and pull-ups, the DMA engine,
//! and the hardware transaction queue. This crate only ever asks it to
//! activate a channel and to queue a [`Transaction`].

use core::{fmt, ptr::NonNull};

use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;

/// Identifies one hardware SPI peripheral ("host") that a channel runs on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub u8);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SPI{}", self.0)
    }
}

/// GPIO numbers assigned to each SPI role, from the slave's point of view.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PinRoles {
    /// Slave out, master in.
    pub miso: u8,
    /// Master out, slave in.
    pub mosi: u8,
    pub sclk: u8,
    /// Chip select, driven by the master.
    pub cs: u8,
}

/// Clock polarity/phase combination.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SpiMode {
    #[default]
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

/// How long [`SlaveBus::submit`] may wait for space in the hardware queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitPolicy {
    /// Block until a queue slot frees up.
    Forever,
    /// Fail immediately if the queue is full.
    NoWait,
}

/// Everything a driver needs to bring up one slave channel.
#[derive(Copy, Clone)]
pub struct Activation<'a> {
    pub host: HostId,
    pub pins: &'a PinRoles,
    pub mode: SpiMode,
    /// Maximum number of transactions in flight at once. Always at least 1.
    pub queue_depth: usize,
    /// Entry points the driver must call for *every* transaction it
    /// processes on this host.
    pub hooks: &'static dyn TransactionHooks,
}

impl fmt::Debug for Activation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("host", &self.host)
            .field("pins", self.pins)
            .field("mode", &self.mode)
            .field("queue_depth", &self.queue_depth)
            .finish_non_exhaustive()
    }
}

/// The two hardware hooks.
///
/// Most slave drivers accept one callback address per driver rather than one
/// per channel, so a single implementation receives the events for every
/// channel and must route them using the descriptor it is handed. In this
/// crate that implementation is [`SlaveSpi`](crate::SlaveSpi).
///
/// Both hooks run in interrupt context and must not block.
pub trait TransactionHooks: Sync {
    /// Called once `trans`'s buffers are loaded and visible to the master.
    fn after_queueing(&self, trans: NonNull<Transaction>);

    /// Called once the master has finished exchanging `trans`. The driver
    /// must have recorded the actual length with
    /// [`Transaction::set_trans_len_bits`] before calling this.
    fn after_transmission(&self, trans: NonNull<Transaction>);
}

/// A platform SPI slave driver.
pub trait SlaveBus: Sync {
    /// Driver-defined error code.
    type Error: fmt::Debug;

    /// Configure and enable a slave channel.
    fn activate(&self, activation: Activation<'_>) -> Result<(), Self::Error>;

    /// Queue `trans` on `host`, waiting for queue space according to `wait`.
    ///
    /// # Safety
    ///
    /// The caller must keep the descriptor, and both buffers it points at,
    /// alive and untouched until the driver has called
    /// [`TransactionHooks::after_transmission`] for it.
    unsafe fn submit(
        &self,
        host: HostId,
        trans: NonNull<Transaction>,
        wait: WaitPolicy,
    ) -> Result<(), Self::Error>;
}
