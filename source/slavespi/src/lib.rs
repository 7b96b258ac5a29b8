//! # slavespi
//!
//! A byte-stream layer on top of a DMA-driven SPI *slave* peripheral.
//!
//! An SPI slave does not get to decide when data moves: the external master
//! drives the clock and chip-select, and each exchange moves one fixed-size
//! DMA buffer in each direction. This crate turns that model into a pair of
//! unbounded byte streams per channel:
//!
//! * an **outgoing** stream, filled by [`Channel::write`] and sliced into
//!   transmit buffers, one buffer per exchange;
//! * an **incoming** stream, appended to after every completed exchange and
//!   drained by [`Channel::read`], [`Channel::read_byte`] or
//!   [`Channel::read_async`].
//!
//! ## Moving parts
//!
//! * [`SlaveSpi`] is the coordinating object. It owns the [`SlaveBus`]
//!   driver, a [`DmaAlloc`] reference and the registry of every [`Channel`].
//!   It is also the [`TransactionHooks`] implementation handed to the bus
//!   driver, so the two hardware hooks find the owning channel without any
//!   global state.
//! * A [`Channel`] owns one pair of DMA buffers and exactly one live
//!   [`Transaction`] descriptor. After every exchange it drains the receive
//!   buffer, refills the transmit buffer from the outgoing stream, and
//!   resubmits the descriptor before returning from the hook.
//!
//! ## Startup
//!
//! ```rust
//! # #[cfg(feature = "use-std")]
//! # fn main() {
//! use slavespi::{dma::HeapDma, sim::SimBus, ChannelSettings, HostId, PinRoles, SlaveSpi};
//!
//! static DMA: HeapDma = HeapDma::new();
//!
//! let spi: &'static SlaveSpi<SimBus> = Box::leak(Box::new(SlaveSpi::new(SimBus::new(), &DMA)));
//! let chan = spi.register(HostId(2)).unwrap();
//!
//! // bytes may be queued before the channel is configured...
//! chan.write(b"HELLO").unwrap();
//!
//! // ...and configuring arms the first transaction with the head of the stream.
//! let pins = PinRoles { miso: 12, mosi: 13, sclk: 14, cs: 15 };
//! chan.configure(pins, 4, || 0, ChannelSettings::default()).unwrap();
//!
//! // "HELL" is armed; "O" waits for the next exchange.
//! assert_eq!(chan.pending(), 1);
//! assert_eq!(spi.bus().exchange(HostId(2), b"ABCD").unwrap(), b"HELL");
//! assert_eq!(chan.read(), b"ABCD");
//! # }
//! # #[cfg(not(feature = "use-std"))]
//! # fn main() {}
//! ```
//!
//! ## Interrupt context
//!
//! Bus drivers call the hooks from an interrupt (or interrupt-adjacent)
//! context and are expected to wrap those calls in an [`isr::Isr`] guard.
//! Both streams are guarded by [`critical_section`], so `write`/`read` from
//! thread mode never race with the completion path.

#![cfg_attr(not(any(feature = "use-std", test)), no_std)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

pub mod bus;
pub mod channel;
pub mod dma;
pub mod isr;
pub mod registry;
pub mod settings;
#[cfg(any(feature = "use-std", test))]
pub mod sim;
pub mod stream;
pub mod transaction;

#[cfg(test)]
pub(crate) mod test_util;

pub use bus::{Activation, HostId, PinRoles, SlaveBus, SpiMode, TransactionHooks, WaitPolicy};
pub use channel::{Channel, ChannelStats, ChannelStatus, ConfigureError, WriteError};
pub use dma::{DmaAlloc, DmaBuffer};
pub use registry::{ChannelId, RegisterError, SlaveSpi};
pub use settings::{ChannelSettings, DrainMode};
pub use transaction::Transaction;
