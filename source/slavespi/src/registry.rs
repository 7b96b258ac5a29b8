//! The channel registry and hook dispatcher.

use alloc::{sync::Arc, vec::Vec};
use core::{cell::RefCell, fmt, ptr::NonNull};

use critical_section::Mutex;

use crate::{
    bus::{HostId, SlaveBus, TransactionHooks},
    channel::Channel,
    dma::DmaAlloc,
    isr::Isr,
    transaction::Transaction,
};

/// Stable handle for a registered channel.
///
/// Slots are never reused, so an id keeps naming the same channel (or
/// nothing) for the life of the [`SlaveSpi`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChannelId(usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegisterError {
    /// The registry could not grow.
    NoMemory,
}

/// Owns the bus driver and every channel on it.
///
/// Usually created once at startup and leaked, so that it can be handed to
/// the driver as its `&'static` [`TransactionHooks`].
pub struct SlaveSpi<B: SlaveBus + 'static> {
    bus: B,
    dma: &'static dyn DmaAlloc,
    channels: Mutex<RefCell<Vec<Option<Arc<Channel<B>>>>>>,
}

impl ChannelId {
    /// Value stored in the descriptor's `user` field. Never zero.
    #[inline]
    pub(crate) fn tag(self) -> usize {
        self.0 + 1
    }

    #[inline]
    fn from_tag(tag: usize) -> Option<Self> {
        tag.checked_sub(1).map(Self)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan{}", self.0)
    }
}

impl<B: SlaveBus + 'static> SlaveSpi<B> {
    #[must_use]
    pub fn new(bus: B, dma: &'static dyn DmaAlloc) -> Self {
        Self {
            bus,
            dma,
            channels: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub(crate) fn dma(&self) -> &'static dyn DmaAlloc {
        self.dma
    }

    /// Create a channel on `host` and add it to the registry.
    ///
    /// The channel is unconfigured; nothing reaches the bus until
    /// [`Channel::configure`] is called.
    #[tracing::instrument(
        name = "SlaveSpi::register",
        level = tracing::Level::DEBUG,
        skip(self),
        fields(%host),
        err(Debug),
    )]
    pub fn register(&'static self, host: HostId) -> Result<Arc<Channel<B>>, RegisterError> {
        critical_section::with(|cs| {
            let mut channels = self.channels.borrow_ref_mut(cs);
            channels
                .try_reserve(1)
                .map_err(|_| RegisterError::NoMemory)?;
            let id = ChannelId(channels.len());
            let chan = Arc::new(Channel::new(id, host, self));
            channels.push(Some(chan.clone()));
            tracing::debug!(%id, "channel registered");
            Ok(chan)
        })
    }

    /// Remove a channel from the registry.
    ///
    /// Hook calls for its descriptor are ignored from now on, and anyone
    /// waiting in [`Channel::read_async`] is woken with an error. The slot is
    /// not reused.
    pub fn deregister(&self, id: ChannelId) -> Option<Arc<Channel<B>>> {
        let chan = critical_section::with(|cs| {
            self.channels
                .borrow_ref_mut(cs)
                .get_mut(id.0)
                .and_then(Option::take)
        })?;
        chan.retire();
        tracing::info!(%id, host = %chan.host(), "channel deregistered");
        Some(chan)
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel<B>>> {
        critical_section::with(|cs| self.channels.borrow_ref(cs).get(id.0).cloned().flatten())
    }

    /// Every live channel, in registration order.
    pub fn channels(&self) -> Vec<Arc<Channel<B>>> {
        critical_section::with(|cs| {
            self.channels
                .borrow_ref(cs)
                .iter()
                .flatten()
                .cloned()
                .collect()
        })
    }

    /// Number of live channels.
    #[must_use]
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.channels.borrow_ref(cs).iter().flatten().count())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the channel whose descriptor is `trans`.
    ///
    /// The tag in the descriptor names the likely owner, but only pointer
    /// identity is trusted: a stale or foreign tag falls back to scanning
    /// every channel.
    pub fn find_owner(&self, trans: NonNull<Transaction>) -> Option<Arc<Channel<B>>> {
        // SAFETY: the driver only hands us descriptors that are still alive.
        let tag = unsafe { trans.as_ref().tag() };
        critical_section::with(|cs| {
            let channels = self.channels.borrow_ref(cs);
            let tagged = ChannelId::from_tag(tag)
                .and_then(|id| channels.get(id.0))
                .and_then(Option::as_ref)
                .filter(|chan| chan.owns(trans));
            tagged
                .or_else(|| channels.iter().flatten().find(|chan| chan.owns(trans)))
                .cloned()
        })
    }
}

impl<B: SlaveBus + 'static> TransactionHooks for SlaveSpi<B> {
    fn after_queueing(&self, trans: NonNull<Transaction>) {
        debug_assert!(Isr::is_in_isr(), "hooks must be called from the bus ISR");
        match self.find_owner(trans) {
            Some(chan) => chan.on_queued(),
            None => tracing::warn!(?trans, "after-queueing for an unknown descriptor; ignoring"),
        }
    }

    fn after_transmission(&self, trans: NonNull<Transaction>) {
        debug_assert!(Isr::is_in_isr(), "hooks must be called from the bus ISR");
        match self.find_owner(trans) {
            Some(chan) => chan.on_transmission(),
            None => {
                tracing::warn!(?trans, "after-transmission for an unknown descriptor; ignoring")
            }
        }
    }
}

impl<B: SlaveBus + fmt::Debug + 'static> fmt::Debug for SlaveSpi<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveSpi")
            .field("bus", &self.bus)
            .field("channels", &self.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => f.write_str("out of memory growing the channel registry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sim::SimError, test_util::*, ChannelSettings, ChannelStatus};

    #[test]
    fn channels_do_not_cross_talk() {
        trace_init();
        let spi = leak_spi();

        let chans: Vec<_> = (0..4u8)
            .map(|n| {
                let chan = spi.register(HostId(n)).unwrap();
                chan.write(&[b'a' + n; 3]).unwrap();
                chan.configure(pins(), 3, || 0, ChannelSettings::default())
                    .unwrap();
                chan
            })
            .collect();

        // exchange out of registration order
        for n in [2u8, 0, 3, 1] {
            let miso = spi.bus().exchange(HostId(n), &[b'A' + n; 3]).unwrap();
            assert_eq!(miso, [b'a' + n; 3]);
        }
        for (n, chan) in chans.iter().enumerate() {
            assert_eq!(chan.read(), [b'A' + n as u8; 3]);
            assert_eq!(chan.stats().exchanges, 1);
        }
    }

    #[test]
    fn owner_found_by_identity_despite_bad_tag() {
        trace_init();
        let spi = leak_spi();
        let a = spi.register(HostId(1)).unwrap();
        let b = spi.register(HostId(2)).unwrap();
        a.configure(pins(), 4, || 0, ChannelSettings::default())
            .unwrap();
        b.configure(pins(), 4, || 0, ChannelSettings::default())
            .unwrap();

        let mut trans = spi.bus().head(HostId(2)).unwrap();
        // point b's tag at a; lookup must still land on b
        unsafe { trans.as_mut().reset(4, a.id().tag()) };
        let owner = spi.find_owner(trans).unwrap();
        assert_eq!(owner.id(), b.id());
    }

    #[test]
    fn unknown_descriptor_is_ignored() {
        trace_init();
        let spi = leak_spi();
        let chan = spi.register(HostId(1)).unwrap();
        chan.configure(pins(), 4, || 0, ChannelSettings::default())
            .unwrap();

        let tx = crate::DmaBuffer::new_in(&DMA, 4).unwrap();
        let mut rx = crate::DmaBuffer::new_in(&DMA, 4).unwrap();
        let mut stray = Transaction::new(&tx, &mut rx, 4);
        stray.reset(4, chan.id().tag());
        stray.set_trans_len_bits(32);

        assert!(spi.find_owner(NonNull::from(&mut stray)).is_none());
        {
            let _isr = Isr::enter();
            spi.after_transmission(NonNull::from(&mut stray));
        }
        assert_eq!(chan.stats().exchanges, 0);
        assert_eq!(chan.available(), 0);
    }

    #[test]
    fn deregistered_channel_stops_receiving() {
        trace_init();
        let spi = leak_spi();
        let chan = spi.register(HostId(3)).unwrap();
        chan.configure(pins(), 2, || 0, ChannelSettings::default())
            .unwrap();
        assert_eq!(spi.len(), 1);

        let removed = spi.deregister(chan.id()).unwrap();
        assert_eq!(removed.id(), chan.id());
        assert_eq!(chan.status(), ChannelStatus::Deregistered);
        assert!(spi.is_empty());
        assert!(spi.channel(chan.id()).is_none());
        assert!(spi.deregister(chan.id()).is_none());

        // the descriptor is still queued, but nobody claims it
        spi.bus().exchange(HostId(3), b"zz").unwrap();
        assert_eq!(chan.available(), 0);
        assert_eq!(
            chan.write(b"x"),
            Err(crate::WriteError::Deregistered)
        );

        // slot ids are not recycled
        let next = spi.register(HostId(3)).unwrap();
        assert_ne!(next.id(), chan.id());
        assert_eq!(spi.bus().exchange(HostId(4), b"zz"), Err(SimError::NotActive(HostId(4))));
    }
}
