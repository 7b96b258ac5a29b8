//! # Slave channels
//!
//! A [`Channel`] is one configured SPI slave peripheral: a pair of DMA
//! buffers, the single [`Transaction`] descriptor bound to them, and the two
//! byte streams the application talks to.
//!
//! The life of a channel:
//!
//! 1. [`SlaveSpi::register`] creates it and adds it to the registry. Bytes
//!    may already be queued with [`Channel::write`] at this point.
//! 2. [`Channel::configure`] allocates the buffers, activates the bus and
//!    submits the first transaction ("arms" the channel).
//! 3. Every time the master finishes an exchange, the bus driver calls the
//!    after-transmission hook and the channel drains the receive buffer into
//!    the incoming stream, re-arms, and then calls the user callback.
//!
//! Step 3 repeats until power-off. The channel is never left without a
//! queued transaction between exchanges: re-arming happens before the hook
//! returns, so the master always finds fresh buffers.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{cell::RefCell, fmt, ptr::NonNull};

use critical_section::Mutex;
use portable_atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::{
    bus::{Activation, HostId, PinRoles, SlaveBus, WaitPolicy},
    dma::{AllocError, DmaBuffer},
    registry::{ChannelId, SlaveSpi},
    settings::{ChannelSettings, DrainMode},
    stream::{ByteStream, Closed, StreamFull},
    transaction::Transaction,
};

/// Called after every completed exchange, once the channel has re-armed.
///
/// The return value is a status code; anything other than zero is logged
/// and recorded in [`ChannelStats::last_status`], but otherwise ignored.
pub type Callback = Arc<dyn Fn() -> i32 + Send + Sync>;

pub struct Channel<B: SlaveBus + 'static> {
    id: ChannelId,
    host: HostId,
    spi: &'static SlaveSpi<B>,
    armed: Mutex<RefCell<Option<Armed>>>,
    /// Address of the live descriptor, for matching hook calls without
    /// entering a critical section.
    descriptor: AtomicPtr<Transaction>,
    capacity: AtomicUsize,
    status: AtomicU8,
    in_flight: AtomicBool,
    outgoing: ByteStream,
    incoming: ByteStream,
    counters: Counters,
}

/// A channel's buffer pair and the descriptor bound to them.
struct Armed {
    tx: DmaBuffer,
    rx: DmaBuffer,
    trans: Box<Transaction>,
    capacity: usize,
    drain: DrainMode,
    callback: Callback,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelStatus {
    Unconfigured,
    Configuring,
    /// Armed and exchanging with the master.
    Running,
    /// A resubmission failed; the channel no longer exchanges data.
    Faulted,
    /// Removed from the registry.
    Deregistered,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ChannelStats {
    /// Exchanges completed with the master.
    pub exchanges: usize,
    /// Bytes appended to the incoming stream.
    pub bytes_received: usize,
    /// Payload bytes loaded into transmit buffers (excluding zero fill).
    pub bytes_sent: usize,
    /// After-queueing notifications seen.
    pub queued: usize,
    /// Received bytes dropped because the incoming stream was full.
    pub overrun_bytes: usize,
    /// The callback's most recent non-zero return value.
    pub last_status: i32,
}

#[derive(Debug, Eq, PartialEq)]
pub enum ConfigureError<E> {
    ZeroCapacity,
    AlreadyConfigured,
    Deregistered,
    Alloc(AllocError),
    /// The driver refused to activate the channel.
    Activate(E),
    /// The driver refused the first transaction.
    Submit(E),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteError {
    Full(StreamFull),
    Faulted,
    Deregistered,
}

#[derive(Default)]
struct Counters {
    exchanges: AtomicUsize,
    bytes_received: AtomicUsize,
    bytes_sent: AtomicUsize,
    queued: AtomicUsize,
    overrun_bytes: AtomicUsize,
    last_status: AtomicI32,
}

impl ChannelStatus {
    const UNCONFIGURED: u8 = 0;
    const CONFIGURING: u8 = 1;
    const RUNNING: u8 = 2;
    const FAULTED: u8 = 3;
    const DEREGISTERED: u8 = 4;

    fn from_u8(status: u8) -> Self {
        match status {
            Self::UNCONFIGURED => Self::Unconfigured,
            Self::CONFIGURING => Self::Configuring,
            Self::RUNNING => Self::Running,
            Self::FAULTED => Self::Faulted,
            _ => Self::Deregistered,
        }
    }
}

impl<B: SlaveBus + 'static> Channel<B> {
    pub(crate) fn new(id: ChannelId, host: HostId, spi: &'static SlaveSpi<B>) -> Self {
        Self {
            id,
            host,
            spi,
            armed: Mutex::new(RefCell::new(None)),
            descriptor: AtomicPtr::new(core::ptr::null_mut()),
            capacity: AtomicUsize::new(0),
            status: AtomicU8::new(ChannelStatus::UNCONFIGURED),
            in_flight: AtomicBool::new(false),
            outgoing: ByteStream::new(),
            incoming: ByteStream::new(),
            counters: Counters::default(),
        }
    }

    /// Allocate this channel's buffers, activate it on the bus, and submit
    /// the first transaction.
    ///
    /// `capacity` is the number of bytes moved in each direction per
    /// exchange. The DMA allocation may be larger (see
    /// [`MIN_DMA_BUFFER`](crate::dma::MIN_DMA_BUFFER)), but the declared
    /// transaction length is always exactly `capacity * 8` bits.
    ///
    /// If activation fails the channel stays unconfigured and `configure`
    /// may be retried. If the first submission fails the channel is
    /// [`ChannelStatus::Faulted`].
    #[tracing::instrument(
        name = "Channel::configure",
        level = tracing::Level::INFO,
        skip(self, callback),
        fields(host = %self.host, id = ?self.id),
        err(Debug),
    )]
    pub fn configure<F>(
        &self,
        pins: PinRoles,
        capacity: usize,
        callback: F,
        settings: ChannelSettings,
    ) -> Result<(), ConfigureError<B::Error>>
    where
        F: Fn() -> i32 + Send + Sync + 'static,
    {
        if capacity == 0 {
            return Err(ConfigureError::ZeroCapacity);
        }

        if let Err(status) = self.status.compare_exchange(
            ChannelStatus::UNCONFIGURED,
            ChannelStatus::CONFIGURING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match ChannelStatus::from_u8(status) {
                ChannelStatus::Deregistered => ConfigureError::Deregistered,
                _ => ConfigureError::AlreadyConfigured,
            });
        }

        let buffers = DmaBuffer::new_in(self.spi.dma(), capacity)
            .and_then(|tx| Ok((tx, DmaBuffer::new_in(self.spi.dma(), capacity)?)));
        let (tx, mut rx) = match buffers {
            Ok(bufs) => bufs,
            Err(error) => {
                self.finish_configuring(ChannelStatus::UNCONFIGURED)?;
                return Err(ConfigureError::Alloc(error));
            }
        };
        tracing::debug!(capacity, dma_len = tx.len(), "allocated DMA buffers");

        self.outgoing.set_limit(settings.max_outgoing);
        self.incoming.set_limit(settings.max_incoming);

        let activation = Activation {
            host: self.host,
            pins: &pins,
            mode: settings.mode,
            queue_depth: settings.queue_depth.max(1),
            hooks: self.spi,
        };
        if let Err(error) = self.spi.bus().activate(activation) {
            tracing::error!(?error, "bus refused to activate channel");
            self.finish_configuring(ChannelStatus::UNCONFIGURED)?;
            return Err(ConfigureError::Activate(error));
        }

        // nothing has been submitted yet, so if the channel was deregistered
        // in the meantime the buffers can simply be dropped.
        self.finish_configuring(ChannelStatus::RUNNING)?;

        let mut trans = Box::new(Transaction::new(&tx, &mut rx, capacity));
        self.descriptor
            .store(&mut *trans as *mut Transaction, Ordering::Release);
        self.capacity.store(capacity, Ordering::Release);
        critical_section::with(|cs| {
            *self.armed.borrow_ref_mut(cs) = Some(Armed {
                tx,
                rx,
                trans,
                capacity,
                drain: settings.drain,
                callback: Arc::new(callback),
            });
        });

        self.rearm().map_err(ConfigureError::Submit)?;
        tracing::info!(capacity, ?settings, "channel running");
        Ok(())
    }

    /// Leave `Configuring` for `next`, unless the channel was deregistered
    /// while `configure` was running.
    fn finish_configuring<E>(&self, next: u8) -> Result<(), ConfigureError<E>> {
        self.status
            .compare_exchange(
                ChannelStatus::CONFIGURING,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| {
                tracing::warn!(host = %self.host, "channel deregistered while configuring");
                ConfigureError::Deregistered
            })
    }

    /// Refill the transmit buffer from the outgoing stream and resubmit the
    /// descriptor.
    ///
    /// Each call submits exactly once, with the declared length reset to the
    /// capacity and the actual length reset to zero. Unused transmit bytes
    /// are zeroed so nothing from an earlier, longer write is replayed.
    fn rearm(&self) -> Result<(), B::Error> {
        let prepared = critical_section::with(|cs| {
            let mut armed = self.armed.borrow_ref_mut(cs);
            let Armed {
                tx, trans, capacity, ..
            } = armed.as_mut()?;
            let loaded = self.outgoing.fill(&mut tx.as_mut_slice()[..*capacity]);
            trans.reset(*capacity, self.id.tag());
            Some((NonNull::from(&mut **trans), loaded))
        });
        let Some((trans, loaded)) = prepared else {
            // not configured yet; `configure` arms the channel itself.
            return Ok(());
        };

        self.counters
            .bytes_sent
            .fetch_add(loaded, Ordering::Relaxed);
        self.in_flight.store(true, Ordering::Release);

        // SAFETY: the descriptor and both buffers live in `self.armed` and are
        // not touched again until the after-transmission hook for `trans`.
        let res = unsafe {
            self.spi
                .bus()
                .submit(self.host, trans, WaitPolicy::Forever)
        };
        if let Err(error) = res {
            self.in_flight.store(false, Ordering::Release);
            // a deregistered channel stays deregistered
            let _ = self.status.compare_exchange(
                ChannelStatus::RUNNING,
                ChannelStatus::FAULTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            tracing::error!(
                host = %self.host,
                ?error,
                "failed to queue transaction; channel can no longer make progress",
            );
            return Err(error);
        }

        tracing::trace!(host = %self.host, loaded, "re-armed");
        Ok(())
    }

    /// After-queueing hook, routed here by the dispatcher.
    pub(crate) fn on_queued(&self) {
        // Future home of the "data ready" strobe towards the master; no
        // handshake line is driven yet.
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(host = %self.host, "transaction visible to master");
    }

    /// After-transmission hook, routed here by the dispatcher.
    pub(crate) fn on_transmission(&self) {
        self.in_flight.store(false, Ordering::Release);

        let drained = critical_section::with(|cs| {
            let mut armed = self.armed.borrow_ref_mut(cs);
            let armed = armed.as_mut()?;
            let len = match armed.drain {
                DrainMode::ReportedLength => armed.trans.received_len(),
                DrainMode::FullCapacity => armed.capacity,
            };
            let rx = &mut armed.rx.as_mut_slice()[..armed.capacity];
            let dropped = self.incoming.push_lossy(&rx[..len]);
            rx.fill(0);
            Some((len, dropped, armed.callback.clone()))
        });
        let Some((len, dropped, callback)) = drained else {
            tracing::warn!(host = %self.host, "completion on an unconfigured channel; ignoring");
            return;
        };

        self.counters.exchanges.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(len - dropped, Ordering::Relaxed);
        if dropped > 0 {
            self.counters
                .overrun_bytes
                .fetch_add(dropped, Ordering::Relaxed);
            tracing::warn!(host = %self.host, dropped, "incoming stream full; dropped received bytes");
        }
        tracing::trace!(host = %self.host, len, "exchange complete");

        // A failed resubmit has already been logged and faulted the channel;
        // the bytes drained above are still worth announcing.
        let _ = self.rearm();

        let status = callback();
        if status != 0 {
            self.counters
                .last_status
                .store(status, Ordering::Relaxed);
            tracing::debug!(host = %self.host, status, "completion callback returned non-zero");
        }
    }

    /// Does `trans` point at this channel's live descriptor?
    pub(crate) fn owns(&self, trans: NonNull<Transaction>) -> bool {
        self.descriptor.load(Ordering::Acquire) == trans.as_ptr()
    }

    /// Called by the registry when this channel is removed from it.
    pub(crate) fn retire(&self) {
        self.status
            .store(ChannelStatus::DEREGISTERED, Ordering::Release);
        self.incoming.close();
    }

    // === application side ===

    /// Queue `bytes` for transmission.
    ///
    /// The bytes go out, in order, over as many exchanges as it takes. Nothing
    /// is sent until the master clocks an exchange. If the outgoing stream
    /// has a limit and `bytes` would exceed it, nothing is queued.
    pub fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        match self.status() {
            ChannelStatus::Faulted => return Err(WriteError::Faulted),
            ChannelStatus::Deregistered => return Err(WriteError::Deregistered),
            _ => {}
        }
        self.outgoing.push(bytes).map_err(WriteError::Full)
    }

    /// Take everything received since the last read.
    pub fn read(&self) -> Vec<u8> {
        self.incoming.take_all()
    }

    /// Take the oldest received byte, or `None` if nothing is buffered.
    pub fn read_byte(&self) -> Option<u8> {
        self.incoming.pop()
    }

    /// Wait until at least one byte has been received, then take everything.
    ///
    /// Fails once the channel is deregistered and nothing is left to read.
    pub async fn read_async(&self) -> Result<Vec<u8>, Closed> {
        loop {
            // subscribe before checking, so a completion landing between the
            // check and the wait still wakes us.
            let wait = self.incoming.readable().subscribe().await;
            let bytes = self.incoming.take_all();
            if !bytes.is_empty() {
                return Ok(bytes);
            }
            wait.await.map_err(|_| Closed::new())?;
        }
    }

    /// Received bytes waiting to be read.
    #[must_use]
    pub fn available(&self) -> usize {
        self.incoming.len()
    }

    /// Bytes written but not yet loaded into a transmit buffer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub fn host(&self) -> HostId {
        self.host
    }

    /// Bytes per exchange, once configured.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        match self.capacity.load(Ordering::Acquire) {
            0 => None,
            cap => Some(cap),
        }
    }

    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        let c = &self.counters;
        ChannelStats {
            exchanges: c.exchanges.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            overrun_bytes: c.overrun_bytes.load(Ordering::Relaxed),
            last_status: c.last_status.load(Ordering::Relaxed),
        }
    }
}

impl<B: SlaveBus + 'static> Drop for Channel<B> {
    fn drop(&mut self) {
        let armed = self.armed.get_mut().get_mut().take();
        if let Some(armed) = armed {
            if *self.in_flight.get_mut() {
                // The driver may still write into these buffers; leaking them
                // is the only sound option.
                tracing::warn!(
                    host = %self.host,
                    "channel dropped with a transaction in flight; leaking its DMA buffers",
                );
                core::mem::forget(armed);
            }
        }
    }
}

impl<B: SlaveBus + 'static> fmt::Debug for Channel<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("status", &self.status())
            .field("capacity", &self.capacity())
            .field("outgoing", &self.outgoing)
            .field("incoming", &self.incoming)
            .finish()
    }
}

impl<E: fmt::Debug> fmt::Display for ConfigureError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroCapacity => f.write_str("buffer capacity must be at least one byte"),
            Self::AlreadyConfigured => f.write_str("channel is already configured"),
            Self::Deregistered => f.write_str("channel has been deregistered"),
            Self::Alloc(error) => fmt::Display::fmt(error, f),
            Self::Activate(error) => write!(f, "bus activation failed: {error:?}"),
            Self::Submit(error) => write!(f, "failed to queue first transaction: {error:?}"),
        }
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(full) => fmt::Display::fmt(full, f),
            Self::Faulted => f.write_str("channel faulted"),
            Self::Deregistered => f.write_str("channel has been deregistered"),
        }
    }
}
