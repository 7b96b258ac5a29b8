//! The hardware-facing transaction descriptor.

use core::fmt;

use crate::dma::DmaBuffer;

/// One exchange attempt, as seen by the slave driver.
///
/// Laid out like the C driver's slave transaction record, so a platform
/// driver can hand it to the hardware layer directly. Each channel owns
/// exactly one of these for its whole life and rewrites it on every re-arm.
///
/// `length` bounds how much the driver may read from `tx_buffer` or write to
/// `rx_buffer`; the master still decides how long the exchange really is.
/// If the master clocks out more, only the first `length` bits are exchanged
/// and `trans_len` is capped at `length`.
#[repr(C)]
pub struct Transaction {
    /// Declared length, in bits.
    length: usize,
    /// Length actually exchanged, in bits. Written by the driver.
    trans_len: usize,
    tx_buffer: *const u8,
    rx_buffer: *mut u8,
    /// Owner tag; zero means "untagged".
    user: usize,
}

// SAFETY: the raw buffer pointers are only dereferenced by the driver (while
// the transaction is queued) or by the owning channel (while it is not).
unsafe impl Send for Transaction {}
unsafe impl Sync for Transaction {}

impl Transaction {
    pub(crate) fn new(tx: &DmaBuffer, rx: &mut DmaBuffer, capacity: usize) -> Self {
        debug_assert!(capacity <= tx.len() && capacity <= rx.len());
        Self {
            length: capacity * 8,
            trans_len: 0,
            tx_buffer: tx.as_ptr(),
            rx_buffer: rx.as_mut_ptr(),
            user: 0,
        }
    }

    /// Prepare the descriptor for resubmission.
    pub(crate) fn reset(&mut self, capacity: usize, tag: usize) {
        self.length = capacity * 8;
        self.trans_len = 0;
        self.user = tag;
    }

    #[inline]
    #[must_use]
    pub fn length_bits(&self) -> usize {
        self.length
    }

    #[inline]
    #[must_use]
    pub fn trans_len_bits(&self) -> usize {
        self.trans_len
    }

    /// Record how many bits the master actually clocked.
    ///
    /// Values beyond the declared length are capped, matching what the
    /// hardware reports for an over-long exchange.
    #[inline]
    pub fn set_trans_len_bits(&mut self, bits: usize) {
        self.trans_len = bits.min(self.length);
    }

    /// Declared length, in bytes.
    #[inline]
    #[must_use]
    pub fn max_len(&self) -> usize {
        self.length / 8
    }

    /// Whole bytes actually received, never more than [`Self::max_len`].
    #[inline]
    #[must_use]
    pub fn received_len(&self) -> usize {
        (self.trans_len / 8).min(self.max_len())
    }

    #[inline]
    pub fn tx_buffer(&self) -> *const u8 {
        self.tx_buffer
    }

    #[inline]
    pub fn rx_buffer(&self) -> *mut u8 {
        self.rx_buffer
    }

    #[inline]
    #[must_use]
    pub fn tag(&self) -> usize {
        self.user
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("length", &self.length)
            .field("trans_len", &self.trans_len)
            .field("tx_buffer", &self.tx_buffer)
            .field("rx_buffer", &self.rx_buffer)
            .field("user", &self.user)
            .finish()
    }
}
