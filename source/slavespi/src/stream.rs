//! Interrupt-safe byte streams.
//!
//! Each channel has two of these. The outgoing stream is produced by the
//! application and consumed by the completion hook; the incoming stream goes
//! the other way. Every access happens inside a [`critical_section`], which on
//! bare metal means "interrupts off", so the hook can never observe a
//! half-finished `write` or `read`.

use alloc::{collections::VecDeque, vec::Vec};
use core::{cell::RefCell, fmt};

use critical_section::Mutex;
use maitake_sync::WaitCell;
use portable_atomic::{AtomicUsize, Ordering};

const UNBOUNDED: usize = usize::MAX;

pub struct ByteStream {
    bytes: Mutex<RefCell<VecDeque<u8>>>,
    limit: AtomicUsize,
    readable: WaitCell,
}

/// Returned by [`ByteStream::push`] when the bytes would not fit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StreamFull {
    /// Bytes already buffered.
    pub len: usize,
    /// Bytes that were offered.
    pub offered: usize,
    pub limit: usize,
}

impl fmt::Display for StreamFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream full: {} buffered + {} offered exceeds limit of {}",
            self.len, self.offered, self.limit
        )
    }
}

/// The stream was closed while waiting on it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(());

impl Closed {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stream closed")
    }
}

impl ByteStream {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: Mutex::new(RefCell::new(VecDeque::new())),
            limit: AtomicUsize::new(UNBOUNDED),
            readable: WaitCell::new(),
        }
    }

    pub fn set_limit(&self, limit: Option<usize>) {
        self.limit
            .store(limit.unwrap_or(UNBOUNDED), Ordering::Release);
    }

    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        match self.limit.load(Ordering::Acquire) {
            UNBOUNDED => None,
            limit => Some(limit),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.bytes.borrow_ref(cs).len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append all of `bytes`, or none of them if that would exceed the limit.
    pub fn push(&self, bytes: &[u8]) -> Result<(), StreamFull> {
        if bytes.is_empty() {
            return Ok(());
        }
        let limit = self.limit.load(Ordering::Acquire);
        critical_section::with(|cs| {
            let mut q = self.bytes.borrow_ref_mut(cs);
            let fits = q
                .len()
                .checked_add(bytes.len())
                .map_or(false, |total| total <= limit);
            if !fits {
                return Err(StreamFull {
                    len: q.len(),
                    offered: bytes.len(),
                    limit,
                });
            }
            q.extend(bytes.iter().copied());
            Ok(())
        })?;
        self.readable.wake();
        Ok(())
    }

    /// Append as much of `bytes` as fits, returning how many were dropped.
    ///
    /// Never fails, so it is safe to call from a hook that has nowhere to
    /// report an error.
    pub fn push_lossy(&self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }
        let limit = self.limit.load(Ordering::Acquire);
        let kept = critical_section::with(|cs| {
            let mut q = self.bytes.borrow_ref_mut(cs);
            let room = limit.saturating_sub(q.len());
            let kept = room.min(bytes.len());
            q.extend(bytes[..kept].iter().copied());
            kept
        });
        if kept > 0 {
            self.readable.wake();
        }
        bytes.len() - kept
    }

    /// Remove and return everything buffered.
    pub fn take_all(&self) -> Vec<u8> {
        let taken = critical_section::with(|cs| core::mem::take(&mut *self.bytes.borrow_ref_mut(cs)));
        Vec::from(taken)
    }

    /// Remove and return the oldest byte, if any.
    pub fn pop(&self) -> Option<u8> {
        critical_section::with(|cs| self.bytes.borrow_ref_mut(cs).pop_front())
    }

    /// Move the head of the stream into `dst`. See [`segment`].
    pub fn fill(&self, dst: &mut [u8]) -> usize {
        critical_section::with(|cs| segment(&mut self.bytes.borrow_ref_mut(cs), dst))
    }

    /// Woken whenever bytes are appended.
    pub(crate) fn readable(&self) -> &WaitCell {
        &self.readable
    }

    /// Fail current and future waiters. Buffered bytes stay readable.
    pub fn close(&self) {
        self.readable.close();
    }
}

impl Default for ByteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("len", &self.len())
            .field("limit", &self.limit())
            .finish()
    }
}

/// Copy the first `min(dst.len(), pending.len())` bytes of `pending` into
/// the front of `dst`, remove them from `pending`, and zero the rest of `dst`.
///
/// Returns the number of bytes moved. Anything left in `pending` waits for
/// the next call, so an over-long stream goes out over as many buffers as it
/// needs, in order, with no delimiter between them.
pub fn segment(pending: &mut VecDeque<u8>, dst: &mut [u8]) -> usize {
    let n = dst.len().min(pending.len());
    for (slot, byte) in dst.iter_mut().zip(pending.drain(..n)) {
        *slot = byte;
    }
    dst[n..].fill(0);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{collection::vec, prop_assert, prop_assert_eq, proptest};

    #[test]
    fn hello_splits_across_two_buffers() {
        let mut pending: VecDeque<u8> = b"HELLO".iter().copied().collect();
        let mut buf = [0xAA; 4];

        assert_eq!(segment(&mut pending, &mut buf), 4);
        assert_eq!(&buf, b"HELL");
        assert_eq!(pending, [b'O']);

        // the tail of the second buffer is cleared, not left as "ELL"
        assert_eq!(segment(&mut pending, &mut buf), 1);
        assert_eq!(&buf, b"O\0\0\0");
        assert!(pending.is_empty());
    }

    #[test]
    fn push_is_all_or_nothing() {
        let stream = ByteStream::new();
        stream.set_limit(Some(4));

        stream.push(b"abc").unwrap();
        let err = stream.push(b"de").unwrap_err();
        assert_eq!(
            err,
            StreamFull {
                len: 3,
                offered: 2,
                limit: 4
            }
        );
        assert_eq!(stream.take_all(), b"abc");
    }

    #[test]
    fn push_lossy_keeps_what_fits() {
        let stream = ByteStream::new();
        stream.set_limit(Some(4));

        assert_eq!(stream.push_lossy(b"abc"), 0);
        assert_eq!(stream.push_lossy(b"def"), 2);
        assert_eq!(stream.take_all(), b"abcd");

        stream.set_limit(None);
        assert_eq!(stream.limit(), None);
        assert_eq!(stream.push_lossy(&[0; 100]), 0);
        assert_eq!(stream.len(), 100);
    }

    #[test]
    fn pop_drains_in_order() {
        let stream = ByteStream::new();
        stream.push(b"xy").unwrap();
        assert_eq!(stream.pop(), Some(b'x'));
        assert_eq!(stream.pop(), Some(b'y'));
        assert_eq!(stream.pop(), None);
    }

    proptest! {
        #[test]
        fn segmentation_preserves_order(data in vec(proptest::num::u8::ANY, 0..512), cap in 1usize..64) {
            let mut pending: VecDeque<u8> = data.iter().copied().collect();
            let mut sent = Vec::new();
            let mut buf = vec![0xFF; cap];
            loop {
                let n = segment(&mut pending, &mut buf);
                prop_assert!(buf[n..].iter().all(|&b| b == 0));
                sent.extend_from_slice(&buf);
                if pending.is_empty() {
                    break;
                }
                prop_assert_eq!(n, cap);
            }
            sent.truncate(data.len());
            prop_assert_eq!(sent, data);
        }
    }
}
