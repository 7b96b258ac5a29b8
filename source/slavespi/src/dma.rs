//! DMA-capable buffer allocation.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::{fmt, ptr::NonNull, slice};

/// Smallest buffer ever handed to the DMA engine, in bytes.
///
/// Smaller requests are rounded up to this size; the channel's logical
/// capacity is unaffected.
pub const MIN_DMA_BUFFER: usize = 32;

/// Alignment (and length granularity) of every DMA buffer.
pub const DMA_ALIGN: usize = 4;

/// Hands out zeroed memory that the DMA engine can address.
///
/// # Safety
///
/// Implementations must return memory that is valid for reads and writes of
/// `len` bytes, aligned to [`DMA_ALIGN`], zero-filled, and reachable by the
/// platform's SPI DMA engine.
pub unsafe trait DmaAlloc: Sync {
    fn alloc_zeroed(&self, len: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have come from [`DmaAlloc::alloc_zeroed`] on this
    /// allocator, with the same `len`.
    unsafe fn free(&self, ptr: NonNull<u8>, len: usize);
}

/// DMA memory from the global allocator.
///
/// Suitable wherever all of RAM is DMA-addressable, and on the host.
#[derive(Debug, Default)]
pub struct HeapDma {
    _x: (),
}

impl HeapDma {
    pub const fn new() -> Self {
        Self { _x: () }
    }

    fn layout(len: usize) -> Option<Layout> {
        Layout::from_size_align(len, DMA_ALIGN).ok()
    }
}

unsafe impl DmaAlloc for HeapDma {
    fn alloc_zeroed(&self, len: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout(len)?;
        if layout.size() == 0 {
            return None;
        }
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, len: usize) {
        if let Some(layout) = Self::layout(len) {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// The DMA allocator could not provide a buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AllocError {
    pub requested: usize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to allocate {} bytes of DMA memory", self.requested)
    }
}

/// An owned, fixed-size, zero-initialized DMA region.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
    alloc: &'static dyn DmaAlloc,
}

// SAFETY: `DmaBuffer` uniquely owns its region, like a `Box<[u8]>`.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate a buffer able to hold at least `capacity` bytes.
    ///
    /// The allocation is `capacity` floored to [`MIN_DMA_BUFFER`] and rounded
    /// up to a multiple of [`DMA_ALIGN`].
    pub fn new_in(alloc: &'static dyn DmaAlloc, capacity: usize) -> Result<Self, AllocError> {
        let len = Self::alloc_len(capacity).ok_or(AllocError {
            requested: capacity,
        })?;
        let ptr = alloc
            .alloc_zeroed(len)
            .ok_or(AllocError { requested: len })?;
        Ok(Self { ptr, len, alloc })
    }

    /// Size of the region actually allocated for a `capacity`-byte request.
    #[must_use]
    pub fn alloc_len(capacity: usize) -> Option<usize> {
        let len = capacity.max(MIN_DMA_BUFFER);
        len.checked_add(DMA_ALIGN - 1)
            .map(|len| len & !(DMA_ALIGN - 1))
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The whole region.
    ///
    /// Callers must not hold this across a submission: while a transaction
    /// referencing the buffer is queued, the DMA engine may write to it.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        unsafe { self.alloc.free(self.ptr, self.len) }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DMA: HeapDma = HeapDma::new();

    #[test]
    fn small_requests_are_floored() {
        let buf = DmaBuffer::new_in(&DMA, 4).unwrap();
        assert_eq!(buf.len(), MIN_DMA_BUFFER);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn lengths_are_aligned() {
        assert_eq!(DmaBuffer::alloc_len(33), Some(36));
        assert_eq!(DmaBuffer::alloc_len(64), Some(64));
        assert_eq!(DmaBuffer::alloc_len(usize::MAX), None);

        let buf = DmaBuffer::new_in(&DMA, 61).unwrap();
        assert_eq!(buf.len(), 64);
        assert_eq!(buf.as_ptr() as usize % DMA_ALIGN, 0);
    }

    #[test]
    fn failed_allocation_is_reported() {
        struct NoDma;
        unsafe impl DmaAlloc for NoDma {
            fn alloc_zeroed(&self, _: usize) -> Option<NonNull<u8>> {
                None
            }
            unsafe fn free(&self, _: NonNull<u8>, _: usize) {
                unreachable!("nothing was ever allocated")
            }
        }
        static NO_DMA: NoDma = NoDma;

        let err = DmaBuffer::new_in(&NO_DMA, 100).unwrap_err();
        assert_eq!(err, AllocError { requested: 100 });
    }
}
