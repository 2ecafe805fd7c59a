//! DMA-capable transfer buffer.
//!
//! The session owns exactly one of these for its whole lifetime. It is lent
//! mutably to each submission, so the borrow checker guarantees that no two
//! requests ever see it at once and that the engine only reads it back after
//! the completion has been observed.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{StorageError, StorageResult};

/// A zero-initialized, aligned, fixed-size byte buffer.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is uniquely owned heap memory; access goes through `&self`/`&mut self`.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocates `size` zeroed bytes aligned to `alignment` (rounded up to a
    /// power of two, minimum 1).
    pub fn zeroed(size: usize, alignment: usize) -> StorageResult<Self> {
        let alignment = alignment.max(1).next_power_of_two();
        let failed = StorageError::BufferAllocation { size, alignment };
        if size == 0 {
            return Err(failed);
        }
        let layout = Layout::from_size_align(size, alignment).map_err(|_| failed)?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(StorageError::BufferAllocation { size, alignment })?;
        Ok(Self { ptr, layout })
    }

    /// Buffer size in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false: zero-sized buffers cannot be allocated.
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Alignment of the allocation.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Views the buffer as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes for the life of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Views the buffer as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Address of the allocation, used to check buffer identity across resubmissions.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Zeroes the whole buffer.
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("len", &self.len())
            .field("alignment", &self.alignment())
            .finish()
    }
}
