use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// f32 lanes per SIMD register width the row layout targets (256-bit ops).
pub const LANES: usize = 8;

/// Row base alignment in bytes.
pub const ALIGN_BYTES: usize = LANES * std::mem::size_of::<f32>();

/// A zero-initialized f32 buffer whose base address is 32-byte aligned.
///
/// Factor matrices pad their row stride to a multiple of [`LANES`], so an
/// aligned base keeps every row aligned as well.
pub struct AlignedVec {
    ptr: NonNull<f32>,
    len: usize,
}

impl AlignedVec {
    pub fn zeroed(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }
        let layout = Self::layout(len)?;
        let raw = unsafe { alloc_zeroed(layout) } as *mut f32;
        match NonNull::new(raw) {
            Some(ptr) => Ok(Self { ptr, len }),
            None => Err(Error::OutOfMemory(len)),
        }
    }

    fn layout(len: usize) -> Result<Layout> {
        len.checked_mul(std::mem::size_of::<f32>())
            .and_then(|bytes| Layout::from_size_align(bytes, ALIGN_BYTES).ok())
            .ok_or(Error::OutOfMemory(len))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address for workers that write disjoint rows concurrently.
    pub(crate) fn raw(&self) -> *mut f32 {
        self.ptr.as_ptr()
    }
}

impl Deref for AlignedVec {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedVec {
    fn deref_mut(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedVec {
    fn drop(&mut self) {
        if self.len > 0 {
            // layout was validated at allocation time
            let layout = Self::layout(self.len).unwrap();
            unsafe { dealloc(self.ptr.as_ptr() as *mut u8, layout) };
        }
    }
}

// SAFETY: the buffer is plain f32 storage; cross-thread access is coordinated
// by the block scheduler, which never hands two workers the same rows.
unsafe impl Send for AlignedVec {}
unsafe impl Sync for AlignedVec {}
