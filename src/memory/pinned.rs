//! Pinned buffer allocation
//!
//! Anonymous private mappings, huge-page backed unless the policy says otherwise.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::config::PagePolicy;
use crate::error::{CollectorError, Result};

/// Allocates page-aligned buffers for registration with the fabric
#[derive(Debug, Clone, Copy)]
pub struct PinnedBufferAllocator {
    policy: PagePolicy,
}

impl PinnedBufferAllocator {
    pub fn new(policy: PagePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> PagePolicy {
        self.policy
    }

    /// Number of pages needed to hold `len` bytes
    pub fn pages_for(&self, len: usize) -> usize {
        len.div_ceil(self.policy.page_size())
    }

    /// Allocate a zero-initialized buffer of at least `len` bytes
    ///
    /// The mapping is rounded up to whole pages of the configured policy.
    /// With huge pages this fails when the kernel has too few reserved;
    /// there is no fallback to ordinary pages.
    pub fn allocate(&self, len: usize) -> Result<PinnedBuffer> {
        if len == 0 {
            return Err(CollectorError::Allocation(
                "Cannot allocate an empty buffer".to_string(),
            ));
        }

        let page_size = self.policy.page_size();
        let pages = self.pages_for(len);
        let mapped_len = pages.checked_mul(page_size).ok_or_else(|| {
            CollectorError::Allocation(format!("Buffer of {} bytes overflows the address space", len))
        })?;

        let mut flags = MapFlags::MAP_PRIVATE;
        if let PagePolicy::HugePages { .. } = self.policy {
            flags |= MapFlags::MAP_HUGETLB;
        }

        tracing::info!(
            "Allocating {} bytes: {} page(s) of {} bytes ({:?})",
            len,
            pages,
            page_size,
            self.policy
        );

        let length = NonZeroUsize::new(mapped_len).ok_or_else(|| {
            CollectorError::Allocation("Mapping length rounded to zero".to_string())
        })?;

        // SAFETY: an anonymous mapping with no fixed address cannot alias
        // any existing Rust object.
        let ptr = unsafe {
            mmap_anonymous(None, length, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, flags)
        }
        .map_err(|e| {
            tracing::error!("Failed to map {} bytes ({:?}): {}", mapped_len, self.policy, e);
            CollectorError::Mman(e)
        })?;

        tracing::debug!("Buffer mapped at {:p}", ptr.as_ptr());

        Ok(PinnedBuffer {
            ptr: ptr.cast::<u8>(),
            len,
            mapped_len,
            policy: self.policy,
        })
    }
}

/// A page-aligned anonymous mapping, unmapped on drop
///
/// All access goes through 32-bit atomic words so that local reads and
/// writes coexist with one-sided writes from the fabric.
pub struct PinnedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    mapped_len: usize,
    policy: PagePolicy,
}

// SAFETY: the mapping is exclusively owned and only accessed through atomics.
unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    /// Start address of the mapping
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Start address as the integer the fabric advertises
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as usize as u64
    }

    /// Requested length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length actually mapped (whole pages)
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn policy(&self) -> PagePolicy {
        self.policy
    }

    /// The requested range viewed as 32-bit words
    pub fn words(&self) -> &[AtomicU32] {
        // SAFETY: the mapping is page aligned, at least `len` bytes long and
        // lives as long as `self`. AtomicU32 has the layout of u32.
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().cast::<AtomicU32>(),
                self.len / std::mem::size_of::<AtomicU32>(),
            )
        }
    }

    /// Zero the requested range
    pub fn zero(&self) {
        for word in self.words() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/mapped_len describe exactly the mapping created in
        // allocate, and no borrow of `words()` can outlive `self`.
        let result = unsafe { munmap(self.ptr.cast::<c_void>(), self.mapped_len) };
        if let Err(e) = result {
            tracing::warn!("Failed to unmap buffer at {:p}: {}", self.ptr.as_ptr(), e);
        }
    }
}

impl std::fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("addr", &self.ptr.as_ptr())
            .field("len", &self.len)
            .field("mapped_len", &self.mapped_len)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_allocation_rounds_to_pages() {
        let allocator = PinnedBufferAllocator::new(PagePolicy::Standard);
        let buffer = allocator.allocate(100).unwrap();

        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.mapped_len(), 4096);
        assert_eq!(buffer.addr() % 4096, 0);
        assert_eq!(buffer.words().len(), 25);
        assert!(buffer.words().iter().all(|w| w.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn test_huge_page_count_rounds_up() {
        let allocator = PinnedBufferAllocator::new(PagePolicy::default());

        assert_eq!(allocator.pages_for(1), 1);
        assert_eq!(allocator.pages_for(1 << 30), 1);
        assert_eq!(allocator.pages_for((1 << 30) + 1), 2);
    }

    #[test]
    fn test_zero_length_rejected() {
        let allocator = PinnedBufferAllocator::new(PagePolicy::Standard);
        assert!(matches!(allocator.allocate(0), Err(CollectorError::Allocation(_))));
    }
}
