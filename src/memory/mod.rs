//! Memory Module
//!
//! Pinned, page-aligned buffers suitable for fabric registration.
//!
//! ## Responsibilities
//! - Reserve whole huge pages for a byte request (rounded up)
//! - Hand out zero-initialized, page-aligned memory
//! - Expose the memory as 32-bit atomic words, the unit every slot is made of
//! - Unmap on drop
//!
//! ## Layout
//! ```text
//! ┌──────────────── mapped_len (whole pages) ────────────────┐
//! │ requested len (capacity * slot_size)   │  unused tail    │
//! └────────────────────────────────────────┴─────────────────┘
//! ```

mod pinned;

pub use pinned::{PinnedBuffer, PinnedBufferAllocator};
