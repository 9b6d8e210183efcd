//! Slot layouts and the storage area holding them
//!
//! Every slot is a whole number of 32-bit words and its byte size is a power
//! of two, so a peer can locate slot `i` at `base + i * SIZE` (or with a
//! shift). A slot whose live words are all zero counts as unoccupied, which
//! also means a payload of 0 can never be told apart from "never written".

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{CollectorError, Result};
use crate::memory::{PinnedBuffer, PinnedBufferAllocator};

/// Widest slot layout, in words
pub const MAX_SLOT_WORDS: usize = 8;

/// Number of live hop fields in a postcard record
pub const HOP_COUNT: usize = 5;

/// A fixed-size record made of 32-bit words
pub trait Slot: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Number of 32-bit words in the slot
    const WORDS: usize;

    /// Slot size in bytes
    const SIZE: usize = Self::WORDS * std::mem::size_of::<u32>();

    fn from_words(words: &[u32]) -> Self;

    /// The slot as words; entries past `WORDS` are zero
    fn to_words(&self) -> [u32; MAX_SLOT_WORDS];

    /// Whether the slot reads as never written
    fn is_empty(&self) -> bool;

    /// Read the slot from shared memory, word by word
    fn load(words: &[AtomicU32]) -> Self {
        let mut buf = [0u32; MAX_SLOT_WORDS];
        for (out, word) in buf.iter_mut().zip(words.iter().take(Self::WORDS)) {
            *out = word.load(Ordering::Relaxed);
        }
        Self::from_words(&buf[..Self::WORDS])
    }

    /// Write the slot to shared memory, word by word
    fn store(&self, words: &[AtomicU32]) {
        for (word, value) in words.iter().take(Self::WORDS).zip(self.to_words()) {
            word.store(value, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Slot Layouts
// =============================================================================

/// Hash-addressed key/value slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KeyValueSlot {
    pub checksum: u32,
    pub value: u32,
}

impl Slot for KeyValueSlot {
    const WORDS: usize = 2;

    fn from_words(words: &[u32]) -> Self {
        Self {
            checksum: words[0],
            value: words[1],
        }
    }

    fn to_words(&self) -> [u32; MAX_SLOT_WORDS] {
        let mut out = [0; MAX_SLOT_WORDS];
        out[0] = self.checksum;
        out[1] = self.value;
        out
    }

    fn is_empty(&self) -> bool {
        self.checksum == 0 && self.value == 0
    }
}

/// Multi-hop "postcard" record: five hop fields padded to 32 bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PostcardSlot {
    pub hops: [u32; HOP_COUNT],
    pub padding: [u32; MAX_SLOT_WORDS - HOP_COUNT],
}

impl PostcardSlot {
    pub fn with_hops(hops: [u32; HOP_COUNT]) -> Self {
        Self {
            hops,
            ..Self::default()
        }
    }
}

impl Slot for PostcardSlot {
    const WORDS: usize = MAX_SLOT_WORDS;

    fn from_words(words: &[u32]) -> Self {
        let mut slot = Self::default();
        slot.hops.copy_from_slice(&words[..HOP_COUNT]);
        slot.padding.copy_from_slice(&words[HOP_COUNT..Self::WORDS]);
        slot
    }

    fn to_words(&self) -> [u32; MAX_SLOT_WORDS] {
        let mut out = [0; MAX_SLOT_WORDS];
        out[..HOP_COUNT].copy_from_slice(&self.hops);
        out[HOP_COUNT..].copy_from_slice(&self.padding);
        out
    }

    /// Padding is ignored
    fn is_empty(&self) -> bool {
        self.hops.iter().all(|&hop| hop == 0)
    }
}

/// Append log entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct AppendSlot {
    pub value: u32,
}

impl Slot for AppendSlot {
    const WORDS: usize = 1;

    fn from_words(words: &[u32]) -> Self {
        Self { value: words[0] }
    }

    fn to_words(&self) -> [u32; MAX_SLOT_WORDS] {
        let mut out = [0; MAX_SLOT_WORDS];
        out[0] = self.value;
        out
    }

    fn is_empty(&self) -> bool {
        self.value == 0
    }
}

// Remote peers rely on power-of-two slot sizes for masked addressing.
const _: () = assert!(<KeyValueSlot as Slot>::SIZE.is_power_of_two());
const _: () = assert!(<PostcardSlot as Slot>::SIZE.is_power_of_two());
const _: () = assert!(<AppendSlot as Slot>::SIZE.is_power_of_two());
const _: () = assert!(<KeyValueSlot as Slot>::SIZE == std::mem::size_of::<KeyValueSlot>());
const _: () = assert!(<PostcardSlot as Slot>::SIZE == std::mem::size_of::<PostcardSlot>());
const _: () = assert!(<AppendSlot as Slot>::SIZE == std::mem::size_of::<AppendSlot>());

// =============================================================================
// Storage Area
// =============================================================================

/// Exactly `capacity` slots in one pinned allocation
///
/// Never resized. Reads and writes are word-atomic, so a slot observed while
/// a remote writer is mid-update may mix old and new words.
pub struct StorageArea<S: Slot> {
    buffer: Arc<PinnedBuffer>,
    capacity: u64,
    _slot: PhantomData<fn() -> S>,
}

impl<S: Slot> StorageArea<S> {
    /// Allocate `capacity * S::SIZE` bytes
    pub fn allocate(allocator: &PinnedBufferAllocator, capacity: u64) -> Result<Self> {
        let size = capacity
            .checked_mul(S::SIZE as u64)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| {
                CollectorError::Allocation(format!(
                    "{} slots of {} bytes do not fit the address space",
                    capacity,
                    S::SIZE
                ))
            })?;

        let buffer = allocator.allocate(size)?;
        Ok(Self {
            buffer: Arc::new(buffer),
            capacity,
            _slot: PhantomData,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        S::SIZE
    }

    /// Bytes covered by the slots (the registered length)
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Base address peers add `index * slot_size` to
    pub fn addr(&self) -> u64 {
        self.buffer.addr()
    }

    pub fn buffer(&self) -> &Arc<PinnedBuffer> {
        &self.buffer
    }

    /// Read slot `index`
    pub fn get(&self, index: u64) -> Option<S> {
        self.words_of(index).map(S::load)
    }

    /// Write slot `index` locally, the way a remote writer would
    pub fn put(&self, index: u64, slot: &S) -> Result<()> {
        let words = self.words_of(index).ok_or(CollectorError::IndexOutOfRange {
            index,
            capacity: self.capacity,
        })?;
        slot.store(words);
        Ok(())
    }

    /// All slots in index order
    pub fn iter(&self) -> impl Iterator<Item = S> + '_ {
        self.buffer.words().chunks_exact(S::WORDS).map(S::load)
    }

    /// Zero every slot
    pub fn clear(&self) {
        self.buffer.zero();
    }

    fn words_of(&self, index: u64) -> Option<&[AtomicU32]> {
        if index >= self.capacity {
            return None;
        }
        let start = usize::try_from(index).ok()? * S::WORDS;
        self.buffer.words().get(start..start + S::WORDS)
    }
}

impl<S: Slot> fmt::Debug for StorageArea<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageArea")
            .field("capacity", &self.capacity)
            .field("slot_size", &S::SIZE)
            .field("buffer", &self.buffer)
            .finish()
    }
}
