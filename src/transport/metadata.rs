//! Region metadata advertisement
//!
//! Wire layout (16 bytes, host-order u32 words):
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │ addr low 32  │ addr high 32 │ length       │ lkey         │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```

use crate::error::{CollectorError, Result};

/// Size of the advertisement payload in bytes
pub const METADATA_LEN: usize = 16;

/// What a peer learns about the registered region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionMetadata {
    pub addr: u64,
    pub length: u32,
    pub key: u32,
}

impl RegionMetadata {
    /// The four words written to the front of the region
    pub fn to_words(&self) -> [u32; 4] {
        [
            (self.addr & 0xffff_ffff) as u32,
            (self.addr >> 32) as u32,
            self.length,
            self.key,
        ]
    }

    pub fn from_words(words: [u32; 4]) -> Self {
        Self {
            addr: u64::from(words[0]) | (u64::from(words[1]) << 32),
            length: words[2],
            key: words[3],
        }
    }

    pub fn encode(&self) -> [u8; METADATA_LEN] {
        let mut out = [0u8; METADATA_LEN];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < METADATA_LEN {
            return Err(CollectorError::Protocol(format!(
                "Metadata too short: expected {} bytes, got {}",
                METADATA_LEN,
                bytes.len()
            )));
        }

        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self::from_words(words))
    }

    /// Absolute address of slot `index` for slots of `slot_size` bytes
    pub fn slot_addr(&self, index: u64, slot_size: usize) -> u64 {
        self.addr + index * slot_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_split_address() {
        let meta = RegionMetadata {
            addr: 0x0000_7f12_3456_7000,
            length: 2048,
            key: 0xabcd,
        };

        assert_eq!(meta.to_words(), [0x3456_7000, 0x7f12, 2048, 0xabcd]);
        assert_eq!(RegionMetadata::decode(&meta.encode()).unwrap(), meta);
    }

    #[test]
    fn test_decode_short_payload() {
        assert!(matches!(
            RegionMetadata::decode(&[0u8; 15]),
            Err(CollectorError::Protocol(_))
        ));
    }
}
