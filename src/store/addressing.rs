//! Content addressing for key/value slots
//!
//! The writer (a remote peer) and the reader (this process) derive the same
//! candidate slots from a key without sharing any index structure:
//!
//! ```text
//! key_bytes  = key as 4 little-endian bytes
//! checksum   = CRC32(key_bytes)
//! slot(n)    = CRC32(key_bytes ++ [n]) mod capacity,   n = 0 .. redundancy
//! ```
//!
//! The CRC is CRC-32/ISO-HDLC (zlib). Each probe hashes a fresh 5-byte
//! buffer; no CRC state is carried from one probe to the next.

/// Byte encoding of a key fed to the CRC
pub fn key_bytes(key: u32) -> [u8; 4] {
    key.to_le_bytes()
}

/// The checksum stored alongside a key's value
pub fn key_checksum(key: u32) -> u32 {
    crc32fast::hash(&key_bytes(key))
}

/// Slot index of probe `n` for `key`
pub fn probe_index(key: u32, n: u8, capacity: u64) -> u64 {
    let mut buf = [0u8; 5];
    buf[..4].copy_from_slice(&key_bytes(key));
    buf[4] = n;
    u64::from(crc32fast::hash(&buf)) % capacity
}

/// Candidate slots for `key`, in probe order
pub fn probe_sequence(key: u32, redundancy: u8, capacity: u64) -> impl Iterator<Item = u64> {
    (0..redundancy).map(move |n| probe_index(key, n, capacity))
}
