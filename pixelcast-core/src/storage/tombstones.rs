//! # Tombstone log
//!
//! An append-only sequence of little-endian `u32` surface handles. A torn final write leaves a partial record,
//! which is ignored on read.
//!
//! Older installations kept tombstones as a JSON array of integers, which is read once and migrated into the log.

use crate::surface::SurfaceHandle;

const RECORD_LEN: usize = std::mem::size_of::<u32>();

#[must_use]
pub fn encode(handles: &[SurfaceHandle]) -> Vec<u8> {
    handles
        .iter()
        .flat_map(|handle| handle.0.to_le_bytes())
        .collect()
}

/// Decode a log. Duplicate records are kept - callers collect into a set anyway.
#[must_use]
pub fn decode(bytes: &[u8]) -> Vec<SurfaceHandle> {
    let chunks = bytes.chunks_exact(RECORD_LEN);
    if !chunks.remainder().is_empty() {
        log::warn!(
            "Tombstone log has {} trailing bytes, ignoring partial record",
            chunks.remainder().len()
        );
    }
    chunks
        .map(|chunk| {
            let mut record = [0u8; RECORD_LEN];
            record.copy_from_slice(chunk);
            SurfaceHandle(u32::from_le_bytes(record))
        })
        .collect()
}

/// Parse the legacy JSON array format.
pub fn decode_legacy(json: &str) -> Result<Vec<SurfaceHandle>, serde_json::Error> {
    serde_json::from_str(json)
}
