//! Hash-slot calculation

use crate::utils::MuxError;

/// Number of hash slots in a cluster
pub const TOTAL_SLOTS: u16 = 16384;

/// Calculate slot for key using CRC16
///
/// If the key contains a non-empty `{tag}`, only the tag is hashed, so
/// related keys can be forced onto the same shard.
pub fn slot_for_key(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % TOTAL_SLOTS
}

/// The part of `key` that participates in hashing
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            if end > 0 {
                return &key[start + 1..start + 1 + end];
            }
        }
    }
    key
}

/// Slot shared by every key, or `None` for a keyless request
///
/// Fails with [`MuxError::MultiSlot`] as soon as two keys disagree.
pub fn common_slot<'a, I>(keys: I) -> Result<Option<u16>, MuxError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut slot = None;
    for key in keys {
        let next = slot_for_key(key);
        match slot {
            None => slot = Some(next),
            Some(first) if first != next => {
                return Err(MuxError::MultiSlot {
                    first,
                    second: next,
                })
            }
            Some(_) => {}
        }
    }
    Ok(slot)
}

/// CRC16 implementation for cluster slot calculation (XMODEM)
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
