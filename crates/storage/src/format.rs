//! On-disk box file format
//!
//! A box file is a header followed by CRC-framed entries:
//!
//! ```text
//! header:  magic "VSBX" | u16 format version | u8 flags
//! entry:   u8 kind | u32 key_len | u32 val_len | key | val | u32 crc
//! ```
//!
//! `kind` is 1 for put and 2 for delete (`val_len` = 0). The checksum
//! covers everything before it in the entry. All integers are
//! little-endian.
//!
//! Replay semantics:
//! - A truncated entry at the end of the file is a torn write from a
//!   crash; it is dropped and the file is truncated back to the last
//!   complete entry.
//! - A complete entry with a bad checksum, or an invalid header, means
//!   the file is corrupt; the caller backs it up and starts fresh.

use crate::error::{Result, StorageError};
use std::collections::BTreeMap;
use std::io::Read;

/// File magic.
pub const BOX_MAGIC: &[u8; 4] = b"VSBX";
/// Current format version.
pub const BOX_FORMAT_VERSION: u16 = 1;
/// Header length in bytes.
pub const BOX_HEADER_LEN: usize = 7;

/// Flag bit: values in this box are encrypted.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0001;

/// Entry kind byte for a put.
const KIND_PUT: u8 = 1;
/// Entry kind byte for a delete.
const KIND_DELETE: u8 = 2;

/// A single replayed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxEntry {
    /// Insert or overwrite a key
    Put {
        /// Record key
        key: String,
        /// Encoded (possibly encrypted) value bytes
        value: Vec<u8>,
    },
    /// Remove a key
    Delete {
        /// Record key
        key: String,
    },
}

/// Encode the file header.
pub fn encode_header(encrypted: bool) -> [u8; BOX_HEADER_LEN] {
    let mut header = [0u8; BOX_HEADER_LEN];
    header[0..4].copy_from_slice(BOX_MAGIC);
    header[4..6].copy_from_slice(&BOX_FORMAT_VERSION.to_le_bytes());
    header[6] = if encrypted { FLAG_ENCRYPTED } else { 0 };
    header
}

/// Validate a header, returning the flags byte.
pub fn decode_header(box_name: &str, header: &[u8]) -> Result<u8> {
    if header.len() < BOX_HEADER_LEN {
        return Err(StorageError::Corrupt {
            box_name: box_name.to_string(),
            reason: format!("header too short: {} bytes", header.len()),
        });
    }
    if &header[0..4] != BOX_MAGIC {
        return Err(StorageError::Corrupt {
            box_name: box_name.to_string(),
            reason: "bad magic".to_string(),
        });
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != BOX_FORMAT_VERSION {
        return Err(StorageError::Corrupt {
            box_name: box_name.to_string(),
            reason: format!("unsupported format version {}", version),
        });
    }
    Ok(header[6])
}

/// Encode one entry with its checksum frame.
pub fn encode_entry(entry: &BoxEntry) -> Vec<u8> {
    let (kind, key, value): (u8, &str, &[u8]) = match entry {
        BoxEntry::Put { key, value } => (KIND_PUT, key, value),
        BoxEntry::Delete { key } => (KIND_DELETE, key, &[]),
    };
    let key_bytes = key.as_bytes();
    let mut buf = Vec::with_capacity(9 + key_bytes.len() + value.len() + 4);
    buf.push(kind);
    buf.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key_bytes);
    buf.extend_from_slice(value);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Result of replaying a box file.
#[derive(Debug)]
pub struct Replay {
    /// Materialized key-value state
    pub map: BTreeMap<String, Vec<u8>>,
    /// Flags byte from the header
    pub flags: u8,
    /// Offset of the first torn byte, when the tail must be truncated
    pub truncate_to: Option<u64>,
}

/// Replay a box file from raw bytes.
///
/// Returns the materialized map plus a truncation offset when a torn
/// tail was dropped. Header or checksum damage is a corruption error.
pub fn replay(box_name: &str, mut reader: impl Read) -> Result<Replay> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    let flags = decode_header(box_name, &bytes)?;
    let mut map = BTreeMap::new();
    let mut offset = BOX_HEADER_LEN;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        // kind + key_len + val_len
        if remaining < 9 {
            return torn(box_name, map, flags, offset);
        }
        let kind = bytes[offset];
        let key_len =
            u32::from_le_bytes(bytes[offset + 1..offset + 5].try_into().unwrap()) as usize;
        let val_len =
            u32::from_le_bytes(bytes[offset + 5..offset + 9].try_into().unwrap()) as usize;
        let total = 9 + key_len + val_len + 4;
        if remaining < total {
            return torn(box_name, map, flags, offset);
        }

        let body = &bytes[offset..offset + 9 + key_len + val_len];
        let stored_crc = u32::from_le_bytes(
            bytes[offset + 9 + key_len + val_len..offset + total]
                .try_into()
                .unwrap(),
        );
        if crc32fast::hash(body) != stored_crc {
            return Err(StorageError::Corrupt {
                box_name: box_name.to_string(),
                reason: format!("checksum mismatch at offset {}", offset),
            });
        }

        let key = std::str::from_utf8(&bytes[offset + 9..offset + 9 + key_len])
            .map_err(|_| StorageError::Corrupt {
                box_name: box_name.to_string(),
                reason: format!("non-utf8 key at offset {}", offset),
            })?
            .to_string();

        match kind {
            KIND_PUT => {
                let value = bytes[offset + 9 + key_len..offset + 9 + key_len + val_len].to_vec();
                map.insert(key, value);
            }
            KIND_DELETE => {
                map.remove(&key);
            }
            other => {
                return Err(StorageError::Corrupt {
                    box_name: box_name.to_string(),
                    reason: format!("unknown entry kind {} at offset {}", other, offset),
                });
            }
        }
        offset += total;
    }

    Ok(Replay {
        map,
        flags,
        truncate_to: None,
    })
}

fn torn(
    box_name: &str,
    map: BTreeMap<String, Vec<u8>>,
    flags: u8,
    offset: usize,
) -> Result<Replay> {
    tracing::warn!(
        box_name = %box_name,
        offset,
        "dropping torn tail entry from box file"
    );
    Ok(Replay {
        map,
        flags,
        truncate_to: Some(offset as u64),
    })
}
