//! # Binary Codec
//!
//! Three layers of encoding, innermost first:
//!
//! 1. **Value codec** — a type tag byte followed by a little-endian
//!    payload; arrays and objects nest recursively.
//! 2. **Stored record** — the value payload framed with its modification
//!    timestamp, owning transaction, checksum and flags. This is what the
//!    WAL and SSTables persist.
//! 3. **Snapshot envelope** — a whole configuration tree in one blob.
//!
//! ## Envelope Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (32 bytes)                                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ Magic "KSNP"      (4 bytes)                         │    │
//! │  │ Format version    (4 bytes)                         │    │
//! │  │ Schema version    (4 bytes)                         │    │
//! │  │ Compression tag   (4 bytes)  0=none 1=zstd          │    │
//! │  │ Entry count       (4 bytes)                         │    │
//! │  │ Total size        (4 bytes)                         │    │
//! │  │ Checksum (CRC32)  (4 bytes)  over body as written   │    │
//! │  │ Reserved          (4 bytes)                         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Index: entry_count × 16 bytes                              │
//! │    [key hash 8B] [offset 4B] [size 4B]                      │
//! │    offsets are into the (uncompressed) payload region       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Payload region                                             │
//! │    per entry: [path_len u16][path][record_len u32][record]  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::crypto::{content_hash64, crc32_checksum, path_hash, Encryptor};
use crate::error::{Error, Result};
use crate::types::{ConfigValue, StoredValue, TypeTag};
use crate::FORMAT_VERSION;

pub const ENVELOPE_MAGIC: &[u8; 4] = b"KSNP";
pub const ENVELOPE_HEADER_SIZE: usize = 32;
pub const ENVELOPE_INDEX_ENTRY_SIZE: usize = 16;
pub const STORED_HEADER_SIZE: usize = 8 + 8 + 8 + 1 + 4;

pub const COMPRESSION_NONE: u32 = 0;
pub const COMPRESSION_ZSTD: u32 = 1;

const STORED_FLAG_ENCRYPTED: u8 = 1 << 0;
const MAX_NESTING: usize = 32;

// ---------------------------------------------------------------------------
// Value codec
// ---------------------------------------------------------------------------

/// Encode a value to its canonical byte form.
pub fn encode_value(value: &ConfigValue) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    write_value(&mut buf, value);
    buf
}

fn write_value(buf: &mut Vec<u8>, value: &ConfigValue) {
    buf.push(value.type_tag().as_byte());
    match value {
        ConfigValue::Bool(v) => buf.push(*v as u8),
        ConfigValue::I8(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::I16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::U8(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::U64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::F32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ConfigValue::Str(s) => {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        ConfigValue::Bytes(b) => {
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
        ConfigValue::Array(items) => {
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                write_value(buf, item);
            }
        }
        ConfigValue::Object(map) => {
            buf.extend_from_slice(&(map.len() as u32).to_le_bytes());
            for (k, v) in map {
                buf.extend_from_slice(&(k.len() as u16).to_le_bytes());
                buf.extend_from_slice(k.as_bytes());
                write_value(buf, v);
            }
        }
    }
}

/// Decode a value from its canonical byte form.
pub fn decode_value(bytes: &[u8]) -> Result<ConfigValue> {
    let mut cursor = Cursor::new(bytes);
    let value = read_value(&mut cursor, 0)?;
    Ok(value)
}

fn read_value(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<ConfigValue> {
    if depth > MAX_NESTING {
        return Err(Error::Serialization {
            message: format!("value nesting exceeds {} levels", MAX_NESTING),
        });
    }

    let tag_byte = cursor.read_u8().map_err(truncated)?;
    let tag = TypeTag::from_byte(tag_byte).ok_or_else(|| Error::Serialization {
        message: format!("unknown type tag: {:#04x}", tag_byte),
    })?;

    Ok(match tag {
        TypeTag::Bool => ConfigValue::Bool(cursor.read_u8().map_err(truncated)? != 0),
        TypeTag::I8 => ConfigValue::I8(cursor.read_i8().map_err(truncated)?),
        TypeTag::I16 => ConfigValue::I16(cursor.read_i16::<LittleEndian>().map_err(truncated)?),
        TypeTag::I32 => ConfigValue::I32(cursor.read_i32::<LittleEndian>().map_err(truncated)?),
        TypeTag::I64 => ConfigValue::I64(cursor.read_i64::<LittleEndian>().map_err(truncated)?),
        TypeTag::U8 => ConfigValue::U8(cursor.read_u8().map_err(truncated)?),
        TypeTag::U16 => ConfigValue::U16(cursor.read_u16::<LittleEndian>().map_err(truncated)?),
        TypeTag::U32 => ConfigValue::U32(cursor.read_u32::<LittleEndian>().map_err(truncated)?),
        TypeTag::U64 => ConfigValue::U64(cursor.read_u64::<LittleEndian>().map_err(truncated)?),
        TypeTag::F32 => ConfigValue::F32(cursor.read_f32::<LittleEndian>().map_err(truncated)?),
        TypeTag::F64 => ConfigValue::F64(cursor.read_f64::<LittleEndian>().map_err(truncated)?),
        TypeTag::Str => {
            let len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
            let bytes = read_exact(cursor, len)?;
            ConfigValue::Str(String::from_utf8(bytes).map_err(|e| Error::Serialization {
                message: format!("invalid UTF-8 in string value: {}", e),
            })?)
        }
        TypeTag::Bytes => {
            let len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
            ConfigValue::Bytes(read_exact(cursor, len)?)
        }
        TypeTag::Array => {
            let count = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(read_value(cursor, depth + 1)?);
            }
            ConfigValue::Array(items)
        }
        TypeTag::Object => {
            let count = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key_len = cursor.read_u16::<LittleEndian>().map_err(truncated)? as usize;
                let key_bytes = read_exact(cursor, key_len)?;
                let key = String::from_utf8(key_bytes).map_err(|e| Error::Serialization {
                    message: format!("invalid UTF-8 in object key: {}", e),
                })?;
                map.insert(key, read_value(cursor, depth + 1)?);
            }
            ConfigValue::Object(map)
        }
    })
}

fn truncated(e: std::io::Error) -> Error {
    Error::Serialization {
        message: format!("truncated value payload: {}", e),
    }
}

fn read_exact(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    use std::io::Read;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Stored record framing
// ---------------------------------------------------------------------------

/// Serialize a stored value for persistence.
///
/// For keys flagged sensitive, pass the encryptor: the payload is sealed
/// and the checksum covers the ciphertext, so integrity can be verified
/// without the key.
pub fn encode_stored(
    stored: &StoredValue,
    key_path: &str,
    encryptor: Option<&Encryptor>,
) -> Result<Vec<u8>> {
    let plain = encode_value(&stored.value);
    let (payload, flags) = if stored.encrypted {
        let enc = encryptor.ok_or_else(|| Error::Encryption {
            reason: format!("no encryptor available for sensitive key {}", key_path),
        })?;
        (enc.seal(&plain, key_path.as_bytes())?, STORED_FLAG_ENCRYPTED)
    } else {
        (plain, 0u8)
    };

    let mut buf = Vec::with_capacity(STORED_HEADER_SIZE + payload.len());
    buf.write_u64::<LittleEndian>(stored.timestamp_ns)?;
    buf.write_u64::<LittleEndian>(stored.txn_id)?;
    buf.write_u64::<LittleEndian>(content_hash64(&payload))?;
    buf.write_u8(flags)?;
    buf.write_u32::<LittleEndian>(payload.len() as u32)?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a stored value, verifying its checksum first.
///
/// The checksum check runs against the payload exactly as persisted, so
/// corruption of an encrypted value is detected before any decryption.
pub fn decode_stored(
    bytes: &[u8],
    key_path: &str,
    encryptor: Option<&Encryptor>,
) -> Result<StoredValue> {
    let mut cursor = Cursor::new(bytes);
    let timestamp_ns = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    let txn_id = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    let checksum = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    let flags = cursor.read_u8().map_err(truncated)?;
    let len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let payload = read_exact(&mut cursor, len)?;

    if content_hash64(&payload) != checksum {
        return Err(Error::Corruption {
            key: key_path.to_string(),
            detail: "stored value checksum mismatch".to_string(),
        });
    }

    let encrypted = flags & STORED_FLAG_ENCRYPTED != 0;
    let plain = if encrypted {
        let enc = encryptor.ok_or_else(|| Error::Encryption {
            reason: format!("value for {} is encrypted but no key is loaded", key_path),
        })?;
        enc.open(&payload, key_path.as_bytes())?
    } else {
        payload
    };

    Ok(StoredValue {
        value: decode_value(&plain)?,
        timestamp_ns,
        txn_id,
        checksum,
        encrypted,
    })
}

/// Cheap integrity check of a stored record: parses the header and hashes
/// the payload without decoding or decrypting it.
pub fn verify_record(bytes: &[u8]) -> bool {
    if bytes.len() < STORED_HEADER_SIZE {
        return false;
    }
    let mut cursor = Cursor::new(bytes);
    let header = (|| -> std::io::Result<(u64, usize)> {
        cursor.set_position(16); // skip timestamp + txn id
        let checksum = cursor.read_u64::<LittleEndian>()?;
        let _flags = cursor.read_u8()?;
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        Ok((checksum, len))
    })();
    match header {
        Ok((checksum, len)) => {
            let start = STORED_HEADER_SIZE;
            match bytes.get(start..start + len) {
                Some(payload) => content_hash64(payload) == checksum,
                None => false,
            }
        }
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Snapshot envelope
// ---------------------------------------------------------------------------

/// A decoded snapshot envelope.
#[derive(Debug)]
pub struct Envelope {
    pub schema_version: u32,
    pub compression: u32,
    /// (key hash, key path, stored-record bytes)
    pub entries: Vec<(u64, String, Bytes)>,
}

/// Build a snapshot envelope from `(path, stored-record bytes)` pairs.
pub fn write_envelope(
    schema_version: u32,
    compression: u32,
    entries: &[(String, Vec<u8>)],
) -> Result<Vec<u8>> {
    if compression != COMPRESSION_NONE && compression != COMPRESSION_ZSTD {
        return Err(Error::Serialization {
            message: format!("unsupported envelope compression tag: {}", compression),
        });
    }

    let mut index = Vec::with_capacity(entries.len() * ENVELOPE_INDEX_ENTRY_SIZE);
    let mut payload = Vec::new();

    for (path, record) in entries {
        let offset = payload.len() as u32;
        payload.write_u16::<LittleEndian>(path.len() as u16)?;
        payload.extend_from_slice(path.as_bytes());
        payload.write_u32::<LittleEndian>(record.len() as u32)?;
        payload.extend_from_slice(record);
        let size = payload.len() as u32 - offset;

        index.write_u64::<LittleEndian>(path_hash(path))?;
        index.write_u32::<LittleEndian>(offset)?;
        index.write_u32::<LittleEndian>(size)?;
    }

    let mut body = index;
    body.extend_from_slice(&payload);
    if compression == COMPRESSION_ZSTD {
        body = zstd::encode_all(&body[..], 3).map_err(|e| Error::Serialization {
            message: format!("envelope compression failed: {}", e),
        })?;
    }

    let total_size = ENVELOPE_HEADER_SIZE + body.len();
    let mut out = Vec::with_capacity(total_size);
    out.extend_from_slice(ENVELOPE_MAGIC);
    out.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    out.write_u32::<LittleEndian>(schema_version)?;
    out.write_u32::<LittleEndian>(compression)?;
    out.write_u32::<LittleEndian>(entries.len() as u32)?;
    out.write_u32::<LittleEndian>(total_size as u32)?;
    out.write_u32::<LittleEndian>(crc32_checksum(&body))?;
    out.write_u32::<LittleEndian>(0)?; // Reserved
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse and verify a snapshot envelope.
pub fn read_envelope(bytes: &[u8]) -> Result<Envelope> {
    if bytes.len() < ENVELOPE_HEADER_SIZE {
        return Err(Error::Serialization {
            message: "envelope shorter than header".to_string(),
        });
    }

    let mut cursor = Cursor::new(bytes);
    let mut magic = [0u8; 4];
    std::io::Read::read_exact(&mut cursor, &mut magic).map_err(truncated)?;
    if &magic != ENVELOPE_MAGIC {
        return Err(Error::Serialization {
            message: "bad envelope magic".to_string(),
        });
    }

    let format_version = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    if format_version != FORMAT_VERSION {
        return Err(Error::Serialization {
            message: format!("unsupported envelope format version: {}", format_version),
        });
    }
    let schema_version = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let compression = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let entry_count = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let total_size = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let checksum = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let _reserved = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

    if total_size != bytes.len() {
        return Err(Error::Serialization {
            message: format!(
                "envelope size mismatch: header says {}, got {}",
                total_size,
                bytes.len()
            ),
        });
    }

    let body = &bytes[ENVELOPE_HEADER_SIZE..];
    if crc32_checksum(body) != checksum {
        return Err(Error::Corruption {
            key: "<envelope>".to_string(),
            detail: "envelope checksum mismatch".to_string(),
        });
    }

    let decompressed;
    let body: &[u8] = match compression {
        COMPRESSION_NONE => body,
        COMPRESSION_ZSTD => {
            decompressed = zstd::decode_all(body).map_err(|e| Error::Serialization {
                message: format!("envelope decompression failed: {}", e),
            })?;
            &decompressed
        }
        other => {
            return Err(Error::Serialization {
                message: format!("unsupported envelope compression tag: {}", other),
            });
        }
    };

    let index_size = entry_count * ENVELOPE_INDEX_ENTRY_SIZE;
    if body.len() < index_size {
        return Err(Error::Serialization {
            message: "envelope index truncated".to_string(),
        });
    }
    let (index, payload) = body.split_at(index_size);

    let mut entries = Vec::with_capacity(entry_count);
    let mut idx = Cursor::new(index);
    for _ in 0..entry_count {
        let key_hash = idx.read_u64::<LittleEndian>().map_err(truncated)?;
        let offset = idx.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let size = idx.read_u32::<LittleEndian>().map_err(truncated)? as usize;

        let blob = payload
            .get(offset..offset + size)
            .ok_or_else(|| Error::Serialization {
                message: "envelope index points outside payload".to_string(),
            })?;

        let mut entry = Cursor::new(blob);
        let path_len = entry.read_u16::<LittleEndian>().map_err(truncated)? as usize;
        let path_bytes = read_exact(&mut entry, path_len)?;
        let path = String::from_utf8(path_bytes).map_err(|e| Error::Serialization {
            message: format!("invalid UTF-8 in envelope key: {}", e),
        })?;
        let record_len = entry.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let record_start = entry.position() as usize;
        let record = blob
            .get(record_start..record_start + record_len)
            .ok_or_else(|| Error::Serialization {
                message: "envelope record truncated".to_string(),
            })?;

        entries.push((key_hash, path, Bytes::copy_from_slice(record)));
    }

    Ok(Envelope {
        schema_version,
        compression,
        entries,
    })
}
