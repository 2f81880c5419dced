//! Block and index builders

use byteorder::{LittleEndian, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use kasane_core::error::Result;

/// Builder for SSTable data blocks
pub struct BlockBuilder {
    buffer: BytesMut,
    offsets: Vec<u32>,
    last_key: Option<Bytes>,
    max_size: usize,
}

impl BlockBuilder {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_size),
            offsets: Vec::new(),
            last_key: None,
            max_size,
        }
    }

    /// Add a key-value pair. Returns false if the block is full; a block
    /// always accepts at least one entry.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> bool {
        let entry_size = 4 + key.len() + 4 + value.len();

        if !self.is_empty() && self.buffer.len() + entry_size > self.max_size {
            return false;
        }

        self.offsets.push(self.buffer.len() as u32);
        self.buffer.put_u32_le(key.len() as u32);
        self.buffer.put_slice(key);
        self.buffer.put_u32_le(value.len() as u32);
        self.buffer.put_slice(value);
        self.last_key = Some(Bytes::copy_from_slice(key));

        true
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn last_key(&self) -> Option<Bytes> {
        self.last_key.clone()
    }

    /// Finish the block: entry data, then the offset table, then the entry
    /// count. Resets the builder for reuse.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.buffer.len() + self.offsets.len() * 4 + 4);
        result.extend_from_slice(&self.buffer);
        for offset in &self.offsets {
            result.extend_from_slice(&offset.to_le_bytes());
        }
        result.extend_from_slice(&(self.offsets.len() as u32).to_le_bytes());

        self.buffer.clear();
        self.offsets.clear();
        self.last_key = None;

        result
    }
}

/// Builder for the sparse last-key index
pub struct IndexBuilder {
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) last_key: Bytes,
    pub(crate) block_offset: u64,
    pub(crate) block_size: u32,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, last_key: &[u8], block_offset: u64, block_size: u32) -> Result<()> {
        self.entries.push(IndexEntry {
            last_key: Bytes::copy_from_slice(last_key),
            block_offset,
            block_size,
        });
        Ok(())
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut buffer = Vec::new();
        for entry in &self.entries {
            buffer
                .write_u32::<LittleEndian>(entry.last_key.len() as u32)
                .unwrap();
            buffer.extend_from_slice(&entry.last_key);
            buffer.write_u64::<LittleEndian>(entry.block_offset).unwrap();
            buffer.write_u32::<LittleEndian>(entry.block_size).unwrap();
        }
        buffer
            .write_u32::<LittleEndian>(self.entries.len() as u32)
            .unwrap();
        buffer
    }

    pub(crate) fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}
