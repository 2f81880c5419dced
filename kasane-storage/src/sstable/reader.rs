//! SSTable reader over a memory-mapped file

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};

use kasane_core::error::{Error, Result};

use crate::sstable::{
    decompress_block, BloomFilter, CompressionType, SSTableIterator, FOOTER_SIZE, SSTABLE_MAGIC,
    SSTABLE_VERSION,
};

pub struct SSTableReader {
    path: PathBuf,
    mmap: Mmap,
    index: SSTableIndex,
    bloom_filter: Option<BloomFilter>,
}

pub(crate) struct SSTableIndex {
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) last_key: Bytes,
    pub(crate) block_offset: u64,
    pub(crate) block_size: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct BlockInfo {
    pub offset: u64,
    pub size: u32,
}

impl SSTableReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        let mmap = unsafe {
            MmapOptions::new().map(&file).map_err(|e| Error::Io {
                message: "failed to mmap SSTable".to_string(),
                source: e,
            })?
        };

        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::SSTable {
                message: "SSTable file too small".to_string(),
                source: None,
            });
        }

        let footer_offset = file_size - FOOTER_SIZE as u64;
        let mut cursor = Cursor::new(&mmap[footer_offset as usize..]);

        let index_offset = cursor.read_u64::<LittleEndian>()?;
        let index_size = cursor.read_u32::<LittleEndian>()?;
        let bloom_offset = cursor.read_u64::<LittleEndian>()?;
        let bloom_size = cursor.read_u32::<LittleEndian>()?;

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != SSTABLE_MAGIC {
            return Err(Error::SSTable {
                message: "invalid SSTable magic number".to_string(),
                source: None,
            });
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        if version != SSTABLE_VERSION {
            return Err(Error::SSTable {
                message: format!("unsupported SSTable version: {}", version),
                source: None,
            });
        }

        let checksum = cursor.read_u32::<LittleEndian>()?;

        let index_end = (index_offset + index_size as u64) as usize;
        let bloom_end = (bloom_offset + bloom_size as u64) as usize;
        if index_end > footer_offset as usize || bloom_end > footer_offset as usize {
            return Err(Error::SSTable {
                message: "footer offsets out of bounds".to_string(),
                source: None,
            });
        }

        let index_data = &mmap[index_offset as usize..index_end];
        let bloom_data = &mmap[bloom_offset as usize..bloom_end];

        let mut meta_hasher = crc32fast::Hasher::new();
        meta_hasher.update(index_data);
        meta_hasher.update(bloom_data);
        if meta_hasher.finalize() != checksum {
            return Err(Error::SSTable {
                message: "index/bloom checksum mismatch".to_string(),
                source: None,
            });
        }

        let index = SSTableIndex::load(index_data)?;
        let bloom_filter = if bloom_size > 0 {
            Some(Self::deserialize_bloom_filter(bloom_data)?)
        } else {
            None
        };

        Ok(Self {
            path,
            mmap,
            index,
            bloom_filter,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point lookup. The bloom filter rejects most absent keys without
    /// touching a block.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        if let Some(ref bloom) = self.bloom_filter {
            if !bloom.contains(key) {
                return Ok(None);
            }
        }

        let block_info = match self.index.find_block(key) {
            Some(info) => info,
            None => return Ok(None),
        };

        let block_data = self.read_block(block_info.offset, block_info.size)?;
        self.search_block(&block_data, key)
    }

    /// Read and decompress a block, verifying its CRC.
    pub(crate) fn read_block(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let block_end = offset + size as u64 - 5; // -5 for block footer
        let block_data = &self.mmap[offset as usize..block_end as usize];

        let compression = CompressionType::try_from(self.mmap[block_end as usize])?;
        let crc = (&self.mmap[(block_end + 1) as usize..(block_end + 5) as usize])
            .read_u32::<LittleEndian>()?;

        if crc32fast::hash(block_data) != crc {
            return Err(Error::SSTable {
                message: "block CRC mismatch".to_string(),
                source: None,
            });
        }

        decompress_block(block_data, compression)
    }

    fn search_block(&self, block_data: &[u8], target_key: &[u8]) -> Result<Option<Bytes>> {
        let mut cursor = Cursor::new(block_data);

        let data_len = block_data.len();
        if data_len < 4 {
            return Ok(None);
        }

        cursor.seek(SeekFrom::End(-4))?;
        let entry_count = cursor.read_u32::<LittleEndian>()? as usize;

        let offsets_start = data_len - 4 - (entry_count * 4);
        cursor.seek(SeekFrom::Start(offsets_start as u64))?;

        let mut offsets = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            offsets.push(cursor.read_u32::<LittleEndian>()?);
        }

        let mut left = 0;
        let mut right = entry_count;

        while left < right {
            let mid = left + (right - left) / 2;
            cursor.seek(SeekFrom::Start(offsets[mid] as u64))?;

            let key_len = cursor.read_u32::<LittleEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            cursor.read_exact(&mut key)?;

            match key.as_slice().cmp(target_key) {
                std::cmp::Ordering::Equal => {
                    let value_len = cursor.read_u32::<LittleEndian>()? as usize;
                    let mut value = vec![0u8; value_len];
                    cursor.read_exact(&mut value)?;
                    return Ok(Some(Bytes::from(value)));
                }
                std::cmp::Ordering::Less => left = mid + 1,
                std::cmp::Ordering::Greater => right = mid,
            }
        }

        Ok(None)
    }

    pub fn iter(&self) -> SSTableIterator<'_> {
        SSTableIterator::new(self)
    }

    pub(crate) fn index(&self) -> &SSTableIndex {
        &self.index
    }

    fn deserialize_bloom_filter(data: &[u8]) -> Result<BloomFilter> {
        if data.len() < 12 {
            return Err(Error::SSTable {
                message: "invalid bloom filter data".to_string(),
                source: None,
            });
        }

        let mut cursor = Cursor::new(&data[data.len() - 12..]);
        let _num_hash_functions = cursor.read_u32::<LittleEndian>()? as usize;
        let _num_bits = cursor.read_u32::<LittleEndian>()? as usize;
        let bits_per_key = cursor.read_u32::<LittleEndian>()? as usize;

        let bits_data = data[..data.len() - 12].to_vec();
        Ok(BloomFilter::from_bytes(bits_data, bits_per_key))
    }
}

impl SSTableIndex {
    pub(crate) fn load(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut entries = Vec::new();

        cursor.seek(SeekFrom::End(-4))?;
        let entry_count = cursor.read_u32::<LittleEndian>()? as usize;
        cursor.seek(SeekFrom::Start(0))?;

        for _ in 0..entry_count {
            let key_len = cursor.read_u32::<LittleEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            cursor.read_exact(&mut key)?;

            let block_offset = cursor.read_u64::<LittleEndian>()?;
            let block_size = cursor.read_u32::<LittleEndian>()?;

            entries.push(IndexEntry {
                last_key: Bytes::from(key),
                block_offset,
                block_size,
            });
        }

        Ok(Self { entries })
    }

    /// Blocks are sorted and non-overlapping: the key, if present, lives in
    /// the first block whose last key is >= it.
    pub(crate) fn find_block(&self, key: &[u8]) -> Option<BlockInfo> {
        let idx = self
            .entries
            .partition_point(|e| e.last_key.as_ref() < key);
        self.entries.get(idx).map(|e| BlockInfo {
            offset: e.block_offset,
            size: e.block_size,
        })
    }

    pub(crate) fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }
}
