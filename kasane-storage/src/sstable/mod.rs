//! Immutable sorted files backing the persistent tree.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SSTable File Structure                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data Blocks (16KB default)                                 │
//! │    Entry: [key_len][key][value_len][value]                  │
//! │    Block Footer: [compression][crc32]                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Index Block: [last_key][offset][size] per data block       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Bloom Filter: [filter_data][num_probes][bits_per_key]      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (40B): [index_offset][index_size][bloom_offset]     │
//! │                [bloom_size][magic][version][checksum]       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod bloom;
mod builder;
mod compression;
mod iterator;
mod reader;
mod types;
mod writer;

pub use bloom::BloomFilter;
pub use builder::{BlockBuilder, IndexBuilder};
pub use compression::{compress_block, decompress_block, CompressionType};
pub use iterator::SSTableIterator;
pub use reader::SSTableReader;
pub use types::{SSTableConfig, SSTableInfo, FOOTER_SIZE, SSTABLE_MAGIC, SSTABLE_VERSION};
pub use writer::SSTableWriter;
