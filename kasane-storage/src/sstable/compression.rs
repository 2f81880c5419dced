//! Per-block compression

use kasane_core::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Zstd = 1,
    Snappy = 2,
}

impl TryFrom<u8> for CompressionType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            2 => Ok(CompressionType::Snappy),
            _ => Err(Error::SSTable {
                message: format!("unknown compression type: {}", value),
                source: None,
            }),
        }
    }
}

pub fn compress_block(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => zstd::encode_all(data, 3).map_err(|e| Error::SSTable {
            message: format!("zstd compression failed: {}", e),
            source: Some(Box::new(e)),
        }),
        CompressionType::Snappy => {
            snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| Error::SSTable {
                    message: format!("snappy compression failed: {}", e),
                    source: Some(Box::new(e)),
                })
        }
    }
}

pub fn decompress_block(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => zstd::decode_all(data).map_err(|e| Error::SSTable {
            message: format!("zstd decompression failed: {}", e),
            source: Some(Box::new(e)),
        }),
        CompressionType::Snappy => {
            snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| Error::SSTable {
                    message: format!("snappy decompression failed: {}", e),
                    source: Some(Box::new(e)),
                })
        }
    }
}
