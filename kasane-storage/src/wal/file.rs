use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use tracing::{info, warn};

use kasane_core::crypto::content_hash64;
use kasane_core::error::{Error, Result};

use super::types::*;

/// In-memory struct of an open WAL file.
pub(crate) struct WalFile {
    pub path: PathBuf,
    pub file: BufWriter<File>,
    pub size: u64,
    pub record_count: u64,
    pub first_ts: u64,
    pub last_ts: u64,
}

pub(crate) fn create_file(wal_dir: &Path, first_ts: u64, config: &WalConfig) -> Result<WalFile> {
    let filename = format!("{:020}.wal", first_ts);
    let path = wal_dir.join(&filename);

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(&path)?;

    let mut writer = BufWriter::with_capacity(config.buffer_size, file);

    writer.write_all(WAL_MAGIC)?;
    writer.write_u32::<LittleEndian>(WAL_VERSION)?;
    writer.write_u64::<LittleEndian>(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs(),
    )?;
    writer.write_u64::<LittleEndian>(first_ts)?;
    writer.write_u64::<LittleEndian>(first_ts)?; // Last timestamp (updated on finalize)
    writer.write_u64::<LittleEndian>(0)?; // Record count
    writer.write_u32::<LittleEndian>(0)?; // Checksum placeholder
    writer.write_all(&[0u8; 16])?; // Reserved
    writer.flush()?;

    Ok(WalFile {
        path,
        file: writer,
        size: WAL_HEADER_SIZE as u64,
        record_count: 0,
        first_ts,
        last_ts: first_ts,
    })
}

/// Reopen the newest WAL file, scanning its records and truncating any
/// torn tail left by a crash.
pub(crate) fn recover_file(path: &Path, config: &WalConfig) -> Result<WalFile> {
    info!("Recovering from WAL file: {:?}", path);

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != WAL_MAGIC {
        return Err(Error::WriteAheadLog {
            message: "invalid WAL file magic number".to_string(),
            source: None,
        });
    }

    let version = reader.read_u32::<LittleEndian>()?;
    if version != WAL_VERSION {
        return Err(Error::WriteAheadLog {
            message: format!("unsupported WAL version: {}", version),
            source: None,
        });
    }

    let _creation_time = reader.read_u64::<LittleEndian>()?;
    let first_ts = reader.read_u64::<LittleEndian>()?;
    let mut last_ts = reader.read_u64::<LittleEndian>()?;
    let _record_count = reader.read_u64::<LittleEndian>()?;
    let _checksum = reader.read_u32::<LittleEndian>()?;
    reader.read_exact(&mut [0u8; 16])?;

    let mut valid_end = WAL_HEADER_SIZE as u64;
    let mut record_count = 0u64;
    loop {
        match read_record(&mut reader) {
            Ok((record, len)) => {
                last_ts = record.timestamp_ns;
                valid_end += len as u64;
                record_count += 1;
            }
            Err(_) => break,
        }
    }

    let mut file = reader.into_inner();
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size > valid_end {
        warn!(
            "Truncating torn WAL tail: {} -> {} bytes",
            file_size, valid_end
        );
        file.set_len(valid_end)?;
        file.sync_all()?;
    }
    file.seek(SeekFrom::Start(valid_end))?;
    let writer = BufWriter::with_capacity(config.buffer_size, file);

    Ok(WalFile {
        path: path.to_path_buf(),
        file: writer,
        size: valid_end,
        record_count,
        first_ts,
        last_ts,
    })
}

/// Update header with final timestamp/count before rotation.
pub(crate) fn finalize_header(wal_file: &mut WalFile) -> Result<()> {
    wal_file.file.flush()?;
    let file = wal_file.file.get_mut();

    file.seek(SeekFrom::Start(28))?; // Offset of last_ts
    file.write_u64::<LittleEndian>(wal_file.last_ts)?;
    file.write_u64::<LittleEndian>(wal_file.record_count)?;
    file.sync_all()?;
    file.seek(SeekFrom::End(0))?;

    Ok(())
}

pub(crate) fn read_header_last_ts(path: &Path) -> Result<u64> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(28))?;
    Ok(file.read_u64::<LittleEndian>()?)
}

fn encode_payload(record: &WalRecord) -> Vec<u8> {
    match record.op {
        WalOp::Set => {
            let mut buf = Vec::with_capacity(2 + record.path.len() + record.record.len());
            buf.extend_from_slice(&(record.path.len() as u16).to_le_bytes());
            buf.extend_from_slice(record.path.as_bytes());
            buf.extend_from_slice(&record.record);
            buf
        }
        WalOp::Delete => {
            let mut buf = Vec::with_capacity(2 + record.path.len());
            buf.extend_from_slice(&(record.path.len() as u16).to_le_bytes());
            buf.extend_from_slice(record.path.as_bytes());
            buf
        }
        WalOp::TxnCommit | WalOp::TxnAbort | WalOp::Checkpoint => Vec::new(),
    }
}

pub(crate) fn write_record(writer: &mut impl Write, record: &WalRecord) -> Result<usize> {
    let payload = encode_payload(record);

    writer.write_u64::<LittleEndian>(record.txn_id)?;
    writer.write_u64::<LittleEndian>(record.timestamp_ns)?;
    writer.write_u64::<LittleEndian>(record.op as u64)?;
    writer.write_u64::<LittleEndian>(record.key_hash)?;
    writer.write_u64::<LittleEndian>(payload.len() as u64)?;
    writer.write_u64::<LittleEndian>(content_hash64(&payload))?;
    writer.write_u64::<LittleEndian>(record.prev_offset)?;
    writer.write_u64::<LittleEndian>(record.flags)?;
    writer.write_all(&payload)?;

    Ok(RECORD_HEADER_SIZE + payload.len())
}

/// Read one record. Returns the record and its total on-disk length.
pub(crate) fn read_record(reader: &mut impl Read) -> Result<(WalRecord, usize)> {
    let txn_id = match reader.read_u64::<LittleEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::WriteAheadLog {
                message: "EOF".to_string(),
                source: Some(Box::new(e)),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let timestamp_ns = reader.read_u64::<LittleEndian>()?;
    let op = WalOp::try_from(reader.read_u64::<LittleEndian>()?)?;
    let key_hash = reader.read_u64::<LittleEndian>()?;
    let value_size = reader.read_u64::<LittleEndian>()? as usize;
    let checksum = reader.read_u64::<LittleEndian>()?;
    let prev_offset = reader.read_u64::<LittleEndian>()?;
    let flags = reader.read_u64::<LittleEndian>()?;

    let mut payload = vec![0u8; value_size];
    reader.read_exact(&mut payload)?;

    if content_hash64(&payload) != checksum {
        return Err(Error::WriteAheadLog {
            message: "record checksum mismatch".to_string(),
            source: None,
        });
    }

    let (path, record) = match op {
        WalOp::Set | WalOp::Delete => {
            if payload.len() < 2 {
                return Err(Error::WriteAheadLog {
                    message: "record payload too short for path".to_string(),
                    source: None,
                });
            }
            let path_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
            if payload.len() < 2 + path_len {
                return Err(Error::WriteAheadLog {
                    message: "record path truncated".to_string(),
                    source: None,
                });
            }
            let path = String::from_utf8(payload[2..2 + path_len].to_vec()).map_err(|e| {
                Error::WriteAheadLog {
                    message: format!("invalid UTF-8 in record path: {}", e),
                    source: None,
                }
            })?;
            let record = Bytes::copy_from_slice(&payload[2 + path_len..]);
            (path, record)
        }
        _ => (String::new(), Bytes::new()),
    };

    Ok((
        WalRecord {
            txn_id,
            timestamp_ns,
            op,
            key_hash,
            checksum,
            prev_offset,
            flags,
            path,
            record,
        },
        RECORD_HEADER_SIZE + value_size,
    ))
}

pub(crate) fn record_size(record: &WalRecord) -> usize {
    let payload_len = match record.op {
        WalOp::Set => 2 + record.path.len() + record.record.len(),
        WalOp::Delete => 2 + record.path.len(),
        _ => 0,
    };
    RECORD_HEADER_SIZE + payload_len
}
