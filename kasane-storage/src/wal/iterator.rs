//! Lazy iteration over WAL records across multiple files.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::PathBuf;

use kasane_core::error::Result;

use super::file::read_record;
use super::types::{WalRecord, WAL_HEADER_SIZE};

pub struct WalRecordIterator {
    files: Vec<PathBuf>,
    file_index: usize,
    reader: Option<BufReader<File>>,
    min_timestamp: u64,
}

impl WalRecordIterator {
    pub(crate) fn new(files: Vec<PathBuf>, min_timestamp: u64) -> Result<Self> {
        Ok(Self {
            files,
            file_index: 0,
            reader: None,
            min_timestamp,
        })
    }

    fn open_next_file(&mut self) -> Result<bool> {
        if self.file_index >= self.files.len() {
            return Ok(false);
        }
        let file = File::open(&self.files[self.file_index])?;
        self.file_index += 1;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        self.reader = Some(reader);
        Ok(true)
    }
}

impl Iterator for WalRecordIterator {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.reader.is_none() {
                match self.open_next_file() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }

            let reader = self.reader.as_mut()?;
            match read_record(reader) {
                Ok((record, _)) => {
                    if record.timestamp_ns > self.min_timestamp || self.min_timestamp == 0 {
                        return Some(Ok(record));
                    }
                    // Before the checkpoint; skip.
                }
                Err(_) => {
                    // End of this file (EOF or torn tail); move on.
                    self.reader = None;
                }
            }
        }
    }
}
