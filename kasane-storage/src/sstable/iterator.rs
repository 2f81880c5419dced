//! Ordered iteration over every entry of a table.

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;

use kasane_core::error::Result;

use super::reader::SSTableReader;

pub struct SSTableIterator<'a> {
    reader: &'a SSTableReader,
    block_index: usize,
    current_entries: Vec<(Bytes, Bytes)>,
    entry_index: usize,
}

impl<'a> SSTableIterator<'a> {
    pub(crate) fn new(reader: &'a SSTableReader) -> Self {
        Self {
            reader,
            block_index: 0,
            current_entries: Vec::new(),
            entry_index: 0,
        }
    }

    fn load_next_block(&mut self) -> Result<bool> {
        let index = self.reader.index();
        let entry = match index.entries().get(self.block_index) {
            Some(e) => e.clone(),
            None => return Ok(false),
        };
        self.block_index += 1;

        let block_data = self.reader.read_block(entry.block_offset, entry.block_size)?;
        self.current_entries = decode_block_entries(&block_data)?;
        self.entry_index = 0;
        Ok(true)
    }
}

impl<'a> Iterator for SSTableIterator<'a> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.entry_index < self.current_entries.len() {
                let pair = self.current_entries[self.entry_index].clone();
                self.entry_index += 1;
                return Some(Ok(pair));
            }
            match self.load_next_block() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn decode_block_entries(block_data: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
    let mut cursor = Cursor::new(block_data);
    if block_data.len() < 4 {
        return Ok(Vec::new());
    }

    cursor.seek(SeekFrom::End(-4))?;
    let entry_count = cursor.read_u32::<LittleEndian>()? as usize;
    cursor.seek(SeekFrom::Start(0))?;

    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let key_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;
        let value_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut value = vec![0u8; value_len];
        cursor.read_exact(&mut value)?;
        entries.push((Bytes::from(key), Bytes::from(value)));
    }
    Ok(entries)
}
