use std::sync::Arc;

use crate::error::Result;
use crate::temp_file::TempFile;
use crate::varint;

/// Page-aligned streaming writer for one PMA (4.4).
///
/// Records are appended as `varint(len) || bytes`, back to back, with
/// no regard for page boundaries - a record may straddle two pages.
/// The matching `Reader` carries an assembly buffer for exactly that
/// case. Output only ever reaches the backing file a full page at a
/// time, keeping writes aligned even though records aren't.
pub(crate) struct Writer {
    file: Arc<dyn TempFile>,
    page_size: usize,
    page_buf: Vec<u8>,
    file_offset: u64,
    total_len: u64,
}

impl Writer {
    /// `start_offset` is the absolute file offset this writer begins
    /// appending at - a subtask's primary file keeps growing across
    /// many flushed PMAs, and an `IncrementalMerger` buffer (4.6)
    /// lives at a region offset inside its scratch file, so a writer
    /// can never assume it starts at byte zero.
    pub(crate) fn new(file: Arc<dyn TempFile>, page_size: usize, start_offset: u64) -> Writer {
        Writer {
            file,
            page_size,
            page_buf: Vec::with_capacity(page_size),
            file_offset: start_offset,
            total_len: 0,
        }
    }

    /// Total number of bytes written so far through this writer,
    /// counting bytes still sitting in `page_buf`. Does not include
    /// `start_offset`.
    pub(crate) fn len(&self) -> u64 {
        self.total_len
    }

    /// Emit a bare varint, used once by `Subtask::flush` to write a
    /// PMA's outer `varint(payload_bytes)` header (6) ahead of its
    /// records.
    pub(crate) fn write_varint(&mut self, value: u64) -> Result<()> {
        let mut header = Vec::with_capacity(9);
        varint::encode(value, &mut header);
        self.write_bytes(&header)
    }

    pub(crate) fn write_record(&mut self, record: &[u8]) -> Result<()> {
        self.write_varint(record.len() as u64)?;
        self.write_bytes(record)?;
        Ok(())
    }

    fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        self.total_len += data.len() as u64;
        while !data.is_empty() {
            let room = self.page_size - self.page_buf.len();
            let take = room.min(data.len());
            self.page_buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.page_buf.len() == self.page_size {
                self.flush_page()?;
            }
        }
        Ok(())
    }

    fn flush_page(&mut self) -> Result<()> {
        self.file.write_at(self.file_offset, &self.page_buf)?;
        self.file_offset += self.page_buf.len() as u64;
        self.page_buf.clear();
        Ok(())
    }

    /// Flush any partial trailing page and return the backing file,
    /// ready for a `Reader` to consume from offset 0.
    pub(crate) fn finish(mut self) -> Result<Arc<dyn TempFile>> {
        if !self.page_buf.is_empty() {
            self.flush_page()?;
        }
        Ok(self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_file::{DefaultTempFileFactory, TempFileFactory};

    #[test]
    fn records_survive_a_page_straddle() {
        let factory = DefaultTempFileFactory::system_tmp(0);
        let backing = factory.open().unwrap();
        let mut writer = Writer::new(backing.clone(), 8, 0);
        writer.write_record(b"hello").unwrap();
        writer.write_record(b"world!!").unwrap();
        let file = writer.finish().unwrap();

        let mut buf = vec![0u8; file.len() as usize];
        file.read_at(0, &mut buf).unwrap();
        let (len1, n1) = varint::decode(&buf);
        assert_eq!(len1, 5);
        assert_eq!(&buf[n1..n1 + 5], b"hello");
        let (len2, n2) = varint::decode(&buf[n1 + 5..]);
        assert_eq!(len2, 7);
        assert_eq!(&buf[n1 + 5 + n2..n1 + 5 + n2 + 7], b"world!!");
    }
}
