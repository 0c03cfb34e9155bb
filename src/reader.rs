use std::sync::Arc;

use crate::error::{Error, Result};
use crate::incremental_merger::IncrementalMerger;
use crate::source::RecordSource;
use crate::temp_file::{MmapView, TempFile};
use crate::varint;

/// Where the current key's bytes live, so `current()` can hand back a
/// borrow without the reader being self-referential (4.5).
enum KeyLoc {
    /// Offset into `buf`, relative to `buf_start`.
    Buf(usize, usize),
    /// Offset into the reusable `assembly` buffer.
    Assembly(usize),
    /// Offset into the whole-file `mmap` view.
    Mmap(usize, usize),
}

/// Forward-only reader over one PMA or one `IncrementalMerger`'s
/// output region (4.5).
///
/// A reader constructed over a plain file region expects a leading
/// `varint(payload_bytes)` header (the on-disk PMA format, 6); a
/// reader built over an `IncrementalMerger` reads bare
/// `varint(key_len) || key_bytes` records up to the region boundary
/// the merger hands back, with no such header.
pub(crate) struct Reader {
    file: Arc<dyn TempFile>,
    mmap: Option<MmapView>,
    page_size: usize,
    buf: Vec<u8>,
    buf_start: u64,
    buf_valid: usize,
    assembly: Vec<u8>,
    offset: u64,
    eof: u64,
    current: Option<KeyLoc>,
    incremental: Option<Box<IncrementalMerger>>,
}

impl Reader {
    /// Open a reader positioned at the start of a level-0 or
    /// higher-level PMA: `start` points at the outer
    /// `varint(payload_bytes)` header.
    pub(crate) fn open_pma(file: Arc<dyn TempFile>, mmap: Option<MmapView>, start: u64, page_size: usize) -> Result<Reader> {
        let mut reader = Reader {
            file,
            mmap,
            page_size,
            buf: Vec::new(),
            buf_start: 0,
            buf_valid: 0,
            assembly: Vec::new(),
            offset: start,
            eof: start,
            current: None,
            incremental: None,
        };
        let payload_bytes = reader.read_varint()?;
        reader.eof = reader.offset + payload_bytes;
        reader.decode_next()?;
        Ok(reader)
    }

    /// Open a reader whose records come from an `IncrementalMerger`'s
    /// double-buffered region instead of a single static PMA (4.6).
    pub(crate) fn open_incremental(mut merger: IncrementalMerger) -> Result<Reader> {
        let region = merger.initial_region()?;
        let mut reader = Reader {
            file: region.file,
            mmap: None,
            page_size: merger.page_size(),
            buf: Vec::new(),
            buf_start: 0,
            buf_valid: 0,
            assembly: Vec::new(),
            offset: region.start,
            eof: region.eof,
            current: None,
            incremental: Some(Box::new(merger)),
        };
        reader.decode_next()?;
        Ok(reader)
    }

    fn fill_buffer(&mut self, at: u64) -> Result<()> {
        if self.buf.len() != self.page_size {
            self.buf.resize(self.page_size, 0);
        }
        // Bounded by the file's actual length, not `self.eof`: the
        // very first read (the outer payload-size header) happens
        // before `self.eof` is known.
        let file_len = self.file.len();
        let remaining = file_len.saturating_sub(at);
        let want = remaining.min(self.page_size as u64) as usize;
        if want > 0 {
            self.file.read_at(at, &mut self.buf[..want])?;
        }
        self.buf_start = at;
        self.buf_valid = want;
        Ok(())
    }

    fn byte_at(&mut self, pos: u64) -> Result<u8> {
        if let Some(mmap) = &self.mmap {
            return Ok(mmap.as_slice()[pos as usize]);
        }
        if pos < self.buf_start || pos >= self.buf_start + self.buf_valid as u64 {
            self.fill_buffer(pos)?;
        }
        Ok(self.buf[(pos - self.buf_start) as usize])
    }

    /// Read a base-128 varint starting at `self.offset`, advancing it
    /// past the varint's last byte.
    fn read_varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut pos = self.offset;
        for i in 0..9 {
            let byte = self.byte_at(pos)?;
            pos += 1;
            if i == 8 {
                result |= (byte as u64) << (7 * 8);
                break;
            }
            result |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                break;
            }
        }
        self.offset = pos;
        Ok(result)
    }

    /// Decode the next `varint(key_len) || key_bytes` record at
    /// `self.offset`, or transition to exhaustion/incremental-swap if
    /// there is none.
    fn decode_next(&mut self) -> Result<()> {
        if self.offset >= self.eof {
            return self.handle_exhausted();
        }
        let key_len = self.read_varint()? as usize;
        let key_start = self.offset;

        if self.mmap.is_some() {
            self.current = Some(KeyLoc::Mmap(key_start as usize, key_len));
            self.offset = key_start + key_len as u64;
            return Ok(());
        }

        if self.buf_valid > 0 && key_start >= self.buf_start && key_start + key_len as u64 <= self.buf_start + self.buf_valid as u64 {
            self.current = Some(KeyLoc::Buf((key_start - self.buf_start) as usize, key_len));
        } else {
            if self.assembly.len() < key_len {
                self.assembly.resize(key_len, 0);
            }
            for i in 0..key_len {
                self.assembly[i] = self.byte_at(key_start + i as u64)?;
            }
            self.current = Some(KeyLoc::Assembly(key_len));
        }
        self.offset = key_start + key_len as u64;
        Ok(())
    }

    fn handle_exhausted(&mut self) -> Result<()> {
        if let Some(mut merger) = self.incremental.take() {
            match merger.swap()? {
                Some(region) => {
                    self.file = region.file;
                    self.offset = region.start;
                    self.eof = region.eof;
                    self.buf_valid = 0;
                    self.incremental = Some(merger);
                    self.decode_next()
                }
                None => {
                    self.current = None;
                    Ok(())
                }
            }
        } else {
            self.current = None;
            Ok(())
        }
    }
}

impl RecordSource for Reader {
    fn current(&self) -> Option<&[u8]> {
        match self.current.as_ref()? {
            KeyLoc::Buf(start, len) => Some(&self.buf[*start..*start + *len]),
            KeyLoc::Assembly(len) => Some(&self.assembly[..*len]),
            KeyLoc::Mmap(start, len) => self.mmap.as_ref().map(|m| &m.as_slice()[*start..*start + *len]),
        }
    }

    fn advance(&mut self) -> Result<()> {
        if self.current.is_none() {
            return Ok(());
        }
        self.decode_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_file::{DefaultTempFileFactory, TempFileFactory};
    use crate::writer::Writer;

    fn pma_file(records: &[&[u8]], page_size: usize) -> Arc<dyn TempFile> {
        pma_file_with_mmap(records, page_size, 0)
    }

    fn pma_file_with_mmap(records: &[&[u8]], page_size: usize, max_mmap_bytes: u64) -> Arc<dyn TempFile> {
        let factory = DefaultTempFileFactory::system_tmp(max_mmap_bytes);
        let file = factory.open().unwrap();
        let mut writer = Writer::new(file.clone(), page_size, 0);
        let payload: u64 = records
            .iter()
            .map(|r| varint::encoded_len(r.len() as u64) as u64 + r.len() as u64)
            .sum();
        writer.write_varint(payload).unwrap();
        for r in records {
            writer.write_record(r).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn reads_records_in_order() {
        let records: &[&[u8]] = &[b"aa", b"bbb", b"c"];
        let file = pma_file(records, 8);
        let mut reader = Reader::open_pma(file, None, 0, 8).unwrap();
        let mut out = Vec::new();
        loop {
            match reader.current() {
                Some(k) => out.push(k.to_vec()),
                None => break,
            }
            reader.advance().unwrap();
        }
        assert_eq!(out, vec![b"aa".to_vec(), b"bbb".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn handles_keys_that_straddle_buffer_pages() {
        // page_size smaller than a single key forces the assembly path.
        let records: &[&[u8]] = &[b"0123456789abcdef"];
        let file = pma_file(records, 4);
        let mut reader = Reader::open_pma(file, None, 0, 4).unwrap();
        assert_eq!(reader.current(), Some(b"0123456789abcdef".as_slice()));
        reader.advance().unwrap();
        assert_eq!(reader.current(), None);
    }

    #[test]
    fn empty_pma_is_immediately_exhausted() {
        let file = pma_file(&[], 8);
        let reader = Reader::open_pma(file, None, 0, 8).unwrap();
        assert_eq!(reader.current(), None);
    }

    #[test]
    fn reads_via_mmap_when_provided() {
        let records: &[&[u8]] = &[b"x", b"y", b"z"];
        let file = pma_file_with_mmap(records, 64, 4096);
        let view = file.try_mmap(file.len()).expect("mmap should be available for a small file");
        let mut reader = Reader::open_pma(file, Some(view), 0, 64).unwrap();
        let mut out = Vec::new();
        while let Some(k) = reader.current() {
            out.push(k.to_vec());
            reader.advance().unwrap();
        }
        assert_eq!(out, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
    }
}
