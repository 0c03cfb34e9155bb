use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::merge_engine::MergeEngine;
use crate::temp_file::{TempFile, TempFileFactory};
use crate::varint;
use crate::writer::Writer;

/// A materialized byte range a `Reader` can consume as if it were one
/// long, header-less PMA (4.6).
pub(crate) struct Region {
    pub(crate) file: Arc<dyn TempFile>,
    pub(crate) start: u64,
    pub(crate) eof: u64,
}

/// Where an `IncrementalMerger`'s two buffers live (4.6). Single
/// threaded mode aliases two halves of one shared scratch file;
/// threaded mode gives each buffer its own temp file so a background
/// fill never contends with the foreground read.
pub(crate) enum Storage {
    SingleThreaded { file: Arc<dyn TempFile>, start_offset: u64 },
    Threaded { files: [Arc<dyn TempFile>; 2] },
}

struct Buf {
    file: Arc<dyn TempFile>,
    start: u64,
    eof: u64,
}

type WorkerResult = Result<(MergeEngine, u64)>;

/// Double-buffered producer/consumer adapter that streams a child
/// `MergeEngine`'s output into bounded regions so a parent `Reader`
/// can drain one side while the other refills (4.6).
pub(crate) struct IncrementalMerger {
    child: Option<MergeEngine>,
    storage: Storage,
    max_buf: u64,
    page_size: usize,
    bufs: [Buf; 2],
    read_idx: usize,
    done: bool,
    worker: Option<JoinHandle<WorkerResult>>,
}

impl IncrementalMerger {
    /// Build the merger and perform the first, synchronous fill of
    /// `buf[0]` so a `Reader` can be positioned on it immediately.
    /// In threaded mode, also kicks off a background fill of `buf[1]`
    /// so it stands a chance of being ready before the first swap.
    pub(crate) fn new(child: MergeEngine, storage: Storage, max_buf: u64, page_size: usize) -> Result<IncrementalMerger> {
        let (buf0, buf1) = match &storage {
            Storage::SingleThreaded { file, start_offset } => (
                Buf { file: file.clone(), start: *start_offset, eof: *start_offset },
                Buf { file: file.clone(), start: *start_offset + max_buf, eof: *start_offset + max_buf },
            ),
            Storage::Threaded { files } => (
                Buf { file: files[0].clone(), start: 0, eof: 0 },
                Buf { file: files[1].clone(), start: 0, eof: 0 },
            ),
        };
        let threaded = matches!(storage, Storage::Threaded { .. });
        let mut merger = IncrementalMerger {
            child: Some(child),
            storage,
            max_buf,
            page_size,
            bufs: [buf0, buf1],
            read_idx: 0,
            done: false,
            worker: None,
        };

        let eof0 = fill_region(merger.child.as_mut().expect("child present at construction"), &merger.bufs[0].file, merger.bufs[0].start, merger.max_buf, merger.page_size)?;
        merger.bufs[0].eof = eof0;
        if eof0 == merger.bufs[0].start {
            merger.done = true;
        } else if threaded {
            merger.spawn_fill(1)?;
        }
        Ok(merger)
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// The region a freshly constructed `Reader` should start draining.
    pub(crate) fn initial_region(&self) -> Result<Region> {
        let buf = &self.bufs[self.read_idx];
        Ok(Region { file: buf.file.clone(), start: buf.start, eof: buf.eof })
    }

    fn spawn_fill(&mut self, idx: usize) -> Result<()> {
        let child = self.child.take().ok_or_else(|| Error::invalid_usage("incremental merger worker already in flight"))?;
        let file = self.bufs[idx].file.clone();
        let start = self.bufs[idx].start;
        let max_buf = self.max_buf;
        let page_size = self.page_size;
        let mut child = child;
        self.worker = Some(std::thread::spawn(move || {
            let eof = fill_region(&mut child, &file, start, max_buf, page_size)?;
            Ok((child, eof))
        }));
        Ok(())
    }

    /// Called when the owning `Reader` has drained `bufs[read_idx]`
    /// down to its `eof`. Returns the next region to read from, or
    /// `None` once the merge is fully exhausted.
    pub(crate) fn swap(&mut self) -> Result<Option<Region>> {
        if self.done {
            return Ok(None);
        }
        let other = 1 - self.read_idx;
        let threaded = matches!(self.storage, Storage::Threaded { .. });

        if threaded {
            if let Some(handle) = self.worker.take() {
                let (child, eof) = handle.join().map_err(|_| Error::worker_failed(Error::InvalidUsage("incremental merge worker panicked".to_string())))??;
                self.child = Some(child);
                self.bufs[other].eof = eof;
            } else {
                let eof = fill_region(self.child.as_mut().expect("child present between worker spawns"), &self.bufs[other].file, self.bufs[other].start, self.max_buf, self.page_size)?;
                self.bufs[other].eof = eof;
            }
        } else {
            let eof = fill_region(self.child.as_mut().expect("single-threaded merger always owns its child"), &self.bufs[other].file, self.bufs[other].start, self.max_buf, self.page_size)?;
            self.bufs[other].eof = eof;
        }

        self.read_idx = other;
        if self.bufs[other].eof == self.bufs[other].start {
            self.done = true;
            return Ok(None);
        }

        if threaded {
            let drained = 1 - other;
            self.spawn_fill(drained)?;
        }

        Ok(Some(Region { file: self.bufs[other].file.clone(), start: self.bufs[other].start, eof: self.bufs[other].eof }))
    }
}

impl Drop for IncrementalMerger {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Pull records from `child` and append them (bare `varint(key_len)
/// || key_bytes`, no outer payload-size header) into `file` starting
/// at `start`, stopping when the next key would not fit in `max_buf`
/// bytes or `child` is exhausted. Returns the absolute end offset of
/// what was actually written.
fn fill_region(child: &mut MergeEngine, file: &Arc<dyn TempFile>, start: u64, max_buf: u64, page_size: usize) -> Result<u64> {
    let mut writer = Writer::new(file.clone(), page_size, start);
    loop {
        let Some(key) = child.current_key() else { break };
        let need = varint::encoded_len(key.len() as u64) as u64 + key.len() as u64;
        if writer.len() + need > max_buf {
            break;
        }
        writer.write_record(key)?;
        child.advance()?;
    }
    let written = writer.len();
    writer.finish()?;
    Ok(start + written)
}

/// `max_buf = max(largest_key_bytes + 9, max_pma_bytes/2)`, per (4.6):
/// large enough to hold the biggest key seen so far plus its varint
/// header, but at least half the PMA cap so small keys still batch up.
pub(crate) fn compute_max_buf(largest_key_bytes: u64, max_pma_bytes: u64) -> u64 {
    (largest_key_bytes + 9).max(max_pma_bytes / 2).max(1)
}

#[allow(dead_code)]
pub(crate) fn new_per_merger_storage(factory: &dyn TempFileFactory) -> Result<Storage> {
    Ok(Storage::Threaded { files: [factory.open()?, factory.open()?] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::LexicographicComparator;
    use crate::reader::Reader;
    use crate::source::RecordSource;
    use crate::temp_file::DefaultTempFileFactory;

    struct VecSource {
        items: Vec<Vec<u8>>,
        pos: usize,
    }
    impl RecordSource for VecSource {
        fn current(&self) -> Option<&[u8]> {
            self.items.get(self.pos).map(|v| v.as_slice())
        }
        fn advance(&mut self) -> Result<()> {
            if self.pos < self.items.len() {
                self.pos += 1;
            }
            Ok(())
        }
    }
    fn source(items: &[&str]) -> Box<dyn RecordSource> {
        Box::new(VecSource { items: items.iter().map(|s| s.as_bytes().to_vec()).collect(), pos: 0 })
    }

    #[test]
    fn single_threaded_roundtrip_through_reader() {
        let factory = DefaultTempFileFactory::system_tmp(0);
        let scratch = factory.open().unwrap();
        let engine = MergeEngine::new(vec![source(&["a", "c", "e"]), source(&["b", "d"])], 2, Arc::new(LexicographicComparator));
        let storage = Storage::SingleThreaded { file: scratch, start_offset: 0 };
        let merger = IncrementalMerger::new(engine, storage, 4096, 64).unwrap();
        let mut reader = Reader::open_incremental(merger).unwrap();
        let mut out = Vec::new();
        while let Some(k) = reader.current() {
            out.push(k.to_vec());
            reader.advance().unwrap();
        }
        assert_eq!(out, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);
    }

    #[test]
    fn threaded_roundtrip_through_reader() {
        let factory = DefaultTempFileFactory::system_tmp(0);
        let engine = MergeEngine::new(vec![source(&["1", "3"]), source(&["2", "4", "5"])], 2, Arc::new(LexicographicComparator));
        let storage = new_per_merger_storage(&factory).unwrap();
        let merger = IncrementalMerger::new(engine, storage, 4096, 64).unwrap();
        let mut reader = Reader::open_incremental(merger).unwrap();
        let mut out = Vec::new();
        while let Some(k) = reader.current() {
            out.push(k.to_vec());
            reader.advance().unwrap();
        }
        assert_eq!(out, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec(), b"5".to_vec()]);
    }

    #[test]
    fn small_max_buf_forces_many_swaps() {
        let factory = DefaultTempFileFactory::system_tmp(0);
        let scratch = factory.open().unwrap();
        let items: Vec<String> = (0..50).map(|i| format!("{i:03}")).collect();
        let refs: Vec<&str> = items.iter().map(|s| s.as_str()).collect();
        let engine = MergeEngine::new(vec![source(&refs)], 1, Arc::new(LexicographicComparator));
        // max_buf just big enough for one record at a time forces a swap per record.
        let storage = Storage::SingleThreaded { file: scratch, start_offset: 0 };
        let merger = IncrementalMerger::new(engine, storage, 8, 16).unwrap();
        let mut reader = Reader::open_incremental(merger).unwrap();
        let mut out = Vec::new();
        while let Some(k) = reader.current() {
            out.push(String::from_utf8(k.to_vec()).unwrap());
            reader.advance().unwrap();
        }
        assert_eq!(out, items);
    }
}
