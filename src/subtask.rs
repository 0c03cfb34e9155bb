use std::sync::Arc;
use std::thread::JoinHandle;

use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::run::Run;
use crate::temp_file::{MmapView, TempFile, TempFileFactory};
use crate::writer::Writer;

/// Outcome of sorting and streaming one run out as a level-0 PMA (4.2).
struct FlushOutcome {
    file: Arc<dyn TempFile>,
    start: u64,
    eof: u64,
}

/// A unit of resources owned exclusively by the `Sorter`: one primary
/// temp file holding this subtask's level-0 PMAs back to back, one
/// scratch temp file for this subtask's own higher-level incremental
/// merges, an optional in-flight flush worker, and a sticky error (3).
pub(crate) struct Subtask {
    index: usize,
    primary_file: Option<Arc<dyn TempFile>>,
    primary_eof: u64,
    pma_boundaries: Vec<(u64, u64)>,
    scratch_file: Option<Arc<dyn TempFile>>,
    scratch_cursor: u64,
    worker: Option<JoinHandle<Result<FlushOutcome>>>,
    first_error: Option<Error>,
}

impl Subtask {
    pub(crate) fn new(index: usize) -> Subtask {
        Subtask {
            index,
            primary_file: None,
            primary_eof: 0,
            pma_boundaries: Vec::new(),
            scratch_file: None,
            scratch_cursor: 0,
            worker: None,
            first_error: None,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn pma_count(&self) -> usize {
        self.pma_boundaries.len()
    }

    pub(crate) fn pma_boundaries(&self) -> &[(u64, u64)] {
        &self.pma_boundaries
    }

    pub(crate) fn primary_file(&self) -> Option<Arc<dyn TempFile>> {
        self.primary_file.clone()
    }

    fn check_error(&self) -> Result<()> {
        match &self.first_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// A worker is currently writing a PMA for this subtask: a new
    /// flush must be routed elsewhere (4.2 step 1). Reaps a finished
    /// worker first so the subtask frees up as soon as possible.
    pub(crate) fn is_busy(&mut self) -> bool {
        match &self.worker {
            Some(handle) if handle.is_finished() => {
                let _ = self.join_flush_worker();
                self.worker.is_some()
            }
            Some(_) => true,
            None => false,
        }
    }

    fn open_primary(&mut self, factory: &dyn TempFileFactory) -> Result<Arc<dyn TempFile>> {
        if self.primary_file.is_none() {
            self.primary_file = Some(factory.open()?);
        }
        Ok(self.primary_file.as_ref().unwrap().clone())
    }

    /// Lazily open this subtask's scratch file, used to back the
    /// single-threaded `IncrementalMerger`s built over its own PMAs
    /// at rewind (4.8).
    pub(crate) fn open_scratch(&mut self, factory: &dyn TempFileFactory) -> Result<Arc<dyn TempFile>> {
        if self.scratch_file.is_none() {
            self.scratch_file = Some(factory.open()?);
        }
        Ok(self.scratch_file.as_ref().unwrap().clone())
    }

    /// Hand out the next `2 * max_buf` byte region of this subtask's
    /// scratch file for one single-threaded `IncrementalMerger`.
    pub(crate) fn alloc_scratch_region(&mut self, max_buf: u64) -> u64 {
        let start = self.scratch_cursor;
        self.scratch_cursor += 2 * max_buf;
        start
    }

    /// Run steps 3-5 of Flush (4.2) inline on the calling thread.
    pub(crate) fn flush_inline(&mut self, run: Run, comparator: Arc<dyn Comparator>, page_size: usize, factory: &dyn TempFileFactory) -> Result<()> {
        self.check_error()?;
        let file = self.open_primary(factory)?;
        let start = self.primary_eof;
        let outcome = sort_and_write(run, comparator.as_ref(), file, page_size, start)?;
        self.apply_outcome(outcome);
        Ok(())
    }

    /// Spawn a background worker to run steps 3-5 of Flush (4.2).
    pub(crate) fn flush_spawn(&mut self, run: Run, comparator: Arc<dyn Comparator>, page_size: usize, factory: &dyn TempFileFactory) -> Result<()> {
        self.check_error()?;
        debug_assert!(self.worker.is_none(), "flush dispatched to a busy subtask");
        let file = self.open_primary(factory)?;
        let start = self.primary_eof;
        self.worker = Some(std::thread::spawn(move || sort_and_write(run, comparator.as_ref(), file, page_size, start)));
        Ok(())
    }

    /// Join an outstanding flush worker, if any, applying its outcome
    /// or capturing its error as this subtask's sticky `first_error`.
    pub(crate) fn join_flush_worker(&mut self) -> Result<()> {
        self.check_error()?;
        let Some(handle) = self.worker.take() else { return Ok(()) };
        match handle.join() {
            Ok(Ok(outcome)) => {
                self.apply_outcome(outcome);
                Ok(())
            }
            Ok(Err(e)) => {
                let wrapped = Error::worker_failed(e);
                self.first_error = Some(wrapped.clone());
                Err(wrapped)
            }
            Err(_) => {
                let e = Error::worker_failed(Error::InvalidUsage("flush worker panicked".to_string()));
                self.first_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn apply_outcome(&mut self, outcome: FlushOutcome) {
        log::info!("subtask {}: flushed PMA #{} [{}, {}) ({} bytes)", self.index, self.pma_boundaries.len(), outcome.start, outcome.eof, outcome.eof - outcome.start);
        self.primary_eof = outcome.eof;
        self.pma_boundaries.push((outcome.start, outcome.eof));
    }

    /// Best-effort whole-file mmap of this subtask's primary file,
    /// honoring the configured threshold (6).
    pub(crate) fn try_mmap(&self, max_mmap_bytes: u64) -> Option<MmapView> {
        let file = self.primary_file.as_ref()?;
        if max_mmap_bytes == 0 || self.primary_eof > max_mmap_bytes {
            return None;
        }
        file.try_mmap(self.primary_eof)
    }

    /// Drop this subtask's temp files and accumulated state, for
    /// `Sorter::reset()`.
    pub(crate) fn clear(&mut self) {
        self.primary_file = None;
        self.primary_eof = 0;
        self.pma_boundaries.clear();
        self.scratch_file = None;
        self.scratch_cursor = 0;
        self.first_error = None;
    }
}

impl Drop for Subtask {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Steps 3-5 of Flush (4.2): sort the run, then stream it through a
/// `Writer` as one PMA starting at `start`.
fn sort_and_write(run: Run, comparator: &dyn Comparator, file: Arc<dyn TempFile>, page_size: usize, start: u64) -> Result<FlushOutcome> {
    let order = run.sort_stable(comparator);
    let payload_bytes = run.pma_payload_bytes();
    // Best-effort pre-extend; not fatal if the backend declines.
    let _ = file.truncate(start + 9 + payload_bytes);

    let mut writer = Writer::new(file.clone(), page_size, start);
    writer.write_varint(payload_bytes)?;
    for idx in order {
        writer.write_record(run.get(idx))?;
    }
    let written = writer.len();
    writer.finish()?;
    Ok(FlushOutcome { file, start, eof: start + written })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::LexicographicComparator;
    use crate::reader::Reader;
    use crate::run::RunStorage;
    use crate::source::RecordSource;
    use crate::temp_file::DefaultTempFileFactory;

    fn run_of(records: &[&[u8]]) -> Run {
        let mut run = Run::new(RunStorage::Bulk, 64);
        for r in records {
            run.push(r).unwrap();
        }
        run
    }

    #[test]
    fn flush_inline_appends_a_pma_and_tracks_eof() {
        let factory = DefaultTempFileFactory::system_tmp(0);
        let mut subtask = Subtask::new(0);
        subtask.flush_inline(run_of(&[b"c", b"a", b"b"]), Arc::new(LexicographicComparator), 64, &factory).unwrap();
        assert_eq!(subtask.pma_count(), 1);
        let (start, eof) = subtask.pma_boundaries()[0];
        assert_eq!(start, 0);
        assert!(eof > start);

        subtask.flush_inline(run_of(&[b"z"]), Arc::new(LexicographicComparator), 64, &factory).unwrap();
        assert_eq!(subtask.pma_count(), 2);
        assert_eq!(subtask.pma_boundaries()[1].0, eof);

        let file = subtask.primary_file().unwrap();
        let mut reader = Reader::open_pma(file.clone(), None, 0, 64).unwrap();
        let mut first_pma = Vec::new();
        while let Some(k) = reader.current() {
            first_pma.push(k.to_vec());
            reader.advance().unwrap();
        }
        assert_eq!(first_pma, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let mut reader2 = Reader::open_pma(file, None, eof, 64).unwrap();
        assert_eq!(reader2.current(), Some(b"z".as_slice()));
        reader2.advance().unwrap();
        assert_eq!(reader2.current(), None);
    }

    #[test]
    fn flush_spawn_surfaces_through_join() {
        let factory = DefaultTempFileFactory::system_tmp(0);
        let mut subtask = Subtask::new(0);
        assert!(!subtask.is_busy());
        subtask.flush_spawn(run_of(&[b"a", b"b"]), Arc::new(LexicographicComparator), 64, &factory).unwrap();
        subtask.join_flush_worker().unwrap();
        assert_eq!(subtask.pma_count(), 1);
    }
}
