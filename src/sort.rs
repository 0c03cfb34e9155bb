use std::cmp::Ordering;
use std::sync::Arc;

use rlimit::Resource;

use crate::comparator::Comparator;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::incremental_merger::{self, IncrementalMerger, Storage as MergeStorage};
use crate::merge_engine::MergeEngine;
use crate::reader::Reader;
use crate::run::{Run, RunStorage};
use crate::source::RecordSource;
use crate::subtask::Subtask;
use crate::temp_file::TempFileFactory;

/// A heap-pressure oracle (6): if present, `write()` also spills early
/// when `nearly_full()` reports true and the run has crossed
/// `min_pma_bytes`, even though `max_pma_bytes` hasn't been hit yet.
pub trait HeapPressureOracle: Send + Sync {
    fn nearly_full(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Accumulating,
    Merging,
    Exhausted,
}

/// In-memory-only fast path taken when `rewind()` is reached without
/// ever having spilled a PMA (4.1).
struct InMemoryCursor {
    run: Run,
    order: Vec<usize>,
    next: usize,
}

/// External merge-sort engine over opaque record blobs (1). Buffers
/// writes in RAM, spills sorted runs ("PMAs") to temp files once
/// `max_pma_bytes` is exceeded, and on `rewind()` builds a tournament
/// merge tree that `next()` drives one record at a time.
///
/// # Examples
/// ```
/// use std::sync::Arc;
/// use pma_sort::comparator::LexicographicComparator;
/// use pma_sort::config::Config;
/// use pma_sort::sort::Sorter;
/// use pma_sort::temp_file::DefaultTempFileFactory;
///
/// fn sort_three() -> pma_sort::error::Result<Vec<Vec<u8>>> {
///     let mut sorter = Sorter::init(
///         Arc::new(LexicographicComparator),
///         Config::default(),
///         Arc::new(DefaultTempFileFactory::system_tmp(0)),
///     )?;
///     sorter.write(b"c")?;
///     sorter.write(b"a")?;
///     sorter.write(b"b")?;
///     sorter.rewind()?;
///
///     let mut out = Vec::new();
///     while sorter.next()? {
///         out.push(sorter.rowkey()?.to_vec());
///     }
///     Ok(out)
/// }
/// ```
pub struct Sorter {
    comparator: Arc<dyn Comparator>,
    config: Config,
    temp_file_factory: Arc<dyn TempFileFactory>,
    heap_oracle: Option<Arc<dyn HeapPressureOracle>>,
    storage: RunStorage,
    use_threads: bool,
    phase: Phase,
    use_pma: bool,
    subtasks: Vec<Subtask>,
    round_robin: usize,
    current_run: Run,
    largest_key_bytes: u64,
    root: Option<MergeEngine>,
    in_memory: Option<InMemoryCursor>,
    current_key: Option<Vec<u8>>,
    restore_nofile: Option<(u64, u64)>,
}

impl Sorter {
    /// `init(comparator, config, temp_file_factory)` (4.1). If
    /// `config.worker_budget() > 0`, creates `worker_budget + 1`
    /// subtasks and runs in threaded mode; otherwise a single subtask
    /// handles every flush inline.
    pub fn init(comparator: Arc<dyn Comparator>, config: Config, temp_file_factory: Arc<dyn TempFileFactory>) -> Result<Sorter> {
        let use_threads = config.worker_budget() > 0;
        let n_subtasks = if use_threads { config.worker_budget() + 1 } else { 1 };
        let subtasks = (0..n_subtasks).map(Subtask::new).collect();
        let storage = RunStorage::Bulk;
        let restore_nofile = Self::raise_nofile_limit(n_subtasks, config.fanout());

        Ok(Sorter {
            comparator,
            temp_file_factory,
            heap_oracle: None,
            storage,
            use_threads,
            phase: Phase::Accumulating,
            use_pma: false,
            subtasks,
            round_robin: 0,
            current_run: Run::new(storage, config.page_size()),
            largest_key_bytes: 0,
            root: None,
            in_memory: None,
            current_key: None,
            restore_nofile,
            config,
        })
    }

    /// Attach an optional heap-pressure oracle (6) after construction.
    pub fn with_heap_oracle(mut self, oracle: Arc<dyn HeapPressureOracle>) -> Sorter {
        self.heap_oracle = Some(oracle);
        self
    }

    fn raise_nofile_limit(n_subtasks: usize, fanout: usize) -> Option<(u64, u64)> {
        let (soft, hard) = rlimit::getrlimit(Resource::NOFILE).ok()?;
        // Two scratch files per incremental merger in threaded mode,
        // one primary file per subtask, plus headroom.
        let wanted = (n_subtasks as u64) * (fanout as u64 * 2 + 2) + 256;
        let new_soft = wanted.max(soft).min(hard);
        log::info!("raising NOFILE rlimit from {} to {} (hard cap {})", soft, new_soft, hard);
        if rlimit::setrlimit(Resource::NOFILE, new_soft, hard).is_ok() {
            Some((soft, hard))
        } else {
            None
        }
    }

    fn ensure_phase(&self, expected: Phase) -> Result<()> {
        if self.phase != expected {
            Err(Error::invalid_usage(format!("expected phase {expected:?}, found {:?}", self.phase)))
        } else {
            Ok(())
        }
    }

    /// Append `record` to the in-memory run, spilling to a level-0
    /// PMA once the run crosses `max_pma_bytes`, or `min_pma_bytes`
    /// while the heap-pressure oracle reports near-full (4.1).
    pub fn write(&mut self, record: &[u8]) -> Result<()> {
        self.ensure_phase(Phase::Accumulating)?;
        self.current_run.push(record)?;
        self.largest_key_bytes = self.largest_key_bytes.max(record.len() as u64);

        let run_bytes_as_pma = self.current_run.pma_payload_bytes();
        let near_full = self.heap_oracle.as_deref().map(|o| o.nearly_full()).unwrap_or(false);
        if run_bytes_as_pma > self.config.max_pma_bytes() || (run_bytes_as_pma > self.config.min_pma_bytes() && near_full) {
            self.flush_current_run()?;
        }
        Ok(())
    }

    fn select_subtask_for_flush(&mut self) -> usize {
        if self.use_threads {
            let budget = self.config.worker_budget();
            for _ in 0..budget {
                let i = self.round_robin;
                self.round_robin = (self.round_robin + 1) % budget;
                if !self.subtasks[i].is_busy() {
                    return i;
                }
            }
        }
        self.subtasks.len() - 1
    }

    /// Flush (4.2): select a subtask, steal the run, sort it, and
    /// stream it out as a level-0 PMA - inline or on a worker thread.
    fn flush_current_run(&mut self) -> Result<()> {
        let idx = self.select_subtask_for_flush();
        let run = std::mem::replace(&mut self.current_run, Run::new(self.storage, self.config.page_size()));
        self.use_pma = true;
        let comparator = self.comparator.clone();
        let page_size = self.config.page_size();
        log::info!("flush: dispatching run of {} records to subtask {}", run.len(), idx);
        if self.use_threads && idx < self.config.worker_budget() {
            self.subtasks[idx].flush_spawn(run, comparator, page_size, self.temp_file_factory.as_ref())
        } else {
            self.subtasks[idx].flush_inline(run, comparator, page_size, self.temp_file_factory.as_ref())
        }
    }

    /// One-way transition to MERGING (4.1). Flushes any final run,
    /// joins outstanding flush workers, and builds the merge tree - or,
    /// if no PMA was ever spilled, sorts the in-memory run directly.
    pub fn rewind(&mut self) -> Result<()> {
        self.ensure_phase(Phase::Accumulating)?;
        log::info!("rewind: start (use_pma={})", self.use_pma);

        if !self.use_pma {
            let run = std::mem::replace(&mut self.current_run, Run::new(self.storage, self.config.page_size()));
            let order = run.sort_stable(self.comparator.as_ref());
            log::info!("rewind: finish, in-memory fast path, {} records", order.len());
            self.in_memory = Some(InMemoryCursor { run, order, next: 0 });
            self.phase = Phase::Merging;
            return Ok(());
        }

        if !self.current_run.is_empty() {
            self.flush_current_run()?;
        }
        for subtask in &mut self.subtasks {
            subtask.join_flush_worker()?;
        }

        self.root = Some(self.build_root_tree()?);
        self.phase = Phase::Merging;
        log::info!("rewind: finish, merge tree built");
        Ok(())
    }

    fn max_buf(&self) -> u64 {
        incremental_merger::compute_max_buf(self.largest_key_bytes, self.config.max_pma_bytes())
    }

    /// Build one `Reader` per level-0 PMA in a subtask's primary file,
    /// in file (write) order, sharing one whole-file mmap view when
    /// the file is within the configured threshold (4.5, 4.8).
    fn subtask_leaf_readers(&self, subtask: &Subtask) -> Result<Vec<Box<dyn RecordSource>>> {
        let file = subtask.primary_file().expect("subtask with PMAs has an open primary file");
        let mmap = subtask.try_mmap(self.config.max_mmap_bytes());
        subtask
            .pma_boundaries()
            .iter()
            .map(|&(start, _eof)| -> Result<Box<dyn RecordSource>> { Ok(Box::new(Reader::open_pma(file.clone(), mmap.clone(), start, self.config.page_size())?)) })
            .collect()
    }

    /// Fold `sources` into a single `MergeEngine`, inserting an
    /// `IncrementalMerger`-backed `Reader` tier whenever there are
    /// more than `fanout` of them, per (4.8)'s `depth = ceil(log_F(P))`
    /// hierarchy. `scratch` supplies the backing storage for each
    /// tier's incremental mergers.
    fn fold_into_tree(&self, mut sources: Vec<Box<dyn RecordSource>>, scratch: &mut dyn FnMut(u64) -> Result<MergeStorage>) -> Result<MergeEngine> {
        let fanout = self.config.fanout();
        loop {
            if sources.len() <= fanout {
                return Ok(MergeEngine::new(sources, fanout, self.comparator.clone()));
            }
            let mut next_level: Vec<Box<dyn RecordSource>> = Vec::new();
            let mut iter = sources.into_iter();
            loop {
                let group: Vec<Box<dyn RecordSource>> = (&mut iter).take(fanout).collect();
                if group.is_empty() {
                    break;
                }
                let engine = MergeEngine::new(group, fanout, self.comparator.clone());
                let max_buf = self.max_buf();
                let storage = scratch(max_buf)?;
                let merger = IncrementalMerger::new(engine, storage, max_buf, self.config.page_size())?;
                next_level.push(Box::new(Reader::open_incremental(merger)?));
            }
            sources = next_level;
        }
    }

    fn build_subtask_tree(&self, subtask: &mut Subtask) -> Result<MergeEngine> {
        let leaves = self.subtask_leaf_readers(subtask)?;
        let use_threads = self.use_threads;
        let factory = self.temp_file_factory.clone();
        let mut scratch = move |max_buf: u64| -> Result<MergeStorage> {
            if use_threads {
                incremental_merger::new_per_merger_storage(factory.as_ref())
            } else {
                let start = subtask.alloc_scratch_region(max_buf);
                let file = subtask.open_scratch(factory.as_ref())?;
                Ok(MergeStorage::SingleThreaded { file, start_offset: start })
            }
        };
        self.fold_into_tree(leaves, &mut scratch)
    }

    /// Tree construction at rewind (4.8): one subtree per subtask that
    /// holds PMAs, then a root merging across subtasks.
    fn build_root_tree(&mut self) -> Result<MergeEngine> {
        let mut per_subtask_roots: Vec<MergeEngine> = Vec::new();
        for subtask in &mut self.subtasks {
            if subtask.pma_count() > 0 {
                per_subtask_roots.push(self.build_subtask_tree(subtask)?);
            }
        }

        if per_subtask_roots.len() == 1 {
            return Ok(per_subtask_roots.into_iter().next().unwrap());
        }

        let use_threads = self.use_threads;
        let factory = self.temp_file_factory.clone();
        let root_scratch: Option<Arc<dyn crate::temp_file::TempFile>> = if use_threads { None } else { Some(factory.open()?) };
        let mut cursor: u64 = 0;
        // The root's fanout is exactly the number of subtasks with data (4.8) -
        // every slot is a real reader, so there is no EOF padding here.
        let root_fanout = per_subtask_roots.len();
        let leaves: Vec<Box<dyn RecordSource>> = per_subtask_roots
            .into_iter()
            .map(|engine| -> Result<Box<dyn RecordSource>> {
                let max_buf = self.max_buf();
                let storage = if use_threads {
                    incremental_merger::new_per_merger_storage(factory.as_ref())?
                } else {
                    let start = cursor;
                    cursor += 2 * max_buf;
                    MergeStorage::SingleThreaded { file: root_scratch.clone().unwrap(), start_offset: start }
                };
                let merger = IncrementalMerger::new(engine, storage, max_buf, self.config.page_size())?;
                Ok(Box::new(Reader::open_incremental(merger)?))
            })
            .collect::<Result<_>>()?;

        Ok(MergeEngine::new(leaves, root_fanout, self.comparator.clone()))
    }

    /// Advance to the next smallest key. Idempotent once exhausted:
    /// `Ok(false)` means end-of-stream, never an error (4.1, 4.9).
    pub fn next(&mut self) -> Result<bool> {
        match self.phase {
            Phase::Accumulating => return Err(Error::invalid_usage("next() called before rewind()")),
            Phase::Exhausted => return Ok(false),
            Phase::Merging => {}
        }

        if let Some(cursor) = &mut self.in_memory {
            if cursor.next >= cursor.order.len() {
                self.phase = Phase::Exhausted;
                self.current_key = None;
                return Ok(false);
            }
            self.current_key = Some(cursor.run.get(cursor.order[cursor.next]).to_vec());
            cursor.next += 1;
            return Ok(true);
        }

        let root = self.root.as_mut().expect("root merge tree built before first next() in PMA mode");
        match root.current_key() {
            Some(key) => {
                self.current_key = Some(key.to_vec());
                root.advance()?;
                Ok(true)
            }
            None => {
                self.phase = Phase::Exhausted;
                self.current_key = None;
                Ok(false)
            }
        }
    }

    /// The current key; valid until the next `next()` or `rewind()`
    /// call on this sorter (4.1).
    pub fn rowkey(&self) -> Result<&[u8]> {
        self.current_key.as_deref().ok_or_else(|| Error::invalid_usage("rowkey() called with no current record"))
    }

    /// Compare `candidate` against the current key, ignoring the last
    /// `ignore_trailing_fields` comparator fields. Returns `Less` if
    /// the current key's leading fields are NULL under the
    /// comparator's own encoding, deferring the check (4.1).
    pub fn compare(&self, candidate: &[u8], ignore_trailing_fields: usize) -> Result<Ordering> {
        let current = self.rowkey()?;
        if self.comparator.has_null_leading_field(current, ignore_trailing_fields) {
            return Ok(Ordering::Less);
        }
        Ok(self.comparator.cmp(candidate, current, ignore_trailing_fields))
    }

    /// Return to ACCUMULATING, clearing runs and temp files but
    /// reusing this sorter's allocated buffers (4.1).
    pub fn reset(&mut self) -> Result<()> {
        for subtask in &mut self.subtasks {
            let _ = subtask.join_flush_worker();
            subtask.clear();
        }
        self.current_run = Run::new(self.storage, self.config.page_size());
        self.largest_key_bytes = 0;
        self.use_pma = false;
        self.root = None;
        self.in_memory = None;
        self.current_key = None;
        self.phase = Phase::Accumulating;
        Ok(())
    }
}

impl Drop for Sorter {
    fn drop(&mut self) {
        for subtask in &mut self.subtasks {
            let _ = subtask.join_flush_worker();
        }
        if let Some((soft, hard)) = self.restore_nofile {
            log::info!("restoring NOFILE rlimit to {}", soft);
            let _ = rlimit::setrlimit(Resource::NOFILE, soft, hard);
        }
    }
}
