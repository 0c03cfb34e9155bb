/// Sort engine configuration.
///
/// Mirrors the way the teacher's own `Config` precomputes derived
/// values (`queue_size` from `tasks`) - here `min_pma_bytes` and
/// `max_pma_bytes` are precomputed from `page_size`/`cache_pages` once,
/// at construction, rather than recomputed on every `write()`.
#[derive(Clone, Debug)]
pub struct Config {
    page_size: usize,
    cache_pages: usize,
    worker_budget: usize,
    max_mmap_bytes: u64,
    fanout: usize,
    min_pma_bytes: u64,
    max_pma_bytes: u64,
}

/// Runs smaller than this are kept in memory even past `min_pma_bytes`
/// unless the heap-pressure oracle reports near-full, matching the
/// `MIN_WORKING * page_size` term of (4.1).
const MIN_WORKING_PAGES: usize = 4;

/// Default fanout for the tournament tree, `SORTER_MAX_MERGE_COUNT` in (6).
pub const SORTER_MAX_MERGE_COUNT: usize = 16;

impl Config {
    /// Build a `Config` from the enumerated options of (6).
    ///
    /// `max_pma_bytes` ends up at roughly 1 MiB with the defaults
    /// (`page_size = 4096`, `cache_pages` chosen accordingly), as
    /// required by the configuration table.
    pub fn new(
        page_size: usize,
        cache_pages: usize,
        worker_budget: usize,
        max_mmap_bytes: u64,
        fanout: usize,
    ) -> Config {
        let fanout = fanout.clamp(2, SORTER_MAX_MERGE_COUNT);
        let min_pma_bytes = (MIN_WORKING_PAGES * page_size) as u64;
        let max_pma_bytes = (cache_pages * page_size) as u64;
        Config {
            page_size,
            cache_pages,
            worker_budget,
            max_mmap_bytes,
            fanout,
            min_pma_bytes,
            max_pma_bytes,
        }
    }

    /// Sensible defaults: 4 KiB pages, ~1 MiB PMA cap, no workers, no
    /// mmap, fanout 16.
    pub fn default_for_page_size(page_size: usize) -> Config {
        let cache_pages = (1_048_576 / page_size).max(MIN_WORKING_PAGES * 2);
        Config::new(page_size, cache_pages, 0, 0, SORTER_MAX_MERGE_COUNT)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn cache_pages(&self) -> usize {
        self.cache_pages
    }

    pub fn worker_budget(&self) -> usize {
        self.worker_budget
    }

    pub fn max_mmap_bytes(&self) -> u64 {
        self.max_mmap_bytes
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn min_pma_bytes(&self) -> u64 {
        self.min_pma_bytes
    }

    pub fn max_pma_bytes(&self) -> u64 {
        self.max_pma_bytes
    }

    pub fn with_worker_budget(mut self, worker_budget: usize) -> Config {
        self.worker_budget = worker_budget;
        self
    }

    pub fn with_max_mmap_bytes(mut self, max_mmap_bytes: u64) -> Config {
        self.max_mmap_bytes = max_mmap_bytes;
        self
    }

    pub fn with_fanout(mut self, fanout: usize) -> Config {
        self.fanout = fanout.clamp(2, SORTER_MAX_MERGE_COUNT);
        self
    }

    /// Convenience mirroring the teacher's `tasks == 0` -> "use every
    /// available core" default: leaves one core for the consumer
    /// thread itself.
    pub fn with_worker_budget_all_cores(mut self) -> Config {
        self.worker_budget = num_cpus::get().saturating_sub(1).max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::default_for_page_size(4096)
    }
}
