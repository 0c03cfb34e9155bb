use std::sync::Arc;

use pma_sort::comparator::LexicographicComparator;
use pma_sort::config::Config;
use pma_sort::sort::Sorter;
use pma_sort::temp_file::DefaultTempFileFactory;
use rand::Rng;

#[allow(dead_code)]
pub fn setup() {
    let _ = simple_logger::SimpleLogger::new().env().init();
}

#[allow(dead_code)]
pub fn new_sorter(config: Config) -> Sorter {
    Sorter::init(Arc::new(LexicographicComparator), config, Arc::new(DefaultTempFileFactory::system_tmp(0))).unwrap()
}

#[allow(dead_code)]
pub fn random_records(count: usize, len: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| (0..len).map(|_| rng.gen::<u8>()).collect())
        .collect()
}

#[allow(dead_code)]
pub fn drain(sorter: &mut Sorter) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    while sorter.next()? {
        out.push(sorter.rowkey()?.to_vec());
    }
    Ok(out)
}

#[allow(dead_code)]
pub fn is_non_decreasing(records: &[Vec<u8>]) -> bool {
    records.windows(2).all(|w| w[0] <= w[1])
}
