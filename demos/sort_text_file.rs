use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Error;

use pma_sort::comparator::LexicographicComparator;
use pma_sort::config::Config;
use pma_sort::sort::Sorter;
use pma_sort::temp_file::DefaultTempFileFactory;

/// Sorts the lines of `input_path` and writes them, one per line, to
/// `output_path` - a minimal line-oriented caller built on top of the
/// opaque-record engine.
fn sort_lines(input_path: &Path, output_path: &Path, config: Config) -> Result<(), Error> {
    let mut sorter = Sorter::init(Arc::new(LexicographicComparator), config, Arc::new(DefaultTempFileFactory::system_tmp(0)))?;

    let reader = BufReader::new(fs::File::open(input_path)?);
    for line in reader.lines() {
        sorter.write(line?.as_bytes())?;
    }
    sorter.rewind()?;

    let mut writer = BufWriter::new(fs::File::create(output_path)?);
    while sorter.next()? {
        writer.write_all(sorter.rowkey()?)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

// cargo run -r --example sort_text_file
pub fn main() -> Result<(), Error> {
    let input_path = PathBuf::from("./tests/fixtures/sorted-1000.dat");
    let single_threaded_path = PathBuf::from("./target/single-threaded-1000.dat");
    let threaded_path = PathBuf::from("./target/threaded-1000.dat");

    sort_lines(&input_path, &single_threaded_path, Config::default())?;
    sort_lines(&input_path, &threaded_path, Config::default().with_worker_budget_all_cores())?;

    Ok(())
}
