//! An external merge-sort engine over opaque record blobs.
//!
//! Records are appended to an in-memory run; once the run outgrows a
//! configured memory budget it is sorted and streamed out to a temp
//! file as a packed memory array (PMA). On [`sort::Sorter::rewind`]
//! the engine builds an N-way tournament merge over however many PMAs
//! were spilled - and, for large inputs, a hierarchy of incremental
//! mergers so that peak disk use during the merge stays bounded - then
//! [`sort::Sorter::next`] walks the fully sorted sequence one record
//! at a time.
//!
//! The engine is intentionally ignorant of record *content*: it never
//! parses or splits a record, only moves the bytes the caller gives
//! it and compares them via a caller-supplied [`comparator::Comparator`].
//! This makes it equally suited to sorting composite index keys, raw
//! line bytes, or any other opaque blob a caller can hand it a total
//! order over.
//!
//! # Examples
//! ```
//! use std::sync::Arc;
//! use pma_sort::comparator::LexicographicComparator;
//! use pma_sort::config::Config;
//! use pma_sort::sort::Sorter;
//! use pma_sort::temp_file::DefaultTempFileFactory;
//!
//! fn sort_some_bytes() -> pma_sort::error::Result<()> {
//!     let mut sorter = Sorter::init(
//!         Arc::new(LexicographicComparator),
//!         Config::default(),
//!         Arc::new(DefaultTempFileFactory::system_tmp(0)),
//!     )?;
//!
//!     for record in [b"charlie".as_slice(), b"alpha", b"bravo"] {
//!         sorter.write(record)?;
//!     }
//!     sorter.rewind()?;
//!
//!     while sorter.next()? {
//!         println!("{}", String::from_utf8_lossy(sorter.rowkey()?));
//!     }
//!     Ok(())
//! }
//! ```

pub mod comparator;
pub mod config;
pub mod error;
pub mod sort;
pub mod temp_file;

pub(crate) mod incremental_merger;
pub(crate) mod merge_engine;
pub(crate) mod reader;
pub(crate) mod run;
pub(crate) mod source;
pub(crate) mod subtask;
pub(crate) mod varint;
pub(crate) mod writer;
