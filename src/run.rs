use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::varint;

/// The two in-memory run storage strategies of (3), chosen at
/// `Sorter` construction and never mixed within one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunStorage {
    /// (P) each record is an independently owned allocation.
    Pointer,
    /// (B) all records live contiguously in one bulk buffer; cheap to
    /// bulk-move to a worker thread.
    Bulk,
}

/// A `spec.md` "singly linked sequence of records" realized as an
/// append-only sequence rather than a literal pointer-chased list -
/// see (9): Rust's ownership model makes raw `next` pointers an
/// unnecessary source of unsafety here, and a `Vec`-backed sequence
/// preserves the exact same observable ordering and merge semantics.
pub(crate) struct Run {
    storage: RunStorage,
    pointer_records: Vec<Vec<u8>>,
    bulk_buf: Vec<u8>,
    bulk_offsets: Vec<(usize, usize)>,
}

impl Run {
    pub(crate) fn new(storage: RunStorage, bulk_capacity_hint: usize) -> Run {
        Run {
            storage,
            pointer_records: Vec::new(),
            bulk_buf: Vec::with_capacity(match storage {
                RunStorage::Bulk => bulk_capacity_hint,
                RunStorage::Pointer => 0,
            }),
            bulk_offsets: Vec::new(),
        }
    }

    pub(crate) fn storage(&self) -> RunStorage {
        self.storage
    }

    pub(crate) fn len(&self) -> usize {
        match self.storage {
            RunStorage::Pointer => self.pointer_records.len(),
            RunStorage::Bulk => self.bulk_offsets.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn get(&self, i: usize) -> &[u8] {
        match self.storage {
            RunStorage::Pointer => &self.pointer_records[i],
            RunStorage::Bulk => {
                let (start, len) = self.bulk_offsets[i];
                &self.bulk_buf[start..start + len]
            }
        }
    }

    /// Append `record`. The caller (`Sorter::write`, 4.1) is
    /// responsible for checking `pma_payload_bytes()` against
    /// `max_pma_bytes` after the push and flushing if it has grown
    /// past the cap - a push itself only fails on a genuine
    /// allocation failure, never on crossing the threshold.
    pub(crate) fn push(&mut self, record: &[u8]) -> Result<()> {
        match self.storage {
            RunStorage::Pointer => {
                self.pointer_records.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
                self.pointer_records.push(record.to_vec());
            }
            RunStorage::Bulk => {
                let start = self.bulk_buf.len();
                self.bulk_buf.try_reserve(record.len()).map_err(|_| Error::OutOfMemory)?;
                self.bulk_buf.extend_from_slice(record);
                self.bulk_offsets.push((start, record.len()));
            }
        }
        Ok(())
    }

    /// Bytes this run would occupy once written out as a PMA:
    /// `sum(varint_len(len_i) + len_i)`, not counting the outer
    /// payload-size prefix.
    pub(crate) fn pma_payload_bytes(&self) -> u64 {
        (0..self.len())
            .map(|i| {
                let len = self.get(i).len() as u64;
                varint::encoded_len(len) as u64 + len
            })
            .sum()
    }

    /// Stable merge-sort over the run via the bounded bin array of
    /// (4.3), returning the order of record indices after sorting.
    ///
    /// Ties are broken in favor of the chronologically older operand
    /// at every merge step. Within the cascading-insert phase that
    /// operand is always the bin being folded in (it was placed there
    /// on a strictly earlier insertion); in the closing sweep across
    /// bins that operand is always the accumulator built from the
    /// higher (older) bin indices processed so far - see DESIGN.md for
    /// the derivation.
    pub(crate) fn sort_stable(&self, comparator: &dyn Comparator) -> Vec<usize> {
        const BINS: usize = 64;
        let mut bins: [Option<Vec<usize>>; BINS] = std::array::from_fn(|_| None);

        for i in 0..self.len() {
            let mut p = vec![i];
            let mut level = 0;
            while let Some(existing) = bins[level].take() {
                p = merge_indices(self, comparator, existing, p);
                level += 1;
            }
            bins[level] = Some(p);
        }

        let mut acc: Option<Vec<usize>> = None;
        for level in (0..BINS).rev() {
            if let Some(bin) = bins[level].take() {
                acc = Some(match acc {
                    None => bin,
                    Some(older) => merge_indices(self, comparator, older, bin),
                });
            }
        }
        acc.unwrap_or_default()
    }
}

/// Two-finger merge of `left` and `right` index sequences (each
/// already sorted among themselves), comparing via `run.get(idx)`.
/// Ties prefer `left`.
fn merge_indices(run: &Run, comparator: &dyn Comparator, left: Vec<usize>, right: Vec<usize>) -> Vec<usize> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut li = 0;
    let mut ri = 0;
    while li < left.len() && ri < right.len() {
        let ordering = comparator.cmp(run.get(left[li]), run.get(right[ri]), 0);
        if ordering == std::cmp::Ordering::Greater {
            out.push(right[ri]);
            ri += 1;
        } else {
            out.push(left[li]);
            li += 1;
        }
    }
    out.extend_from_slice(&left[li..]);
    out.extend_from_slice(&right[ri..]);
    out
}
