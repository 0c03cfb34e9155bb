use std::cmp::Ordering;

/// The caller-supplied total order over record keys (6).
///
/// Implementations must be pure, deterministic, and safe to invoke
/// concurrently from multiple worker threads - the engine never holds
/// a lock across a call into this trait. The byte layout of a record
/// is entirely the comparator's business; the engine only ever moves
/// opaque `&[u8]` around.
pub trait Comparator: Send + Sync {
    /// Compare `a` against `b`, ignoring the last `ignore_trailing`
    /// comparator fields. Must be reflexive, antisymmetric and
    /// transitive on every key the engine hands it.
    fn cmp(&self, a: &[u8], b: &[u8], ignore_trailing: usize) -> Ordering;

    /// Used by `Sorter::compare` to defer a comparison when the
    /// leading (non-ignored) fields of `key` are NULL under the
    /// comparator's own encoding - e.g. to let UNIQUE-index
    /// enforcement defer its check. Composite-key NULL encoding is
    /// out of scope for the engine itself, so the default is "never
    /// defer".
    fn has_null_leading_field(&self, _key: &[u8], _ignore_trailing: usize) -> bool {
        false
    }
}

impl<F> Comparator for F
where
    F: Fn(&[u8], &[u8], usize) -> Ordering + Send + Sync,
{
    fn cmp(&self, a: &[u8], b: &[u8], ignore_trailing: usize) -> Ordering {
        self(a, b, ignore_trailing)
    }
}

/// Lexicographic comparator over the raw record bytes, ignoring
/// `ignore_trailing` as a flat byte-count suffix. Useful as a default
/// for byte-string keys and in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct LexicographicComparator;

impl Comparator for LexicographicComparator {
    fn cmp(&self, a: &[u8], b: &[u8], ignore_trailing: usize) -> Ordering {
        let a = a.get(..a.len().saturating_sub(ignore_trailing)).unwrap_or(a);
        let b = b.get(..b.len().saturating_sub(ignore_trailing)).unwrap_or(b);
        a.cmp(b)
    }
}
