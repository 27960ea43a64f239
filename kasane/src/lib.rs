//! Multi-pattern keyword matching over a double-array Aho–Corasick
//! automaton.
//!
//! A [`Matcher`] is compiled once from `(key, value)` pairs and then
//! reports every occurrence of every key, overlaps included, in a single
//! linear pass over the input. Matching works on UTF-16 code units, so hit
//! offsets count code units and surrogate pairs match as unit sequences.
//! The compiled automaton is immutable and can be persisted to a byte
//! stream and loaded back.
//!
//! ```
//! use kasane::Matcher;
//!
//! let matcher = Matcher::build([("he", 1), ("hers", 2)], false).unwrap();
//! let hits = matcher.find_all("ushers");
//! assert_eq!(hits.len(), 2);
//! assert_eq!((hits[0].begin, hits[0].end, hits[0].value), (2, 4, Some(&1)));
//! assert_eq!((hits[1].begin, hits[1].end, hits[1].value), (2, 6, Some(&2)));
//! ```

mod pack;
mod serial;
mod trie;

use snafu::Snafu;
use tracing::{instrument, trace};

pub use kasane_wire::WireValue;

use crate::trie::Trie;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Error)))]
pub enum Error {
    #[snafu(display("double array cannot grow to {requested} slots"))]
    CapacityError { requested: usize },
    #[snafu(display("malformed stream: {detail}"))]
    CorruptError { detail: String },
    #[snafu(display("wire format error"))]
    WireError { source: kasane_wire::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One reported occurrence of a keyword.
///
/// `begin` is inclusive, `end` exclusive, both in UTF-16 code units from
/// the start of the scanned text (or slice). `value` is `None` when the
/// matcher was loaded without its value table.
#[derive(Debug, PartialEq, Eq)]
pub struct Hit<'a, V> {
    pub begin: usize,
    pub end: usize,
    pub index: usize,
    pub value: Option<&'a V>,
}

impl<V> Clone for Hit<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Hit<'_, V> {}

impl<V> Hit<'_, V> {
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.begin
    }
}

/// A compiled keyword dictionary: overlapping substring search in one
/// pass, perfect-hash exact lookup, and binary persistence.
///
/// Once built (or loaded) a matcher never changes, so sharing it across
/// threads needs no synchronisation.
pub struct Matcher<V> {
    pub(crate) base: Vec<i32>,
    pub(crate) check: Vec<i32>,
    pub(crate) fail: Vec<i32>,
    pub(crate) output: Vec<Option<Box<[i32]>>>,
    /// keyword lengths in code units, by keyword index
    pub(crate) key_lengths: Vec<i32>,
    pub(crate) values: Option<Vec<V>>,
    /// logical slot count; the arrays keep zeroed slack past it
    pub(crate) size: usize,
    pub(crate) ignore_case: bool,
}

impl<V> Matcher<V> {
    /// Compile a matcher from `(key, value)` pairs.
    ///
    /// Keyword indices follow iteration order. Duplicate keys are legal:
    /// every occurrence keeps its index and is reported by scans, while
    /// [`Matcher::exact_match`] resolves to the largest index. With
    /// `ignore_case`, keys are case-folded here and input is folded the
    /// same way at scan time.
    #[instrument(skip_all, level = "trace")]
    pub fn build<I, K>(entries: I, ignore_case: bool) -> Result<Matcher<V>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
    {
        let entries = entries.into_iter();
        let (reserve, _) = entries.size_hint();
        let mut key_lengths = Vec::with_capacity(reserve);
        let mut values = Vec::with_capacity(reserve);
        let mut trie = Trie::new();
        for (index, (key, value)) in entries.enumerate() {
            let units = key.as_ref().encode_utf16();
            let len = if ignore_case {
                trie.insert(units.map(fold_unit), index as i32)
            } else {
                trie.insert(units, index as i32)
            };
            key_lengths.push(len as i32);
            values.push(value);
        }
        trace!(
            "trie of {} nodes over {} keywords",
            trie.node_count(),
            key_lengths.len()
        );

        let packed = pack::pack(&trie, key_lengths.len())?;
        Ok(Matcher {
            base: packed.base,
            check: packed.check,
            fail: packed.fail,
            output: packed.output,
            key_lengths,
            values: Some(values),
            size: packed.size,
            ignore_case,
        })
    }

    /// Number of keywords in the dictionary.
    pub fn len(&self) -> usize {
        self.key_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_lengths.is_empty()
    }

    /// The folding policy this matcher was built with.
    pub fn ignore_case(&self) -> bool {
        self.ignore_case
    }

    /// Borrow the value table, when present.
    pub fn values(&self) -> Option<&[V]> {
        self.values.as_deref()
    }

    /// Scan `text` and hand every hit to `sink`, ordered by ascending end
    /// position; hits sharing an end position arrive largest keyword index
    /// first. Returning `false` from the sink stops the scan there.
    pub fn scan<'m, F>(&'m self, text: &str, sink: F)
    where
        F: FnMut(Hit<'m, V>) -> bool,
    {
        self.scan_folded(text.encode_utf16(), sink)
    }

    /// Scan a buffer of UTF-16 code units. Hit offsets are relative to the
    /// start of the slice, so scanning a subrange reports subrange-local
    /// positions.
    pub fn scan_units<'m, F>(&'m self, units: &[u16], sink: F)
    where
        F: FnMut(Hit<'m, V>) -> bool,
    {
        self.scan_folded(units.iter().copied(), sink)
    }

    fn scan_folded<'m, U, F>(&'m self, units: U, mut sink: F)
    where
        U: Iterator<Item = u16>,
        F: FnMut(Hit<'m, V>) -> bool,
    {
        if self.is_empty() {
            return;
        }
        let mut current = 0usize;
        for (at, unit) in units.enumerate() {
            let unit = if self.ignore_case {
                fold_unit(unit)
            } else {
                unit
            };
            current = self.next_state(current, unit);
            if let Some(out) = self.output[current].as_deref() {
                let end = at + 1;
                for &index in out {
                    let index = index as usize;
                    let hit = Hit {
                        begin: end.saturating_sub(self.key_lengths[index] as usize),
                        end,
                        index,
                        value: self.values.as_ref().map(|values| &values[index]),
                    };
                    if !sink(hit) {
                        return;
                    }
                }
            }
        }
    }

    /// Take the transition for `unit`, chasing failure links until one
    /// exists; the root absorbs every miss, so this always lands somewhere.
    fn next_state(&self, mut state: usize, unit: u16) -> usize {
        loop {
            match pack::transition_with_root(&self.base, &self.check, state, unit) {
                Some(next) => return next,
                None => state = self.fail[state] as usize,
            }
        }
    }

    /// Collect every hit eagerly, in scan order.
    pub fn find_all(&self, text: &str) -> Vec<Hit<'_, V>> {
        let mut hits = Vec::new();
        self.scan(text, |hit| {
            hits.push(hit);
            true
        });
        hits
    }

    /// The first hit in scan order, if any keyword occurs at all.
    pub fn find_first(&self, text: &str) -> Option<Hit<'_, V>> {
        let mut first = None;
        self.scan(text, |hit| {
            first = Some(hit);
            false
        });
        first
    }

    /// Does any keyword occur in `text`?
    pub fn is_match(&self, text: &str) -> bool {
        self.find_first(text).is_some()
    }

    /// Perfect-hash lookup: the index of the keyword exactly equal to
    /// `key`, or `None`. Case folding applies when the matcher ignores
    /// case; duplicate keys resolve to the largest index.
    pub fn exact_match(&self, key: &str) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let mut b = self.base[0];
        for unit in key.encode_utf16() {
            let unit = if self.ignore_case {
                fold_unit(unit)
            } else {
                unit
            };
            let p = b as usize + unit as usize + 1;
            if self.check.get(p) != Some(&b) {
                return None;
            }
            b = self.base[p];
        }
        // the terminal marker cell sits at the state's own base
        let p = b as usize;
        if self.check.get(p) != Some(&b) {
            return None;
        }
        match self.base.get(p) {
            Some(&n) if n < 0 => Some((-n - 1) as usize),
            _ => None,
        }
    }

    /// Value lookup by exact key. `None` when the key is absent or the
    /// matcher holds no value table.
    pub fn get(&self, key: &str) -> Option<&V> {
        let index = self.exact_match(key)?;
        self.values.as_deref()?.get(index)
    }
}

/// Case-fold one UTF-16 unit: ASCII uppercase by bit flip, the rest
/// through the invariant single-unit lowercase mapping. Units without a
/// one-to-one BMP lowering (surrogate halves included) pass through
/// unchanged.
fn fold_unit(unit: u16) -> u16 {
    if (0x41..=0x5a).contains(&unit) {
        unit | 0x20
    } else if unit < 0x80 {
        unit
    } else {
        match char::from_u32(u32::from(unit)) {
            Some(c) => {
                let mut lower = c.to_lowercase();
                match (lower.next(), lower.next()) {
                    (Some(low), None) if (low as u32) <= 0xffff => low as u16,
                    _ => unit,
                }
            }
            None => unit,
        }
    }
}
