//! Bitmap indexes over a single column.
//!
//! An [`Index`] partitions the valid rows of a column into bins and keeps one
//! compressed bitmap per bin:
//! * **relic**: one bin per distinct value, `keys[i]` is that value. Every lookup is exact,
//!   except that 64-bit integers beyond 2^53 can share a key and are then rechecked.
//! * **bin**: range partitioned, `keys[i]` is the exclusive upper edge of bin `i` (bin `i`
//!   starts at `keys[i-1]`). The bin edges are chosen so the bins hold roughly equal
//!   numbers of rows. Each bin also remembers the smallest and largest value it holds,
//!   so a range condition splits the bins into *certain* ones, entirely inside the
//!   range, and *candidates* that have to be checked against the column data.
//!
//! The bitmaps live in a word store ([`BitmapSource`]) as the concatenation of their
//! [`Bitvector::to_words`] forms; `offsets[i]..offsets[i+1]` delimits bitmap `i`, hence
//! `offsets.len() == keys.len() + 1`. Bitmaps are decoded on first use and then shared;
//! evaluating a query never modifies them.
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use itertools::Itertools;
use tracing::debug;

use crate::bitvector::Bitvector;
use crate::column::{with_numeric, ArrayRef, ColumnType, Numeric};
use crate::error::{Error, Result};
use crate::histogram::{divide_counts, next_down, next_up};
use crate::options::{IndexKind, IndexOptions};
use crate::qexpr::{beyond_exact_integers, ContinuousRange, DiscreteRange};

/// Where the serialized bitmaps of an index come from.
pub trait BitmapSource: Send + Sync {
    /// Number of words available.
    fn capacity(&self) -> usize;
    /// The words in `range`.
    fn read(&self, range: Range<usize>) -> Result<Vec<u32>>;
}

impl BitmapSource for Vec<u32> {
    fn capacity(&self) -> usize {
        self.len()
    }

    fn read(&self, range: Range<usize>) -> Result<Vec<u32>> {
        self.get(range.clone())
            .map(<[u32]>::to_vec)
            .ok_or_else(|| Error::Corrupt(format!("words {range:?} outside a store of {}", self.len())))
    }
}

/// A [`BitmapSource`] backed by a callback, for bitmaps kept outside this crate.
pub struct BitmapReader<F> {
    capacity: usize,
    read: F,
}

impl<F> BitmapReader<F>
where
    F: Fn(Range<usize>) -> Result<Vec<u32>> + Send + Sync,
{
    /// `read` is called with word ranges below `capacity`.
    pub fn new(capacity: usize, read: F) -> Self {
        BitmapReader { capacity, read }
    }
}

impl<F> BitmapSource for BitmapReader<F>
where
    F: Fn(Range<usize>) -> Result<Vec<u32>> + Send + Sync,
{
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn read(&self, range: Range<usize>) -> Result<Vec<u32>> {
        if range.end > self.capacity {
            return Err(Error::Corrupt(format!("words {range:?} beyond capacity {}", self.capacity)));
        }
        (self.read)(range)
    }
}

/// Result of [`Index::locate`]: bins `hit0..hit1` satisfy the condition entirely,
/// bins `cand0..hit0` and `hit1..cand1` might, all others don't.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    /// first candidate bin
    pub cand0: usize,
    /// first certain bin
    pub hit0: usize,
    /// one past the last certain bin
    pub hit1: usize,
    /// one past the last candidate bin
    pub cand1: usize,
}

impl Located {
    const NOTHING: Located = Located { cand0: 0, hit0: 0, hit1: 0, cand1: 0 };

    /// The candidate bins, below and above the certain ones.
    pub fn candidates(&self) -> impl Iterator<Item = usize> {
        (self.cand0..self.hit0).chain(self.hit1..self.cand1)
    }

    /// `true` if some bins need a check against the data.
    pub fn has_candidates(&self) -> bool {
        self.cand0 < self.hit0 || self.hit1 < self.cand1
    }
}

/// A relic or bin index, see the module documentation.
pub struct Index {
    kind: IndexKind,
    nrows: u32,
    keys: Vec<f64>,
    offsets: Vec<u32>,
    minval: Vec<f64>,
    maxval: Vec<f64>,
    source: Arc<dyn BitmapSource>,
    bitmaps: Vec<OnceLock<Bitvector>>,
    weights: OnceLock<Vec<u32>>,
    external: bool,
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("kind", &self.kind)
            .field("nrows", &self.nrows)
            .field("bins", &self.keys.len())
            .field("words", &self.source.capacity())
            .field("external", &self.external)
            .finish()
    }
}

/// valid, non-NaN values with their rows, sorted by value then row
fn sorted_pairs<T: Numeric>(values: &[T], valid: &Bitvector) -> Vec<(f64, u32)> {
    let mut pairs: Vec<(f64, u32)> = valid
        .ones()
        .take_while(|&p| (p as usize) < values.len())
        .filter_map(|p| {
            // + 0.0 folds -0.0 into 0.0
            let x = values[p as usize].to_f64() + 0.0;
            (!x.is_nan()).then_some((x, p))
        })
        .collect();
    pairs.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    pairs
}

impl Index {
    /// Builds an index over the rows of `values` marked in `valid`.
    /// NaNs are left out, like nulls.
    pub fn build(values: &ArrayRef, valid: &Bitvector, options: IndexOptions) -> Result<Index> {
        let nrows = u32::try_from(values.len())
            .map_err(|_| Error::InvalidInput(format!("{} rows are too many to index", values.len())))?;
        let pairs = with_numeric!(values, v => sorted_pairs(v, valid), _s => {
            return Err(Error::UnsupportedType { ctype: ColumnType::Text, op: "index build" });
        });

        // (value, rows holding it), rows ascending
        let mut distinct: Vec<(f64, Vec<u32>)> = Vec::new();
        for (value, group) in &pairs.iter().chunk_by(|p| p.0) {
            distinct.push((value, group.map(|p| p.1).collect()));
        }

        let mut keys = Vec::new();
        let mut minval = Vec::new();
        let mut maxval = Vec::new();
        let mut bitmaps = Vec::new();
        match options.kind {
            IndexKind::Relic => {
                for (value, rows) in distinct {
                    keys.push(value);
                    minval.push(value);
                    maxval.push(value);
                    bitmaps.push(Bitvector::from_positions(rows, nrows)?);
                }
            }
            IndexKind::Bin => {
                let weights: Vec<u64> = distinct.iter().map(|(_, rows)| rows.len() as u64).collect();
                let cuts = divide_counts(&weights, options.nbins.max(1) as usize);
                for (j, (&lo, &hi)) in cuts.iter().tuple_windows().enumerate() {
                    let group = &distinct[lo..hi];
                    let (Some(first), Some(last)) = (group.first(), group.last()) else { continue };
                    let mut rows: Vec<u32> = group.iter().flat_map(|(_, r)| r.iter().copied()).collect();
                    rows.sort_unstable();
                    keys.push(if j + 2 < cuts.len() { distinct[hi].0 } else { next_up(last.0) });
                    minval.push(first.0);
                    maxval.push(last.0);
                    bitmaps.push(Bitvector::from_positions(rows, nrows)?);
                }
            }
        }

        let mut words = Vec::new();
        let mut offsets = vec![0_u32];
        for b in &bitmaps {
            words.extend(b.to_words());
            let end = u32::try_from(words.len())
                .map_err(|_| Error::ResourceExhausted("index word store exceeds 2^32 words".to_string()))?;
            offsets.push(end);
        }
        debug!(kind = ?options.kind, nrows, bins = keys.len(), words = words.len(), "index built");

        Ok(Index {
            kind: options.kind,
            nrows,
            keys,
            offsets,
            minval,
            maxval,
            source: Arc::new(words),
            bitmaps: bitmaps.into_iter().map(OnceLock::from).collect(),
            weights: OnceLock::new(),
            external: false,
        })
    }

    /// An index from externally supplied parts; nothing is derived from column data.
    ///
    /// Fails with [`Error::ShapeMismatch`] unless `keys.len() + 1 == offsets.len()`,
    /// offsets are non-decreasing and the last offset lies within `source`.
    /// Keys must be strictly ascending.
    pub fn attach(
        kind: IndexKind,
        nrows: u32,
        keys: Vec<f64>,
        offsets: Vec<u32>,
        source: Arc<dyn BitmapSource>,
    ) -> Result<Index> {
        if keys.len() + 1 != offsets.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} keys need {} offsets, got {}",
                keys.len(),
                keys.len() + 1,
                offsets.len()
            )));
        }
        if offsets.iter().tuple_windows().any(|(a, b)| a > b) {
            return Err(Error::ShapeMismatch("offsets are not monotone".to_string()));
        }
        let last = offsets.last().copied().unwrap_or(0) as usize;
        if last > source.capacity() {
            return Err(Error::ShapeMismatch(format!(
                "offsets reach word {last}, the bitmap source holds {}",
                source.capacity()
            )));
        }
        if keys.iter().any(|k| k.is_nan()) || keys.iter().tuple_windows().any(|(a, b)| a >= b) {
            return Err(Error::InvalidInput("index keys must be strictly ascending".to_string()));
        }

        let (minval, maxval) = match kind {
            IndexKind::Relic => (keys.clone(), keys.clone()),
            IndexKind::Bin => {
                let lower = std::iter::once(f64::NEG_INFINITY).chain(keys.iter().copied());
                (lower.take(keys.len()).collect(), keys.iter().map(|&k| next_down(k)).collect())
            }
        };
        debug!(?kind, nrows, bins = keys.len(), "index attached");
        Ok(Index {
            kind,
            nrows,
            bitmaps: (0..keys.len()).map(|_| OnceLock::new()).collect(),
            keys,
            offsets,
            minval,
            maxval,
            source,
            weights: OnceLock::new(),
            external: true,
        })
    }

    /// Relic or bin.
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Number of rows covered.
    pub fn nrows(&self) -> u32 {
        self.nrows
    }

    /// Number of bins.
    pub fn num_bins(&self) -> usize {
        self.keys.len()
    }

    /// Distinct values (relic) or exclusive upper bin edges (bin).
    pub fn keys(&self) -> &[f64] {
        &self.keys
    }

    /// Word offsets of the bitmaps.
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// `true` if the index was attached rather than built.
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Approximate memory footprint in bytes.
    pub fn byte_size(&self) -> usize {
        self.keys.len() * 8 * 3 + self.offsets.len() * 4 + self.source.capacity() * 4
    }

    pub(crate) fn source(&self) -> &dyn BitmapSource {
        self.source.as_ref()
    }

    /// Bitmap of bin `i`, decoded on first use.
    pub fn bitmap(&self, i: usize) -> Result<&Bitvector> {
        let cell = self
            .bitmaps
            .get(i)
            .ok_or_else(|| Error::NotFound(format!("bin {i} of an index with {} bins", self.keys.len())))?;
        if let Some(b) = cell.get() {
            return Ok(b);
        }
        let words = self.source.read(self.offsets[i] as usize..self.offsets[i + 1] as usize)?;
        let b = Bitvector::from_words(&words)?;
        if b.size() != self.nrows {
            return Err(Error::Corrupt(format!(
                "bitmap {i} has {} bits for an index over {} rows",
                b.size(),
                self.nrows
            )));
        }
        Ok(cell.get_or_init(|| b))
    }

    /// Splits the bins into excluded, candidate and certain ones for `range`.
    ///
    /// Keys are `f64`, so a bin of a 64-bit integer column may mix integers that round
    /// to the same key. Beyond 2^53 a bound only decides bins that lie clear of it.
    pub fn locate(&self, range: &ContinuousRange) -> Located {
        if !range.has_coarse_end() {
            return self.locate_exact(range);
        }
        let outer = self.locate_exact(&range.with_coarse_ends(true));
        let inner = self.locate_exact(&range.with_coarse_ends(false));
        if inner.hit0 >= inner.hit1 {
            return Located { hit0: outer.cand0, hit1: outer.cand0, ..outer };
        }
        Located { hit0: inner.hit0, hit1: inner.hit1, ..outer }
    }

    fn locate_exact(&self, range: &ContinuousRange) -> Located {
        if range.is_empty() || self.keys.is_empty() {
            return Located::NOTHING;
        }
        let cand0 = self.maxval.partition_point(|&x| !range.above_lower(x));
        let hit0 = self.minval.partition_point(|&x| !range.above_lower(x));
        let hit1 = self.maxval.partition_point(|&x| range.below_upper(x));
        let cand1 = self.minval.partition_point(|&x| range.below_upper(x));
        if hit0 >= hit1 {
            // no bin lies entirely inside, e.g. the range falls within a single bin
            let hit = hit0.min(cand1).max(cand0);
            return Located { cand0, hit0: hit, hit1: hit, cand1: cand1.max(hit) };
        }
        Located { cand0, hit0, hit1, cand1 }
    }

    /// Bins that may hold one of the values of `set`: `(exact, candidates)`.
    pub fn discrete_bins(&self, set: &DiscreteRange) -> (Vec<usize>, Vec<usize>) {
        let mut exact = Vec::new();
        let mut candidates = Vec::new();
        for &v in &set.values {
            let i = self.maxval.partition_point(|&x| x < v);
            if i < self.keys.len() && self.minval[i] <= v {
                if self.minval[i] == self.maxval[i] && !beyond_exact_integers(v) {
                    exact.push(i);
                } else {
                    candidates.push(i);
                }
            }
        }
        exact.dedup();
        candidates.dedup();
        (exact, candidates)
    }

    /// OR of the bitmaps of bins `i0..i1`, sized to the indexed rows.
    pub fn sum_bins(&self, i0: usize, i1: usize) -> Result<Bitvector> {
        let mut out = Bitvector::filled(false, self.nrows);
        for i in i0.min(self.keys.len())..i1.min(self.keys.len()) {
            out |= self.bitmap(i)?;
        }
        Ok(out)
    }

    /// OR of an arbitrary set of bins.
    fn union_of(&self, bins: &[usize]) -> Result<Bitvector> {
        let mut out = Bitvector::filled(false, self.nrows);
        for &i in bins {
            out |= self.bitmap(i)?;
        }
        Ok(out)
    }

    /// Rows of `mask` satisfying `range`. Certain bins are taken as they are, candidate
    /// bins are checked row by row against `values`.
    pub fn evaluate(&self, range: &ContinuousRange, values: &ArrayRef, mask: &Bitvector) -> Result<Bitvector> {
        let loc = self.locate(range);
        let mut hits = self.sum_bins(loc.hit0, loc.hit1)?;
        hits &= mask;
        for i in loc.candidates() {
            let rows = self.bitmap(i)? & mask;
            if rows.count() == 0 {
                continue;
            }
            hits |= &values.scan_range(&rows, range)?;
        }
        hits.adjust_size(false, mask.size());
        debug!(column = %range.column, ?loc, hits = hits.count(), "range resolved with index");
        Ok(hits)
    }

    /// Rows of `mask` whose value is in `set`.
    pub fn evaluate_discrete(&self, set: &DiscreteRange, values: &ArrayRef, mask: &Bitvector) -> Result<Bitvector> {
        let (exact, candidates) = self.discrete_bins(set);
        let mut hits = self.union_of(&exact)?;
        hits &= mask;
        for i in candidates {
            let rows = self.bitmap(i)? & mask;
            if rows.count() > 0 {
                hits |= &values.scan_set(&rows, set)?;
            }
        }
        hits.adjust_size(false, mask.size());
        Ok(hits)
    }

    /// Edges of the bins, `num_bins() + 1` strictly ascending values. For a relic index
    /// the last edge is just above the largest value; an attached bin index starts
    /// at `-inf` since its lowest value is unknown.
    pub fn bin_boundaries(&self) -> Vec<f64> {
        match self.kind {
            IndexKind::Relic => {
                let mut b = self.keys.clone();
                if let Some(&last) = self.keys.last() {
                    b.push(next_up(last));
                }
                b
            }
            IndexKind::Bin => match self.minval.first() {
                Some(&first) => std::iter::once(first).chain(self.keys.iter().copied()).collect(),
                None => Vec::new(),
            },
        }
    }

    /// Number of rows in each bin.
    pub fn bin_weights(&self) -> Result<&[u32]> {
        if let Some(w) = self.weights.get() {
            return Ok(w);
        }
        let w = (0..self.keys.len())
            .map(|i| self.bitmap(i).map(Bitvector::count))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.weights.get_or_init(|| w))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::qexpr::CompareOp;
    use pretty_assertions::assert_eq;
    use rand::distributions::{Distribution, Uniform};
    use std::ops::Bound;

    fn scenario() -> ArrayRef {
        ArrayRef::from(vec![5_i32, 1, 1, 5, 9, 1, 5, 9, 9, 9])
    }

    fn all(n: u32) -> Bitvector {
        Bitvector::filled(true, n)
    }

    fn scan(values: &ArrayRef, range: &ContinuousRange, mask: &Bitvector) -> Bitvector {
        values.scan(mask, |x| range.contains(x)).unwrap()
    }

    mod relic {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_structure() {
            let ix = Index::build(&scenario(), &all(10), IndexOptions::relic()).unwrap();
            assert_eq!(ix.keys(), &[1.0, 5.0, 9.0]);
            assert_eq!(ix.offsets().len(), ix.keys().len() + 1);
            assert_eq!(ix.bin_weights().unwrap(), &[3, 3, 4]);
            assert_eq!(ix.bitmap(1).unwrap().ones().collect::<Vec<_>>(), vec![0, 3, 6]);
            assert_eq!(ix.bin_boundaries(), vec![1.0, 5.0, 9.0, next_up(9.0)]);
        }

        #[test]
        fn test_never_has_candidates() {
            let ix = Index::build(&scenario(), &all(10), IndexOptions::relic()).unwrap();
            for op in [CompareOp::Lt, CompareOp::Le, CompareOp::Gt, CompareOp::Ge, CompareOp::Eq] {
                for v in [0.0, 1.0, 3.0, 5.0, 7.5, 9.0, 10.0] {
                    let r = ContinuousRange::compare("a", op, v).unwrap();
                    let loc = ix.locate(&r);
                    assert_eq!(loc.cand0, loc.hit0, "{op:?} {v}");
                    assert_eq!(loc.hit1, loc.cand1, "{op:?} {v}");
                }
            }
        }

        #[test]
        fn test_eq_five() {
            let data = scenario();
            let ix = Index::build(&data, &all(10), IndexOptions::relic()).unwrap();
            let r = ContinuousRange::compare("a", CompareOp::Eq, 5.0).unwrap();
            let hits = ix.evaluate(&r, &data, &all(10)).unwrap();
            assert_eq!(hits.count(), 3);
            assert_eq!(hits.ones().collect::<Vec<_>>(), vec![0, 3, 6]);
        }

        #[test]
        fn test_long_keys_beyond_2_53() {
            let big = 1_i64 << 53;
            let data = ArrayRef::from(vec![big, big + 1, 5, big + 4]);
            let ix = Index::build(&data, &all(4), IndexOptions::relic()).unwrap();
            // the first two rows share a key
            assert_eq!(ix.keys(), &[5.0, big as f64, (big + 4) as f64]);

            let eq = ContinuousRange::compare("a", CompareOp::Eq, big as f64).unwrap();
            assert!(ix.locate(&eq).has_candidates());
            assert_eq!(ix.evaluate(&eq, &data, &all(4)).unwrap().ones().collect::<Vec<_>>(), vec![0]);
            for op in [CompareOp::Lt, CompareOp::Le, CompareOp::Gt, CompareOp::Ge] {
                let r = ContinuousRange::compare("a", op, big as f64).unwrap();
                let expected = data.scan_range(&all(4), &r).unwrap();
                assert_eq!(ix.evaluate(&r, &data, &all(4)).unwrap(), expected, "{op:?}");
            }
            let set = DiscreteRange::new("a", [big as f64]);
            assert_eq!(ix.evaluate_discrete(&set, &data, &all(4)).unwrap().ones().collect::<Vec<_>>(), vec![0]);
        }

        #[test]
        fn test_nulls_not_indexed() {
            let valid = Bitvector::from_positions([0, 1, 2], 10).unwrap();
            let ix = Index::build(&scenario(), &valid, IndexOptions::relic()).unwrap();
            assert_eq!(ix.keys(), &[1.0, 5.0]);
            assert_eq!(ix.bin_weights().unwrap(), &[2, 1]);
        }
    }

    mod binned {
        use super::*;
        use pretty_assertions::assert_eq;

        fn random_data(n: usize) -> ArrayRef {
            let mut rng = rand::thread_rng();
            let d = Uniform::new(0_i32, 500);
            ArrayRef::from((0..n).map(|_| d.sample(&mut rng)).collect::<Vec<_>>())
        }

        #[test]
        fn test_structure() {
            let data = random_data(5000);
            let ix = Index::build(&data, &all(5000), IndexOptions::bin(10)).unwrap();
            assert!(ix.num_bins() <= 10);
            assert_eq!(ix.offsets().len(), ix.num_bins() + 1);
            assert!(ix.keys().iter().tuple_windows().all(|(a, b)| a < b));
            let total: u32 = ix.bin_weights().unwrap().iter().sum();
            assert_eq!(total, 5000);
            let b = ix.bin_boundaries();
            assert_eq!(b.len(), ix.num_bins() + 1);
            assert!(b.iter().tuple_windows().all(|(a, b)| a < b));
        }

        #[test]
        fn test_candidates_match_scan() {
            let data = random_data(5000);
            let ix = Index::build(&data, &all(5000), IndexOptions::bin(8)).unwrap();
            let mut seen_candidates = false;
            for (lo, hi) in [(10.5, 130.0), (0.0, 499.0), (250.0, 251.0), (-5.0, 3.0), (400.0, 1000.0)] {
                let r = ContinuousRange::new("a", Bound::Excluded(lo), Bound::Included(hi));
                seen_candidates |= ix.locate(&r).has_candidates();
                let mask = all(5000);
                assert_eq!(ix.evaluate(&r, &data, &mask).unwrap(), scan(&data, &r, &mask), "{lo}..{hi}");
            }
            assert!(seen_candidates);
        }

        #[test]
        fn test_masked_evaluation() {
            let data = random_data(1000);
            let ix = Index::build(&data, &all(1000), IndexOptions::bin(5)).unwrap();
            let mask: Bitvector = (0..1000).map(|i| i % 3 == 0).collect();
            let r = ContinuousRange::compare("a", CompareOp::Ge, 123.0).unwrap();
            assert_eq!(ix.evaluate(&r, &data, &mask).unwrap(), scan(&data, &r, &mask));
        }

        #[test]
        fn test_discrete() {
            let data = random_data(2000);
            let ix = Index::build(&data, &all(2000), IndexOptions::bin(7)).unwrap();
            let set = DiscreteRange::new("a", [3.0, 77.0, 250.0, 600.0]);
            let expected = data.scan(&all(2000), |x| set.contains(x)).unwrap();
            assert_eq!(ix.evaluate_discrete(&set, &data, &all(2000)).unwrap(), expected);
        }

        #[test]
        fn test_empty_range() {
            let data = random_data(100);
            let ix = Index::build(&data, &all(100), IndexOptions::bin(4)).unwrap();
            let r = ContinuousRange::new("a", Bound::Included(5.0), Bound::Excluded(5.0));
            assert_eq!(ix.locate(&r), Located::NOTHING);
            assert_eq!(ix.evaluate(&r, &data, &all(100)).unwrap().count(), 0);
        }
    }

    mod attach {
        use super::*;
        use pretty_assertions::assert_eq;

        fn parts() -> (Vec<f64>, Vec<u32>, Vec<u32>) {
            let ix = Index::build(&scenario(), &all(10), IndexOptions::relic()).unwrap();
            let words = ix.source().read(0..ix.source().capacity()).unwrap();
            (ix.keys().to_vec(), ix.offsets().to_vec(), words)
        }

        #[test]
        fn test_attach_and_query() {
            let (keys, offsets, words) = parts();
            let ix = Index::attach(IndexKind::Relic, 10, keys, offsets, Arc::new(words)).unwrap();
            assert!(ix.is_external());
            let r = ContinuousRange::compare("a", CompareOp::Le, 5.0).unwrap();
            assert_eq!(ix.sum_bins(0, 2).unwrap().count(), 6);
            assert_eq!(ix.evaluate(&r, &scenario(), &all(10)).unwrap().count(), 6);
        }

        #[test]
        fn test_attach_through_reader() {
            let (keys, offsets, words) = parts();
            let n = words.len();
            let reader = BitmapReader::new(n, move |r: Range<usize>| Ok(words[r].to_vec()));
            let ix = Index::attach(IndexKind::Relic, 10, keys, offsets, Arc::new(reader)).unwrap();
            assert_eq!(ix.bin_weights().unwrap(), &[3, 3, 4]);
        }

        #[test]
        fn test_attach_as_bin_needs_checks() {
            let (keys, offsets, words) = parts();
            let ix = Index::attach(IndexKind::Bin, 10, keys, offsets, Arc::new(words)).unwrap();
            let r = ContinuousRange::compare("a", CompareOp::Ge, 2.0).unwrap();
            assert!(ix.locate(&r).has_candidates());
            let data = scenario();
            assert_eq!(ix.evaluate(&r, &data, &all(10)).unwrap(), scan(&data, &r, &all(10)));
        }

        #[test]
        fn test_shape_errors() {
            let (keys, offsets, words) = parts();
            let short = offsets[..offsets.len() - 1].to_vec();
            let e = Index::attach(IndexKind::Relic, 10, keys.clone(), short, Arc::new(words.clone()));
            assert!(matches!(e, Err(Error::ShapeMismatch(_))));

            let mut too_far = offsets.clone();
            *too_far.last_mut().unwrap() += 1;
            let e = Index::attach(IndexKind::Relic, 10, keys.clone(), too_far, Arc::new(words.clone()));
            assert!(matches!(e, Err(Error::ShapeMismatch(_))));

            let unsorted = vec![5.0, 1.0, 9.0];
            let e = Index::attach(IndexKind::Relic, 10, unsorted, offsets, Arc::new(words));
            assert!(matches!(e, Err(Error::InvalidInput(_))));
        }

        #[test]
        fn test_wrong_row_count_is_corrupt() {
            let (keys, offsets, words) = parts();
            let ix = Index::attach(IndexKind::Relic, 11, keys, offsets, Arc::new(words)).unwrap();
            assert!(matches!(ix.bitmap(0), Err(Error::Corrupt(_))));
        }
    }
}
