//! Histograms over one or more columns.
//!
//! Three ways of choosing bins:
//! * **adaptive** ([`adaptive_bins`]): bin edges follow the data so that every bin holds
//!   about the same number of rows. The rows are first counted into a fine uniform
//!   grid, then for every dimension the fine bins are merged greedily into the
//!   requested number of coarse bins ([`divide_counts`]), and the fine grid is summed
//!   into the coarse cells.
//! * **uniform** ([`uniform_bins`], [`distribution_nd`]): a fixed stride, either derived
//!   from the data range and rounded to 1, 2 or 5 times a power of ten, or given by
//!   the caller.
//! * **index** ([`index_bins`]): the bins of an existing index, merged like the fine
//!   bins above. [`histogram`] with [`BinningStrategy::Auto`] picks this one when
//!   reading the index is cheaper than reading the column.
//!
//! A row is in bin `i` if `bounds[i] <= x < bounds[i+1]`. The last edge lies just
//! above the largest value: `max + 1` for integer columns, the next representable
//! double for floating point ones. Cells are stored in raster order, the last
//! dimension varying fastest. Only rows that are set in the mask and valid in every
//! column take part; NaNs count as missing.
//!
//! # Example
//! ```rust
//! use binquery::bitvector::Bitvector;
//! use binquery::column::{ArrayRef, Column};
//! use binquery::histogram::adaptive_bins;
//! use binquery::options::BinningOptions;
//!
//! let c = Column::new("x", ArrayRef::from((1..=100).collect::<Vec<i32>>())).unwrap();
//! let h = adaptive_bins(&[&c], &[10], &Bitvector::filled(true, 100), &BinningOptions::default()).unwrap();
//! assert_eq!(h.counts, vec![10; 10]);
//! assert_eq!(h.bounds[0][0], 1.0);
//! assert_eq!(h.bounds[0][10], 101.0);
//! ```
use tracing::debug;

use crate::bitvector::Bitvector;
use crate::column::{with_numeric, ArrayRef, Column, ColumnType, Numeric};
use crate::error::{Error, Result};
use crate::options::{BinningOptions, BinningStrategy, IndexKind};

/// Bins and their contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// per dimension the bin edges, strictly ascending
    pub bounds: Vec<Vec<f64>>,
    /// rows per cell
    pub counts: Vec<u32>,
    /// rows per cell as bitmaps; `None` for empty cells
    pub bitmaps: Option<Vec<Option<Bitvector>>>,
    /// per cell sum of the weight column
    pub weights: Option<Vec<f64>>,
}

impl Histogram {
    fn empty(ndims: usize) -> Histogram {
        Histogram { bounds: vec![Vec::new(); ndims], counts: Vec::new(), bitmaps: None, weights: None }
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.bounds.len()
    }

    /// Bins per dimension.
    pub fn nbins(&self) -> Vec<usize> {
        self.bounds.iter().map(|b| b.len().saturating_sub(1)).collect()
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// Count of the cell at `coords`.
    pub fn count_at(&self, coords: &[usize]) -> Option<u32> {
        let shape = self.nbins();
        if coords.len() != shape.len() || coords.iter().zip(&shape).any(|(c, n)| c >= n) {
            return None;
        }
        self.counts.get(raster(&shape, coords.iter().copied())).copied()
    }
}

/// Fixed bins `begin, begin + stride, ...` covering `[begin, end]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedBins {
    /// lower edge of the first bin
    pub begin: f64,
    /// values above this are not counted; a value equal to it lands in the last bin
    pub end: f64,
    /// bin width
    pub stride: f64,
}

impl FixedBins {
    /// `begin..=end` in steps of `stride`.
    pub fn new(begin: f64, end: f64, stride: f64) -> Self {
        FixedBins { begin, end, stride }
    }

    /// `max(1, ceil((end - begin) / stride))`, refused beyond [`MAX_FIXED_BINS`].
    pub fn num_bins(&self) -> Result<usize> {
        let (b, e, s) = (self.begin, self.end, self.stride);
        if !(b.is_finite() && e.is_finite() && b <= e && s > 0.0 && s.is_finite()) {
            return Err(Error::InvalidInput(format!("bad fixed bins {self:?}")));
        }
        let n = ((e - b) / s).ceil().max(1.0);
        if n > MAX_FIXED_BINS as f64 {
            return Err(Error::ResourceExhausted(format!("{self:?} asks for {n:e} bins")));
        }
        Ok(n as usize)
    }

    /// The `num_bins() + 1` edges. A single point `begin == end` is the one bin
    /// `[begin, next_up(begin))`.
    pub fn edges(&self) -> Result<Vec<f64>> {
        if self.begin == self.end {
            self.num_bins()?;
            return Ok(vec![self.begin, next_up(self.begin)]);
        }
        let n = self.num_bins()?;
        let mut edges = Vec::new();
        edges
            .try_reserve_exact(n + 1)
            .map_err(|e| Error::ResourceExhausted(format!("{n} fixed bins: {e}")))?;
        edges.extend((0..=n).map(|k| self.begin + k as f64 * self.stride));
        if edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidInput(format!(
                "stride {} does not separate the edges near {}",
                self.stride, self.begin
            )));
        }
        Ok(edges)
    }
}

/// Upper limit on the bins of one [`FixedBins`] dimension.
pub const MAX_FIXED_BINS: u32 = 1 << 28;

/// The smallest double greater than `x`.
pub fn next_up(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f64::from_bits(1);
    }
    let bits = x.to_bits();
    if x > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

/// The largest double smaller than `x`.
pub fn next_down(x: f64) -> f64 {
    -next_up(-x)
}

/// Rounds a raw bin width up to 1, 2 or 5 times a power of ten.
pub fn nice_stride(raw: f64) -> f64 {
    if raw.is_nan() || raw <= 0.0 || raw.is_infinite() {
        return 1.0;
    }
    let p = 10_f64.powf(raw.log10().floor());
    let m = raw / p;
    let f = if m <= 1.0 {
        1.0
    } else if m <= 2.0 {
        2.0
    } else if m <= 5.0 {
        5.0
    } else {
        10.0
    };
    f * p
}

/// Groups consecutive `weights` into at most `nbins` groups of similar total weight.
///
/// Returns the cut points: `cuts[0] == 0`, `cuts.last() == weights.len()`, strictly
/// increasing; group `j` is `cuts[j]..cuts[j+1]`. With at least `nbins` weights the
/// result has exactly `nbins` groups. Each group grows until it reaches the even
/// share of the remaining weight, or until taking the next element would overshoot
/// that share by more than stopping short of it.
pub fn divide_counts(weights: &[u64], nbins: usize) -> Vec<usize> {
    let n = weights.len();
    let mut cuts = vec![0];
    if n == 0 {
        return cuts;
    }
    let nbins = nbins.max(1);
    if nbins >= n {
        cuts.extend(1..=n);
        return cuts;
    }
    let mut remaining: u64 = weights.iter().sum();
    let mut start = 0;
    for b in 0..nbins {
        let bins_left = nbins - b;
        if bins_left == 1 {
            cuts.push(n);
            break;
        }
        let target = remaining as f64 / bins_left as f64;
        // leave at least one element for each of the other groups
        let limit = n - (bins_left - 1);
        let mut acc = 0_u64;
        let mut end = start;
        while end < limit {
            let w = weights[end];
            if end > start && (acc + w) as f64 - target > target - acc as f64 {
                break;
            }
            acc += w;
            end += 1;
            if acc as f64 >= target {
                break;
            }
        }
        cuts.push(end);
        remaining -= acc;
        start = end;
    }
    cuts
}

#[inline]
fn raster(shape: &[usize], coords: impl Iterator<Item = usize>) -> usize {
    shape.iter().zip(coords).fold(0, |acc, (&n, c)| acc * n + c)
}

fn zeroed<T: Clone + Default>(shape: &[usize]) -> Result<Vec<T>> {
    let n = shape
        .iter()
        .try_fold(1_usize, |acc, &s| acc.checked_mul(s))
        .ok_or_else(|| Error::ResourceExhausted(format!("grid {shape:?} is too large")))?;
    let mut v = Vec::new();
    v.try_reserve_exact(n)
        .map_err(|e| Error::ResourceExhausted(format!("grid {shape:?}: {e}")))?;
    v.resize(n, T::default());
    Ok(v)
}

fn upper_edge(max: f64, integer: bool) -> f64 {
    let up = max + 1.0;
    if integer && up > max {
        up
    } else {
        next_up(max)
    }
}

/// Bin edges along one dimension.
#[derive(Debug, Clone)]
struct Axis {
    lo: f64,
    stride: f64,
    edges: Vec<f64>,
}

impl Axis {
    fn new(lo: f64, stride: f64, mut edges: Vec<f64>) -> Axis {
        edges.dedup();
        Axis { lo, stride, edges }
    }

    fn single(v: f64, integer: bool) -> Axis {
        Axis { lo: v, stride: 0.0, edges: vec![v, upper_edge(v, integer)] }
    }

    /// the fine grid of the adaptive binning
    fn fine(min: f64, max: f64, integer: bool, nfine: usize, exact_limit: usize) -> Axis {
        if min == max {
            return Axis::single(min, integer);
        }
        let top = upper_edge(max, integer);
        if integer {
            let span = max - min + 1.0;
            // one fine bin per integer value when affordable
            let stride = if span <= exact_limit as f64 { 1.0 } else { (span / nfine as f64).ceil() };
            let n = (span / stride).ceil() as usize;
            let edges = (0..n).map(|k| min + k as f64 * stride).chain(std::iter::once(top)).collect();
            Axis::new(min, stride, edges)
        } else {
            let stride = (max - min) / nfine as f64;
            let edges = (0..nfine).map(|k| min + k as f64 * stride).chain(std::iter::once(top)).collect();
            Axis::new(min, stride, edges)
        }
    }

    /// nice stride from the data range
    fn uniform(min: f64, max: f64, integer: bool, nbins: usize) -> Axis {
        if min == max {
            return Axis::single(min, integer);
        }
        let mut stride = nice_stride((max - min) / nbins as f64);
        if integer {
            stride = stride.max(1.0);
        }
        let begin = (min / stride).floor() * stride;
        let n = ((max - begin) / stride).floor() as usize + 1;
        let mut edges: Vec<f64> = (0..=n).map(|k| begin + k as f64 * stride).collect();
        if edges[n] <= max {
            edges.push(begin + (n + 1) as f64 * stride);
        }
        Axis::new(begin, stride, edges)
    }

    fn fixed(bins: &FixedBins) -> Result<Axis> {
        let edges = bins.edges()?;
        let stride = if bins.begin == bins.end { edges[1] - edges[0] } else { bins.stride };
        Ok(Axis { lo: bins.begin, stride, edges })
    }

    fn len(&self) -> usize {
        self.edges.len() - 1
    }

    /// Bin of `x`, for `edges[0] <= x`. The arithmetic guess is corrected so that
    /// the answer agrees with the edges; values beyond the last edge go to the last bin.
    #[inline]
    fn locate(&self, x: f64) -> usize {
        let n = self.len();
        let guess = if self.stride > 0.0 { ((x - self.lo) / self.stride) as usize } else { 0 };
        let mut j = guess.min(n - 1);
        while j > 0 && x < self.edges[j] {
            j -= 1;
        }
        while j + 1 < n && x >= self.edges[j + 1] {
            j += 1;
        }
        j
    }
}

/// The rows taking part in a histogram and their values.
struct Sample {
    /// size of the row space, for the bitmaps
    nrows: u32,
    rows: Vec<u32>,
    dims: Vec<Vec<f64>>,
    integer: Vec<bool>,
    weights: Option<Vec<f64>>,
}

fn values_at<T: Numeric>(values: &[T], rows: &[u32]) -> Vec<f64> {
    rows.iter().map(|&r| values[r as usize].to_f64()).collect()
}

impl Sample {
    fn gather(columns: &[&Column], weight: Option<&Column>, mask: &Bitvector) -> Result<Sample> {
        if columns.is_empty() {
            return Err(Error::InvalidInput("a histogram needs at least one column".to_string()));
        }
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len() + 1);
        let mut valid = mask.clone();
        for col in columns.iter().copied().chain(weight) {
            let array = col.values()?;
            if array.column_type() == ColumnType::Text {
                return Err(Error::UnsupportedType { ctype: ColumnType::Text, op: "binning" });
            }
            valid &= &*col.null_mask();
            arrays.push(array);
        }
        let len = arrays.iter().map(ArrayRef::len).min().unwrap_or(0);
        let mut rows: Vec<u32> = valid.ones().take_while(|&r| (r as usize) < len).collect();
        let mut dims = arrays
            .iter()
            .map(|a| {
                with_numeric!(a, v => Ok(values_at(v, &rows)), _s => {
                    Err(Error::UnsupportedType { ctype: ColumnType::Text, op: "binning" })
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if dims.iter().any(|d| d.iter().any(|x| x.is_nan())) {
            let keep: Vec<bool> = (0..rows.len()).map(|i| dims.iter().all(|d| !d[i].is_nan())).collect();
            let mut k = keep.iter();
            rows.retain(|_| k.next().copied().unwrap_or(false));
            for d in dims.iter_mut() {
                let mut k = keep.iter();
                d.retain(|_| k.next().copied().unwrap_or(false));
            }
        }
        let weights = if weight.is_some() { dims.pop() } else { None };
        Ok(Sample {
            nrows: len as u32,
            rows,
            dims,
            integer: columns.iter().map(|c| c.column_type().is_integer()).collect(),
            weights,
        })
    }

    fn min_max(&self, d: usize) -> (f64, f64) {
        self.dims[d]
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fill {
    Counts,
    Bitmaps,
    Weights,
}

fn check_nbins(columns: &[&Column], nbins: &[u32]) -> Result<()> {
    if nbins.len() != columns.len() {
        return Err(Error::ShapeMismatch(format!(
            "{} bin counts for {} columns",
            nbins.len(),
            columns.len()
        )));
    }
    if nbins.contains(&0) {
        return Err(Error::InvalidInput("zero bins requested".to_string()));
    }
    Ok(())
}

fn adaptive(sample: &Sample, nbins: &[u32], options: &BinningOptions, fill: Fill) -> Result<Histogram> {
    let ndims = sample.dims.len();
    let nsel = sample.rows.len();
    if nsel == 0 {
        return Ok(Histogram::empty(ndims));
    }

    // fine grid size per dimension
    let rows = nsel as f64;
    let product: f64 = nbins.iter().map(|&n| f64::from(n)).product();
    let ratio = (rows / product).cbrt();
    let ceiling = f64::from(options.fine_ceiling).max(rows.cbrt().round()) as usize;
    let axes: Vec<Axis> = (0..ndims)
        .map(|d| {
            let (min, max) = sample.min_max(d);
            let nb = nbins[d] as usize;
            let nfine = ((nb as f64 * ratio).round() as usize).clamp(nb, ceiling.max(nb));
            let exact_limit = if ndims == 1 { ceiling.max(nb) } else { nfine };
            Axis::fine(min, max, sample.integer[d], nfine, exact_limit)
        })
        .collect();
    let fine_shape: Vec<usize> = axes.iter().map(Axis::len).collect();
    debug!(?fine_shape, rows = nsel, "adaptive binning fine grid");

    let fine: Vec<Vec<u32>> = axes
        .iter()
        .zip(&sample.dims)
        .map(|(a, values)| values.iter().map(|&x| a.locate(x) as u32).collect())
        .collect();
    let mut grid: Vec<u32> = zeroed(&fine_shape)?;
    for i in 0..nsel {
        grid[raster(&fine_shape, fine.iter().map(|f| f[i] as usize))] += 1;
    }

    // merge the fine bins of every dimension by their marginal weights
    let mut bounds = Vec::with_capacity(ndims);
    let mut coarse_of: Vec<Vec<usize>> = Vec::with_capacity(ndims);
    for d in 0..ndims {
        let mut marginal = vec![0_u64; fine_shape[d]];
        for &j in &fine[d] {
            marginal[j as usize] += 1;
        }
        let cuts = divide_counts(&marginal, nbins[d] as usize);
        bounds.push(cuts.iter().map(|&c| axes[d].edges[c]).collect::<Vec<f64>>());
        let mut map = vec![0; fine_shape[d]];
        for (j, w) in cuts.windows(2).enumerate() {
            map[w[0]..w[1]].fill(j);
        }
        coarse_of.push(map);
    }
    let shape: Vec<usize> = bounds.iter().map(|b| b.len() - 1).collect();

    // recombine the fine grid into the coarse cells
    let mut counts: Vec<u32> = zeroed(&shape)?;
    let mut coord = vec![0_usize; ndims];
    for &c in &grid {
        if c > 0 {
            counts[raster(&shape, coord.iter().enumerate().map(|(d, &f)| coarse_of[d][f]))] += c;
        }
        for d in (0..ndims).rev() {
            coord[d] += 1;
            if coord[d] < fine_shape[d] {
                break;
            }
            coord[d] = 0;
        }
    }

    let mut h = Histogram { bounds, counts, bitmaps: None, weights: None };
    if fill != Fill::Counts {
        let cells: Vec<usize> = (0..nsel)
            .map(|i| raster(&shape, (0..ndims).map(|d| coarse_of[d][fine[d][i] as usize])))
            .collect();
        fill_extras(&mut h, sample, &cells, &shape, fill)?;
    }
    Ok(h)
}

fn fill_extras(h: &mut Histogram, sample: &Sample, cells: &[usize], shape: &[usize], fill: Fill) -> Result<()> {
    match fill {
        Fill::Counts => {}
        Fill::Bitmaps => {
            let mut bitmaps: Vec<Option<Bitvector>> = zeroed::<u8>(shape)?.into_iter().map(|_| None).collect();
            for (&cell, &row) in cells.iter().zip(&sample.rows) {
                bitmaps[cell].get_or_insert_with(Bitvector::new).set_bit(row, true)?;
            }
            for b in bitmaps.iter_mut().flatten() {
                b.adjust_size(false, sample.nrows);
            }
            h.bitmaps = Some(bitmaps);
        }
        Fill::Weights => {
            let mut sums: Vec<f64> = zeroed(shape)?;
            if let Some(w) = &sample.weights {
                for (&cell, &x) in cells.iter().zip(w) {
                    sums[cell] += x;
                }
            }
            h.weights = Some(sums);
        }
    }
    Ok(())
}

/// Equal-weight bins over `columns` (one entry of `nbins` per column).
///
/// The result may have fewer bins than requested in a dimension with fewer distinct
/// values, and always exactly one bin in a dimension holding a single value.
pub fn adaptive_bins(columns: &[&Column], nbins: &[u32], mask: &Bitvector, options: &BinningOptions) -> Result<Histogram> {
    check_nbins(columns, nbins)?;
    adaptive(&Sample::gather(columns, None, mask)?, nbins, options, Fill::Counts)
}

/// [`adaptive_bins`] plus the rows of every cell as a bitmap over the full row range.
pub fn adaptive_bins_bitvectors(
    columns: &[&Column],
    nbins: &[u32],
    mask: &Bitvector,
    options: &BinningOptions,
) -> Result<Histogram> {
    check_nbins(columns, nbins)?;
    adaptive(&Sample::gather(columns, None, mask)?, nbins, options, Fill::Bitmaps)
}

/// [`adaptive_bins`] plus the per cell sum of `weights`. Rows where the weight is null
/// are left out. The sums are plain `f64` additions in row order.
pub fn adaptive_bins_weighted(
    columns: &[&Column],
    weights: &Column,
    nbins: &[u32],
    mask: &Bitvector,
    options: &BinningOptions,
) -> Result<Histogram> {
    check_nbins(columns, nbins)?;
    adaptive(&Sample::gather(columns, Some(weights), mask)?, nbins, options, Fill::Weights)
}

/// counts per cell for fixed axes; rows outside `keep` are skipped
fn count_fixed(sample: &Sample, axes: &[Axis], keep: impl Fn(usize, f64) -> bool) -> Result<Histogram> {
    let shape: Vec<usize> = axes.iter().map(Axis::len).collect();
    let mut counts: Vec<u32> = zeroed(&shape)?;
    for i in 0..sample.rows.len() {
        if sample.dims.iter().enumerate().all(|(d, v)| keep(d, v[i])) {
            counts[raster(&shape, axes.iter().zip(&sample.dims).map(|(a, v)| a.locate(v[i])))] += 1;
        }
    }
    Ok(Histogram { bounds: axes.iter().map(|a| a.edges.clone()).collect(), counts, bitmaps: None, weights: None })
}

/// Bins of a compact stride derived from the data range, at most about `nbins` per
/// dimension.
pub fn uniform_bins(columns: &[&Column], nbins: &[u32], mask: &Bitvector) -> Result<Histogram> {
    check_nbins(columns, nbins)?;
    let sample = Sample::gather(columns, None, mask)?;
    if sample.rows.is_empty() {
        return Ok(Histogram::empty(columns.len()));
    }
    let axes: Vec<Axis> = (0..columns.len())
        .map(|d| {
            let (min, max) = sample.min_max(d);
            Axis::uniform(min, max, sample.integer[d], nbins[d] as usize)
        })
        .collect();
    count_fixed(&sample, &axes, |_, _| true)
}

/// Counts in caller-defined fixed bins, one [`FixedBins`] per column. Values outside
/// `[begin, end]` are not counted.
pub fn distribution_nd(columns: &[&Column], bins: &[FixedBins], mask: &Bitvector) -> Result<Histogram> {
    if bins.len() != columns.len() {
        return Err(Error::ShapeMismatch(format!(
            "{} fixed bin layouts for {} columns",
            bins.len(),
            columns.len()
        )));
    }
    let axes = bins.iter().map(Axis::fixed).collect::<Result<Vec<Axis>>>()?;
    let sample = Sample::gather(columns, None, mask)?;
    count_fixed(&sample, &axes, |d, x| bins[d].begin <= x && x <= bins[d].end)
}

/// [`distribution_nd`] for one column.
pub fn distribution_1d(column: &Column, bins: FixedBins, mask: &Bitvector) -> Result<Histogram> {
    distribution_nd(&[column], &[bins], mask)
}

/// [`distribution_nd`] for two columns.
pub fn distribution_2d(c1: &Column, b1: FixedBins, c2: &Column, b2: FixedBins, mask: &Bitvector) -> Result<Histogram> {
    distribution_nd(&[c1, c2], &[b1, b2], mask)
}

/// [`distribution_nd`] for three columns.
pub fn distribution_3d(
    columns: [&Column; 3],
    bins: [FixedBins; 3],
    mask: &Bitvector,
) -> Result<Histogram> {
    distribution_nd(&columns, &bins, mask)
}

/// Histogram from the bins of the column's index, merged down to `nbins` by weight.
/// Needs a built (or attached) index that is not stale.
pub fn index_bins(column: &Column, nbins: u32, mask: &Bitvector) -> Result<Histogram> {
    if nbins == 0 {
        return Err(Error::InvalidInput("zero bins requested".to_string()));
    }
    let index = column
        .index()
        .ok_or_else(|| Error::NotFound(format!("column {} has no usable index", column.name())))?;
    let mut edges = index.bin_boundaries();
    if edges.len() < 2 {
        return Ok(Histogram::empty(1));
    }
    if !edges[0].is_finite() {
        let fallback = next_down(edges[1]);
        edges[0] = column.actual_min().ok().filter(|&m| m < edges[1]).unwrap_or(fallback);
    }
    if column.column_type().is_integer() {
        // same last edge as the other strategies: one above the largest value
        let n = edges.len();
        let max = match index.kind() {
            IndexKind::Relic => Some(edges[n - 2]),
            IndexKind::Bin => column.actual_max().ok(),
        };
        if let Some(top) = max.map(|m| upper_edge(m, true)).filter(|&t| t > edges[n - 2]) {
            edges[n - 1] = top;
        }
    }
    let valid = mask & &*column.null_mask();
    let weights = (0..index.num_bins())
        .map(|i| Ok((index.bitmap(i)? & &valid).count() as u64))
        .collect::<Result<Vec<u64>>>()?;
    let cuts = divide_counts(&weights, nbins as usize);
    let counts = cuts.windows(2).map(|w| weights[w[0]..w[1]].iter().sum::<u64>() as u32).collect();
    Ok(Histogram {
        bounds: vec![cuts.iter().map(|&c| edges[c]).collect()],
        counts,
        bitmaps: None,
        weights: None,
    })
}

/// `true` if binning from the index should beat scanning the raw column.
fn index_is_cheaper(index_bytes: usize, element_size: usize, rows: u32, nbins: u32) -> bool {
    (index_bytes as f64) * f64::from(nbins.max(2)).log2() < (element_size as f64) * f64::from(rows)
}

/// Histogram with the strategy of `options`.
pub fn histogram(columns: &[&Column], nbins: &[u32], mask: &Bitvector, options: &BinningOptions) -> Result<Histogram> {
    match options.strategy {
        BinningStrategy::Adaptive => adaptive_bins(columns, nbins, mask, options),
        BinningStrategy::Uniform => uniform_bins(columns, nbins, mask),
        BinningStrategy::Auto => {
            if let ([column], [n]) = (columns, nbins) {
                if let Some(index) = column.index() {
                    let element = column.column_type().element_size();
                    if index_is_cheaper(index.byte_size(), element, column.nrows(), *n) {
                        debug!(column = %column.name(), index_bytes = index.byte_size(), "binning from index");
                        return index_bins(column, *n, mask);
                    }
                }
            }
            debug!(ndims = columns.len(), "binning adaptively");
            adaptive_bins(columns, nbins, mask, options)
        }
    }
}
