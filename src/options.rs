//! Options for building indexes and computing histograms.
//!
//! Index options come in as short strings, the way applications pass them through
//! [`crate::iapi::Iapi::build_index`]:
//! ```text
//! ""                    relic index (default)
//! "relic"               relic index
//! "<binning none/>"     relic index
//! "bin"                 bin index with the default number of bins
//! "bin nbins=64"        bin index with 64 bins
//! "<binning nbins=64/>" same
//! ```
use std::str::FromStr;

use crate::error::Error;

/// Number of bins of a bin index when nothing else is requested.
pub const DEFAULT_INDEX_BINS: u32 = 1000;

/// Largest fine grid per dimension used by the adaptive binning, unless the row
/// count is so large that `cbrt(rows)` exceeds it.
pub const DEFAULT_FINE_CEILING: u32 = 2048;

/// The two index layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// one bitmap per distinct value, every lookup is exact
    Relic,
    /// range-partitioned bins, boundary bins need a re-check against the data
    Bin,
}

/// How to build an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// relic or bin
    pub kind: IndexKind,
    /// number of bins requested for a bin index; ignored for relic
    pub nbins: u32,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions { kind: IndexKind::Relic, nbins: DEFAULT_INDEX_BINS }
    }
}

impl IndexOptions {
    /// A relic index.
    pub fn relic() -> Self {
        IndexOptions::default()
    }

    /// A bin index with `nbins` bins.
    pub fn bin(nbins: u32) -> Self {
        IndexOptions { kind: IndexKind::Bin, nbins: nbins.max(1) }
    }
}

impl FromStr for IndexOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let cleaned: String = s
            .chars()
            .map(|c| if matches!(c, '<' | '>' | '/' | ',' | ';') { ' ' } else { c })
            .collect();
        let mut opts = IndexOptions::default();
        for token in cleaned.split_whitespace() {
            let token = token.to_ascii_lowercase();
            match token.split_once('=') {
                Some(("nbins", n)) => {
                    let n: u32 = n.trim_matches('"').parse().map_err(|_| {
                        Error::InvalidInput(format!("bad bin count {n:?} in index options {s:?}"))
                    })?;
                    if n == 0 {
                        return Err(Error::InvalidInput(format!("zero bins in index options {s:?}")));
                    }
                    opts.kind = IndexKind::Bin;
                    opts.nbins = n;
                }
                Some(_) => {
                    return Err(Error::InvalidInput(format!(
                        "unknown setting {token:?} in index options {s:?}"
                    )))
                }
                None => match token.as_str() {
                    "default" | "binning" | "index" => {}
                    "none" | "relic" | "equality" => opts.kind = IndexKind::Relic,
                    "bin" | "bins" => opts.kind = IndexKind::Bin,
                    _ => {
                        return Err(Error::InvalidInput(format!(
                            "unknown keyword {token:?} in index options {s:?}"
                        )))
                    }
                },
            }
        }
        Ok(opts)
    }
}

/// Which binning algorithm a histogram uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinningStrategy {
    /// equal-weight boundaries derived from the data
    Adaptive,
    /// fixed stride, rounded to a compact value
    Uniform,
    /// reuse the index bins when reading the index is cheaper than the raw data,
    /// adaptive otherwise
    Auto,
}

/// Settings of the histogram engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinningOptions {
    /// upper bound on the fine grid per dimension, see [`DEFAULT_FINE_CEILING`]
    pub fine_ceiling: u32,
    /// algorithm
    pub strategy: BinningStrategy,
}

impl Default for BinningOptions {
    fn default() -> Self {
        BinningOptions { fine_ceiling: DEFAULT_FINE_CEILING, strategy: BinningStrategy::Adaptive }
    }
}

impl BinningOptions {
    /// Same options with another strategy.
    pub fn with_strategy(mut self, strategy: BinningStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Same options with another fine-grid ceiling (at least 1).
    pub fn with_fine_ceiling(mut self, ceiling: u32) -> Self {
        self.fine_ceiling = ceiling.max(1);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_relic_forms() {
        for s in ["", "default", "relic", "<binning none/>", "<binning none>"] {
            let o: IndexOptions = s.parse().unwrap();
            assert_eq!(o.kind, IndexKind::Relic, "{s}");
        }
    }

    #[test]
    fn test_parse_bin_forms() {
        let o: IndexOptions = "<binning nbins=64/>".parse().unwrap();
        assert_eq!(o, IndexOptions::bin(64));
        let o: IndexOptions = "bin nbins=7".parse().unwrap();
        assert_eq!(o, IndexOptions::bin(7));
        let o: IndexOptions = "BIN".parse().unwrap();
        assert_eq!(o.kind, IndexKind::Bin);
        assert_eq!(o.nbins, DEFAULT_INDEX_BINS);
    }

    #[test]
    fn test_parse_errors() {
        assert!("nbins=abc".parse::<IndexOptions>().is_err());
        assert!("nbins=0".parse::<IndexOptions>().is_err());
        assert!("precision=2".parse::<IndexOptions>().is_err());
        assert!("btree".parse::<IndexOptions>().is_err());
    }
}
