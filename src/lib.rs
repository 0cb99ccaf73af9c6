//! Bitmap-indexed selections and histograms over columnar arrays.
//!
//! The crate answers two kinds of questions about in-memory arrays:
//! *which rows satisfy a condition* and *how are the selected rows distributed*.
//!
//! # Overview
//! * [`bitvector::Bitvector`]: word-aligned hybrid (WAH) compressed bit sequences,
//!   the currency of every result. Runs of equal bits collapse into fill words,
//!   and the set algebra works on the compressed words directly.
//! * [`column::Column`]: a typed array with a validity mask, either owned or borrowed
//!   from the application, plus the state of its index.
//! * [`index::Index`]: one bitmap per distinct value (*relic*) or per value range
//!   (*bin*). Bin indexes split a range condition into certain bins and candidate
//!   bins; only the candidate rows are checked against the data.
//! * [`qexpr::QExpr`] and [`query::CountQuery`]: condition trees, a where-clause
//!   parser, and their estimation and exact evaluation.
//! * [`histogram`]: adaptive (equal weight), uniform and index-based binning in
//!   any number of dimensions.
//! * [`iapi::Iapi`]: a registry of application buffers with selection handles
//!   and coordinate extraction, also exposed with integer status codes.
//! * [`transport`]: moving an index between processes as plain arrays or bytes.
//!
//! # Example
//! ```rust
//! use binquery::column::{ArrayRef, Column};
//! use binquery::histogram::adaptive_bins;
//! use binquery::options::{BinningOptions, IndexOptions};
//! use binquery::query::{CountQuery, Table};
//!
//! let mut table = Table::new();
//! let energy = table
//!     .add_column(Column::new("energy", ArrayRef::from((0..1000).map(|i| (i % 97) as f32).collect::<Vec<_>>())).unwrap())
//!     .unwrap();
//! energy.build_index(IndexOptions::bin(16)).unwrap();
//!
//! let mut q = CountQuery::new(&table);
//! q.set_where_clause("energy >= 10 AND energy < 20.5").unwrap();
//! q.estimate().unwrap();
//! assert!(q.min_hits().unwrap() <= q.max_hits().unwrap());
//! let n = q.evaluate().unwrap();
//! assert_eq!(n, 121);
//!
//! // distribution of the selected rows
//! let h = adaptive_bins(&[&*energy], &[5], q.hit_vector().unwrap(), &BinningOptions::default()).unwrap();
//! assert_eq!(h.total(), 121);
//! ```
//!
//! # Note
//! Nothing in the crate installs a `tracing` subscriber; build, evaluation and
//! registry events are emitted at `debug`/`info` level for the application to collect.
#![deny(missing_docs)]
pub mod bitvector;
pub mod column;
pub mod error;
pub mod histogram;
pub mod iapi;
pub mod index;
pub mod options;
pub mod qexpr;
pub mod query;
pub mod transport;

pub use bitvector::Bitvector;
pub use column::{ArrayRef, Column, ColumnType};
pub use error::{Error, Result};
pub use histogram::Histogram;
pub use index::Index;
pub use qexpr::QExpr;
pub use query::CountQuery;
