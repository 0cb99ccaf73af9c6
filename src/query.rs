//! Count queries: which rows satisfy a [`QExpr`].
//!
//! A [`CountQuery`] holds an expression over the columns of a [`ColumnSource`] and
//! offers two ways to resolve it:
//! * [`CountQuery::estimate`] brackets the answer between a lower and an upper hit
//!   set using only the indexes. Leaves without a usable index contribute
//!   "nothing certain, everything possible".
//! * [`CountQuery::evaluate`] computes the exact hits, with the index where one is
//!   built and fresh, and by scanning the column data otherwise.
//!
//! Only rows that are valid in every referenced column take part.
//!
//! # Example
//! ```rust
//! use binquery::column::{ArrayRef, Column};
//! use binquery::query::{CountQuery, Table};
//!
//! let mut t = Table::new();
//! t.add_column(Column::new("a", ArrayRef::from(vec![5_i32, 1, 1, 5, 9])).unwrap()).unwrap();
//! let mut q = CountQuery::new(&t);
//! q.set_where_clause("a = 5 OR a > 8").unwrap();
//! assert_eq!(q.evaluate().unwrap(), 3);
//! assert_eq!(q.hit_vector().unwrap().ones().collect::<Vec<_>>(), vec![0, 3, 4]);
//! ```
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::bitvector::Bitvector;
use crate::column::Column;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::qexpr::{parse_where_clause, QExpr};

/// Anything that can hand out columns by (case-insensitive) name.
pub trait ColumnSource {
    /// The column called `name`, if any.
    fn column(&self, name: &str) -> Option<Arc<Column>>;
}

/// A set of columns of equal length.
#[derive(Default)]
pub struct Table {
    columns: Vec<Arc<Column>>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("nrows", &self.nrows())
            .field("columns", &self.column_names())
            .finish()
    }
}

impl Table {
    /// An empty table.
    pub fn new() -> Self {
        Table::default()
    }

    /// Adds a column; it must have as many rows as the columns already present and
    /// a name not used yet.
    pub fn add_column(&mut self, column: Column) -> Result<Arc<Column>> {
        let column = Arc::new(column);
        self.add_shared(Arc::clone(&column))?;
        Ok(column)
    }

    /// Adds a column that is also held elsewhere.
    pub fn add_shared(&mut self, column: Arc<Column>) -> Result<()> {
        if let Some(first) = self.columns.first() {
            if first.nrows() != column.nrows() {
                return Err(Error::ShapeMismatch(format!(
                    "column {} has {} rows, the table {}",
                    column.name(),
                    column.nrows(),
                    first.nrows()
                )));
            }
        }
        if self.get(column.name()).is_some() {
            return Err(Error::InvalidInput(format!("duplicate column {}", column.name())));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Looks up a column, ignoring case.
    pub fn get(&self, name: &str) -> Option<&Arc<Column>> {
        self.columns.iter().find(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// Rows per column, 0 for an empty table.
    pub fn nrows(&self) -> u32 {
        self.columns.first().map_or(0, |c| c.nrows())
    }

    /// Number of columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name()).collect()
    }
}

impl ColumnSource for Table {
    fn column(&self, name: &str) -> Option<Arc<Column>> {
        self.get(name).cloned()
    }
}

/// The columns of one expression, resolved once per estimate/evaluate.
struct Bindings {
    columns: HashMap<String, Arc<Column>>,
    /// rows valid in every referenced column
    mask: Bitvector,
}

impl Bindings {
    fn column(&self, name: &str) -> Result<&Arc<Column>> {
        self.columns
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::NotFound(format!("column {name}")))
    }
}

/// A where-clause over a [`ColumnSource`] and its hits.
pub struct CountQuery<'a> {
    source: &'a dyn ColumnSource,
    expr: Option<QExpr>,
    lower: Option<Bitvector>,
    upper: Option<Bitvector>,
    hits: Option<Bitvector>,
}

impl fmt::Debug for CountQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountQuery")
            .field("expr", &self.expr.as_ref().map(|e| e.to_string()))
            .field("min_hits", &self.min_hits())
            .field("max_hits", &self.max_hits())
            .field("num_hits", &self.num_hits())
            .finish()
    }
}

impl<'a> CountQuery<'a> {
    /// A query without a condition over the columns of `source`.
    pub fn new(source: &'a dyn ColumnSource) -> Self {
        CountQuery { source, expr: None, lower: None, upper: None, hits: None }
    }

    /// Parses `clause` and makes it the condition, see [`crate::qexpr`] for the grammar.
    pub fn set_where_clause(&mut self, clause: &str) -> Result<()> {
        self.set_expr(parse_where_clause(clause)?)
    }

    /// Makes `expr` the condition. Every column it names must exist.
    /// Results of a previous condition are dropped.
    pub fn set_expr(&mut self, expr: QExpr) -> Result<()> {
        if let Some(missing) = expr.columns().into_iter().find(|c| self.source.column(c).is_none()) {
            return Err(Error::NotFound(format!("column {missing}")));
        }
        self.expr = Some(expr);
        self.lower = None;
        self.upper = None;
        self.hits = None;
        Ok(())
    }

    /// The current condition.
    pub fn expr(&self) -> Option<&QExpr> {
        self.expr.as_ref()
    }

    fn bind(&self) -> Result<(&QExpr, Bindings)> {
        let expr = self
            .expr
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("no where clause set".to_string()))?;
        let mut columns = HashMap::new();
        let mut mask: Option<Bitvector> = None;
        for name in expr.columns() {
            let col = self.source.column(name).ok_or_else(|| Error::NotFound(format!("column {name}")))?;
            let valid = col.null_mask();
            mask = Some(match mask {
                Some(m) => &m & &*valid,
                None => valid.as_ref().clone(),
            });
            columns.insert(name.to_ascii_lowercase(), col);
        }
        Ok((expr, Bindings { columns, mask: mask.unwrap_or_default() }))
    }

    /// Brackets the hits without reading column data: afterwards
    /// `min_hits() <= hits <= max_hits()`.
    pub fn estimate(&mut self) -> Result<()> {
        let (expr, bindings) = self.bind()?;
        let (lower, upper) = estimate_node(expr, &bindings)?;
        debug!(%expr, min = lower.count(), max = upper.count(), "estimated");
        self.lower = Some(lower);
        self.upper = Some(upper);
        Ok(())
    }

    /// Computes the exact hits and returns their number.
    pub fn evaluate(&mut self) -> Result<u32> {
        let (expr, bindings) = self.bind()?;
        let hits = evaluate_node(expr, &bindings, &bindings.mask)?;
        let n = hits.count();
        info!(%expr, rows = bindings.mask.size(), hits = n, "evaluated");
        self.lower = Some(hits.clone());
        self.upper = Some(hits.clone());
        self.hits = Some(hits);
        Ok(n)
    }

    /// Number of hits, after [`CountQuery::evaluate`].
    pub fn num_hits(&self) -> Option<u32> {
        self.hits.as_ref().map(Bitvector::count)
    }

    /// The hits, after [`CountQuery::evaluate`].
    pub fn hit_vector(&self) -> Option<&Bitvector> {
        self.hits.as_ref()
    }

    /// Consumes the query, keeping only its hits.
    pub fn into_hits(self) -> Option<Bitvector> {
        self.hits
    }

    /// Rows certain to be hits, after [`CountQuery::estimate`] or [`CountQuery::evaluate`].
    pub fn min_hits(&self) -> Option<u32> {
        self.lower.as_ref().map(Bitvector::count)
    }

    /// Rows that may be hits, after [`CountQuery::estimate`] or [`CountQuery::evaluate`].
    pub fn max_hits(&self) -> Option<u32> {
        self.upper.as_ref().map(Bitvector::count)
    }

    /// The certain hits of the last estimate.
    pub fn lower_bound(&self) -> Option<&Bitvector> {
        self.lower.as_ref()
    }

    /// The possible hits of the last estimate.
    pub fn upper_bound(&self) -> Option<&Bitvector> {
        self.upper.as_ref()
    }

    fn hits_of(&self, name: &str) -> Result<(Arc<Column>, &Bitvector)> {
        let hits = self.hits.as_ref().ok_or(Error::NotComputed("hit vector"))?;
        let col = self.source.column(name).ok_or_else(|| Error::NotFound(format!("column {name}")))?;
        Ok((col, hits))
    }

    /// Values of `column` at the hit rows, as doubles.
    pub fn qualified_doubles(&self, column: &str) -> Result<Vec<f64>> {
        let (col, hits) = self.hits_of(column)?;
        col.select_doubles(hits)
    }

    /// Values of the integer `column` at the hit rows, as i64.
    pub fn qualified_longs(&self, column: &str) -> Result<Vec<i64>> {
        let (col, hits) = self.hits_of(column)?;
        col.select_longs(hits)
    }
}

/// OR of the given bins restricted to `mask`.
fn union_of(index: &Index, bins: impl Iterator<Item = usize>, mask: &Bitvector) -> Result<Bitvector> {
    let mut out = Bitvector::filled(false, mask.size());
    for i in bins {
        out |= index.bitmap(i)?;
    }
    out &= mask;
    out.adjust_size(false, mask.size());
    Ok(out)
}

fn estimate_node(e: &QExpr, bindings: &Bindings) -> Result<(Bitvector, Bitvector)> {
    let mask = &bindings.mask;
    let nothing = || Bitvector::filled(false, mask.size());
    Ok(match e {
        QExpr::And(l, r) => {
            let (l1, u1) = estimate_node(l, bindings)?;
            let (l2, u2) = estimate_node(r, bindings)?;
            (&l1 & &l2, &u1 & &u2)
        }
        QExpr::Or(l, r) => {
            let (l1, u1) = estimate_node(l, bindings)?;
            let (l2, u2) = estimate_node(r, bindings)?;
            (&l1 | &l2, &u1 | &u2)
        }
        QExpr::Xor(l, r) => {
            let (l1, u1) = estimate_node(l, bindings)?;
            let (l2, u2) = estimate_node(r, bindings)?;
            // certain: certainly on one side and certainly not on the other
            let lower = &l1.and_not(&u2) | &l2.and_not(&u1);
            let upper = (&u1 | &u2).and_not(&(&l1 & &l2));
            (lower, upper)
        }
        QExpr::Not(inner) => {
            let (lo, up) = estimate_node(inner, bindings)?;
            (mask.and_not(&up), mask.and_not(&lo))
        }
        QExpr::Range(r) => match bindings.column(&r.column)?.index() {
            Some(ix) => {
                let loc = ix.locate(r);
                (union_of(&ix, loc.hit0..loc.hit1, mask)?, union_of(&ix, loc.cand0..loc.cand1, mask)?)
            }
            None => (nothing(), mask.clone()),
        },
        QExpr::Discrete(d) => match bindings.column(&d.column)?.index() {
            Some(ix) => {
                let (exact, candidates) = ix.discrete_bins(d);
                let lower = union_of(&ix, exact.iter().copied(), mask)?;
                let upper = &lower | &union_of(&ix, candidates.into_iter(), mask)?;
                (lower, upper)
            }
            None => (nothing(), mask.clone()),
        },
        QExpr::StringEq(_) => (nothing(), mask.clone()),
    })
}

fn evaluate_node(e: &QExpr, bindings: &Bindings, mask: &Bitvector) -> Result<Bitvector> {
    match e {
        QExpr::And(l, r) => {
            let left = evaluate_node(l, bindings, mask)?;
            if left.count() == 0 {
                return Ok(left);
            }
            // the right side only has to look at the rows the left side kept
            evaluate_node(r, bindings, &left)
        }
        QExpr::Or(l, r) => {
            let left = evaluate_node(l, bindings, mask)?;
            let rest = mask.and_not(&left);
            if rest.count() == 0 {
                return Ok(left);
            }
            Ok(&left | &evaluate_node(r, bindings, &rest)?)
        }
        QExpr::Xor(l, r) => Ok(&evaluate_node(l, bindings, mask)? ^ &evaluate_node(r, bindings, mask)?),
        QExpr::Not(inner) => Ok(mask.and_not(&evaluate_node(inner, bindings, mask)?)),
        QExpr::Range(r) => {
            let col = bindings.column(&r.column)?;
            let values = col.values()?;
            match col.index() {
                Some(ix) => ix.evaluate(r, &values, mask),
                None => values.scan_range(mask, r),
            }
        }
        QExpr::Discrete(d) => {
            let col = bindings.column(&d.column)?;
            let values = col.values()?;
            match col.index() {
                Some(ix) => ix.evaluate_discrete(d, &values, mask),
                None => values.scan_set(mask, d),
            }
        }
        QExpr::StringEq(s) => bindings.column(&s.column)?.values()?.scan_text(mask, |x| x == s.value),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::column::ArrayRef;
    use crate::options::IndexOptions;
    use crate::qexpr::CompareOp;
    use pretty_assertions::assert_eq;
    use rand::distributions::{Distribution, Uniform};
    use rand::Rng;

    fn table_a() -> Table {
        let mut t = Table::new();
        t.add_column(Column::new("a", ArrayRef::from(vec![5_i32, 1, 1, 5, 9, 1, 5, 9, 9, 9])).unwrap())
            .unwrap();
        t
    }

    fn positions(b: &Bitvector) -> Vec<u32> {
        b.ones().collect()
    }

    mod table {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_shape_and_names() {
            let mut t = table_a();
            let b = Column::new("B", ArrayRef::from(vec![0.5_f32; 10])).unwrap();
            t.add_column(b).unwrap();
            assert_eq!(t.nrows(), 10);
            assert_eq!(t.column_names(), vec!["a", "B"]);
            assert!(t.get("b").is_some());

            let short = Column::new("c", ArrayRef::from(vec![1_u8; 3])).unwrap();
            assert!(matches!(t.add_column(short), Err(Error::ShapeMismatch(_))));
            let dup = Column::new("A", ArrayRef::from(vec![1_u8; 10])).unwrap();
            assert!(matches!(t.add_column(dup), Err(Error::InvalidInput(_))));
            assert_eq!(t.num_columns(), 2);
        }
    }

    mod count {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_equality_hits() {
            let t = table_a();
            let mut q = CountQuery::new(&t);
            q.set_where_clause("a == 5").unwrap();
            assert_eq!(q.num_hits(), None);
            assert_eq!(q.evaluate().unwrap(), 3);
            assert_eq!(q.num_hits(), Some(3));
            assert_eq!(positions(q.hit_vector().unwrap()), vec![0, 3, 6]);
        }

        #[test]
        fn test_estimate_without_index() {
            let t = table_a();
            let mut q = CountQuery::new(&t);
            q.set_where_clause("a != 5").unwrap();
            assert_eq!(q.min_hits(), None);
            assert_eq!(q.max_hits(), None);
            q.estimate().unwrap();
            assert_eq!(q.max_hits(), Some(10));
            assert_eq!(q.min_hits(), Some(0));
            assert_eq!(q.num_hits(), None);
            assert_eq!(q.evaluate().unwrap(), 7);
            assert_eq!(q.min_hits(), Some(7));
        }

        #[test]
        fn test_estimate_with_relic_is_exact() {
            let t = table_a();
            t.get("a").unwrap().build_index(IndexOptions::relic()).unwrap();
            let mut q = CountQuery::new(&t);
            q.set_where_clause("a == 5 OR a > 8").unwrap();
            q.estimate().unwrap();
            assert_eq!(q.min_hits(), Some(7));
            assert_eq!(q.max_hits(), Some(7));
            q.set_where_clause("a != 5").unwrap();
            q.estimate().unwrap();
            assert_eq!((q.min_hits(), q.max_hits()), (Some(7), Some(7)));
        }

        #[test]
        fn test_nulls_are_excluded() {
            let mut t = Table::new();
            let c = Column::new("x", ArrayRef::from(vec![1.0_f64, 2.0, 3.0, 4.0]))
                .unwrap()
                .with_null_mask(Bitvector::from_positions([0, 1, 3], 4).unwrap())
                .unwrap();
            t.add_column(c).unwrap();
            let mut q = CountQuery::new(&t);
            q.set_where_clause("NOT x < 2").unwrap();
            q.evaluate().unwrap();
            assert_eq!(positions(q.hit_vector().unwrap()), vec![1, 3]);
        }

        #[test]
        fn test_strings_and_sets() {
            let mut t = Table::new();
            let names = ["ab", "cd", "ab", "ef"].map(String::from).to_vec();
            t.add_column(Column::new("name", ArrayRef::from(names)).unwrap()).unwrap();
            t.add_column(Column::new("v", ArrayRef::from(vec![1_i64, 2, 3, 4])).unwrap()).unwrap();
            let mut q = CountQuery::new(&t);
            q.set_where_clause("name = 'ab' OR v IN (4, 7)").unwrap();
            q.evaluate().unwrap();
            assert_eq!(positions(q.hit_vector().unwrap()), vec![0, 2, 3]);
            assert_eq!(q.qualified_longs("v").unwrap(), vec![1, 3, 4]);
            assert_eq!(q.qualified_doubles("V").unwrap_err(), Error::UnsupportedType {
                ctype: crate::column::ColumnType::Long,
                op: "select_doubles",
            });

            q.set_where_clause("v = 'ab'").unwrap();
            assert!(matches!(q.evaluate(), Err(Error::UnsupportedType { .. })));
        }

        #[test]
        fn test_errors() {
            let t = table_a();
            let mut q = CountQuery::new(&t);
            assert!(matches!(q.evaluate(), Err(Error::InvalidInput(_))));
            assert!(matches!(q.set_where_clause("b < 3"), Err(Error::NotFound(_))));
            assert!(matches!(q.set_where_clause("a < "), Err(Error::Parse { .. })));
            assert_eq!(q.qualified_doubles("a"), Err(Error::NotComputed("hit vector")));
            q.set_expr(QExpr::compare("A", CompareOp::Ge, 9.0)).unwrap();
            assert_eq!(q.evaluate().unwrap(), 4);
            assert_eq!(q.qualified_doubles("a").unwrap(), vec![9.0; 4]);
        }
    }

    mod random {
        use super::*;
        use pretty_assertions::assert_eq;

        const N: usize = 4000;

        /// same data twice: `x`,`y` carry indexes, `xs`,`ys` are scanned
        fn tables() -> (Table, Vec<i32>, Vec<f64>) {
            let mut rng = rand::thread_rng();
            let xd = Uniform::new(0, 500);
            let yd = Uniform::new(-1.0, 1.0);
            let x: Vec<i32> = (0..N).map(|_| xd.sample(&mut rng)).collect();
            let y: Vec<f64> = (0..N).map(|_| yd.sample(&mut rng)).collect();
            let valid: Bitvector = (0..N).map(|i| i % 13 != 0).collect();
            let mut t = Table::new();
            for (name, data) in [("x", ArrayRef::from(x.clone())), ("xs", ArrayRef::from(x.clone()))] {
                t.add_column(Column::new(name, data).unwrap().with_null_mask(valid.clone()).unwrap()).unwrap();
            }
            t.add_column(Column::new("y", ArrayRef::from(y.clone())).unwrap()).unwrap();
            t.add_column(Column::new("ys", ArrayRef::from(y.clone())).unwrap()).unwrap();
            t.get("x").unwrap().build_index(IndexOptions::bin(30)).unwrap();
            t.get("y").unwrap().build_index(IndexOptions::bin(25)).unwrap();
            (t, x, y)
        }

        #[test]
        fn test_index_matches_scan_and_brute_force() {
            let (t, x, y) = tables();
            let mut rng = rand::thread_rng();
            for _ in 0..30 {
                let a = rng.gen_range(0..500);
                let b = rng.gen_range(a..=500);
                let c: f64 = rng.gen_range(-1.0..1.0);
                let with = |xn: &str, yn: &str| format!("({xn} >= {a} AND {xn} < {b}) XOR NOT {yn} > {c}");

                let mut qi = CountQuery::new(&t);
                qi.set_where_clause(&with("x", "y")).unwrap();
                qi.evaluate().unwrap();
                let mut qs = CountQuery::new(&t);
                qs.set_where_clause(&with("xs", "ys")).unwrap();
                qs.evaluate().unwrap();
                assert_eq!(qi.hit_vector(), qs.hit_vector());

                let expected: Vec<u32> = (0..N)
                    .filter(|&i| i % 13 != 0)
                    .filter(|&i| (x[i] >= a && x[i] < b) != (y[i] <= c))
                    .map(|i| i as u32)
                    .collect();
                assert_eq!(positions(qi.hit_vector().unwrap()), expected);
            }
        }

        #[test]
        fn test_estimate_brackets_hits() {
            let (t, _, _) = tables();
            let mut rng = rand::thread_rng();
            for _ in 0..30 {
                let a = rng.gen_range(0..500);
                let c: f64 = rng.gen_range(-1.0..1.0);
                let clause = format!("x < {a} OR (y > {c} AND NOT x IN (3, 17, {a}))");
                let mut q = CountQuery::new(&t);
                q.set_where_clause(&clause).unwrap();
                q.estimate().unwrap();
                let lower = q.lower_bound().unwrap().clone();
                let upper = q.upper_bound().unwrap().clone();
                let hits = q.evaluate().unwrap();
                let exact = q.hit_vector().unwrap();
                assert!(lower.count() <= hits && hits <= upper.count());
                assert_eq!(&(&lower & exact), &lower);
                assert_eq!(&(&upper & exact), exact);
            }
        }

        #[test]
        fn test_bin_index_has_candidates() {
            let (t, _, _) = tables();
            let mut q = CountQuery::new(&t);
            q.set_where_clause("y < 0.0123").unwrap();
            q.estimate().unwrap();
            assert!(q.min_hits().unwrap() < q.max_hits().unwrap());
        }
    }
}
