//! Selections over application buffers.
//!
//! The facade keeps three registries, each behind its own lock:
//! * arrays: application buffers registered as [`Column`]s, by (case-insensitive)
//!   name and by buffer address,
//! * selections: a [`QExpr`] plus the mesh shape it applies to, behind an opaque
//!   [`SelectionHandle`],
//! * results: the hits of evaluated selections.
//!
//! Locks are only held for map lookups and insertions. Columns are cloned out of
//! the registry before anything is scanned.
//!
//! [`Iapi::global`] is the process-wide instance the integer-code functions in
//! [`status`] work on; tests and embedders can also create private instances.
//!
//! # Example
//! ```rust
//! use binquery::column::{ArrayRef, ColumnType};
//! use binquery::iapi::{Combinator, Iapi};
//! use binquery::qexpr::CompareOp;
//!
//! let api = Iapi::new();
//! let t = ArrayRef::from(vec![1.0_f32, 5.0, 2.0, 8.0, 6.0, 0.5]);
//! let warm = api.selection_create(ColumnType::Float, &t, CompareOp::Gt, 4.0).unwrap();
//! let cool = api.selection_create(ColumnType::Float, &t, CompareOp::Lt, 7.0).unwrap();
//! let both = api.selection_combine(warm, Combinator::And, cool).unwrap();
//! assert_eq!(api.selection_evaluate(both).unwrap(), 2);
//!
//! let mut out = [0.0_f32; 4];
//! assert_eq!(api.selection_read(&t, both, 0, &mut out).unwrap(), 2);
//! assert_eq!(&out[..2], &[5.0, 6.0]);
//! ```
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bitvector::{Bitvector, IndexRun, IndexRunIter, IndexSet};
use crate::column::{ArrayRef, Column, ColumnType, Numeric, Ownership};
use crate::error::{Error, Result};
use crate::options::IndexOptions;
use crate::qexpr::{CompareOp, QExpr};
use crate::query::{ColumnSource, CountQuery};

/// Opaque handle of a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SelectionHandle(u64);

impl SelectionHandle {
    /// The handle as a positive integer.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// a new column was created
    New,
    /// the buffer was registered before; the name now refers to that column too,
    /// unless it was taken
    KnownBuffer,
    /// another array already has this name; nothing changed
    KnownName,
}

impl Registration {
    /// 0, 1 or 2.
    pub fn code(self) -> i64 {
        match self {
            Registration::New => 0,
            Registration::KnownBuffer => 1,
            Registration::KnownName => 2,
        }
    }
}

/// How [`Iapi::selection_combine`] joins two selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    /// both
    And,
    /// either
    Or,
    /// exactly one
    Xor,
    /// not both
    Nand,
    /// neither
    Nor,
}

/// `[_A-Za-z][_A-Za-z0-9.:]*`
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c == '.' || c == ':' || c.is_ascii_alphanumeric())
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("{name:?} is not a valid array name")))
    }
}

fn check_buffer(array: &ArrayRef) -> Result<()> {
    if array.is_empty() {
        return Err(Error::InvalidInput("empty buffer".to_string()));
    }
    Ok(())
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, Arc<Column>>,
    by_address: HashMap<usize, Arc<Column>>,
    anonymous: u64,
}

impl Registry {
    /// The column registered for `address`, dropping entries whose borrowed buffer
    /// is gone (the address may have been reused since).
    fn live(&mut self, address: usize) -> Option<Arc<Column>> {
        let col = self.by_address.get(&address)?.clone();
        if col.values().is_ok() {
            return Some(col);
        }
        debug!(column = %col.name(), address, "dropping registration of a released buffer");
        self.by_address.remove(&address);
        self.by_name.retain(|_, c| !Arc::ptr_eq(c, &col));
        None
    }

    fn insert(&mut self, name: &str, address: usize, column: Column) -> Arc<Column> {
        let col = Arc::new(column);
        self.by_address.insert(address, col.clone());
        self.by_name.insert(name.to_ascii_lowercase(), col.clone());
        col
    }

    fn next_anonymous_name(&mut self) -> String {
        loop {
            self.anonymous += 1;
            let name = format!("_a{}", self.anonymous);
            if !self.by_name.contains_key(&name) {
                return name;
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Selection {
    expr: QExpr,
    shape: Vec<u64>,
}

#[derive(Default)]
struct Selections {
    next: u64,
    map: HashMap<SelectionHandle, Selection>,
}

/// Columns of one query, taken out of the registry.
struct Snapshot(HashMap<String, Arc<Column>>);

impl ColumnSource for Snapshot {
    fn column(&self, name: &str) -> Option<Arc<Column>> {
        self.0.get(&name.to_ascii_lowercase()).cloned()
    }
}

/// Registry of arrays, selections and their results.
#[derive(Default)]
pub struct Iapi {
    registry: Mutex<Registry>,
    selections: Mutex<Selections>,
    results: Mutex<HashMap<SelectionHandle, Arc<Bitvector>>>,
}

impl std::fmt::Debug for Iapi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iapi")
            .field("arrays", &self.registry.lock().by_name.len())
            .field("selections", &self.selections.lock().map.len())
            .field("results", &self.results.lock().len())
            .finish()
    }
}

static GLOBAL: OnceLock<Iapi> = OnceLock::new();

/// Sets up the process-wide instance; calling it again is harmless.
pub fn init() -> &'static Iapi {
    Iapi::global()
}

/// Forgets every array, selection and result of the process-wide instance.
pub fn teardown() {
    if let Some(api) = GLOBAL.get() {
        api.clear_all();
    }
}

impl Iapi {
    /// An empty, private instance.
    pub fn new() -> Self {
        Iapi::default()
    }

    /// The process-wide instance.
    pub fn global() -> &'static Iapi {
        GLOBAL.get_or_init(Iapi::new)
    }

    /// Drops all registrations, selections and cached results.
    pub fn clear_all(&self) {
        *self.results.lock() = HashMap::new();
        *self.selections.lock() = Selections::default();
        *self.registry.lock() = Registry::default();
        info!("iapi state cleared");
    }

    // ---------------------------------------------------------------
    // arrays

    /// Registers an application buffer under `name` without copying it.
    ///
    /// Registering a buffer twice does not create a second column: the new name
    /// becomes an alias of the existing column (if the name is free) and
    /// [`Registration::KnownBuffer`] is returned.
    pub fn register_array(&self, name: &str, array: &ArrayRef) -> Result<Registration> {
        check_name(name)?;
        check_buffer(array)?;
        let address = array.address();
        let mut reg = self.registry.lock();
        if let Some(col) = reg.live(address) {
            reg.by_name.entry(name.to_ascii_lowercase()).or_insert(col);
            return Ok(Registration::KnownBuffer);
        }
        if reg.by_name.contains_key(&name.to_ascii_lowercase()) {
            return Ok(Registration::KnownName);
        }
        let column = Column::borrowed(name, array)?;
        reg.insert(name, address, column);
        info!(name, address, rows = array.len(), "registered array");
        Ok(Registration::New)
    }

    /// Registers a private copy of `array`. The copy is a buffer of its own, so only
    /// the name can collide.
    pub fn register_owned_array(&self, name: &str, array: &ArrayRef) -> Result<Registration> {
        check_name(name)?;
        check_buffer(array)?;
        if self.lookup(name).is_some() {
            return Ok(Registration::KnownName);
        }
        let copy = array.deep_copy()?;
        let column = Column::new(name, copy.clone())?;
        let mut reg = self.registry.lock();
        if reg.by_name.contains_key(&name.to_ascii_lowercase()) {
            return Ok(Registration::KnownName);
        }
        reg.insert(name, copy.address(), column);
        info!(name, rows = copy.len(), "registered owned copy");
        Ok(Registration::New)
    }

    /// The column registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<Column>> {
        self.registry.lock().by_name.get(&name.to_ascii_lowercase()).cloned()
    }

    /// The column registered for the buffer at `address`.
    pub fn lookup_address(&self, address: usize) -> Option<Arc<Column>> {
        self.registry.lock().live(address)
    }

    /// Points array `name` at `array`, which holds the old values followed by new
    /// ones. Owned arrays are copied again. Cached results are dropped.
    pub fn extend_array(&self, name: &str, array: &ArrayRef) -> Result<()> {
        check_buffer(array)?;
        let col = self.lookup(name).ok_or_else(|| Error::NotFound(format!("array {name}")))?;
        let old_address = col.values().map(|v| v.address()).ok();
        let new_data = match col.ownership() {
            Ownership::Borrowed => array.clone(),
            Ownership::Owned => array.deep_copy()?,
        };
        col.extend(&new_data, col.ownership())?;
        {
            let mut reg = self.registry.lock();
            if let Some(old) = old_address {
                if reg.by_address.get(&old).is_some_and(|c| Arc::ptr_eq(c, &col)) {
                    reg.by_address.remove(&old);
                }
            }
            reg.by_address.insert(new_data.address(), col.clone());
        }
        self.purge_all_results();
        info!(name, rows = col.nrows(), "extended array");
        Ok(())
    }

    /// Builds an index on array `name`; `options` as accepted by [`IndexOptions`]'s
    /// `FromStr`, e.g. `"<binning none/>"` or `"<binning nbins=100/>"`.
    pub fn build_index(&self, name: &str, options: &str) -> Result<()> {
        let options: IndexOptions = options.parse()?;
        let col = self.lookup(name).ok_or_else(|| Error::NotFound(format!("array {name}")))?;
        col.build_index(options)?;
        Ok(())
    }

    /// Forgets array `name` together with its aliases. Owned data is released with
    /// the last reference; cached results are dropped since they may refer to it.
    pub fn free_array(&self, name: &str) -> Result<()> {
        {
            let mut reg = self.registry.lock();
            let col = reg
                .by_name
                .remove(&name.to_ascii_lowercase())
                .ok_or_else(|| Error::NotFound(format!("array {name}")))?;
            reg.by_name.retain(|_, c| !Arc::ptr_eq(c, &col));
            reg.by_address.retain(|_, c| !Arc::ptr_eq(c, &col));
        }
        self.purge_all_results();
        info!(name, "freed array");
        Ok(())
    }

    /// Number of registered names (aliases included).
    pub fn num_arrays(&self) -> usize {
        self.registry.lock().by_name.len()
    }

    /// the column of `array`, registered under a generated name if needed
    fn column_for(&self, ctype: ColumnType, array: &ArrayRef) -> Result<Arc<Column>> {
        check_buffer(array)?;
        if array.column_type() != ctype {
            return Err(Error::InvalidInput(format!(
                "type tag {ctype:?} does not match a {:?} buffer",
                array.column_type()
            )));
        }
        if ctype == ColumnType::Text {
            return Err(Error::UnsupportedType { ctype, op: "selection_create" });
        }
        let mut reg = self.registry.lock();
        if let Some(col) = reg.live(array.address()) {
            return Ok(col);
        }
        let name = reg.next_anonymous_name();
        let column = Column::borrowed(&name, array)?;
        debug!(%name, address = array.address(), "registered array on first use");
        Ok(reg.insert(&name, array.address(), column))
    }

    // ---------------------------------------------------------------
    // selections

    fn add_selection(&self, selection: Selection) -> SelectionHandle {
        let mut sel = self.selections.lock();
        sel.next += 1;
        let h = SelectionHandle(sel.next);
        sel.map.insert(h, selection);
        h
    }

    fn selection(&self, h: SelectionHandle) -> Result<Selection> {
        self.selections
            .lock()
            .map
            .get(&h)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("selection {}", h.0)))
    }

    /// `array cmp bound` over a flat array. `Ne` becomes `NOT (array == bound)`.
    pub fn selection_create(&self, ctype: ColumnType, array: &ArrayRef, cmp: CompareOp, bound: f64) -> Result<SelectionHandle> {
        let col = self.column_for(ctype, array)?;
        let expr = QExpr::compare(col.name(), cmp, bound);
        Ok(self.add_selection(Selection { expr, shape: vec![array.len() as u64] }))
    }

    /// Like [`Iapi::selection_create`] over a row-major mesh of shape `dims`.
    pub fn selection_create_nd(
        &self,
        ctype: ColumnType,
        array: &ArrayRef,
        dims: &[u64],
        cmp: CompareOp,
        bound: f64,
    ) -> Result<SelectionHandle> {
        let col = self.column_for(ctype, array)?;
        col.set_shape(dims)?;
        let expr = QExpr::compare(col.name(), cmp, bound);
        Ok(self.add_selection(Selection { expr, shape: dims.to_vec() }))
    }

    /// Joins two selections into a new one. Both inputs are consumed: their handles
    /// become invalid and their cached results are dropped.
    pub fn selection_combine(&self, h1: SelectionHandle, op: Combinator, h2: SelectionHandle) -> Result<SelectionHandle> {
        if h1 == h2 {
            return Err(Error::InvalidInput("cannot combine a selection with itself".to_string()));
        }
        let h = {
            let mut sel = self.selections.lock();
            let (Some(a), Some(b)) = (sel.map.get(&h1), sel.map.get(&h2)) else {
                return Err(Error::NotFound(format!("selection {} or {}", h1.0, h2.0)));
            };
            if a.shape != b.shape {
                return Err(Error::ShapeMismatch(format!("meshes {:?} and {:?}", a.shape, b.shape)));
            }
            let (Some(a), Some(b)) = (sel.map.remove(&h1), sel.map.remove(&h2)) else {
                return Err(Error::NotFound(format!("selection {} or {}", h1.0, h2.0)));
            };
            let expr = match op {
                Combinator::And => a.expr & b.expr,
                Combinator::Or => a.expr | b.expr,
                Combinator::Xor => a.expr ^ b.expr,
                Combinator::Nand => a.expr.nand(b.expr),
                Combinator::Nor => a.expr.nor(b.expr),
            };
            sel.next += 1;
            let h = SelectionHandle(sel.next);
            sel.map.insert(h, Selection { expr, shape: a.shape });
            h
        };
        let mut results = self.results.lock();
        results.remove(&h1);
        results.remove(&h2);
        Ok(h)
    }

    /// The expression behind a handle.
    pub fn selection_expr(&self, h: SelectionHandle) -> Result<QExpr> {
        Ok(self.selection(h)?.expr)
    }

    fn snapshot(&self, expr: &QExpr) -> Result<Snapshot> {
        let reg = self.registry.lock();
        expr.columns()
            .into_iter()
            .map(|c| {
                let key = c.to_ascii_lowercase();
                let col = reg.by_name.get(&key).cloned().ok_or_else(|| Error::NotFound(format!("array {c}")))?;
                Ok((key, col))
            })
            .collect::<Result<HashMap<_, _>>>()
            .map(Snapshot)
    }

    /// Upper bound of the number of hits, from the indexes alone.
    pub fn selection_estimate(&self, h: SelectionHandle) -> Result<u32> {
        if let Some(hits) = self.results.lock().get(&h) {
            return Ok(hits.count());
        }
        let s = self.selection(h)?;
        let snap = self.snapshot(&s.expr)?;
        let mut q = CountQuery::new(&snap);
        q.set_expr(s.expr)?;
        q.estimate()?;
        q.max_hits().ok_or(Error::NotComputed("estimate"))
    }

    /// The hits of a selection, evaluated on first use and cached until purged.
    pub fn selection_hits(&self, h: SelectionHandle) -> Result<Arc<Bitvector>> {
        if let Some(hits) = self.results.lock().get(&h) {
            return Ok(hits.clone());
        }
        let s = self.selection(h)?;
        let snap = self.snapshot(&s.expr)?;
        let mut q = CountQuery::new(&snap);
        q.set_expr(s.expr)?;
        q.evaluate()?;
        let hits = Arc::new(q.into_hits().ok_or(Error::NotComputed("hit vector"))?);
        if self.selections.lock().map.contains_key(&h) {
            self.results.lock().insert(h, hits.clone());
        } else {
            warn!(handle = h.0, "selection freed during evaluation, result not cached");
        }
        Ok(hits)
    }

    /// Exact number of hits.
    pub fn selection_evaluate(&self, h: SelectionHandle) -> Result<u32> {
        Ok(self.selection_hits(h)?.count())
    }

    /// Copies the elements of `base` at the hit rows into `out`, skipping the first
    /// `start` hits. Returns the number of elements copied.
    pub fn selection_read<T: Numeric>(&self, base: &ArrayRef, h: SelectionHandle, start: u64, out: &mut [T]) -> Result<usize> {
        let values = T::view(base).ok_or_else(|| {
            Error::InvalidInput(format!("a {:?} buffer cannot be read as {:?}", base.column_type(), T::TYPE))
        })?;
        let hits = self.selection_hits(h)?;
        let mut cursor = CoordinateCursor::new(&hits, &[hits.size() as u64])?;
        cursor.skip_hits(start);
        let mut n = 0;
        while n < out.len() {
            match cursor.next_position().and_then(|p| values.get(p as usize)) {
                Some(&v) => {
                    out[n] = v;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    /// Writes the mesh coordinates of the hits, one tuple of `ndims` values after
    /// the other, skipping the first `skip` hits. Returns the number of tuples.
    pub fn selection_get_coordinates(&self, h: SelectionHandle, out: &mut [u64], skip: u64) -> Result<usize> {
        let shape = self.selection(h)?.shape;
        let hits = self.selection_hits(h)?;
        coordinates_nd(&hits, &shape, skip, out)
    }

    /// Mesh shape of a selection.
    pub fn selection_shape(&self, h: SelectionHandle) -> Result<Vec<u64>> {
        Ok(self.selection(h)?.shape)
    }

    /// Releases a selection and its cached result.
    pub fn selection_free(&self, h: SelectionHandle) -> Result<()> {
        self.selections
            .lock()
            .map
            .remove(&h)
            .ok_or_else(|| Error::NotFound(format!("selection {}", h.0)))?;
        self.results.lock().remove(&h);
        Ok(())
    }

    /// Drops the cached result of a selection; the next evaluation recomputes it.
    pub fn selection_purge_results(&self, h: SelectionHandle) -> Result<()> {
        self.selection(h)?;
        self.results.lock().remove(&h);
        Ok(())
    }

    /// Drops every cached result.
    pub fn purge_all_results(&self) {
        self.results.lock().clear();
    }

    /// Number of live selections.
    pub fn num_selections(&self) -> usize {
        self.selections.lock().map.len()
    }
}

// ---------------------------------------------------------------
// coordinates

/// Resumable walk over the set bits of a bitvector, as coordinates in a row-major
/// mesh. Skipping moves over whole runs without visiting their positions.
#[derive(Debug, Clone)]
pub struct CoordinateCursor<'a> {
    dims: Vec<u64>,
    runs: IndexSet<'a>,
    current: Option<IndexRunIter>,
}

impl<'a> CoordinateCursor<'a> {
    /// A cursor over `hits`; the product of `dims` must equal the bitvector size.
    pub fn new(hits: &'a Bitvector, dims: &[u64]) -> Result<Self> {
        let product = dims.iter().try_fold(1_u64, |acc, &d| acc.checked_mul(d));
        if dims.is_empty() || product != Some(hits.size() as u64) {
            return Err(Error::ShapeMismatch(format!(
                "mesh {dims:?} does not match a selection over {} rows",
                hits.size()
            )));
        }
        Ok(CoordinateCursor { dims: dims.to_vec(), runs: hits.index_set(), current: None })
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Passes over the next `n` hits; returns how many there were.
    pub fn skip_hits(&mut self, n: u64) -> u64 {
        let mut left = n;
        while left > 0 {
            match self.current.as_mut() {
                Some(IndexRunIter::Range(r)) => {
                    let k = left.min((r.end - r.start) as u64);
                    r.start += k as u32;
                    left -= k;
                    if r.start == r.end {
                        self.current = None;
                    }
                }
                Some(IndexRunIter::List(l, i)) => {
                    let k = left.min((l.as_slice().len() - *i) as u64);
                    *i += k as usize;
                    left -= k;
                    if *i == l.as_slice().len() {
                        self.current = None;
                    }
                }
                None => match self.runs.next() {
                    Some(run) if (run.len() as u64) <= left => left -= run.len() as u64,
                    Some(run) => self.current = Some(run.into_iter()),
                    None => break,
                },
            }
        }
        n - left
    }

    /// Flat position of the next hit.
    pub fn next_position(&mut self) -> Option<u32> {
        loop {
            if let Some(p) = self.current.as_mut().and_then(Iterator::next) {
                return Some(p);
            }
            let run: IndexRun = self.runs.next()?;
            self.current = Some(run.into_iter());
        }
    }

    /// Writes the coordinates of the next hit into `out[..ndims]`.
    pub fn next_into(&mut self, out: &mut [u64]) -> bool {
        let Some(p) = self.next_position() else { return false };
        let mut rest = p as u64;
        for (o, &d) in out.iter_mut().zip(&self.dims).rev() {
            *o = rest % d;
            rest /= d;
        }
        true
    }
}

impl Iterator for CoordinateCursor<'_> {
    type Item = Vec<u64>;
    fn next(&mut self) -> Option<Vec<u64>> {
        let mut c = vec![0; self.dims.len()];
        self.next_into(&mut c).then_some(c)
    }
}

/// Positions of the hits after the first `skip`; returns the number written.
pub fn coordinates_1d(hits: &Bitvector, skip: u64, out: &mut [u64]) -> usize {
    let mut cursor = CoordinateCursor { dims: vec![hits.size() as u64], runs: hits.index_set(), current: None };
    cursor.skip_hits(skip);
    fill(&mut cursor, out.iter_mut().map(std::slice::from_mut))
}

/// writes one tuple per slot until the cursor runs dry
fn fill<'s>(cursor: &mut CoordinateCursor<'_>, slots: impl Iterator<Item = &'s mut [u64]>) -> usize {
    let mut n = 0;
    for slot in slots {
        if !cursor.next_into(slot) {
            break;
        }
        n += 1;
    }
    n
}

/// Row-major `(i, j)` coordinates of the hits after the first `skip`.
pub fn coordinates_2d(hits: &Bitvector, dims: [u64; 2], skip: u64, out: &mut [[u64; 2]]) -> Result<usize> {
    let mut cursor = CoordinateCursor::new(hits, &dims)?;
    cursor.skip_hits(skip);
    Ok(fill(&mut cursor, out.iter_mut().map(|o| &mut o[..])))
}

/// Row-major `(i, j, k)` coordinates of the hits after the first `skip`.
pub fn coordinates_3d(hits: &Bitvector, dims: [u64; 3], skip: u64, out: &mut [[u64; 3]]) -> Result<usize> {
    let mut cursor = CoordinateCursor::new(hits, &dims)?;
    cursor.skip_hits(skip);
    Ok(fill(&mut cursor, out.iter_mut().map(|o| &mut o[..])))
}

/// Coordinates in a mesh of any rank, written tuple after tuple into `out`; as many
/// whole tuples as fit. Returns the number of tuples.
pub fn coordinates_nd(hits: &Bitvector, dims: &[u64], skip: u64, out: &mut [u64]) -> Result<usize> {
    let mut cursor = CoordinateCursor::new(hits, dims)?;
    cursor.skip_hits(skip);
    Ok(fill(&mut cursor, out.chunks_exact_mut(dims.len())))
}

/// The facade with integer results: a handle or count on success, the negative
/// [`Error::code`] on failure.
pub mod status {
    use super::*;

    fn code<T>(what: &str, r: Result<T>, ok: impl FnOnce(T) -> i64) -> i64 {
        match r {
            Ok(v) => ok(v),
            Err(e) => {
                warn!(call = what, error = %e, "iapi call failed");
                e.code()
            }
        }
    }

    fn handle(h: i64) -> Result<SelectionHandle> {
        u64::try_from(h)
            .ok()
            .filter(|&h| h > 0)
            .map(SelectionHandle)
            .ok_or_else(|| Error::InvalidInput(format!("{h} is not a selection handle")))
    }

    fn raw(h: SelectionHandle) -> i64 {
        h.0 as i64
    }

    /// 0 new, 1 buffer known, 2 name known, negative on error.
    pub fn iapi_register_array(name: &str, array: &ArrayRef) -> i64 {
        code("register_array", Iapi::global().register_array(name, array), Registration::code)
    }

    /// Like [`iapi_register_array`], with a private copy.
    pub fn iapi_register_owned_array(name: &str, array: &ArrayRef) -> i64 {
        code("register_owned_array", Iapi::global().register_owned_array(name, array), Registration::code)
    }

    /// 0 or a negative code.
    pub fn iapi_extend_array(name: &str, array: &ArrayRef) -> i64 {
        code("extend_array", Iapi::global().extend_array(name, array), |_| 0)
    }

    /// 0 or a negative code.
    pub fn iapi_build_index(name: &str, options: &str) -> i64 {
        code("build_index", Iapi::global().build_index(name, options), |_| 0)
    }

    /// 0 or a negative code.
    pub fn iapi_free_array(name: &str) -> i64 {
        code("free_array", Iapi::global().free_array(name), |_| 0)
    }

    /// A positive handle or a negative code.
    pub fn selection_create(ctype: ColumnType, array: &ArrayRef, cmp: CompareOp, bound: f64) -> i64 {
        code("selection_create", Iapi::global().selection_create(ctype, array, cmp, bound), raw)
    }

    /// A positive handle or a negative code.
    pub fn selection_create_nd(ctype: ColumnType, array: &ArrayRef, dims: &[u64], cmp: CompareOp, bound: f64) -> i64 {
        code("selection_create_nd", Iapi::global().selection_create_nd(ctype, array, dims, cmp, bound), raw)
    }

    /// A positive handle or a negative code.
    pub fn selection_combine(h1: i64, op: Combinator, h2: i64) -> i64 {
        let r = handle(h1).and_then(|a| Iapi::global().selection_combine(a, op, handle(h2)?));
        code("selection_combine", r, raw)
    }

    /// Upper bound of the hits or a negative code.
    pub fn selection_estimate(h: i64) -> i64 {
        code("selection_estimate", handle(h).and_then(|h| Iapi::global().selection_estimate(h)), i64::from)
    }

    /// Number of hits or a negative code.
    pub fn selection_evaluate(h: i64) -> i64 {
        code("selection_evaluate", handle(h).and_then(|h| Iapi::global().selection_evaluate(h)), i64::from)
    }

    /// Elements copied or a negative code.
    pub fn selection_read<T: Numeric>(base: &ArrayRef, h: i64, out: &mut [T], start: u64) -> i64 {
        let r = handle(h).and_then(|h| Iapi::global().selection_read(base, h, start, out));
        code("selection_read", r, |n| n as i64)
    }

    /// Tuples copied or a negative code.
    pub fn selection_get_coordinates(h: i64, out: &mut [u64], skip: u64) -> i64 {
        let r = handle(h).and_then(|h| Iapi::global().selection_get_coordinates(h, out, skip));
        code("selection_get_coordinates", r, |n| n as i64)
    }

    /// 0 or a negative code.
    pub fn selection_free(h: i64) -> i64 {
        code("selection_free", handle(h).and_then(|h| Iapi::global().selection_free(h)), |_| 0)
    }

    /// 0 or a negative code.
    pub fn selection_purge_results(h: i64) -> i64 {
        code("selection_purge_results", handle(h).and_then(|h| Iapi::global().selection_purge_results(h)), |_| 0)
    }
}
