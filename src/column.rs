//! Typed column arrays with a validity mask.
//!
//! A [`Column`] wraps an [`ArrayRef`] (one `Arc<[T]>` per element type) together with a
//! null mask, cached extrema and the column's [`Index`] state. The array is either
//! *owned* by the column or *borrowed*: the application keeps the `Arc` and the column
//! only holds a `Weak`, keyed by the buffer address. Reading a borrowed column whose
//! buffer was dropped yields [`Error::NotFound`].
//!
//! All numeric element types implement [`Numeric`]; the scanning and binning code is
//! written once against that trait and instantiated per type through a `with_numeric!` dispatch.
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::bitvector::{Bitvector, IndexRun};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::options::IndexOptions;
use crate::qexpr::{ContinuousRange, DiscreteRange};

/// Element type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// i8
    Byte,
    /// u8
    UByte,
    /// i16
    Short,
    /// u16
    UShort,
    /// i32
    Int,
    /// u32
    UInt,
    /// i64
    Long,
    /// u64
    ULong,
    /// f32
    Float,
    /// f64
    Double,
    /// dictionary codes (u32)
    Category,
    /// strings, only usable with string equality
    Text,
}

impl ColumnType {
    /// Size of one element in bytes (strings count as a pointer-sized handle).
    pub fn element_size(self) -> usize {
        match self {
            ColumnType::Byte | ColumnType::UByte => 1,
            ColumnType::Short | ColumnType::UShort => 2,
            ColumnType::Int | ColumnType::UInt | ColumnType::Float | ColumnType::Category => 4,
            ColumnType::Long | ColumnType::ULong | ColumnType::Double => 8,
            ColumnType::Text => std::mem::size_of::<usize>(),
        }
    }

    /// Integer types (including categories).
    pub fn is_integer(self) -> bool {
        !matches!(self, ColumnType::Float | ColumnType::Double | ColumnType::Text)
    }

    /// Everything but text.
    pub fn is_numeric(self) -> bool {
        self != ColumnType::Text
    }
}

/// A numeric element type: comparable, summable and promotable to `f64`.
pub trait Numeric: Copy + PartialOrd + fmt::Debug + Send + Sync + 'static {
    /// the column type of a plain array of this element
    const TYPE: ColumnType;
    /// integers get `max + 1` as the closing bin edge, floats `next_up(max)`
    const IS_INTEGER: bool;
    /// widening conversion
    fn to_f64(self) -> f64;
    /// the elements of `array` if it holds this type
    fn view(array: &ArrayRef) -> Option<&[Self]>;
    /// Ordering of the element against `bound`, `None` for NaN. Exact even where
    /// [`Numeric::to_f64`] rounds.
    #[inline]
    fn cmp_f64(self, bound: f64) -> Option<Ordering> {
        self.to_f64().partial_cmp(&bound)
    }
}

macro_rules! numeric {
    ($t:ty, $ctype:ident, $int:expr, $cmp:expr) => {
        impl Numeric for $t {
            const TYPE: ColumnType = ColumnType::$ctype;
            const IS_INTEGER: bool = $int;
            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn view(array: &ArrayRef) -> Option<&[Self]> {
                match array {
                    ArrayRef::$ctype(v) => Some(&v[..]),
                    _ => None,
                }
            }
            #[inline]
            fn cmp_f64(self, bound: f64) -> Option<Ordering> {
                ($cmp)(self, bound)
            }
        }
    };
    ($t:ty, $ctype:ident, $int:expr) => {
        numeric!($t, $ctype, $int, |x: $t, b: f64| (x as f64).partial_cmp(&b));
    };
}

/// `2^63` and `2^64`, both exact in `f64`
const TWO_63: f64 = 9_223_372_036_854_775_808.0;
const TWO_64: f64 = 18_446_744_073_709_551_616.0;

/// Orders `x` against `b` by its integral part, then by the fraction `b` has left over.
fn cmp_split(x: Ordering, fraction: f64) -> Ordering {
    x.then(if fraction > 0.0 {
        Ordering::Less
    } else if fraction < 0.0 {
        Ordering::Greater
    } else {
        Ordering::Equal
    })
}

fn cmp_i64(x: i64, b: f64) -> Option<Ordering> {
    if b.is_nan() {
        None
    } else if b >= TWO_63 {
        Some(Ordering::Less)
    } else if b < -TWO_63 {
        Some(Ordering::Greater)
    } else {
        let t = b.trunc();
        Some(cmp_split(x.cmp(&(t as i64)), b - t))
    }
}

fn cmp_u64(x: u64, b: f64) -> Option<Ordering> {
    if b.is_nan() {
        None
    } else if b >= TWO_64 {
        Some(Ordering::Less)
    } else if b < 0.0 {
        Some(Ordering::Greater)
    } else {
        let t = b.trunc();
        Some(cmp_split(x.cmp(&(t as u64)), b - t))
    }
}

numeric!(i8, Byte, true);
numeric!(u8, UByte, true);
numeric!(i16, Short, true);
numeric!(u16, UShort, true);
numeric!(i32, Int, true);
impl Numeric for u32 {
    const TYPE: ColumnType = ColumnType::UInt;
    const IS_INTEGER: bool = true;
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn view(array: &ArrayRef) -> Option<&[Self]> {
        match array {
            ArrayRef::UInt(v) | ArrayRef::Category(v) => Some(&v[..]),
            _ => None,
        }
    }
}
numeric!(i64, Long, true, cmp_i64);
numeric!(u64, ULong, true, cmp_u64);
numeric!(f32, Float, false);
numeric!(f64, Double, false);

/// Shared, type-erased array of column values.
#[derive(Clone)]
pub enum ArrayRef {
    /// i8 values
    Byte(Arc<[i8]>),
    /// u8 values
    UByte(Arc<[u8]>),
    /// i16 values
    Short(Arc<[i16]>),
    /// u16 values
    UShort(Arc<[u16]>),
    /// i32 values
    Int(Arc<[i32]>),
    /// u32 values
    UInt(Arc<[u32]>),
    /// i64 values
    Long(Arc<[i64]>),
    /// u64 values
    ULong(Arc<[u64]>),
    /// f32 values
    Float(Arc<[f32]>),
    /// f64 values
    Double(Arc<[f64]>),
    /// category codes
    Category(Arc<[u32]>),
    /// strings
    Text(Arc<[String]>),
}

/// Runs `$body` with `$v` bound to the typed `Arc<[T]>` of a numeric array, or
/// `$fallback` with `$text` bound to the strings of a text array.
macro_rules! with_numeric {
    ($array:expr, $v:ident => $body:expr, $text:ident => $fallback:expr) => {
        match $array {
            $crate::column::ArrayRef::Byte($v) => $body,
            $crate::column::ArrayRef::UByte($v) => $body,
            $crate::column::ArrayRef::Short($v) => $body,
            $crate::column::ArrayRef::UShort($v) => $body,
            $crate::column::ArrayRef::Int($v) => $body,
            $crate::column::ArrayRef::UInt($v) => $body,
            $crate::column::ArrayRef::Long($v) => $body,
            $crate::column::ArrayRef::ULong($v) => $body,
            $crate::column::ArrayRef::Float($v) => $body,
            $crate::column::ArrayRef::Double($v) => $body,
            $crate::column::ArrayRef::Category($v) => $body,
            $crate::column::ArrayRef::Text($text) => $fallback,
        }
    };
}
pub(crate) use with_numeric;

macro_rules! array_from {
    ($t:ty, $variant:ident) => {
        impl From<Vec<$t>> for ArrayRef {
            fn from(v: Vec<$t>) -> Self {
                ArrayRef::$variant(v.into())
            }
        }
        impl From<Arc<[$t]>> for ArrayRef {
            fn from(v: Arc<[$t]>) -> Self {
                ArrayRef::$variant(v)
            }
        }
    };
}

array_from!(i8, Byte);
array_from!(u8, UByte);
array_from!(i16, Short);
array_from!(u16, UShort);
array_from!(i32, Int);
array_from!(u32, UInt);
array_from!(i64, Long);
array_from!(u64, ULong);
array_from!(f32, Float);
array_from!(f64, Double);
array_from!(String, Text);

impl fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayRef({:?}; {} @ {:#x})", self.column_type(), self.len(), self.address())
    }
}

/// the logic of a deep copy: fallible reservation first, so a failed allocation
/// leaves nothing behind
fn try_copy<T: Clone>(v: &[T]) -> Result<Arc<[T]>> {
    let mut out = Vec::new();
    out.try_reserve_exact(v.len()).map_err(|e| {
        Error::ResourceExhausted(format!("copying {} elements: {e}", v.len()))
    })?;
    out.extend_from_slice(v);
    Ok(out.into())
}

impl ArrayRef {
    /// A category array from dictionary codes.
    pub fn category(codes: Vec<u32>) -> Self {
        ArrayRef::Category(codes.into())
    }

    /// Element type.
    pub fn column_type(&self) -> ColumnType {
        match self {
            ArrayRef::Byte(_) => ColumnType::Byte,
            ArrayRef::UByte(_) => ColumnType::UByte,
            ArrayRef::Short(_) => ColumnType::Short,
            ArrayRef::UShort(_) => ColumnType::UShort,
            ArrayRef::Int(_) => ColumnType::Int,
            ArrayRef::UInt(_) => ColumnType::UInt,
            ArrayRef::Long(_) => ColumnType::Long,
            ArrayRef::ULong(_) => ColumnType::ULong,
            ArrayRef::Float(_) => ColumnType::Float,
            ArrayRef::Double(_) => ColumnType::Double,
            ArrayRef::Category(_) => ColumnType::Category,
            ArrayRef::Text(_) => ColumnType::Text,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        with_numeric!(self, v => v.len(), s => s.len())
    }

    /// `true` for zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of the first element; identifies the buffer in the registries.
    pub fn address(&self) -> usize {
        with_numeric!(self, v => Arc::as_ptr(v) as *const u8 as usize, s => Arc::as_ptr(s) as *const u8 as usize)
    }

    /// Value at `row` promoted to `f64`, `None` for text or out of range.
    pub fn get_f64(&self, row: usize) -> Option<f64> {
        with_numeric!(self, v => v.get(row).map(|x| x.to_f64()), _s => None)
    }

    /// A copy in freshly allocated memory.
    pub fn deep_copy(&self) -> Result<ArrayRef> {
        Ok(match self {
            ArrayRef::Byte(v) => ArrayRef::Byte(try_copy(v)?),
            ArrayRef::UByte(v) => ArrayRef::UByte(try_copy(v)?),
            ArrayRef::Short(v) => ArrayRef::Short(try_copy(v)?),
            ArrayRef::UShort(v) => ArrayRef::UShort(try_copy(v)?),
            ArrayRef::Int(v) => ArrayRef::Int(try_copy(v)?),
            ArrayRef::UInt(v) => ArrayRef::UInt(try_copy(v)?),
            ArrayRef::Long(v) => ArrayRef::Long(try_copy(v)?),
            ArrayRef::ULong(v) => ArrayRef::ULong(try_copy(v)?),
            ArrayRef::Float(v) => ArrayRef::Float(try_copy(v)?),
            ArrayRef::Double(v) => ArrayRef::Double(try_copy(v)?),
            ArrayRef::Category(v) => ArrayRef::Category(try_copy(v)?),
            ArrayRef::Text(v) => ArrayRef::Text(try_copy(v)?),
        })
    }

    /// A weak handle that does not keep the buffer alive.
    pub fn downgrade(&self) -> WeakArray {
        match self {
            ArrayRef::Byte(v) => WeakArray::Byte(Arc::downgrade(v)),
            ArrayRef::UByte(v) => WeakArray::UByte(Arc::downgrade(v)),
            ArrayRef::Short(v) => WeakArray::Short(Arc::downgrade(v)),
            ArrayRef::UShort(v) => WeakArray::UShort(Arc::downgrade(v)),
            ArrayRef::Int(v) => WeakArray::Int(Arc::downgrade(v)),
            ArrayRef::UInt(v) => WeakArray::UInt(Arc::downgrade(v)),
            ArrayRef::Long(v) => WeakArray::Long(Arc::downgrade(v)),
            ArrayRef::ULong(v) => WeakArray::ULong(Arc::downgrade(v)),
            ArrayRef::Float(v) => WeakArray::Float(Arc::downgrade(v)),
            ArrayRef::Double(v) => WeakArray::Double(Arc::downgrade(v)),
            ArrayRef::Category(v) => WeakArray::Category(Arc::downgrade(v)),
            ArrayRef::Text(v) => WeakArray::Text(Arc::downgrade(v)),
        }
    }

    /// Rows of `mask` (that exist in this array) whose value satisfies `pred`.
    /// The result has the size of `mask`.
    pub fn scan(&self, mask: &Bitvector, pred: impl Fn(f64) -> bool) -> Result<Bitvector> {
        with_numeric!(self, v => scan_typed(v, mask, |x| pred(x.to_f64())), _s => Err(Error::UnsupportedType {
            ctype: ColumnType::Text,
            op: "numeric comparison",
        }))
    }

    /// Rows of `mask` whose value lies in `range`, compared in the element type.
    pub fn scan_range(&self, mask: &Bitvector, range: &ContinuousRange) -> Result<Bitvector> {
        with_numeric!(self, v => scan_typed(v, mask, |&x| range.contains_value(x)), _s => Err(Error::UnsupportedType {
            ctype: ColumnType::Text,
            op: "numeric comparison",
        }))
    }

    /// Rows of `mask` whose value is one of `set`, compared in the element type.
    pub fn scan_set(&self, mask: &Bitvector, set: &DiscreteRange) -> Result<Bitvector> {
        with_numeric!(self, v => scan_typed(v, mask, |&x| set.contains_value(x)), _s => Err(Error::UnsupportedType {
            ctype: ColumnType::Text,
            op: "numeric comparison",
        }))
    }

    /// Rows of `mask` whose string satisfies `pred`.
    pub fn scan_text(&self, mask: &Bitvector, pred: impl Fn(&str) -> bool) -> Result<Bitvector> {
        match self {
            ArrayRef::Text(s) => scan_typed(s, mask, |x| pred(x.as_str())),
            other => Err(Error::UnsupportedType {
                ctype: other.column_type(),
                op: "string equality",
            }),
        }
    }
}

fn scan_typed<T>(values: &[T], mask: &Bitvector, pred: impl Fn(&T) -> bool) -> Result<Bitvector> {
    let mut hits = Bitvector::new();
    for p in mask.ones() {
        match values.get(p as usize) {
            Some(x) if pred(x) => hits.set_bit(p, true)?,
            Some(_) => {}
            None => break,
        }
    }
    hits.adjust_size(false, mask.size());
    Ok(hits)
}

/// Values at the rows of `mask`, in row order, converted by `f`.
fn gather<S: Copy, T>(values: &[S], mask: &Bitvector, f: impl Fn(S) -> T) -> Vec<T> {
    let mut out = Vec::with_capacity(mask.count() as usize);
    for run in mask.index_set() {
        match run {
            IndexRun::Range(r) => {
                let end = (r.end as usize).min(values.len());
                let start = (r.start as usize).min(end);
                out.extend(values[start..end].iter().map(|&v| f(v)));
            }
            IndexRun::List(l) => {
                out.extend(l.as_slice().iter().filter_map(|&p| values.get(p as usize)).map(|&v| f(v)))
            }
        }
    }
    out
}

/// Non-owning counterpart of [`ArrayRef`].
#[derive(Clone, Debug)]
pub enum WeakArray {
    /// i8 values
    Byte(Weak<[i8]>),
    /// u8 values
    UByte(Weak<[u8]>),
    /// i16 values
    Short(Weak<[i16]>),
    /// u16 values
    UShort(Weak<[u16]>),
    /// i32 values
    Int(Weak<[i32]>),
    /// u32 values
    UInt(Weak<[u32]>),
    /// i64 values
    Long(Weak<[i64]>),
    /// u64 values
    ULong(Weak<[u64]>),
    /// f32 values
    Float(Weak<[f32]>),
    /// f64 values
    Double(Weak<[f64]>),
    /// category codes
    Category(Weak<[u32]>),
    /// strings
    Text(Weak<[String]>),
}

impl WeakArray {
    /// The array, if the application still holds it.
    pub fn upgrade(&self) -> Option<ArrayRef> {
        Some(match self {
            WeakArray::Byte(v) => ArrayRef::Byte(v.upgrade()?),
            WeakArray::UByte(v) => ArrayRef::UByte(v.upgrade()?),
            WeakArray::Short(v) => ArrayRef::Short(v.upgrade()?),
            WeakArray::UShort(v) => ArrayRef::UShort(v.upgrade()?),
            WeakArray::Int(v) => ArrayRef::Int(v.upgrade()?),
            WeakArray::UInt(v) => ArrayRef::UInt(v.upgrade()?),
            WeakArray::Long(v) => ArrayRef::Long(v.upgrade()?),
            WeakArray::ULong(v) => ArrayRef::ULong(v.upgrade()?),
            WeakArray::Float(v) => ArrayRef::Float(v.upgrade()?),
            WeakArray::Double(v) => ArrayRef::Double(v.upgrade()?),
            WeakArray::Category(v) => ArrayRef::Category(v.upgrade()?),
            WeakArray::Text(v) => ArrayRef::Text(v.upgrade()?),
        })
    }
}

/// Who is responsible for the memory behind a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// the application; the column only keeps a weak reference
    Borrowed,
    /// the column; released together with it
    Owned,
}

enum Buffer {
    Borrowed(WeakArray),
    Owned(ArrayRef),
}

/// Lifecycle of a column's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// no index; queries scan the data
    Unbuilt,
    /// built from the current data
    Built,
    /// supplied from outside (attach / reconstruct), not derived from the data
    AttachedExternal,
    /// the data changed after the index was made; not used until rebuilt
    Stale,
}

struct ColumnData {
    buffer: Buffer,
    ctype: ColumnType,
    nrows: u32,
    null_mask: Arc<Bitvector>,
    shape: Vec<u64>,
    extremes: Option<(f64, f64)>,
    index: Option<Arc<Index>>,
    index_state: IndexState,
    index_options: IndexOptions,
    version: u64,
}

/// A named column: values, validity mask and index.
pub struct Column {
    name: String,
    data: RwLock<ColumnData>,
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.data.read();
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("type", &d.ctype)
            .field("nrows", &d.nrows)
            .field("index_state", &d.index_state)
            .finish_non_exhaustive()
    }
}

fn checked_rows(array: &ArrayRef) -> Result<u32> {
    u32::try_from(array.len())
        .ok()
        .filter(|&n| n < u32::MAX)
        .ok_or_else(|| Error::InvalidInput(format!("{} rows exceed the supported maximum", array.len())))
}

impl Column {
    fn with_buffer(name: &str, buffer: Buffer, array: &ArrayRef) -> Result<Self> {
        let nrows = checked_rows(array)?;
        Ok(Column {
            name: name.to_string(),
            data: RwLock::new(ColumnData {
                buffer,
                ctype: array.column_type(),
                nrows,
                null_mask: Arc::new(Bitvector::filled(true, nrows)),
                shape: vec![nrows as u64],
                extremes: None,
                index: None,
                index_state: IndexState::Unbuilt,
                index_options: IndexOptions::default(),
                version: 0,
            }),
        })
    }

    /// A column owning `array`.
    pub fn new(name: &str, array: ArrayRef) -> Result<Self> {
        let buffer = Buffer::Owned(array.clone());
        Column::with_buffer(name, buffer, &array)
    }

    /// A column over an application buffer; only a weak reference is kept.
    pub fn borrowed(name: &str, array: &ArrayRef) -> Result<Self> {
        Column::with_buffer(name, Buffer::Borrowed(array.downgrade()), array)
    }

    /// Replaces the validity mask (1 = valid). It must have one bit per row.
    pub fn with_null_mask(self, mask: Bitvector) -> Result<Self> {
        self.set_null_mask(mask)?;
        Ok(self)
    }

    /// Replaces the validity mask, see [`Column::with_null_mask`].
    pub fn set_null_mask(&self, mask: Bitvector) -> Result<()> {
        let mut d = self.data.write();
        if mask.size() != d.nrows {
            return Err(Error::ShapeMismatch(format!(
                "null mask of {} bits for column {} with {} rows",
                mask.size(),
                self.name,
                d.nrows
            )));
        }
        d.null_mask = Arc::new(mask);
        d.extremes = None;
        d.version += 1;
        if d.index.is_some() {
            d.index_state = IndexState::Stale;
        }
        Ok(())
    }

    /// Interprets the rows as a row-major N-d mesh.
    pub fn with_shape(self, dims: &[u64]) -> Result<Self> {
        self.set_shape(dims)?;
        Ok(self)
    }

    /// See [`Column::with_shape`].
    pub fn set_shape(&self, dims: &[u64]) -> Result<()> {
        let mut d = self.data.write();
        let product = dims.iter().try_fold(1_u64, |acc, &n| acc.checked_mul(n));
        if dims.is_empty() || product != Some(d.nrows as u64) {
            return Err(Error::ShapeMismatch(format!(
                "mesh {dims:?} does not cover the {} rows of {}",
                d.nrows, self.name
            )));
        }
        d.shape = dims.to_vec();
        Ok(())
    }

    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type.
    pub fn column_type(&self) -> ColumnType {
        self.data.read().ctype
    }

    /// Number of rows.
    pub fn nrows(&self) -> u32 {
        self.data.read().nrows
    }

    /// Mesh shape (a single dimension unless set with [`Column::with_shape`]).
    pub fn shape(&self) -> Vec<u64> {
        self.data.read().shape.clone()
    }

    /// Borrowed or owned.
    pub fn ownership(&self) -> Ownership {
        match self.data.read().buffer {
            Buffer::Borrowed(_) => Ownership::Borrowed,
            Buffer::Owned(_) => Ownership::Owned,
        }
    }

    /// The values. Fails if a borrowed buffer has been released by the application.
    pub fn values(&self) -> Result<ArrayRef> {
        match &self.data.read().buffer {
            Buffer::Owned(a) => Ok(a.clone()),
            Buffer::Borrowed(w) => w
                .upgrade()
                .ok_or_else(|| Error::NotFound(format!("buffer of column {} was released", self.name))),
        }
    }

    /// Validity mask, one bit per row.
    pub fn null_mask(&self) -> Arc<Bitvector> {
        self.data.read().null_mask.clone()
    }

    /// Re-points the column at `array`, which holds the old rows plus new ones.
    /// New rows are valid; an existing index becomes stale.
    pub fn extend(&self, array: &ArrayRef, ownership: Ownership) -> Result<()> {
        let nrows = checked_rows(array)?;
        let mut d = self.data.write();
        if array.column_type() != d.ctype {
            return Err(Error::InvalidInput(format!(
                "cannot extend {:?} column {} with {:?} values",
                d.ctype,
                self.name,
                array.column_type()
            )));
        }
        if nrows < d.nrows {
            return Err(Error::InvalidInput(format!(
                "column {} has {} rows, the new buffer only {nrows}",
                self.name, d.nrows
            )));
        }
        let mut mask = (*d.null_mask).clone();
        mask.adjust_size(true, nrows);
        d.null_mask = Arc::new(mask);
        d.buffer = match ownership {
            Ownership::Borrowed => Buffer::Borrowed(array.downgrade()),
            Ownership::Owned => Buffer::Owned(array.clone()),
        };
        if d.shape.len() <= 1 {
            d.shape = vec![nrows as u64];
        }
        debug!(column = %self.name, from = d.nrows, to = nrows, "extending column");
        d.nrows = nrows;
        d.extremes = None;
        d.version += 1;
        if d.index.is_some() {
            d.index_state = IndexState::Stale;
        }
        Ok(())
    }

    /// Smallest and largest valid value, computed by a scan and cached.
    pub fn actual_range(&self) -> Result<(f64, f64)> {
        if let Some(r) = self.data.read().extremes {
            return Ok(r);
        }
        let values = self.values()?;
        let mask = self.null_mask();
        let range = with_numeric!(&values, v => typed_range(v, &mask), _s => None).ok_or_else(|| {
            if values.column_type() == ColumnType::Text {
                Error::UnsupportedType { ctype: ColumnType::Text, op: "min/max" }
            } else {
                Error::NotFound(format!("column {} has no valid values", self.name))
            }
        })?;
        self.data.write().extremes = Some(range);
        Ok(range)
    }

    /// Smallest valid value.
    pub fn actual_min(&self) -> Result<f64> {
        Ok(self.actual_range()?.0)
    }

    /// Largest valid value.
    pub fn actual_max(&self) -> Result<f64> {
        Ok(self.actual_range()?.1)
    }

    // ---------------------------------------------------------------
    // index state machine

    /// Current index state.
    pub fn index_state(&self) -> IndexState {
        self.data.read().index_state
    }

    /// The index if it may be used, i.e. built or attached and not stale.
    pub fn index(&self) -> Option<Arc<Index>> {
        let d = self.data.read();
        match d.index_state {
            IndexState::Built | IndexState::AttachedExternal => d.index.clone(),
            IndexState::Unbuilt | IndexState::Stale => None,
        }
    }

    /// Builds the index with `options` from the current data.
    pub fn build_index(&self, options: IndexOptions) -> Result<Arc<Index>> {
        let values = self.values()?;
        let (mask, version) = {
            let d = self.data.read();
            (d.null_mask.clone(), d.version)
        };
        let index = Arc::new(Index::build(&values, &mask, options)?);
        let mut d = self.data.write();
        if d.version != version {
            return Err(Error::InvalidInput(format!(
                "column {} changed while its index was being built",
                self.name
            )));
        }
        info!(column = %self.name, kind = ?options.kind, bins = index.num_bins(), "built index");
        d.index = Some(index.clone());
        d.index_state = IndexState::Built;
        d.index_options = options;
        Ok(index)
    }

    /// Makes the unbuilt → built (or stale → built) transition if needed, with the
    /// options of the last build.
    pub fn ensure_index(&self) -> Result<Arc<Index>> {
        if let Some(index) = self.index() {
            return Ok(index);
        }
        let options = self.data.read().index_options;
        self.build_index(options)
    }

    /// Installs an externally supplied index without looking at the data.
    pub fn attach_index(&self, index: Index) -> Result<()> {
        let mut d = self.data.write();
        if index.nrows() != d.nrows {
            return Err(Error::ShapeMismatch(format!(
                "index over {} rows attached to column {} with {} rows",
                index.nrows(),
                self.name,
                d.nrows
            )));
        }
        info!(column = %self.name, bins = index.num_bins(), "attached external index");
        d.index_options = IndexOptions { kind: index.kind(), ..d.index_options };
        d.index = Some(Arc::new(index));
        d.index_state = IndexState::AttachedExternal;
        Ok(())
    }

    /// Drops the index.
    pub fn drop_index(&self) {
        let mut d = self.data.write();
        d.index = None;
        d.index_state = IndexState::Unbuilt;
    }

    // ---------------------------------------------------------------
    // selection of masked rows

    fn selected(&self, mask: &Bitvector) -> Result<(ArrayRef, Bitvector)> {
        let values = self.values()?;
        let valid = mask & &*self.null_mask();
        Ok((values, valid))
    }

    /// Valid rows of `mask` as `i32`; accepts BYTE, SHORT and INT columns.
    pub fn select_ints(&self, mask: &Bitvector) -> Result<Vec<i32>> {
        let (values, m) = self.selected(mask)?;
        match &values {
            ArrayRef::Byte(v) => Ok(gather(v, &m, i32::from)),
            ArrayRef::Short(v) => Ok(gather(v, &m, i32::from)),
            ArrayRef::Int(v) => Ok(gather(v, &m, |x| x)),
            other => Err(Error::UnsupportedType { ctype: other.column_type(), op: "select_ints" }),
        }
    }

    /// Valid rows of `mask` as `u32`; accepts UBYTE, USHORT, UINT and CATEGORY columns.
    pub fn select_uints(&self, mask: &Bitvector) -> Result<Vec<u32>> {
        let (values, m) = self.selected(mask)?;
        match &values {
            ArrayRef::UByte(v) => Ok(gather(v, &m, u32::from)),
            ArrayRef::UShort(v) => Ok(gather(v, &m, u32::from)),
            ArrayRef::UInt(v) | ArrayRef::Category(v) => Ok(gather(v, &m, |x| x)),
            other => Err(Error::UnsupportedType { ctype: other.column_type(), op: "select_uints" }),
        }
    }

    /// Valid rows of `mask` as `i64`; accepts LONG and every narrower integer type.
    pub fn select_longs(&self, mask: &Bitvector) -> Result<Vec<i64>> {
        let (values, m) = self.selected(mask)?;
        match &values {
            ArrayRef::Byte(v) => Ok(gather(v, &m, i64::from)),
            ArrayRef::UByte(v) => Ok(gather(v, &m, i64::from)),
            ArrayRef::Short(v) => Ok(gather(v, &m, i64::from)),
            ArrayRef::UShort(v) => Ok(gather(v, &m, i64::from)),
            ArrayRef::Int(v) => Ok(gather(v, &m, i64::from)),
            ArrayRef::UInt(v) | ArrayRef::Category(v) => Ok(gather(v, &m, i64::from)),
            ArrayRef::Long(v) => Ok(gather(v, &m, |x| x)),
            other => Err(Error::UnsupportedType { ctype: other.column_type(), op: "select_longs" }),
        }
    }

    /// Valid rows of `mask` as `u64`; accepts ULONG and every narrower unsigned type.
    pub fn select_ulongs(&self, mask: &Bitvector) -> Result<Vec<u64>> {
        let (values, m) = self.selected(mask)?;
        match &values {
            ArrayRef::UByte(v) => Ok(gather(v, &m, u64::from)),
            ArrayRef::UShort(v) => Ok(gather(v, &m, u64::from)),
            ArrayRef::UInt(v) | ArrayRef::Category(v) => Ok(gather(v, &m, u64::from)),
            ArrayRef::ULong(v) => Ok(gather(v, &m, |x| x)),
            other => Err(Error::UnsupportedType { ctype: other.column_type(), op: "select_ulongs" }),
        }
    }

    /// Valid rows of `mask` as `f32`; accepts FLOAT and the 8/16-bit integers.
    pub fn select_floats(&self, mask: &Bitvector) -> Result<Vec<f32>> {
        let (values, m) = self.selected(mask)?;
        match &values {
            ArrayRef::Byte(v) => Ok(gather(v, &m, f32::from)),
            ArrayRef::UByte(v) => Ok(gather(v, &m, f32::from)),
            ArrayRef::Short(v) => Ok(gather(v, &m, f32::from)),
            ArrayRef::UShort(v) => Ok(gather(v, &m, f32::from)),
            ArrayRef::Float(v) => Ok(gather(v, &m, |x| x)),
            other => Err(Error::UnsupportedType { ctype: other.column_type(), op: "select_floats" }),
        }
    }

    /// Valid rows of `mask` as `f64`; accepts everything up to 32-bit integers and
    /// both float types. 64-bit integers are refused since they don't fit losslessly.
    pub fn select_doubles(&self, mask: &Bitvector) -> Result<Vec<f64>> {
        let (values, m) = self.selected(mask)?;
        match &values {
            ArrayRef::Byte(v) => Ok(gather(v, &m, f64::from)),
            ArrayRef::UByte(v) => Ok(gather(v, &m, f64::from)),
            ArrayRef::Short(v) => Ok(gather(v, &m, f64::from)),
            ArrayRef::UShort(v) => Ok(gather(v, &m, f64::from)),
            ArrayRef::Int(v) => Ok(gather(v, &m, f64::from)),
            ArrayRef::UInt(v) | ArrayRef::Category(v) => Ok(gather(v, &m, f64::from)),
            ArrayRef::Float(v) => Ok(gather(v, &m, f64::from)),
            ArrayRef::Double(v) => Ok(gather(v, &m, |x| x)),
            other => Err(Error::UnsupportedType { ctype: other.column_type(), op: "select_doubles" }),
        }
    }
}

fn typed_range<T: Numeric>(values: &[T], mask: &Bitvector) -> Option<(f64, f64)> {
    let mut range: Option<(f64, f64)> = None;
    for p in mask.ones() {
        let Some(x) = values.get(p as usize) else { break };
        let x = x.to_f64();
        if x.is_nan() {
            continue;
        }
        range = Some(match range {
            None => (x, x),
            Some((lo, hi)) => (lo.min(x), hi.max(x)),
        });
    }
    range
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Column {
        Column::new("a", ArrayRef::from(vec![5_i32, 1, 1, 5, 9, 1, 5, 9, 9, 9])).unwrap()
    }

    #[test]
    fn test_basic_properties() {
        let c = sample();
        assert_eq!(c.name(), "a");
        assert_eq!(c.column_type(), ColumnType::Int);
        assert_eq!(c.nrows(), 10);
        assert_eq!(c.null_mask().count(), 10);
        assert_eq!(c.ownership(), Ownership::Owned);
        assert_eq!(c.actual_range().unwrap(), (1.0, 9.0));
    }

    #[test]
    fn test_select_preserves_row_order() {
        let c = sample();
        let mask = Bitvector::from_positions([0, 4, 5, 9], 10).unwrap();
        assert_eq!(c.select_ints(&mask).unwrap(), vec![5, 9, 1, 9]);
        assert_eq!(c.select_longs(&mask).unwrap(), vec![5, 9, 1, 9]);
        assert_eq!(c.select_doubles(&mask).unwrap(), vec![5.0, 9.0, 1.0, 9.0]);
    }

    #[test]
    fn test_select_widening_rules() {
        let c = sample();
        let all = Bitvector::filled(true, 10);
        assert!(matches!(c.select_uints(&all), Err(Error::UnsupportedType { .. })));
        assert!(matches!(c.select_floats(&all), Err(Error::UnsupportedType { .. })));

        let longs = Column::new("l", ArrayRef::from(vec![1_i64, 2])).unwrap();
        assert!(longs.select_doubles(&Bitvector::filled(true, 2)).is_err());
        assert!(longs.select_ints(&Bitvector::filled(true, 2)).is_err());

        let bytes = Column::new("b", ArrayRef::from(vec![200_u8, 3])).unwrap();
        let m = Bitvector::filled(true, 2);
        assert_eq!(bytes.select_uints(&m).unwrap(), vec![200, 3]);
        assert_eq!(bytes.select_floats(&m).unwrap(), vec![200.0, 3.0]);
        assert_eq!(bytes.select_ulongs(&m).unwrap(), vec![200, 3]);
    }

    #[test]
    fn test_nulls_are_skipped() {
        let mask = Bitvector::from_positions([0, 1, 2, 3, 4, 5, 6, 7], 10).unwrap();
        let c = sample().with_null_mask(mask).unwrap();
        let all = Bitvector::filled(true, 10);
        assert_eq!(c.select_ints(&all).unwrap(), vec![5, 1, 1, 5, 9, 1, 5, 9]);
        assert!(c.set_null_mask(Bitvector::filled(true, 3)).is_err());
    }

    #[test]
    fn test_borrowed_buffer_release() {
        let data = ArrayRef::from(vec![1.5_f64, 2.5]);
        let c = Column::borrowed("d", &data).unwrap();
        assert_eq!(c.ownership(), Ownership::Borrowed);
        assert_eq!(c.values().unwrap().address(), data.address());
        drop(data);
        assert!(matches!(c.values(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_extend_marks_index_stale() {
        let c = sample();
        c.build_index(IndexOptions::relic()).unwrap();
        assert_eq!(c.index_state(), IndexState::Built);

        let bigger = ArrayRef::from(vec![5_i32, 1, 1, 5, 9, 1, 5, 9, 9, 9, 42]);
        c.extend(&bigger, Ownership::Owned).unwrap();
        assert_eq!(c.nrows(), 11);
        assert_eq!(c.index_state(), IndexState::Stale);
        assert!(c.index().is_none());
        assert_eq!(c.actual_max().unwrap(), 42.0);

        c.ensure_index().unwrap();
        assert_eq!(c.index_state(), IndexState::Built);
        assert_eq!(c.index().unwrap().nrows(), 11);
    }

    #[test]
    fn test_extend_rejects_wrong_type_or_shrink() {
        let c = sample();
        assert!(c.extend(&ArrayRef::from(vec![1.0_f32; 20]), Ownership::Owned).is_err());
        assert!(c.extend(&ArrayRef::from(vec![1_i32; 3]), Ownership::Owned).is_err());
        assert_eq!(c.nrows(), 10);
    }

    #[test]
    fn test_shape() {
        let c = Column::new("m", ArrayRef::from(vec![0_u16; 12])).unwrap();
        assert!(Column::new("m", ArrayRef::from(vec![0_u16; 12])).unwrap().with_shape(&[5, 2]).is_err());
        let c = c.with_shape(&[3, 4]).unwrap();
        assert_eq!(c.shape(), vec![3, 4]);
    }

    #[test]
    fn test_scan() {
        let data = ArrayRef::from(vec![5_i32, 1, 1, 5, 9]);
        let mask = Bitvector::filled(true, 5);
        let hits = data.scan(&mask, |x| x == 5.0).unwrap();
        assert_eq!(hits.ones().collect::<Vec<_>>(), vec![0, 3]);

        let text = ArrayRef::from(vec!["x".to_string(), "y".to_string()]);
        assert!(text.scan(&mask, |_| true).is_err());
        let hits = text.scan_text(&Bitvector::filled(true, 2), |s| s == "y").unwrap();
        assert_eq!(hits.ones().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_cmp_f64_exact_for_64_bit() {
        let two_53 = 9_007_199_254_740_992.0_f64;
        assert_eq!((1_i64 << 53).cmp_f64(two_53), Some(Ordering::Equal));
        assert_eq!(((1_i64 << 53) + 1).cmp_f64(two_53), Some(Ordering::Greater));
        assert_eq!(i64::MAX.cmp_f64(9_223_372_036_854_775_808.0), Some(Ordering::Less));
        assert_eq!(i64::MIN.cmp_f64(-9_223_372_036_854_775_808.0), Some(Ordering::Equal));
        assert_eq!((-3_i64).cmp_f64(-2.5), Some(Ordering::Less));
        assert_eq!((-2_i64).cmp_f64(-2.5), Some(Ordering::Greater));
        assert_eq!(0_u64.cmp_f64(-1.0), Some(Ordering::Greater));
        assert_eq!(u64::MAX.cmp_f64(18_446_744_073_709_551_616.0), Some(Ordering::Less));
        assert_eq!(((1_u64 << 53) + 1).cmp_f64(two_53), Some(Ordering::Greater));
        assert_eq!(7_u64.cmp_f64(f64::NAN), None);
        assert_eq!(7_i32.cmp_f64(7.5), Some(Ordering::Less));
    }

    #[test]
    fn test_scan_range_long_beyond_2_53() {
        use crate::qexpr::CompareOp;
        let big = 1_i64 << 53;
        let data = ArrayRef::from(vec![big, big + 1, 5, big - 1]);
        let mask = Bitvector::filled(true, 4);
        let eq = ContinuousRange::compare("a", CompareOp::Eq, big as f64).unwrap();
        assert_eq!(data.scan_range(&mask, &eq).unwrap().ones().collect::<Vec<_>>(), vec![0]);
        let gt = ContinuousRange::compare("a", CompareOp::Gt, big as f64).unwrap();
        assert_eq!(data.scan_range(&mask, &gt).unwrap().ones().collect::<Vec<_>>(), vec![1]);
        let set = DiscreteRange::new("a", vec![big as f64, 5.0]);
        assert_eq!(data.scan_set(&mask, &set).unwrap().ones().collect::<Vec<_>>(), vec![0, 2]);
        // the f64 promotion cannot tell the first two apart
        assert_eq!(data.scan(&mask, |x| x == big as f64).unwrap().count(), 2);
    }

    #[test]
    fn test_deep_copy_is_a_new_buffer() {
        let data = ArrayRef::from(vec![1_u32, 2, 3]);
        let copy = data.deep_copy().unwrap();
        assert_ne!(copy.address(), data.address());
        assert_eq!(copy.len(), 3);
        assert_eq!(copy.get_f64(2), Some(3.0));
    }
}
