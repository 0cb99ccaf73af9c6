//! Word-aligned hybrid (WAH) compressed bitvector.
//!
//! The bits are split into groups of 31. Each group is stored in a 32-bit word:
//! * a *literal* word (MSB = 0) holds the 31 bits verbatim, the first bit of the
//!   group sitting in bit 30
//! * a *fill* word (MSB = 1) stands for a run of groups that are all 0 or all 1:
//!   bit 30 is the fill value, the lower 30 bits count the groups
//!
//! Bits that don't make up a full group yet live in the *active* word at the end.
//!
//! # Canonical form
//! A group that is all 0 or all 1 is **always** stored as (part of) a fill word and
//! neighbouring fills of the same value are merged. Hence two bitvectors with the same
//! bits have the same words and equality is a plain comparison of the words.
//!
//! # Size limit
//! Positions and sizes are `u32`. The largest size is [`MAX_BITS`], i.e. the largest
//! position that can be set is `MAX_BITS - 1`. Anything beyond that yields
//! [`Error::BitPositionOverflow`].
//!
//! # Example
//! ```rust
//! use binquery::bitvector::Bitvector;
//! let mut a = Bitvector::new();
//! a.set_bit(3, true).unwrap();
//! a.set_bit(100, true).unwrap();
//! let b = Bitvector::filled(true, 50);
//!
//! let both = &a & &b;
//! assert_eq!(both.size(), 101); // the shorter operand is padded with 0s
//! assert_eq!(both.ones().collect::<Vec<_>>(), vec![3]);
//! ```
use std::borrow::Cow;
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign, Not, Range};
use std::sync::atomic::{AtomicU64, Ordering};

use bitvec::prelude::{BitSlice, Msb0};
use bitvec::view::BitView;
use bitvec::field::BitField;

use crate::error::{Error, Result};

/// Largest number of bits a [`Bitvector`] can hold.
pub const MAX_BITS: u32 = u32::MAX;

/// number of bits per literal word
const MAXBITS: u32 = 31;
const ALLONES: u32 = 0x7FFF_FFFF;
const FILLBIT: u32 = 0x4000_0000;
const HEADER0: u32 = 0x8000_0000;
const HEADER1: u32 = 0xC000_0000;
const MAXCNT: u32 = 0x3FFF_FFFF;
/// sentinel for an invalidated popcount
const UNKNOWN_COUNT: u64 = u64::MAX;

#[inline]
fn is_fill(w: u32) -> bool {
    w & HEADER0 != 0
}

#[inline]
fn fill_val(w: u32) -> bool {
    w & FILLBIT != 0
}

#[inline]
fn fill_cnt(w: u32) -> u32 {
    w & MAXCNT
}

/// number of 31-bit groups represented by a word
#[inline]
fn groups(w: u32) -> u32 {
    if is_fill(w) {
        fill_cnt(w)
    } else {
        1
    }
}

#[inline]
fn low_mask(nbits: u32) -> u32 {
    if nbits >= 32 {
        u32::MAX
    } else {
        (1_u32 << nbits) - 1
    }
}

/// A compressed sequence of bits.
///
/// Cloning produces an independent deep copy.
pub struct Bitvector {
    words: Vec<u32>,
    nbits: u32,        // bits stored in `words`, a multiple of 31
    active: u32,       // the trailing partial group, right-aligned
    active_nbits: u32, // < 31
    cnt: AtomicU64,
}

impl Default for Bitvector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Bitvector {
    fn clone(&self) -> Self {
        Bitvector {
            words: self.words.clone(),
            nbits: self.nbits,
            active: self.active,
            active_nbits: self.active_nbits,
            cnt: AtomicU64::new(self.cnt.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for Bitvector {
    fn eq(&self, other: &Self) -> bool {
        self.nbits == other.nbits
            && self.active_nbits == other.active_nbits
            && self.active == other.active
            && self.words == other.words
    }
}

impl Eq for Bitvector {}

impl Bitvector {
    /// An empty bitvector (`size() == 0`).
    pub fn new() -> Self {
        Bitvector {
            words: Vec::new(),
            nbits: 0,
            active: 0,
            active_nbits: 0,
            cnt: AtomicU64::new(0),
        }
    }

    /// `n` bits, all set to `value`.
    pub fn filled(value: bool, n: u32) -> Self {
        let mut bv = Bitvector::new();
        bv.push_run(value, n);
        bv.invalidate();
        bv
    }

    /// Bitvector of `size` bits with exactly the given positions set.
    /// Positions may come in any order; ascending input is the fast path.
    pub fn from_positions(positions: impl IntoIterator<Item = u32>, size: u32) -> Result<Self> {
        let mut bv = Bitvector::new();
        for p in positions {
            if p >= size {
                return Err(Error::InvalidInput(format!(
                    "position {p} is outside a bitvector of {size} bits"
                )));
            }
            bv.set_bit(p, true)?;
        }
        bv.adjust_size(false, size);
        Ok(bv)
    }

    /// Number of bits.
    #[inline]
    pub fn size(&self) -> u32 {
        self.nbits + self.active_nbits
    }

    /// `true` if the bitvector has no bits at all (as opposed to all bits being 0).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of bits set to 1. Cached until the next mutation.
    pub fn count(&self) -> u32 {
        let cached = self.cnt.load(Ordering::Relaxed);
        if cached != UNKNOWN_COUNT {
            return cached as u32;
        }
        let mut n = 0_u32;
        for &w in &self.words {
            if is_fill(w) {
                if fill_val(w) {
                    n += fill_cnt(w) * MAXBITS;
                }
            } else {
                n += w.count_ones();
            }
        }
        n += self.active.count_ones();
        self.cnt.store(n as u64, Ordering::Relaxed);
        n
    }

    /// Approximate memory footprint in bytes, used for cost estimates.
    pub fn byte_size(&self) -> usize {
        (self.words.len() + 2) * std::mem::size_of::<u32>()
    }

    #[inline]
    fn invalidate(&self) {
        self.cnt.store(UNKNOWN_COUNT, Ordering::Relaxed);
    }

    fn check_room(&self, extra: u64) -> Result<()> {
        let end = self.size() as u64 + extra;
        if end > MAX_BITS as u64 {
            return Err(Error::BitPositionOverflow(end - 1));
        }
        Ok(())
    }

    /// Reads bit `pos`; bits beyond `size()` read as 0.
    pub fn get(&self, pos: u32) -> bool {
        if pos >= self.size() {
            return false;
        }
        if pos >= self.nbits {
            let shift = self.active_nbits - 1 - (pos - self.nbits);
            return (self.active >> shift) & 1 == 1;
        }
        let g = pos / MAXBITS;
        let mut seen = 0_u32;
        for &w in &self.words {
            let n = groups(w);
            if seen + n > g {
                return if is_fill(w) {
                    fill_val(w)
                } else {
                    (w >> (MAXBITS - 1 - pos % MAXBITS)) & 1 == 1
                };
            }
            seen += n;
        }
        false
    }

    /// Sets bit `pos` to `value`.
    ///
    /// If `pos >= size()` the bitvector grows, the gap is filled with 0s.
    /// Setting a bit inside a fill splits the fill; a literal that becomes uniform is
    /// folded back into its neighbouring fills.
    pub fn set_bit(&mut self, pos: u32, value: bool) -> Result<()> {
        if pos >= MAX_BITS {
            return Err(Error::BitPositionOverflow(pos as u64));
        }
        let sz = self.size();
        if pos >= sz {
            self.push_run(false, pos - sz);
            self.push_bit(value);
            self.invalidate();
            return Ok(());
        }
        if pos >= self.nbits {
            let bit = 1 << (self.active_nbits - 1 - (pos - self.nbits));
            if value {
                self.active |= bit;
            } else {
                self.active &= !bit;
            }
            self.invalidate();
            return Ok(());
        }

        let g = pos / MAXBITS;
        let bit = 1 << (MAXBITS - 1 - pos % MAXBITS);
        let mut seen = 0_u32;
        let mut i = 0;
        while i < self.words.len() {
            let w = self.words[i];
            let n = groups(w);
            if seen + n > g {
                break;
            }
            seen += n;
            i += 1;
        }
        let w = self.words[i];
        if is_fill(w) {
            if fill_val(w) == value {
                return Ok(());
            }
            let before = g - seen;
            let after = fill_cnt(w) - before - 1;
            let header = w & !MAXCNT;
            let literal = if value { bit } else { ALLONES & !bit };
            let mut replacement = Vec::with_capacity(3);
            if before > 0 {
                replacement.push(header | before);
            }
            replacement.push(literal);
            if after > 0 {
                replacement.push(header | after);
            }
            self.words.splice(i..i + 1, replacement);
        } else {
            let updated = if value { w | bit } else { w & !bit };
            if updated == w {
                return Ok(());
            }
            self.words[i] = updated;
            if updated == 0 || updated == ALLONES {
                self.recompress_from(i.saturating_sub(1));
            }
        }
        self.invalidate();
        Ok(())
    }

    /// Appends a single bit.
    pub fn append_bit(&mut self, value: bool) -> Result<()> {
        self.check_room(1)?;
        self.push_bit(value);
        self.invalidate();
        Ok(())
    }

    /// Appends `n` copies of `value`.
    pub fn append_fill(&mut self, value: bool, n: u32) -> Result<()> {
        self.check_room(n as u64)?;
        self.push_run(value, n);
        self.invalidate();
        Ok(())
    }

    /// Appends the 8 bits of `byte`, most significant bit first.
    pub fn append_byte(&mut self, byte: u8) -> Result<()> {
        self.append_bits(byte.view_bits::<Msb0>())
    }

    /// Appends a raw bit sequence, e.g. a bitmap handed over by an application.
    ///
    /// Once the active word is aligned, the bits are consumed 31 at a time so runs
    /// are merged into fills without going bit by bit.
    pub fn append_bits(&mut self, bits: &BitSlice<u8, Msb0>) -> Result<()> {
        self.check_room(bits.len() as u64)?;
        let head = if self.active_nbits == 0 {
            0
        } else {
            ((MAXBITS - self.active_nbits) as usize).min(bits.len())
        };
        let (head_bits, rest) = bits.split_at(head);
        for bit in head_bits.iter().by_vals() {
            self.push_bit(bit);
        }
        let mut chunks = rest.chunks_exact(MAXBITS as usize);
        for chunk in &mut chunks {
            self.append_literal(chunk.load_be::<u32>());
        }
        for bit in chunks.remainder().iter().by_vals() {
            self.push_bit(bit);
        }
        self.invalidate();
        Ok(())
    }

    /// Truncates or pads the bitvector to exactly `target` bits, padding with `fill`.
    pub fn adjust_size(&mut self, fill: bool, target: u32) {
        let sz = self.size();
        if target > sz {
            self.push_run(fill, target - sz);
        } else if target < sz {
            self.truncate(target);
        }
        self.invalidate();
    }

    /// Flips every bit in place.
    pub fn flip(&mut self) {
        for w in self.words.iter_mut() {
            if is_fill(*w) {
                *w ^= FILLBIT;
            } else {
                *w = !*w & ALLONES;
            }
        }
        self.active = !self.active & low_mask(self.active_nbits);
        self.invalidate();
    }

    /// `self & !other`.
    pub fn and_not(&self, other: &Bitvector) -> Bitvector {
        self.combine(other, BinOp::AndNot)
    }

    /// Iterates over the set bits as runs, see [`IndexSet`].
    pub fn index_set(&self) -> IndexSet<'_> {
        IndexSet {
            words: self.words.iter(),
            pos: 0,
            active: Some((self.active, self.active_nbits)),
        }
    }

    /// Iterates over the positions of the set bits in ascending order.
    pub fn ones(&self) -> Ones<'_> {
        Ones {
            runs: self.index_set(),
            current: None,
        }
    }

    /// Serialized form: the compressed words followed by the active word and its bit count.
    pub fn to_words(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.words.len() + 2);
        out.extend_from_slice(&self.words);
        out.push(self.active);
        out.push(self.active_nbits);
        out
    }

    /// Inverse of [`Bitvector::to_words`]. Non-canonical input is recompressed.
    pub fn from_words(words: &[u32]) -> Result<Self> {
        if words.len() < 2 {
            return Err(Error::Corrupt(format!(
                "a serialized bitvector needs at least 2 words, got {}",
                words.len()
            )));
        }
        let (body, tail) = words.split_at(words.len() - 2);
        let (active, active_nbits) = (tail[0], tail[1]);
        if active_nbits >= MAXBITS || active & !low_mask(active_nbits) != 0 {
            return Err(Error::Corrupt(format!(
                "bad active word {active:#x} with {active_nbits} bits"
            )));
        }
        let total: u64 = body.iter().map(|&w| groups(w) as u64 * MAXBITS as u64).sum::<u64>()
            + active_nbits as u64;
        if total > MAX_BITS as u64 {
            return Err(Error::Corrupt(format!("{total} bits exceed the maximum size")));
        }
        let mut bv = Bitvector::new();
        for &w in body {
            if is_fill(w) {
                bv.append_fill_groups(fill_val(w), fill_cnt(w));
            } else {
                bv.append_literal(w);
            }
        }
        bv.active = active;
        bv.active_nbits = active_nbits;
        bv.invalidate();
        Ok(bv)
    }

    // ---------------------------------------------------------------
    // internal appends, no bounds checks

    fn push_bit(&mut self, value: bool) {
        self.active = (self.active << 1) | value as u32;
        self.active_nbits += 1;
        if self.active_nbits == MAXBITS {
            let w = self.active;
            self.active = 0;
            self.active_nbits = 0;
            self.append_literal(w);
        }
    }

    fn push_run(&mut self, value: bool, mut n: u32) {
        if n == 0 {
            return;
        }
        if self.active_nbits > 0 {
            let take = n.min(MAXBITS - self.active_nbits);
            let pattern = if value { low_mask(take) } else { 0 };
            self.active = (self.active << take) | pattern;
            self.active_nbits += take;
            n -= take;
            if self.active_nbits == MAXBITS {
                let w = self.active;
                self.active = 0;
                self.active_nbits = 0;
                self.append_literal(w);
            }
            if n == 0 {
                return;
            }
        }
        self.append_fill_groups(value, n / MAXBITS);
        let rest = n % MAXBITS;
        if rest > 0 {
            self.active = if value { low_mask(rest) } else { 0 };
            self.active_nbits = rest;
        }
    }

    /// appends a full group; uniform groups become fills
    fn append_literal(&mut self, w: u32) {
        debug_assert!(self.active_nbits == 0);
        if w == 0 {
            self.append_fill_groups(false, 1);
        } else if w == ALLONES {
            self.append_fill_groups(true, 1);
        } else {
            self.words.push(w);
            self.nbits += MAXBITS;
        }
    }

    fn append_fill_groups(&mut self, value: bool, mut n: u32) {
        if n == 0 {
            return;
        }
        self.nbits += n * MAXBITS;
        let header = if value { HEADER1 } else { HEADER0 };
        if let Some(last) = self.words.last_mut() {
            if *last & !MAXCNT == header {
                let take = (MAXCNT - fill_cnt(*last)).min(n);
                *last += take;
                n -= take;
            }
        }
        while n > 0 {
            let take = n.min(MAXCNT);
            self.words.push(header | take);
            n -= take;
        }
    }

    fn recompress_from(&mut self, start: usize) {
        let tail = self.words.split_off(start);
        let tail_bits: u32 = tail.iter().map(|&w| groups(w) * MAXBITS).sum();
        self.nbits -= tail_bits;
        let (active, active_nbits) = (self.active, self.active_nbits);
        self.active = 0;
        self.active_nbits = 0;
        for w in tail {
            if is_fill(w) {
                self.append_fill_groups(fill_val(w), fill_cnt(w));
            } else {
                self.append_literal(w);
            }
        }
        self.active = active;
        self.active_nbits = active_nbits;
    }

    fn truncate(&mut self, target: u32) {
        if target >= self.nbits {
            let keep = target - self.nbits;
            self.active >>= self.active_nbits - keep;
            self.active_nbits = keep;
            return;
        }
        let full = target / MAXBITS;
        let rest = target % MAXBITS;
        let mut seen = 0_u32;
        let mut cut = self.words.len();
        let mut tail = None;
        let mut active = 0_u32;
        for (i, &w) in self.words.iter().enumerate() {
            let n = groups(w);
            if seen + n > full {
                cut = i;
                let keep = full - seen;
                if is_fill(w) {
                    if keep > 0 {
                        tail = Some((w & !MAXCNT) | keep);
                    }
                    if fill_val(w) {
                        active = low_mask(rest);
                    }
                } else {
                    active = w >> (MAXBITS - rest);
                }
                break;
            }
            seen += n;
        }
        self.words.truncate(cut);
        self.words.extend(tail);
        self.nbits = full * MAXBITS;
        self.active = if rest > 0 { active } else { 0 };
        self.active_nbits = rest;
    }

    // ---------------------------------------------------------------
    // binary operations

    /// Combines two bitvectors word by word. Operands of different sizes are
    /// brought to the larger size by padding the shorter one with 0s.
    fn combine(&self, other: &Bitvector, op: BinOp) -> Bitvector {
        let (a, b): (Cow<Bitvector>, Cow<Bitvector>) = match self.size().cmp(&other.size()) {
            std::cmp::Ordering::Equal => (Cow::Borrowed(self), Cow::Borrowed(other)),
            std::cmp::Ordering::Less => {
                let mut padded = self.clone();
                padded.adjust_size(false, other.size());
                (Cow::Owned(padded), Cow::Borrowed(other))
            }
            std::cmp::Ordering::Greater => {
                let mut padded = other.clone();
                padded.adjust_size(false, self.size());
                (Cow::Borrowed(self), Cow::Owned(padded))
            }
        };

        let mut out = Bitvector::new();
        out.words.reserve(a.words.len().max(b.words.len()));
        let mut x = Runs::new(&a.words);
        let mut y = Runs::new(&b.words);
        loop {
            if !x.ensure() || !y.ensure() {
                break;
            }
            if x.is_fill && op.absorbs_left(x.word) {
                let n = x.nwords;
                out.append_fill_groups(op.apply(x.word, 0) == ALLONES, n);
                x.nwords = 0;
                y.skip(n);
            } else if y.is_fill && op.absorbs_right(y.word) {
                let n = y.nwords;
                out.append_fill_groups(op.apply(0, y.word) == ALLONES, n);
                y.nwords = 0;
                x.skip(n);
            } else if x.is_fill && y.is_fill {
                let n = x.nwords.min(y.nwords);
                out.append_fill_groups(op.apply(x.word, y.word) == ALLONES, n);
                x.nwords -= n;
                y.nwords -= n;
            } else {
                out.append_literal(op.apply(x.word, y.word));
                x.nwords -= 1;
                y.nwords -= 1;
            }
        }
        out.active = op.apply(a.active, b.active) & low_mask(a.active_nbits);
        out.active_nbits = a.active_nbits;
        out.invalidate();
        out
    }
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    And,
    Or,
    Xor,
    AndNot,
}

impl BinOp {
    #[inline]
    fn apply(self, x: u32, y: u32) -> u32 {
        let r = match self {
            BinOp::And => x & y,
            BinOp::Or => x | y,
            BinOp::Xor => x ^ y,
            BinOp::AndNot => x & !y,
        };
        r & ALLONES
    }

    /// a left fill with this pattern decides the result on its own
    #[inline]
    fn absorbs_left(self, fill: u32) -> bool {
        matches!(
            (self, fill),
            (BinOp::And, 0) | (BinOp::Or, ALLONES) | (BinOp::AndNot, 0)
        )
    }

    #[inline]
    fn absorbs_right(self, fill: u32) -> bool {
        matches!(
            (self, fill),
            (BinOp::And, 0) | (BinOp::Or, ALLONES) | (BinOp::AndNot, ALLONES)
        )
    }
}

/// Cursor over the runs of a word sequence.
struct Runs<'a> {
    words: std::slice::Iter<'a, u32>,
    word: u32, // literal bits, or the fill expanded to 0 / ALLONES
    nwords: u32,
    is_fill: bool,
}

impl<'a> Runs<'a> {
    fn new(words: &'a [u32]) -> Self {
        Runs {
            words: words.iter(),
            word: 0,
            nwords: 0,
            is_fill: false,
        }
    }

    /// loads the next word if the current one is used up
    fn ensure(&mut self) -> bool {
        if self.nwords > 0 {
            return true;
        }
        match self.words.next() {
            Some(&w) if is_fill(w) => {
                self.word = if fill_val(w) { ALLONES } else { 0 };
                self.nwords = fill_cnt(w);
                self.is_fill = true;
                true
            }
            Some(&w) => {
                self.word = w;
                self.nwords = 1;
                self.is_fill = false;
                true
            }
            None => false,
        }
    }

    fn skip(&mut self, mut n: u32) {
        while n > 0 && self.ensure() {
            let take = n.min(self.nwords);
            self.nwords -= take;
            n -= take;
        }
    }
}

macro_rules! binary_operator {
    ($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident, $op:expr) => {
        impl $trait<&Bitvector> for &Bitvector {
            type Output = Bitvector;
            fn $method(self, rhs: &Bitvector) -> Bitvector {
                self.combine(rhs, $op)
            }
        }

        impl $assign_trait<&Bitvector> for Bitvector {
            fn $assign_method(&mut self, rhs: &Bitvector) {
                *self = self.combine(rhs, $op);
            }
        }
    };
}

binary_operator!(BitAnd, bitand, BitAndAssign, bitand_assign, BinOp::And);
binary_operator!(BitOr, bitor, BitOrAssign, bitor_assign, BinOp::Or);
binary_operator!(BitXor, bitxor, BitXorAssign, bitxor_assign, BinOp::Xor);

impl Not for &Bitvector {
    type Output = Bitvector;
    fn not(self) -> Bitvector {
        let mut out = self.clone();
        out.flip();
        out
    }
}

impl FromIterator<bool> for Bitvector {
    /// Collects bits; stops growing silently at [`MAX_BITS`].
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        let mut bv = Bitvector::new();
        for b in iter {
            if bv.size() == MAX_BITS {
                break;
            }
            bv.push_bit(b);
        }
        bv.invalidate();
        bv
    }
}

impl fmt::Debug for Bitvector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitvector")
            .field("size", &self.size())
            .field("count", &self.count())
            .field("words", &self.words.len())
            .finish()
    }
}

impl fmt::Display for Bitvector {
    /// Bit string for small vectors, a summary otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.size() > 256 {
            return write!(f, "<{} of {} bits set>", self.count(), self.size());
        }
        let mut next = 0;
        for p in self.ones() {
            for _ in next..p {
                f.write_str("0")?;
            }
            f.write_str("1")?;
            next = p + 1;
        }
        for _ in next..self.size() {
            f.write_str("0")?;
        }
        Ok(())
    }
}

/// Up to 31 explicit positions of set bits, all within one literal word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexList {
    positions: [u32; 31],
    len: usize,
}

impl IndexList {
    fn from_word(start: u32, w: u32, nbits: u32) -> Self {
        let mut positions = [0; 31];
        let mut len = 0;
        for j in 0..nbits {
            if (w >> (nbits - 1 - j)) & 1 == 1 {
                positions[len] = start + j;
                len += 1;
            }
        }
        IndexList { positions, len }
    }

    /// The positions, ascending.
    pub fn as_slice(&self) -> &[u32] {
        &self.positions[..self.len]
    }
}

/// One element of [`IndexSet`]: either a contiguous range of set bits or a short list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRun {
    /// every position in `lo..hi` is set
    Range(Range<u32>),
    /// set positions within one 31-bit window
    List(IndexList),
}

impl IndexRun {
    /// Number of positions in the run.
    pub fn len(&self) -> u32 {
        match self {
            IndexRun::Range(r) => r.end - r.start,
            IndexRun::List(l) => l.len as u32,
        }
    }

    /// Runs produced by [`IndexSet`] are never empty, this is for completeness.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IntoIterator for IndexRun {
    type Item = u32;
    type IntoIter = IndexRunIter;
    fn into_iter(self) -> IndexRunIter {
        match self {
            IndexRun::Range(r) => IndexRunIter::Range(r),
            IndexRun::List(l) => IndexRunIter::List(l, 0),
        }
    }
}

/// Positions of one [`IndexRun`].
#[derive(Debug, Clone)]
pub enum IndexRunIter {
    /// from a range
    Range(Range<u32>),
    /// from a list, with the next slot to read
    List(IndexList, usize),
}

impl Iterator for IndexRunIter {
    type Item = u32;
    fn next(&mut self) -> Option<u32> {
        match self {
            IndexRunIter::Range(r) => r.next(),
            IndexRunIter::List(l, i) => {
                let p = l.as_slice().get(*i).copied();
                *i += 1;
                p
            }
        }
    }
}

/// Lazy, forward-only iterator over the set bits of a [`Bitvector`], one run at a time.
///
/// 1-fills come out as [`IndexRun::Range`], literal words (and the active word) as
/// [`IndexRun::List`]. Nothing is decompressed up front.
#[derive(Debug, Clone)]
pub struct IndexSet<'a> {
    words: std::slice::Iter<'a, u32>,
    pos: u32,
    active: Option<(u32, u32)>,
}

impl<'a> Iterator for IndexSet<'a> {
    type Item = IndexRun;

    fn next(&mut self) -> Option<IndexRun> {
        for &w in self.words.by_ref() {
            let start = self.pos;
            if is_fill(w) {
                self.pos += fill_cnt(w) * MAXBITS;
                if fill_val(w) {
                    return Some(IndexRun::Range(start..self.pos));
                }
            } else {
                self.pos += MAXBITS;
                return Some(IndexRun::List(IndexList::from_word(start, w, MAXBITS)));
            }
        }
        match self.active.take() {
            Some((val, nbits)) if val != 0 => {
                Some(IndexRun::List(IndexList::from_word(self.pos, val, nbits)))
            }
            _ => None,
        }
    }
}

/// Ascending positions of the set bits, see [`Bitvector::ones`].
#[derive(Debug, Clone)]
pub struct Ones<'a> {
    runs: IndexSet<'a>,
    current: Option<IndexRunIter>,
}

impl<'a> Iterator for Ones<'a> {
    type Item = u32;
    fn next(&mut self) -> Option<u32> {
        loop {
            if let Some(p) = self.current.as_mut().and_then(|it| it.next()) {
                return Some(p);
            }
            self.current = Some(self.runs.next()?.into_iter());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::distributions::{Distribution, Uniform};
    use rand::Rng;
    use rand_distr::Geometric;

    /// random bits with long runs, so that fills and literals are both exercised
    fn random_bits(n: usize) -> Vec<bool> {
        let mut rng = rand::thread_rng();
        let run_length = Geometric::new(0.02).unwrap();
        let mut bits = Vec::with_capacity(n);
        while bits.len() < n {
            let value = rng.gen_bool(0.4);
            let len = 1 + run_length.sample(&mut rng) as usize;
            if rng.gen_bool(0.5) {
                for _ in 0..len {
                    bits.push(value);
                }
            } else {
                for _ in 0..len {
                    bits.push(rng.gen_bool(0.5));
                }
            }
        }
        bits.truncate(n);
        bits
    }

    fn positions(bits: &[bool]) -> Vec<u32> {
        bits.iter()
            .enumerate()
            .filter(|(_, &b)| b)
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn from_bools(bits: &[bool]) -> Bitvector {
        bits.iter().copied().collect()
    }

    mod round_trip {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_empty() {
            let bv = Bitvector::new();
            assert_eq!(bv.size(), 0);
            assert_eq!(bv.count(), 0);
            assert!(bv.is_empty());
            assert_eq!(bv.index_set().count(), 0);
        }

        #[test]
        fn test_single_bit() {
            let mut bv = Bitvector::new();
            bv.set_bit(0, true).unwrap();
            assert_eq!(bv.size(), 1);
            assert_eq!(bv.ones().collect::<Vec<_>>(), vec![0]);
        }

        #[test]
        fn test_one_word() {
            let mut bv = Bitvector::new();
            for p in [0, 5, 30] {
                bv.set_bit(p, true).unwrap();
            }
            assert_eq!(bv.size(), 31);
            assert_eq!(bv.ones().collect::<Vec<_>>(), vec![0, 5, 30]);
            assert_eq!(bv.words.len(), 1);
            assert_eq!(bv.active_nbits, 0);
        }

        #[test]
        fn test_many_words() {
            let set = vec![3, 62, 63, 1000, 1001, 40_000];
            let bv = Bitvector::from_positions(set.iter().copied(), 50_000).unwrap();
            assert_eq!(bv.size(), 50_000);
            assert_eq!(bv.count(), 6);
            assert_eq!(bv.ones().collect::<Vec<_>>(), set);
        }

        #[test]
        fn test_random_sizes() {
            for n in [0, 1, 30, 31, 32, 61, 62, 63, 1000, 10_000] {
                let bits = random_bits(n);
                let bv = from_bools(&bits);
                assert_eq!(bv.size() as usize, n);
                assert_eq!(bv.ones().collect::<Vec<_>>(), positions(&bits));
                assert_eq!(bv.count() as usize, positions(&bits).len());
                for (i, &b) in bits.iter().enumerate() {
                    assert_eq!(bv.get(i as u32), b, "bit {i} of {n}");
                }
            }
        }

        #[test]
        fn test_unordered_set_bit_matches_reference() {
            let n = 5_000;
            let mut rng = rand::thread_rng();
            let pos = Uniform::from(0..n as u32);
            let mut reference = vec![false; n];
            let mut bv = Bitvector::filled(false, n as u32);
            for _ in 0..3_000 {
                let p = pos.sample(&mut rng);
                let v = rng.gen_bool(0.7);
                reference[p as usize] = v;
                bv.set_bit(p, v).unwrap();
            }
            assert_eq!(bv.ones().collect::<Vec<_>>(), positions(&reference));
            // canonical form: same bits, same words
            assert_eq!(bv, from_bools(&reference));
        }

        #[test]
        fn test_clearing_bit_in_one_fill_refolds() {
            let mut bv = Bitvector::filled(true, 31 * 4);
            assert_eq!(bv.words.len(), 1);
            bv.set_bit(40, false).unwrap();
            assert_eq!(bv.words.len(), 3);
            bv.set_bit(40, true).unwrap();
            assert_eq!(bv.words.len(), 1);
            assert_eq!(bv, Bitvector::filled(true, 31 * 4));
        }

        #[test]
        fn test_index_set_shapes() {
            let mut bv = Bitvector::filled(false, 31);
            bv.append_fill(true, 31 * 3).unwrap();
            bv.append_bit(true).unwrap();
            bv.append_bit(false).unwrap();
            bv.append_bit(true).unwrap();
            let runs: Vec<IndexRun> = bv.index_set().collect();
            assert_eq!(runs.len(), 2);
            assert_eq!(runs[0], IndexRun::Range(31..124));
            match &runs[1] {
                IndexRun::List(l) => assert_eq!(l.as_slice(), &[124, 126]),
                other => panic!("expected a list, got {other:?}"),
            }
        }

        #[test]
        fn test_append_bits_matches_bitwise() {
            use bitvec::prelude::BitVec;
            let bits = random_bits(777);
            let raw: BitVec<u8, Msb0> = bits.iter().copied().collect();
            // misalign the active word first
            let mut bv = Bitvector::new();
            bv.append_bit(true).unwrap();
            bv.append_bit(false).unwrap();
            bv.append_bits(&raw).unwrap();

            let mut expected = vec![true, false];
            expected.extend(bits);
            assert_eq!(bv, from_bools(&expected));
        }

        #[test]
        fn test_append_byte() {
            let mut bv = Bitvector::new();
            bv.append_byte(0b1000_0001).unwrap();
            bv.append_byte(0xFF).unwrap();
            assert_eq!(bv.size(), 16);
            assert_eq!(bv.ones().collect::<Vec<_>>(), vec![0, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        }

        #[test]
        fn test_words_round_trip() {
            let bv = from_bools(&random_bits(3_333));
            let back = Bitvector::from_words(&bv.to_words()).unwrap();
            assert_eq!(back, bv);
            assert_eq!(back.count(), bv.count());
        }

        #[test]
        fn test_from_words_rejects_garbage() {
            assert!(Bitvector::from_words(&[1]).is_err());
            assert!(Bitvector::from_words(&[0, 31]).is_err());
            assert!(Bitvector::from_words(&[0b100, 2]).is_err());
        }

        #[test]
        fn test_display() {
            let bv = Bitvector::from_positions([1, 3], 5).unwrap();
            assert_eq!(bv.to_string(), "01010");
        }
    }

    mod limits {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_largest_position() {
            let mut bv = Bitvector::new();
            bv.set_bit(MAX_BITS - 1, true).unwrap();
            assert_eq!(bv.size(), MAX_BITS);
            assert_eq!(bv.count(), 1);
            assert!(bv.get(MAX_BITS - 1));
            // a handful of words despite 4 billion bits
            assert!(bv.words.len() <= 2);
        }

        #[test]
        fn test_position_overflow() {
            let mut bv = Bitvector::new();
            assert!(matches!(
                bv.set_bit(MAX_BITS, true),
                Err(Error::BitPositionOverflow(_))
            ));
            bv.set_bit(MAX_BITS - 1, false).unwrap();
            assert!(bv.append_bit(true).is_err());
            assert!(bv.append_fill(false, 1).is_err());
            assert_eq!(bv.size(), MAX_BITS);
        }
    }

    mod algebra {
        use super::*;
        use pretty_assertions::assert_eq;

        fn reference(a: &[bool], b: &[bool], f: impl Fn(bool, bool) -> bool) -> Vec<u32> {
            let n = a.len().max(b.len());
            (0..n)
                .filter(|&i| {
                    f(
                        a.get(i).copied().unwrap_or(false),
                        b.get(i).copied().unwrap_or(false),
                    )
                })
                .map(|i| i as u32)
                .collect()
        }

        #[test]
        fn test_ops_match_reference() {
            for (na, nb) in [(0, 0), (31, 31), (100, 100), (5000, 5000), (1000, 4321), (4321, 7)] {
                let a = random_bits(na);
                let b = random_bits(nb);
                let (x, y) = (from_bools(&a), from_bools(&b));

                let and = &x & &y;
                let or = &x | &y;
                let xor = &x ^ &y;
                let diff = x.and_not(&y);
                assert_eq!(and.size() as usize, na.max(nb));
                assert_eq!(and.ones().collect::<Vec<_>>(), reference(&a, &b, |p, q| p & q));
                assert_eq!(or.ones().collect::<Vec<_>>(), reference(&a, &b, |p, q| p | q));
                assert_eq!(xor.ones().collect::<Vec<_>>(), reference(&a, &b, |p, q| p ^ q));
                assert_eq!(diff.ones().collect::<Vec<_>>(), reference(&a, &b, |p, q| p & !q));
            }
        }

        #[test]
        fn test_laws() {
            let x = from_bools(&random_bits(2_000));
            let y = from_bools(&random_bits(2_000));

            assert_eq!(&x & &y, &y & &x);
            assert_eq!(&x | &y, &y | &x);
            assert_eq!(&x ^ &y, &y ^ &x);
            // De Morgan
            assert_eq!(!&(&x & &y), &!&x | &!&y);
            assert_eq!(!&(&x | &y), &!&x & &!&y);
            let and = &x & &y;
            assert!(and.count() <= x.count().min(y.count()));
            assert_eq!(x.and_not(&y), &x & &!&y);
            // double negation
            assert_eq!(!&!&x, x);
        }

        #[test]
        fn test_assign_ops() {
            let x = from_bools(&random_bits(500));
            let y = from_bools(&random_bits(500));
            let mut z = x.clone();
            z &= &y;
            assert_eq!(z, &x & &y);
            let mut z = x.clone();
            z |= &y;
            assert_eq!(z, &x | &y);
            let mut z = x.clone();
            z ^= &y;
            assert_eq!(z, &x ^ &y);
        }

        #[test]
        fn test_flip_counts() {
            let x = from_bools(&random_bits(1_234));
            assert_eq!((!&x).count(), x.size() - x.count());
            assert_eq!((!&x).size(), x.size());
        }
    }

    mod adjust {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_pad_with_ones() {
            let mut bv = Bitvector::from_positions([2], 10).unwrap();
            bv.adjust_size(true, 100);
            assert_eq!(bv.size(), 100);
            assert_eq!(bv.count(), 1 + 90);
            assert!(!bv.get(9));
            assert!(bv.get(10));
            assert!(bv.get(99));
        }

        #[test]
        fn test_pad_with_zeros() {
            let mut bv = Bitvector::filled(true, 10);
            bv.adjust_size(false, 80);
            assert_eq!(bv.count(), 10);
            assert_eq!(bv.size(), 80);
        }

        #[test]
        fn test_truncate() {
            let bits = random_bits(3_000);
            for target in [0, 1, 30, 31, 62, 100, 1_500, 2_999] {
                let mut bv = from_bools(&bits);
                bv.adjust_size(false, target);
                assert_eq!(bv, from_bools(&bits[..target as usize]), "target {target}");
            }
        }

        #[test]
        fn test_idempotent() {
            let bits = random_bits(1_000);
            for (fill, n) in [(false, 2_000), (true, 2_000), (true, 400), (false, 0)] {
                let mut once = from_bools(&bits);
                once.adjust_size(fill, n);
                let mut twice = once.clone();
                twice.adjust_size(fill, n);
                assert_eq!(once, twice);
            }
        }
    }
}
