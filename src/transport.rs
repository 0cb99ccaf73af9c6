//! Moving indexes between processes.
//!
//! [`Index::deconstruct`] splits an index into plain arrays ([`IndexParts`]),
//! [`Index::reconstruct`] turns them back into an index in the attached state.
//! For the trip over a wire or into a file, [`IndexParts::to_bytes`] lays the parts
//! out as:
//! ```text
//! "BIDX" | version: u8 | kind: u8 | nrows: u32 | nkeys: u32
//! keys:    nkeys × f64
//! offsets: ceil((nkeys+1)/32) blocks of [num_bits: u8 | 32 deltas × num_bits bits]
//! nwords:  u32
//! words:   nwords × u32
//! ```
//! All integers little endian. The offsets are non-decreasing, so they are delta
//! packed with `bitpacking`'s sorted `BitPacker1x`; the last block is padded by
//! repeating the final offset.
use std::sync::Arc;

use bitpacking::{BitPacker, BitPacker1x};

use crate::error::{Error, Result};
use crate::index::Index;
use crate::options::IndexKind;

const MAGIC: &[u8; 4] = b"BIDX";
const VERSION: u8 = 1;

/// The arrays making up an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexParts {
    /// relic or bin
    pub kind: IndexKind,
    /// rows covered by every bitmap
    pub nrows: u32,
    /// distinct values or upper bin edges
    pub keys: Vec<f64>,
    /// `keys.len() + 1` word offsets into `words`
    pub offsets: Vec<u32>,
    /// serialized bitmaps
    pub words: Vec<u32>,
}

impl Index {
    /// Copies the index out into plain arrays.
    pub fn deconstruct(&self) -> Result<IndexParts> {
        let end = self.offsets().last().copied().unwrap_or(0) as usize;
        Ok(IndexParts {
            kind: self.kind(),
            nrows: self.nrows(),
            keys: self.keys().to_vec(),
            offsets: self.offsets().to_vec(),
            words: self.source().read(0..end)?,
        })
    }

    /// An attached index from `parts`, validated like [`Index::attach`].
    pub fn reconstruct(parts: IndexParts) -> Result<Index> {
        Index::attach(parts.kind, parts.nrows, parts.keys, parts.offsets, Arc::new(parts.words))
    }
}

fn pack_offsets(offsets: &[u32], out: &mut Vec<u8>) {
    let packer = BitPacker1x::new();
    let mut initial = 0_u32;
    for chunk in offsets.chunks(BitPacker1x::BLOCK_LEN) {
        let mut block = [0_u32; BitPacker1x::BLOCK_LEN];
        block[..chunk.len()].copy_from_slice(chunk);
        let last = chunk[chunk.len() - 1];
        block[chunk.len()..].fill(last);

        let num_bits = packer.num_bits_sorted(initial, &block);
        let mut buf = vec![0_u8; num_bits as usize * BitPacker1x::BLOCK_LEN / 8];
        let written = packer.compress_sorted(initial, &block, &mut buf, num_bits);
        out.push(num_bits);
        out.extend_from_slice(&buf[..written]);
        initial = last;
    }
}

/// Cursor over a byte slice that fails with [`Error::Corrupt`] when it runs dry.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len()).ok_or_else(|| {
            Error::Corrupt(format!("need {n} bytes at offset {}, only {} left", self.pos, self.bytes.len() - self.pos))
        })?;
        let s = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0_u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn f64(&mut self) -> Result<f64> {
        let mut b = [0_u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(b))
    }
}

impl IndexParts {
    /// Serializes the parts, see the module documentation for the layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18 + self.keys.len() * 8 + self.offsets.len() * 4 + self.words.len() * 4);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(match self.kind {
            IndexKind::Relic => 0,
            IndexKind::Bin => 1,
        });
        out.extend_from_slice(&self.nrows.to_le_bytes());
        out.extend_from_slice(&(self.keys.len() as u32).to_le_bytes());
        for k in &self.keys {
            out.extend_from_slice(&k.to_le_bytes());
        }
        pack_offsets(&self.offsets, &mut out);
        out.extend_from_slice(&(self.words.len() as u32).to_le_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Parses the output of [`IndexParts::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<IndexParts> {
        let mut r = Reader { bytes, pos: 0 };
        if r.take(4)? != MAGIC {
            return Err(Error::Corrupt("not an index stream".to_string()));
        }
        let version = r.u8()?;
        if version != VERSION {
            return Err(Error::Corrupt(format!("unsupported version {version}")));
        }
        let kind = match r.u8()? {
            0 => IndexKind::Relic,
            1 => IndexKind::Bin,
            k => return Err(Error::Corrupt(format!("unknown index kind {k}"))),
        };
        let nrows = r.u32()?;
        let nkeys = r.u32()? as usize;
        // every key takes 8 bytes, reject absurd counts before allocating
        if nkeys > bytes.len() / 8 {
            return Err(Error::Corrupt(format!("{nkeys} keys cannot fit in {} bytes", bytes.len())));
        }
        let keys = (0..nkeys).map(|_| r.f64()).collect::<Result<Vec<_>>>()?;

        let packer = BitPacker1x::new();
        let noffsets = nkeys + 1;
        let mut offsets = Vec::with_capacity(noffsets);
        let mut initial = 0_u32;
        while offsets.len() < noffsets {
            let num_bits = r.u8()?;
            if num_bits > 32 {
                return Err(Error::Corrupt(format!("{num_bits} bits per offset")));
            }
            let packed = r.take(num_bits as usize * BitPacker1x::BLOCK_LEN / 8)?;
            let mut block = [0_u32; BitPacker1x::BLOCK_LEN];
            packer.decompress_sorted(initial, packed, &mut block, num_bits);
            let take = (noffsets - offsets.len()).min(BitPacker1x::BLOCK_LEN);
            offsets.extend_from_slice(&block[..take]);
            initial = block[take - 1];
        }

        let nwords = r.u32()? as usize;
        if nwords > (bytes.len() - r.pos) / 4 {
            return Err(Error::Corrupt(format!("{nwords} words announced, stream too short")));
        }
        let words = (0..nwords).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
        if r.pos != bytes.len() {
            return Err(Error::Corrupt(format!("{} trailing bytes", bytes.len() - r.pos)));
        }
        Ok(IndexParts { kind, nrows, keys, offsets, words })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bitvector::Bitvector;
    use crate::column::ArrayRef;
    use crate::options::IndexOptions;
    use crate::qexpr::{CompareOp, ContinuousRange};
    use pretty_assertions::assert_eq;
    use rand::distributions::{Distribution, Uniform};

    fn random_index(n: usize, options: IndexOptions) -> (ArrayRef, Index) {
        let mut rng = rand::thread_rng();
        let d = Uniform::new(0_u16, 300);
        let data = ArrayRef::from((0..n).map(|_| d.sample(&mut rng)).collect::<Vec<_>>());
        let ix = Index::build(&data, &Bitvector::filled(true, n as u32), options).unwrap();
        (data, ix)
    }

    #[test]
    fn test_bytes_round_trip() {
        // > 32 keys so the offsets span several packed blocks
        for options in [IndexOptions::relic(), IndexOptions::bin(40)] {
            let (_, ix) = random_index(3000, options);
            let parts = ix.deconstruct().unwrap();
            assert!(parts.offsets.len() > 32);
            let back = IndexParts::from_bytes(&parts.to_bytes()).unwrap();
            assert_eq!(back, parts);
        }
    }

    #[test]
    fn test_reconstructed_index_answers_the_same() {
        let (data, ix) = random_index(2000, IndexOptions::relic());
        let bytes = ix.deconstruct().unwrap().to_bytes();
        let back = Index::reconstruct(IndexParts::from_bytes(&bytes).unwrap()).unwrap();
        assert!(back.is_external());

        let mask = Bitvector::filled(true, 2000);
        for v in [0.0, 17.0, 150.0, 299.0] {
            let r = ContinuousRange::compare("a", CompareOp::Le, v).unwrap();
            assert_eq!(back.evaluate(&r, &data, &mask).unwrap(), ix.evaluate(&r, &data, &mask).unwrap());
        }
    }

    #[test]
    fn test_empty_index() {
        let data = ArrayRef::from(Vec::<f32>::new());
        let ix = Index::build(&data, &Bitvector::new(), IndexOptions::relic()).unwrap();
        let parts = ix.deconstruct().unwrap();
        assert_eq!(parts.offsets, vec![0]);
        assert_eq!(IndexParts::from_bytes(&parts.to_bytes()).unwrap(), parts);
    }

    #[test]
    fn test_corruption_detected() {
        let (_, ix) = random_index(500, IndexOptions::relic());
        let bytes = ix.deconstruct().unwrap().to_bytes();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(IndexParts::from_bytes(&bad_magic), Err(Error::Corrupt(_))));

        assert!(matches!(IndexParts::from_bytes(&bytes[..bytes.len() - 3]), Err(Error::Corrupt(_))));

        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(IndexParts::from_bytes(&longer), Err(Error::Corrupt(_))));

        let mut bad_kind = bytes;
        bad_kind[5] = 7;
        assert!(matches!(IndexParts::from_bytes(&bad_kind), Err(Error::Corrupt(_))));
    }
}
