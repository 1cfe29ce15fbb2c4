//! SPECK set-partitioning bit-plane coders and the shared machinery
//! they sit on: the per-chunk header, the coding mode, and the
//! budget-unwinding sentinel.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

pub(crate) mod speck2d;
pub(crate) mod speck3d;

/// Hard ceiling on coded bit-planes; thresholds below 2^(E-127) carry
/// no information a double can represent.
pub(crate) const MAX_PLANES: usize = 128;

/// Tombstone for pixels removed from LIP mid-pass.
pub(crate) const LIP_GARBAGE: usize = usize::MAX;

/// Internal sentinel: the bit budget was reached and the nested coding
/// loops must unwind. Never escapes a coder.
pub(crate) struct BudgetMet;

/// Result of one coding step; `?` carries `BudgetMet` up the recursion.
pub(crate) type Step = std::result::Result<(), BudgetMet>;

/// Encode termination rule.
#[derive(Clone, Copy, Debug)]
pub(crate) enum CodingMode {
    /// Stop once this many bits were produced (consumed when decoding).
    Rate { budget: usize },
    /// Stop once the threshold drops below 2^qz_level.
    Quality { qz_level: i32 },
}

/// Number of times a length can be halved before reaching 1; bounds the
/// partition depth along one axis.
pub(crate) fn num_of_partitions(len: usize) -> usize {
    let mut len = len;
    let mut n = 0;
    while len > 1 {
        len -= len / 2;
        n += 1;
    }
    n
}

/// Bit-planes coded for a max-coefficient exponent `e` and floor `qz`:
/// thresholds 2^e down to 2^qz inclusive, capped at [`MAX_PLANES`].
pub(crate) fn plane_count(e: i32, qz: i32) -> usize {
    (e as i64 - qz as i64 + 1).clamp(0, MAX_PLANES as i64) as usize
}

/// Strip signs off the coefficients, recording them separately, and
/// return the largest magnitude.
pub(crate) fn make_coeff_positive(coeff: &mut [f64], signs: &mut Vec<bool>) -> f64 {
    signs.clear();
    signs.reserve(coeff.len());
    let mut max = 0.0f64;
    for c in coeff.iter_mut() {
        signs.push(*c >= 0.0);
        *c = c.abs();
        max = max.max(*c);
    }
    max
}

/// Fixed per-chunk header written in front of the SPECK bits.
///
/// Layout (little-endian): three u32 extents, the f64 chunk mean, the
/// i32 max-coefficient exponent, and one mode-dependent u32 — the
/// encoded bit count in rate mode, the termination quantization level
/// in fixed-quality mode.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChunkHeader {
    pub dim_x: u32,
    pub dim_y: u32,
    pub dim_z: u32,
    pub mean: f64,
    pub max_coeff_bits: i32,
    pub term: u32,
}

pub(crate) const CHUNK_HEADER_SIZE: usize = 28;

impl ChunkHeader {
    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u32::<LittleEndian>(self.dim_x)?;
        out.write_u32::<LittleEndian>(self.dim_y)?;
        out.write_u32::<LittleEndian>(self.dim_z)?;
        out.write_f64::<LittleEndian>(self.mean)?;
        out.write_i32::<LittleEndian>(self.max_coeff_bits)?;
        out.write_u32::<LittleEndian>(self.term)?;
        Ok(())
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        Ok(Self {
            dim_x: cur.read_u32::<LittleEndian>()?,
            dim_y: cur.read_u32::<LittleEndian>()?,
            dim_z: cur.read_u32::<LittleEndian>()?,
            mean: cur.read_f64::<LittleEndian>()?,
            max_coeff_bits: cur.read_i32::<LittleEndian>()?,
            term: cur.read_u32::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_counts() {
        assert_eq!(num_of_partitions(1), 0);
        assert_eq!(num_of_partitions(2), 1);
        assert_eq!(num_of_partitions(4), 2);
        assert_eq!(num_of_partitions(5), 3);
        assert_eq!(num_of_partitions(8), 3);
        assert_eq!(num_of_partitions(9), 4);
    }

    #[test]
    fn plane_counts() {
        assert_eq!(plane_count(4, 0), 5);
        assert_eq!(plane_count(0, 0), 1);
        assert_eq!(plane_count(-1, 0), 0);
        assert_eq!(plane_count(200, -200), MAX_PLANES);
    }

    #[test]
    fn header_roundtrip() {
        let h = ChunkHeader {
            dim_x: 17,
            dim_y: 19,
            dim_z: 23,
            mean: -0.125,
            max_coeff_bits: -3,
            term: 4096,
        };
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        assert_eq!(buf.len(), CHUNK_HEADER_SIZE);
        let g = ChunkHeader::read(&buf).unwrap();
        assert_eq!(g.dim_x, 17);
        assert_eq!(g.dim_y, 19);
        assert_eq!(g.dim_z, 23);
        assert_eq!(g.mean, -0.125);
        assert_eq!(g.max_coeff_bits, -3);
        assert_eq!(g.term, 4096);
    }
}
