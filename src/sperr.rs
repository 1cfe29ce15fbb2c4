//! Outlier corrector for fixed-quality mode: codes the locations and
//! magnitudes of residuals that exceed the tolerance, with the same
//! bit-plane discipline as SPECK but over a sparse 1D domain. Encoding
//! stops once every outlier's decoded correction is within tolerance.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;

use crate::bits::BitBuffer;
use crate::error::{CodecError, Result};
use crate::speck::num_of_partitions;

pub(crate) const SPERR_HEADER_SIZE: usize = 20;

const MAX_SPERR_PLANES: usize = 64;

/// A sample whose residual exceeded the tolerance: its flat index and
/// the signed error to add back on decode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Outlier {
    pub location: usize,
    pub error: f64,
}

/// Encoding finished: every outlier is within tolerance, or the bits
/// ran out on decode.
struct Done;

type Flow = std::result::Result<(), Done>;

#[derive(Clone, Copy, Debug, Default)]
struct Set1 {
    start: usize,
    length: usize,
    part_level: u32,
    garbage: bool,
}

fn part_set(set: &Set1) -> [Set1; 2] {
    let l1 = set.length - set.length / 2;
    [
        Set1 {
            start: set.start,
            length: l1,
            part_level: set.part_level + 1,
            garbage: false,
        },
        Set1 {
            start: set.start + l1,
            length: set.length - l1,
            part_level: set.part_level + 1,
            garbage: false,
        },
    ]
}

#[derive(Default)]
pub(crate) struct Sperr {
    total_len: usize,
    tolerance: f64,
    max_coeff_bits: i32,
    threshold: f64,
    bits: BitBuffer,
    bit_idx: usize,
    lis: Vec<Vec<Set1>>,
    los: Vec<Outlier>,
    q: Vec<f64>,
    err_hat: Vec<f64>,
    recovered_signs: Vec<bool>,
    lsp_new: Vec<usize>,
    lsp_old: Vec<usize>,
    outlier_cnt: usize,
    los_size: usize,
}

impl Sperr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_length(&mut self, len: usize) {
        self.total_len = len;
    }

    pub fn set_tolerance(&mut self, tol: f64) {
        self.tolerance = tol;
    }

    pub fn clear_outliers(&mut self) {
        self.los.clear();
    }

    pub fn add_outlier(&mut self, location: usize, error: f64) {
        self.los.push(Outlier { location, error });
    }

    pub fn outliers(&self) -> &[Outlier] {
        &self.los
    }

    pub fn num_outliers(&self) -> usize {
        self.los.len()
    }

    pub fn encode(&mut self) -> Result<()> {
        // Sorted by location so set significance can scan the list in
        // index order.
        self.los.sort_unstable_by_key(|o| o.location);
        self.check_ready_to_encode()?;

        self.bits.clear();
        self.initialize_lis();
        self.outlier_cnt = self.los.len();
        self.q.clear();
        self.q.extend(self.los.iter().map(|o| o.error.abs()));
        self.err_hat.clear();
        self.err_hat.resize(self.los.len(), 0.0);
        self.lsp_new.clear();
        self.lsp_old.clear();

        let max_q = self.q.iter().fold(0.0f64, |m, &v| m.max(v));
        self.max_coeff_bits = max_q.log2().floor() as i32;
        self.threshold = 2f64.powi(self.max_coeff_bits);

        for _ in 0..MAX_SPERR_PLANES {
            if self.sorting_pass_encode().is_err() {
                break;
            }
            if self.refinement_pass_encode().is_err() {
                break;
            }
            self.threshold *= 0.5;
            self.clean_lis();
        }
        trace!(
            "sperr encode: {} outliers, {} bits",
            self.los.len(),
            self.bits.len()
        );
        Ok(())
    }

    fn check_ready_to_encode(&self) -> Result<()> {
        if self.total_len == 0 || self.tolerance <= 0.0 || self.los.is_empty() {
            return Err(CodecError::InvalidParam("outlier coder not configured"));
        }
        if !self.los.iter().all(|o| o.error.abs() >= self.tolerance) {
            return Err(CodecError::InvalidParam("outlier below tolerance"));
        }
        if let Some(last) = self.los.last() {
            if last.location >= self.total_len {
                return Err(CodecError::InvalidParam("outlier location out of range"));
            }
        }
        if self.los.windows(2).any(|w| w[0].location == w[1].location) {
            return Err(CodecError::InvalidParam("duplicate outlier location"));
        }
        Ok(())
    }

    /// Header (total length, exponent, bit count) plus the packed bits.
    pub fn encoded_stream(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(SPERR_HEADER_SIZE + (self.bits.len() + 7) / 8);
        out.write_u64::<LittleEndian>(self.total_len as u64)?;
        out.write_i32::<LittleEndian>(self.max_coeff_bits)?;
        out.write_u64::<LittleEndian>(self.bits.len() as u64)?;
        out.extend_from_slice(&self.bits.to_bytes());
        Ok(out)
    }

    pub fn parse_stream(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() < SPERR_HEADER_SIZE {
            return Err(CodecError::WrongSize);
        }
        let mut cur = Cursor::new(buf);
        let total_len = cur.read_u64::<LittleEndian>()?;
        let max_coeff_bits = cur.read_i32::<LittleEndian>()?;
        let num_bits = cur.read_u64::<LittleEndian>()? as usize;
        if SPERR_HEADER_SIZE + (num_bits + 7) / 8 != buf.len() {
            return Err(CodecError::WrongSize);
        }
        self.total_len = total_len as usize;
        self.max_coeff_bits = max_coeff_bits;
        self.bits = BitBuffer::from_bytes(&buf[SPERR_HEADER_SIZE..], num_bits);
        Ok(())
    }

    pub fn decode(&mut self) -> Result<()> {
        if self.total_len == 0 || self.bits.is_empty() {
            return Err(CodecError::InvalidParam("outlier stream not ready"));
        }
        self.los.clear();
        self.recovered_signs.clear();
        self.initialize_lis();
        self.bit_idx = 0;
        self.los_size = 0;
        self.threshold = 2f64.powi(self.max_coeff_bits);

        for _ in 0..MAX_SPERR_PLANES {
            if self.sorting_pass_decode().is_err() {
                break;
            }
            if self.refinement_pass_decode().is_err() {
                break;
            }
            self.threshold *= 0.5;
            self.clean_lis();
        }

        for (o, &positive) in self.los.iter_mut().zip(&self.recovered_signs) {
            if !positive {
                o.error = -o.error;
            }
        }
        Ok(())
    }

    fn initialize_lis(&mut self) {
        let n = num_of_partitions(self.total_len) + 1;
        self.lis.clear();
        self.lis.resize_with(n, Vec::new);
        // Two sets, each covering half of the domain.
        let whole = Set1 {
            start: 0,
            length: self.total_len,
            part_level: 0,
            garbage: false,
        };
        for s in part_set(&whole) {
            if s.length > 0 {
                self.push_set(s);
            }
        }
    }

    fn push_set(&mut self, s: Set1) {
        let lev = s.part_level as usize;
        if lev >= self.lis.len() {
            self.lis.resize_with(lev + 1, Vec::new);
        }
        self.lis[lev].push(s);
    }

    #[inline]
    fn read(&mut self) -> std::result::Result<bool, Done> {
        if self.bit_idx >= self.bits.len() {
            return Err(Done);
        }
        let b = self.bits.get(self.bit_idx);
        self.bit_idx += 1;
        Ok(b)
    }

    /// First outlier index inside the set whose remaining magnitude
    /// reaches the threshold, scanning locations in ascending order.
    fn decide_significance(&self, set: &Set1) -> Option<usize> {
        let lo = self.los.partition_point(|o| o.location < set.start);
        for i in lo..self.los.len() {
            if self.los[i].location >= set.start + set.length {
                break;
            }
            if self.q[i] >= self.threshold {
                return Some(i);
            }
        }
        None
    }

    //
    // Encoder
    //

    fn sorting_pass_encode(&mut self) -> Flow {
        let mut dummy = 0;
        for lev in (0..self.lis.len()).rev() {
            let mut j = 0;
            while j < self.lis[lev].len() {
                if !self.lis[lev][j].garbage {
                    self.process_s_encode(lev, j, &mut dummy, true)?;
                }
                j += 1;
            }
        }
        Ok(())
    }

    fn process_s_encode(
        &mut self,
        lev: usize,
        j: usize,
        counter: &mut usize,
        output: bool,
    ) -> Flow {
        let set = self.lis[lev][j];
        let sig_idx = self.decide_significance(&set);
        if output {
            self.bits.push(sig_idx.is_some());
        }
        // When the first half of a split was insignificant, the second
        // half is implied significant and its bit is skipped.
        debug_assert!(output || sig_idx.is_some());

        if let Some(si) = sig_idx {
            *counter += 1;
            if set.length == 1 {
                self.bits.push(self.los[si].error >= 0.0);
                self.lsp_new.push(si);
                self.refine_new(si)?;
            } else {
                self.code_s_encode(&set)?;
            }
            self.lis[lev][j].garbage = true;
        }
        Ok(())
    }

    fn code_s_encode(&mut self, set: &Set1) -> Flow {
        let subs = part_set(set);
        let mut counter = 0;
        if subs[0].length > 0 {
            self.push_set(subs[0]);
            let lev = subs[0].part_level as usize;
            self.process_s_encode(lev, self.lis[lev].len() - 1, &mut counter, true)?;
        }
        if subs[1].length > 0 {
            self.push_set(subs[1]);
            let lev = subs[1].part_level as usize;
            let output = counter != 0;
            self.process_s_encode(lev, self.lis[lev].len() - 1, &mut counter, output)?;
        }
        Ok(())
    }

    fn refine_new(&mut self, i: usize) -> Flow {
        self.q[i] -= self.threshold;
        self.err_hat[i] = 1.5 * self.threshold;
        if (self.err_hat[i] - self.los[i].error.abs()).abs() < self.tolerance {
            self.outlier_cnt -= 1;
            if self.outlier_cnt == 0 {
                return Err(Done);
            }
        }
        Ok(())
    }

    fn refinement_pass_encode(&mut self) -> Flow {
        for k in 0..self.lsp_old.len() {
            let i = self.lsp_old[k];
            let abs_err = self.los[i].error.abs();
            let was_outlier = (self.err_hat[i] - abs_err).abs() >= self.tolerance;
            let need = self.q[i] >= self.threshold;
            self.bits.push(need);
            if need {
                self.q[i] -= self.threshold;
            }
            // Track the exact value the decoder will reconstruct, so
            // termination certifies the decoded corrections.
            self.err_hat[i] += if need {
                0.5 * self.threshold
            } else {
                -0.5 * self.threshold
            };
            let is_outlier = (self.err_hat[i] - abs_err).abs() >= self.tolerance;
            if was_outlier && !is_outlier {
                self.outlier_cnt -= 1;
                if self.outlier_cnt == 0 {
                    return Err(Done);
                }
            } else if !was_outlier && is_outlier {
                self.outlier_cnt += 1;
            }
        }
        self.lsp_old.extend_from_slice(&self.lsp_new);
        self.lsp_new.clear();
        Ok(())
    }

    //
    // Decoder
    //

    fn sorting_pass_decode(&mut self) -> Flow {
        let mut dummy = 0;
        for lev in (0..self.lis.len()).rev() {
            let mut j = 0;
            while j < self.lis[lev].len() {
                if !self.lis[lev][j].garbage {
                    self.process_s_decode(lev, j, &mut dummy, true)?;
                }
                j += 1;
            }
        }
        Ok(())
    }

    fn process_s_decode(
        &mut self,
        lev: usize,
        j: usize,
        counter: &mut usize,
        input: bool,
    ) -> Flow {
        let is_sig = if input { self.read()? } else { true };
        if is_sig {
            *counter += 1;
            let set = self.lis[lev][j];
            if set.length == 1 {
                let positive = self.read()?;
                self.los.push(Outlier {
                    location: set.start,
                    error: 1.5 * self.threshold,
                });
                self.recovered_signs.push(positive);
            } else {
                self.code_s_decode(&set)?;
            }
            self.lis[lev][j].garbage = true;
        }
        Ok(())
    }

    fn code_s_decode(&mut self, set: &Set1) -> Flow {
        let subs = part_set(set);
        let mut counter = 0;
        if subs[0].length > 0 {
            self.push_set(subs[0]);
            let lev = subs[0].part_level as usize;
            self.process_s_decode(lev, self.lis[lev].len() - 1, &mut counter, true)?;
        }
        if subs[1].length > 0 {
            self.push_set(subs[1]);
            let lev = subs[1].part_level as usize;
            let input = counter != 0;
            self.process_s_decode(lev, self.lis[lev].len() - 1, &mut counter, input)?;
        }
        Ok(())
    }

    fn refinement_pass_decode(&mut self) -> Flow {
        for i in 0..self.los_size {
            let bit = self.read()?;
            self.los[i].error += if bit {
                0.5 * self.threshold
            } else {
                -0.5 * self.threshold
            };
        }
        self.los_size = self.los.len();
        Ok(())
    }

    fn clean_lis(&mut self) {
        for list in &mut self.lis {
            list.retain(|s| !s.garbage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outlier_roundtrip_within_tolerance() {
        let tol = 1e-3;
        let mut enc = Sperr::new();
        enc.set_length(4096);
        enc.set_tolerance(tol);
        let originals = [
            (3usize, 0.25),
            (17, -0.031),
            (100, 0.5),
            (1023, -0.002),
            (2048, 0.111),
            (4095, -0.42),
        ];
        for &(loc, err) in &originals {
            enc.add_outlier(loc, err);
        }
        enc.encode().unwrap();
        let stream = enc.encoded_stream().unwrap();

        let mut dec = Sperr::new();
        dec.parse_stream(&stream).unwrap();
        dec.decode().unwrap();

        for &(loc, err) in &originals {
            let rec = dec
                .outliers()
                .iter()
                .find(|o| o.location == loc)
                .unwrap_or_else(|| panic!("outlier at {loc} not recovered"));
            assert!(
                (rec.error - err).abs() < tol,
                "location {loc}: {} vs {err}",
                rec.error
            );
        }
    }

    #[test]
    fn rejects_bad_outlier_lists() {
        let mut s = Sperr::new();
        s.set_length(10);
        s.set_tolerance(0.1);
        s.add_outlier(3, 0.01); // below tolerance
        assert!(s.encode().is_err());

        let mut s = Sperr::new();
        s.set_length(10);
        s.set_tolerance(0.1);
        s.add_outlier(10, 0.5); // out of range
        assert!(s.encode().is_err());

        let mut s = Sperr::new();
        s.set_length(10);
        s.set_tolerance(0.1);
        s.add_outlier(3, 0.5);
        s.add_outlier(3, -0.5); // duplicate location
        assert!(s.encode().is_err());
    }

    #[test]
    fn dense_outliers_all_corrected() {
        let tol = 1e-4;
        let mut enc = Sperr::new();
        enc.set_length(512);
        enc.set_tolerance(tol);
        for i in 0..512 {
            let err = 0.001 + (i as f64) * 0.0007;
            enc.add_outlier(i, if i % 2 == 0 { err } else { -err });
        }
        enc.encode().unwrap();
        let stream = enc.encoded_stream().unwrap();

        let mut dec = Sperr::new();
        dec.parse_stream(&stream).unwrap();
        dec.decode().unwrap();
        assert_eq!(dec.outliers().len(), 512);

        let mut recovered = vec![0.0f64; 512];
        for o in dec.outliers() {
            recovered[o.location] = o.error;
        }
        for i in 0..512 {
            let err = 0.001 + (i as f64) * 0.0007;
            let err = if i % 2 == 0 { err } else { -err };
            assert!((recovered[i] - err).abs() < tol, "i={i}");
        }
    }
}
