//! SPECK coder for single planes (Dz = 1): quadtree partitioning over
//! the root approximation square, with the L-shaped remainder outside
//! the root handled as the TypeI set. The TypeI set lives in its own
//! slot so list cleanup can never collect it.

use log::trace;

use super::{
    make_coeff_positive, num_of_partitions, plane_count, BudgetMet, ChunkHeader, CodingMode,
    Step, LIP_GARBAGE, MAX_PLANES,
};
use crate::bits::BitBuffer;
use crate::cdf97::{approx_len, num_of_xforms};
use crate::error::{CodecError, Result};

#[derive(Clone, Copy, Debug, Default)]
struct Set2 {
    start_x: u32,
    start_y: u32,
    len_x: u32,
    len_y: u32,
    part_level: u16,
    garbage: bool,
}

impl Set2 {
    fn is_pixel(&self) -> bool {
        self.len_x == 1 && self.len_y == 1
    }

    fn is_empty(&self) -> bool {
        self.len_x == 0 || self.len_y == 0
    }
}

/// The remainder outside the covered root rectangle: everything with
/// x >= corner_x or y >= corner_y.
#[derive(Clone, Copy, Debug)]
struct SetI {
    corner_x: u32,
    corner_y: u32,
    levels_left: usize,
    part_level: u16,
}

/// Quadrant split at ceil(len/2); child order y outer, x inner.
fn partition_s(set: &Set2) -> [Set2; 4] {
    let sx = [set.len_x - set.len_x / 2, set.len_x / 2];
    let sy = [set.len_y - set.len_y / 2, set.len_y / 2];
    let mut lev = set.part_level;
    lev += (sx[1] > 0) as u16 + (sy[1] > 0) as u16;

    let xs = [set.start_x, set.start_x + sx[0]];
    let ys = [set.start_y, set.start_y + sy[0]];

    let mut out = [Set2::default(); 4];
    for yi in 0..2 {
        for xi in 0..2 {
            let s = &mut out[yi * 2 + xi];
            s.start_x = xs[xi];
            s.len_x = sx[xi];
            s.start_y = ys[yi];
            s.len_y = sy[yi];
            s.part_level = lev;
        }
    }
    out
}

pub(crate) struct Speck2d {
    dim_x: usize,
    dim_y: usize,
    mode: CodingMode,
    max_coeff_bits: i32,
    threshold: f64,
    bits: BitBuffer,
    bit_idx: usize,
    avail: usize,
    coeff: Vec<f64>,
    signs: Vec<bool>,
    lis: Vec<Vec<Set2>>,
    lis_garbage: Vec<usize>,
    lip: Vec<usize>,
    lsp_new: Vec<usize>,
    lsp_old: Vec<usize>,
    i_set: Option<SetI>,
}

impl Speck2d {
    pub fn new() -> Self {
        Self {
            dim_x: 0,
            dim_y: 0,
            mode: CodingMode::Rate { budget: 0 },
            max_coeff_bits: 0,
            threshold: 0.0,
            bits: BitBuffer::new(),
            bit_idx: 0,
            avail: 0,
            coeff: Vec::new(),
            signs: Vec::new(),
            lis: Vec::new(),
            lis_garbage: Vec::new(),
            lip: Vec::new(),
            lsp_new: Vec::new(),
            lsp_old: Vec::new(),
            i_set: None,
        }
    }

    pub fn set_dims(&mut self, dims: (usize, usize)) {
        self.dim_x = dims.0;
        self.dim_y = dims.1;
    }

    pub fn take_data(&mut self, coeff: Vec<f64>, dims: (usize, usize)) {
        debug_assert_eq!(coeff.len(), dims.0 * dims.1);
        self.set_dims(dims);
        self.coeff = coeff;
    }

    pub fn release_data(&mut self) -> Vec<f64> {
        std::mem::take(&mut self.coeff)
    }

    pub fn set_mode(&mut self, mode: CodingMode) {
        self.mode = mode;
    }

    pub fn set_max_coeff_bits(&mut self, e: i32) {
        self.max_coeff_bits = e;
    }

    pub fn max_coeff_bits(&self) -> i32 {
        self.max_coeff_bits
    }

    pub fn bit_buffer(&self) -> &BitBuffer {
        &self.bits
    }

    pub fn set_bit_buffer(&mut self, bits: BitBuffer) {
        self.bits = bits;
    }

    pub fn num_bits(&self) -> usize {
        self.bits.len()
    }

    pub fn bits_consumed(&self) -> usize {
        self.bit_idx
    }

    pub fn header(&self, mean: f64) -> ChunkHeader {
        ChunkHeader {
            dim_x: self.dim_x as u32,
            dim_y: self.dim_y as u32,
            dim_z: 1,
            mean,
            max_coeff_bits: self.max_coeff_bits,
            term: match self.mode {
                CodingMode::Rate { .. } => self.bits.len() as u32,
                CodingMode::Quality { qz_level } => qz_level as u32,
            },
        }
    }

    pub fn encode(&mut self) -> Result<()> {
        let total = self.dim_x * self.dim_y;
        if total == 0 || self.coeff.len() != total {
            return Err(CodecError::Other("coefficient buffer not ready"));
        }
        if let CodingMode::Rate { budget } = self.mode {
            if budget == 0 {
                return Err(CodecError::InvalidParam("bit budget is zero"));
            }
        }

        self.initialize_lists();
        self.bits.clear();
        let max = make_coeff_positive(&mut self.coeff, &mut self.signs);
        self.max_coeff_bits = if max > 0.0 { max.log2().floor() as i32 } else { 0 };
        self.threshold = 2f64.powi(self.max_coeff_bits);

        let planes = match self.mode {
            CodingMode::Rate { .. } => MAX_PLANES,
            CodingMode::Quality { qz_level } => plane_count(self.max_coeff_bits, qz_level),
        };
        for _ in 0..planes {
            if self.sorting_pass_encode().is_err() {
                break;
            }
            if self.refinement_pass_encode().is_err() {
                break;
            }
            self.threshold *= 0.5;
            self.clean_lists();
        }
        trace!(
            "speck2d encode {}x{}: e={} bits={}",
            self.dim_x, self.dim_y, self.max_coeff_bits, self.bits.len()
        );
        Ok(())
    }

    pub fn decode(&mut self) -> Result<()> {
        let total = self.dim_x * self.dim_y;
        if total == 0 {
            return Err(CodecError::Other("dimensions not set"));
        }

        self.coeff.clear();
        self.coeff.resize(total, 0.0);
        self.signs.clear();
        self.signs.resize(total, true);
        self.initialize_lists();
        self.bit_idx = 0;
        self.threshold = 2f64.powi(self.max_coeff_bits);
        self.avail = match self.mode {
            CodingMode::Rate { budget } => budget.min(self.bits.len()),
            CodingMode::Quality { .. } => self.bits.len(),
        };

        let planes = match self.mode {
            CodingMode::Rate { .. } => MAX_PLANES,
            CodingMode::Quality { qz_level } => plane_count(self.max_coeff_bits, qz_level),
        };
        for _ in 0..planes {
            if self.sorting_pass_decode().is_err() {
                break;
            }
            if self.refinement_pass_decode().is_err() {
                break;
            }
            self.threshold *= 0.5;
            self.clean_lists();
        }

        let v = 1.5 * self.threshold;
        for &idx in &self.lsp_new {
            self.coeff[idx] = v;
        }
        for (c, &positive) in self.coeff.iter_mut().zip(&self.signs) {
            if !positive {
                *c = -*c;
            }
        }
        Ok(())
    }

    fn initialize_lists(&mut self) {
        let nparts = num_of_partitions(self.dim_x) + num_of_partitions(self.dim_y);
        self.lis.clear();
        self.lis.resize_with(nparts + 1, Vec::new);
        self.lis_garbage.clear();
        self.lis_garbage.resize(nparts + 1, 0);
        self.lip.clear();
        self.lsp_new.clear();
        self.lsp_old.clear();

        let levels = num_of_xforms(self.dim_x.min(self.dim_y));
        let w = approx_len(self.dim_x, levels) as u32;
        let h = approx_len(self.dim_y, levels) as u32;
        self.lis[0].push(Set2 {
            start_x: 0,
            start_y: 0,
            len_x: w,
            len_y: h,
            part_level: 0,
            garbage: false,
        });
        self.i_set = if w as usize == self.dim_x && h as usize == self.dim_y {
            None
        } else {
            Some(SetI {
                corner_x: w,
                corner_y: h,
                levels_left: levels,
                part_level: 0,
            })
        };
    }

    fn push_set(&mut self, lev: usize, s: Set2) {
        if lev >= self.lis.len() {
            self.lis.resize_with(lev + 1, Vec::new);
            self.lis_garbage.resize(lev + 1, 0);
        }
        self.lis[lev].push(s);
    }

    #[inline]
    fn emit(&mut self, bit: bool) -> Step {
        self.bits.push(bit);
        if let CodingMode::Rate { budget } = self.mode {
            if self.bits.len() >= budget {
                return Err(BudgetMet);
            }
        }
        Ok(())
    }

    #[inline]
    fn read(&mut self) -> std::result::Result<bool, BudgetMet> {
        if self.bit_idx >= self.avail {
            return Err(BudgetMet);
        }
        let b = self.bits.get(self.bit_idx);
        self.bit_idx += 1;
        Ok(b)
    }

    fn set_significant(&self, set: &Set2) -> bool {
        for y in set.start_y..set.start_y + set.len_y {
            let off = y as usize * self.dim_x + set.start_x as usize;
            if self.coeff[off..off + set.len_x as usize]
                .iter()
                .any(|&c| c >= self.threshold)
            {
                return true;
            }
        }
        false
    }

    fn i_significant(&self, iset: &SetI) -> bool {
        let cx = iset.corner_x as usize;
        let cy = iset.corner_y as usize;
        for y in 0..cy {
            let off = y * self.dim_x;
            if self.coeff[off + cx..off + self.dim_x]
                .iter()
                .any(|&c| c >= self.threshold)
            {
                return true;
            }
        }
        for y in cy..self.dim_y {
            let off = y * self.dim_x;
            if self.coeff[off..off + self.dim_x]
                .iter()
                .any(|&c| c >= self.threshold)
            {
                return true;
            }
        }
        false
    }

    /// The three TypeS rectangles between the covered corner and the
    /// next coarser corner, plus the shrunk remainder.
    fn partition_i(&self, iset: &SetI) -> ([Set2; 3], Option<SetI>) {
        let next_w = approx_len(self.dim_x, iset.levels_left - 1) as u32;
        let next_h = approx_len(self.dim_y, iset.levels_left - 1) as u32;
        let lev = iset.part_level;
        let rects = [
            Set2 {
                start_x: iset.corner_x,
                start_y: 0,
                len_x: next_w - iset.corner_x,
                len_y: iset.corner_y,
                part_level: lev,
                garbage: false,
            },
            Set2 {
                start_x: 0,
                start_y: iset.corner_y,
                len_x: iset.corner_x,
                len_y: next_h - iset.corner_y,
                part_level: lev,
                garbage: false,
            },
            Set2 {
                start_x: iset.corner_x,
                start_y: iset.corner_y,
                len_x: next_w - iset.corner_x,
                len_y: next_h - iset.corner_y,
                part_level: lev,
                garbage: false,
            },
        ];
        let next = if next_w as usize == self.dim_x && next_h as usize == self.dim_y {
            None
        } else {
            Some(SetI {
                corner_x: next_w,
                corner_y: next_h,
                levels_left: iset.levels_left - 1,
                part_level: lev + 1,
            })
        };
        (rects, next)
    }

    //
    // Encoder passes
    //

    fn sorting_pass_encode(&mut self) -> Step {
        let mut i = 0;
        while i < self.lip.len() {
            self.process_p_encode(i)?;
            i += 1;
        }
        for lev in (0..self.lis.len()).rev() {
            let mut j = 0;
            while j < self.lis[lev].len() {
                if !self.lis[lev][j].garbage {
                    self.process_s_encode(lev, j)?;
                }
                j += 1;
            }
        }
        self.process_i_encode()
    }

    fn process_p_encode(&mut self, loc: usize) -> Step {
        let idx = self.lip[loc];
        let is_sig = self.coeff[idx] >= self.threshold;
        self.emit(is_sig)?;
        if is_sig {
            self.emit(self.signs[idx])?;
            self.lsp_new.push(idx);
            self.lip[loc] = LIP_GARBAGE;
        }
        Ok(())
    }

    fn process_s_encode(&mut self, lev: usize, j: usize) -> Step {
        let set = self.lis[lev][j];
        let is_sig = self.set_significant(&set);
        self.emit(is_sig)?;
        if is_sig {
            self.code_s_encode(&set)?;
            self.lis[lev][j].garbage = true;
            self.lis_garbage[lev] += 1;
        }
        Ok(())
    }

    fn code_s_encode(&mut self, set: &Set2) -> Step {
        for s in partition_s(set) {
            if s.is_empty() {
                continue;
            }
            if s.is_pixel() {
                let idx = s.start_y as usize * self.dim_x + s.start_x as usize;
                self.lip.push(idx);
                self.process_p_encode(self.lip.len() - 1)?;
            } else {
                let lev = s.part_level as usize;
                self.push_set(lev, s);
                self.process_s_encode(lev, self.lis[lev].len() - 1)?;
            }
        }
        Ok(())
    }

    fn process_i_encode(&mut self) -> Step {
        let Some(iset) = self.i_set else {
            return Ok(());
        };
        let is_sig = self.i_significant(&iset);
        self.emit(is_sig)?;
        if is_sig {
            self.code_i_encode(&iset)?;
        }
        Ok(())
    }

    fn code_i_encode(&mut self, iset: &SetI) -> Step {
        let (rects, next) = self.partition_i(iset);
        self.i_set = next;
        for s in rects {
            if s.is_empty() {
                continue;
            }
            if s.is_pixel() {
                let idx = s.start_y as usize * self.dim_x + s.start_x as usize;
                self.lip.push(idx);
                self.process_p_encode(self.lip.len() - 1)?;
            } else {
                let lev = s.part_level as usize;
                self.push_set(lev, s);
                self.process_s_encode(lev, self.lis[lev].len() - 1)?;
            }
        }
        self.process_i_encode()
    }

    fn refinement_pass_encode(&mut self) -> Step {
        for i in 0..self.lsp_old.len() {
            let idx = self.lsp_old[i];
            let refine = self.coeff[idx] >= self.threshold;
            if refine {
                self.coeff[idx] -= self.threshold;
            }
            self.emit(refine)?;
        }
        let thr = self.threshold;
        for &idx in &self.lsp_new {
            self.coeff[idx] -= thr;
        }
        self.promote_new_lsp();
        Ok(())
    }

    //
    // Decoder passes
    //

    fn sorting_pass_decode(&mut self) -> Step {
        let mut i = 0;
        while i < self.lip.len() {
            self.process_p_decode(i)?;
            i += 1;
        }
        for lev in (0..self.lis.len()).rev() {
            let mut j = 0;
            while j < self.lis[lev].len() {
                if !self.lis[lev][j].garbage {
                    self.process_s_decode(lev, j)?;
                }
                j += 1;
            }
        }
        self.process_i_decode()
    }

    fn process_p_decode(&mut self, loc: usize) -> Step {
        let is_sig = self.read()?;
        if is_sig {
            let idx = self.lip[loc];
            let positive = self.read()?;
            if !positive {
                self.signs[idx] = false;
            }
            self.lsp_new.push(idx);
            self.lip[loc] = LIP_GARBAGE;
        }
        Ok(())
    }

    fn process_s_decode(&mut self, lev: usize, j: usize) -> Step {
        let is_sig = self.read()?;
        if is_sig {
            let set = self.lis[lev][j];
            self.code_s_decode(&set)?;
            self.lis[lev][j].garbage = true;
            self.lis_garbage[lev] += 1;
        }
        Ok(())
    }

    fn code_s_decode(&mut self, set: &Set2) -> Step {
        for s in partition_s(set) {
            if s.is_empty() {
                continue;
            }
            if s.is_pixel() {
                let idx = s.start_y as usize * self.dim_x + s.start_x as usize;
                self.lip.push(idx);
                self.process_p_decode(self.lip.len() - 1)?;
            } else {
                let lev = s.part_level as usize;
                self.push_set(lev, s);
                self.process_s_decode(lev, self.lis[lev].len() - 1)?;
            }
        }
        Ok(())
    }

    fn process_i_decode(&mut self) -> Step {
        let Some(iset) = self.i_set else {
            return Ok(());
        };
        let is_sig = self.read()?;
        if is_sig {
            self.code_i_decode(&iset)?;
        }
        Ok(())
    }

    fn code_i_decode(&mut self, iset: &SetI) -> Step {
        let (rects, next) = self.partition_i(iset);
        self.i_set = next;
        for s in rects {
            if s.is_empty() {
                continue;
            }
            if s.is_pixel() {
                let idx = s.start_y as usize * self.dim_x + s.start_x as usize;
                self.lip.push(idx);
                self.process_p_decode(self.lip.len() - 1)?;
            } else {
                let lev = s.part_level as usize;
                self.push_set(lev, s);
                self.process_s_decode(lev, self.lis[lev].len() - 1)?;
            }
        }
        self.process_i_decode()
    }

    fn refinement_pass_decode(&mut self) -> Step {
        for i in 0..self.lsp_old.len() {
            let idx = self.lsp_old[i];
            let bit = self.read()?;
            self.coeff[idx] += if bit {
                0.5 * self.threshold
            } else {
                -0.5 * self.threshold
            };
        }
        let v = 1.5 * self.threshold;
        for &idx in &self.lsp_new {
            self.coeff[idx] = v;
        }
        self.promote_new_lsp();
        Ok(())
    }

    fn promote_new_lsp(&mut self) {
        self.lsp_old.extend_from_slice(&self.lsp_new);
        self.lsp_new.clear();
    }

    fn clean_lists(&mut self) {
        for lev in 0..self.lis.len() {
            if self.lis_garbage[lev] * 2 > self.lis[lev].len() {
                self.lis[lev].retain(|s| !s.garbage);
                self.lis_garbage[lev] = 0;
            }
        }
        self.lip.retain(|&i| i != LIP_GARBAGE);
    }
}
