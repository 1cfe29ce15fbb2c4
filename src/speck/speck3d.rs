//! SPECK coder for 3D coefficient volumes: octree set partitioning
//! with per-bit-plane sorting and refinement passes.

use log::trace;

use super::{
    make_coeff_positive, num_of_partitions, plane_count, BudgetMet, ChunkHeader, CodingMode,
    Step, LIP_GARBAGE, MAX_PLANES,
};
use crate::bits::BitBuffer;
use crate::cdf97::num_of_xforms;
use crate::error::{CodecError, Result};

#[derive(Clone, Copy, Debug, Default)]
struct Set3 {
    start_x: u32,
    start_y: u32,
    start_z: u32,
    len_x: u32,
    len_y: u32,
    len_z: u32,
    part_level: u16,
    garbage: bool,
}

impl Set3 {
    fn is_pixel(&self) -> bool {
        self.len_x == 1 && self.len_y == 1 && self.len_z == 1
    }

    fn is_empty(&self) -> bool {
        self.len_x == 0 || self.len_y == 0 || self.len_z == 0
    }
}

/// Split into up to 8 octants at ceil(len/2) per axis; an axis of
/// extent 1 is not split on. Child order is fixed: z outer, y middle,
/// x inner.
fn partition_xyz(set: &Set3) -> [Set3; 8] {
    let sx = [set.len_x - set.len_x / 2, set.len_x / 2];
    let sy = [set.len_y - set.len_y / 2, set.len_y / 2];
    let sz = [set.len_z - set.len_z / 2, set.len_z / 2];
    let mut lev = set.part_level;
    lev += (sx[1] > 0) as u16 + (sy[1] > 0) as u16 + (sz[1] > 0) as u16;

    let xs = [set.start_x, set.start_x + sx[0]];
    let ys = [set.start_y, set.start_y + sy[0]];
    let zs = [set.start_z, set.start_z + sz[0]];

    let mut out = [Set3::default(); 8];
    for zi in 0..2 {
        for yi in 0..2 {
            for xi in 0..2 {
                let s = &mut out[zi * 4 + yi * 2 + xi];
                s.start_x = xs[xi];
                s.len_x = sx[xi];
                s.start_y = ys[yi];
                s.len_y = sy[yi];
                s.start_z = zs[zi];
                s.len_z = sz[zi];
                s.part_level = lev;
            }
        }
    }
    out
}

/// Quadrant split in x/y only; the z extent is carried through.
fn partition_xy(set: &Set3) -> [Set3; 4] {
    let sx = [set.len_x - set.len_x / 2, set.len_x / 2];
    let sy = [set.len_y - set.len_y / 2, set.len_y / 2];
    let mut lev = set.part_level;
    lev += (sx[1] > 0) as u16 + (sy[1] > 0) as u16;

    let xs = [set.start_x, set.start_x + sx[0]];
    let ys = [set.start_y, set.start_y + sy[0]];

    let mut out = [Set3::default(); 4];
    for yi in 0..2 {
        for xi in 0..2 {
            let s = &mut out[yi * 2 + xi];
            s.start_x = xs[xi];
            s.len_x = sx[xi];
            s.start_y = ys[yi];
            s.len_y = sy[yi];
            s.start_z = set.start_z;
            s.len_z = set.len_z;
            s.part_level = lev;
        }
    }
    out
}

/// Halve along z only.
fn partition_z(set: &Set3) -> [Set3; 2] {
    let sz = [set.len_z - set.len_z / 2, set.len_z / 2];
    let mut lev = set.part_level;
    lev += (sz[1] > 0) as u16;

    let mut out = [Set3::default(); 2];
    for (zi, s) in out.iter_mut().enumerate() {
        s.start_x = set.start_x;
        s.len_x = set.len_x;
        s.start_y = set.start_y;
        s.len_y = set.len_y;
        s.start_z = set.start_z + if zi == 1 { sz[0] } else { 0 };
        s.len_z = sz[zi];
        s.part_level = lev;
    }
    out
}

pub(crate) struct Speck3d {
    dim_x: usize,
    dim_y: usize,
    dim_z: usize,
    mode: CodingMode,
    max_coeff_bits: i32,
    threshold: f64,
    bits: BitBuffer,
    bit_idx: usize,
    avail: usize,
    coeff: Vec<f64>,
    signs: Vec<bool>,
    lis: Vec<Vec<Set3>>,
    lis_garbage: Vec<usize>,
    lip: Vec<usize>,
    lsp_new: Vec<usize>,
    lsp_old: Vec<usize>,
}

impl Speck3d {
    pub fn new() -> Self {
        Self {
            dim_x: 0,
            dim_y: 0,
            dim_z: 0,
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
        }
    }

    pub fn set_dims(&mut self, dims: (usize, usize, usize)) {
        self.dim_x = dims.0;
        self.dim_y = dims.1;
        self.dim_z = dims.2;
    }

    pub fn take_data(&mut self, coeff: Vec<f64>, dims: (usize, usize, usize)) {
        debug_assert_eq!(coeff.len(), dims.0 * dims.1 * dims.2);
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

    /// Bits the last decode consumed; the byte after them (rounded up)
    /// is where any trailing sub-stream starts.
    pub fn bits_consumed(&self) -> usize {
        self.bit_idx
    }

    /// Header for the stream this coder just produced. `term` carries
    /// the bit count in rate mode and the floor in fixed-quality mode.
    pub fn header(&self, mean: f64) -> ChunkHeader {
        ChunkHeader {
            dim_x: self.dim_x as u32,
            dim_y: self.dim_y as u32,
            dim_z: self.dim_z as u32,
            mean,
            max_coeff_bits: self.max_coeff_bits,
            term: match self.mode {
                CodingMode::Rate { .. } => self.bits.len() as u32,
                CodingMode::Quality { qz_level } => qz_level as u32,
            },
        }
    }

    pub fn encode(&mut self) -> Result<()> {
        let total = self.dim_x * self.dim_y * self.dim_z;
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
        if let CodingMode::Rate { budget } = self.mode {
            self.bits.reserve(budget);
        }

        let max = make_coeff_positive(&mut self.coeff, &mut self.signs);
        // log2(0) is undefined; an all-zero chunk pins the exponent at
        // zero and codes ordinary insignificance planes.
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
            "speck3d encode {}x{}x{}: e={} bits={}",
            self.dim_x, self.dim_y, self.dim_z, self.max_coeff_bits, self.bits.len()
        );
        Ok(())
    }

    pub fn decode(&mut self) -> Result<()> {
        let total = self.dim_x * self.dim_y * self.dim_z;
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

        // Pixels found significant on the plane the budget cut short
        // still reconstruct to the middle of their interval.
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
        let nparts = num_of_partitions(self.dim_x)
            + num_of_partitions(self.dim_y)
            + num_of_partitions(self.dim_z);
        self.lis.clear();
        self.lis.resize_with(nparts + 1, Vec::new);
        self.lis_garbage.clear();
        self.lis_garbage.resize(nparts + 1, 0);
        self.lip.clear();
        self.lsp_new.clear();
        self.lsp_old.clear();

        // Partition the whole volume down to the approximation subcube,
        // mirroring the transform's dyadic/hybrid level structure. The
        // detail subsets land in LIS at their partition levels.
        let mut big = Set3 {
            start_x: 0,
            start_y: 0,
            start_z: 0,
            len_x: self.dim_x as u32,
            len_y: self.dim_y as u32,
            len_z: self.dim_z as u32,
            part_level: 0,
            garbage: false,
        };
        let nxy = num_of_xforms(self.dim_x.min(self.dim_y));
        let nz = num_of_xforms(self.dim_z);
        let mut xf = 0;
        while xf < nxy.min(nz) {
            let subs = partition_xyz(&big);
            big = subs[0];
            for s in &subs[1..] {
                if !s.is_empty() {
                    self.push_set(s.part_level as usize, *s);
                }
            }
            xf += 1;
        }
        while xf < nxy {
            let subs = partition_xy(&big);
            big = subs[0];
            for s in &subs[1..] {
                if !s.is_empty() {
                    self.push_set(s.part_level as usize, *s);
                }
            }
            xf += 1;
        }
        while xf < nz {
            let subs = partition_z(&big);
            big = subs[0];
            if !subs[1].is_empty() {
                self.push_set(subs[1].part_level as usize, subs[1]);
            }
            xf += 1;
        }

        // The approximation set is the most likely to be significant;
        // keep it at the front of its bucket.
        let lev = big.part_level as usize;
        if lev >= self.lis.len() {
            self.lis.resize_with(lev + 1, Vec::new);
            self.lis_garbage.resize(lev + 1, 0);
        }
        self.lis[lev].insert(0, big);
    }

    fn push_set(&mut self, lev: usize, s: Set3) {
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

    fn set_significant(&self, set: &Set3) -> bool {
        let slice = self.dim_x * self.dim_y;
        for z in set.start_z..set.start_z + set.len_z {
            let zoff = z as usize * slice;
            for y in set.start_y..set.start_y + set.len_y {
                let off = zoff + y as usize * self.dim_x + set.start_x as usize;
                if self.coeff[off..off + set.len_x as usize]
                    .iter()
                    .any(|&c| c >= self.threshold)
                {
                    return true;
                }
            }
        }
        false
    }

    fn pixel_index(&self, s: &Set3) -> usize {
        (s.start_z as usize * self.dim_y + s.start_y as usize) * self.dim_x + s.start_x as usize
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
        Ok(())
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

    fn code_s_encode(&mut self, set: &Set3) -> Step {
        for s in partition_xyz(set) {
            if s.is_empty() {
                continue;
            }
            if s.is_pixel() {
                let idx = self.pixel_index(&s);
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
        Ok(())
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

    fn code_s_decode(&mut self, set: &Set3) -> Step {
        for s in partition_xyz(set) {
            if s.is_empty() {
                continue;
            }
            if s.is_pixel() {
                let idx = self.pixel_index(&s);
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

    /// Rebuild any LIS level whose garbage count passed half its size;
    /// LIP is compacted every plane. Runs deterministically after each
    /// bit-plane on both encode and decode.
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
