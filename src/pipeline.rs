//! The per-chunk pipeline: wavelet transform, SPECK coding, and (in
//! fixed-quality mode) the outlier-correction stage. Each worker owns
//! one `ChunkCompressor`/`ChunkDecompressor` and reuses it across the
//! chunks it is handed.

use log::trace;

use crate::bits::BitBuffer;
use crate::cdf97::Cdf97;
use crate::error::{CodecError, Result};
use crate::speck::speck2d::Speck2d;
use crate::speck::speck3d::Speck3d;
use crate::speck::{ChunkHeader, CodingMode, CHUNK_HEADER_SIZE};
use crate::sperr::Sperr;

/// Sample types accepted at the crate boundary.
pub trait Sample: Copy + Send + Sync + 'static {
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

impl Sample for f64 {
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl Sample for f32 {
    #[inline]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

/// How every chunk of the volume is to be coded.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ChunkMode {
    Rate { bpp: f64 },
    Quality { qz_level: i32, tolerance: f64 },
}

/// Per-chunk outlier statistics: count and SPERR payload bytes.
pub(crate) type OutlierStats = (u64, u64);

pub(crate) struct ChunkCompressor {
    cdf: Cdf97,
    speck3: Speck3d,
    speck2: Speck2d,
    sperr: Sperr,
}

impl ChunkCompressor {
    pub fn new() -> Self {
        Self {
            cdf: Cdf97::new(),
            speck3: Speck3d::new(),
            speck2: Speck2d::new(),
            sperr: Sperr::new(),
        }
    }

    /// Run the full pipeline on one chunk's samples and return its
    /// byte stream plus outlier statistics.
    pub fn compress(
        &mut self,
        samples: Vec<f64>,
        dims: (usize, usize, usize),
        mode: ChunkMode,
    ) -> Result<(Vec<u8>, OutlierStats)> {
        let nvals = dims.0 * dims.1 * dims.2;
        debug_assert_eq!(samples.len(), nvals);
        let original = match mode {
            ChunkMode::Quality { .. } => samples.clone(),
            ChunkMode::Rate { .. } => Vec::new(),
        };

        self.cdf.take_data(samples, dims);
        if dims.2 > 1 {
            self.cdf.dwt3d();
        } else {
            self.cdf.dwt2d();
        }
        let mean = self.cdf.mean();
        let coeffs = self.cdf.release_data();

        let coding = match mode {
            ChunkMode::Rate { bpp } => {
                // Round the budget up so the stream fills its last byte.
                let mut budget = (bpp * nvals as f64) as usize;
                if budget % 8 != 0 {
                    budget += 8 - budget % 8;
                }
                CodingMode::Rate { budget }
            }
            ChunkMode::Quality { qz_level, .. } => CodingMode::Quality { qz_level },
        };

        let (header, bit_bytes) = if dims.2 > 1 {
            self.speck3.take_data(coeffs, dims);
            self.speck3.set_mode(coding);
            self.speck3.encode()?;
            (self.speck3.header(mean), self.speck3.bit_buffer().to_bytes())
        } else {
            self.speck2.take_data(coeffs, (dims.0, dims.1));
            self.speck2.set_mode(coding);
            self.speck2.encode()?;
            (self.speck2.header(mean), self.speck2.bit_buffer().to_bytes())
        };

        let mut stream = Vec::with_capacity(CHUNK_HEADER_SIZE + bit_bytes.len());
        header.write(&mut stream)?;
        stream.extend_from_slice(&bit_bytes);

        let mut stats: OutlierStats = (0, 0);
        if let ChunkMode::Quality { tolerance, .. } = mode {
            // Reconstruct what the decoder will see and code whatever
            // still exceeds the tolerance.
            let recon = self.reconstruct(dims, mean)?;
            self.sperr.clear_outliers();
            self.sperr.set_length(nvals);
            self.sperr.set_tolerance(tolerance);
            for (i, (&orig, &rec)) in original.iter().zip(&recon).enumerate() {
                let diff = orig - rec;
                if diff.abs() > tolerance {
                    self.sperr.add_outlier(i, diff);
                }
            }
            if self.sperr.num_outliers() > 0 {
                self.sperr.encode()?;
                let sperr_stream = self.sperr.encoded_stream()?;
                stats = (self.sperr.num_outliers() as u64, sperr_stream.len() as u64);
                stream.extend_from_slice(&sperr_stream);
            }
            trace!(
                "chunk {}x{}x{}: {} speck bytes, {} outliers",
                dims.0, dims.1, dims.2, bit_bytes.len(), stats.0
            );
        }
        Ok((stream, stats))
    }

    /// Decode this coder's own bits and invert the transform, giving
    /// the exact volume the decoder will reconstruct.
    fn reconstruct(&mut self, dims: (usize, usize, usize), mean: f64) -> Result<Vec<f64>> {
        let coeffs = if dims.2 > 1 {
            self.speck3.decode()?;
            self.speck3.release_data()
        } else {
            self.speck2.decode()?;
            self.speck2.release_data()
        };
        self.cdf.take_data(coeffs, dims);
        self.cdf.set_mean(mean);
        if dims.2 > 1 {
            self.cdf.idwt3d();
        } else {
            self.cdf.idwt2d();
        }
        Ok(self.cdf.release_data())
    }
}

pub(crate) struct ChunkDecompressor {
    cdf: Cdf97,
    speck3: Speck3d,
    speck2: Speck2d,
    sperr: Sperr,
}

impl ChunkDecompressor {
    pub fn new() -> Self {
        Self {
            cdf: Cdf97::new(),
            speck3: Speck3d::new(),
            speck2: Speck2d::new(),
            sperr: Sperr::new(),
        }
    }

    pub fn decompress(
        &mut self,
        stream: &[u8],
        quality_mode: bool,
        expect: (usize, usize, usize),
    ) -> Result<Vec<f64>> {
        if stream.len() < CHUNK_HEADER_SIZE {
            return Err(CodecError::WrongSize);
        }
        let header = ChunkHeader::read(stream)?;
        let dims = (
            header.dim_x as usize,
            header.dim_y as usize,
            header.dim_z as usize,
        );
        if dims != expect {
            return Err(CodecError::DimMismatch);
        }
        let payload = &stream[CHUNK_HEADER_SIZE..];

        // In rate mode the header carries the exact bit count. In
        // fixed-quality mode it carries the quantization floor; the
        // decoder consumes exactly the bits the encoder emitted, and
        // the outlier stream starts at the next byte boundary.
        let (coeffs, consumed) = if dims.2 > 1 {
            self.speck3.set_dims(dims);
            self.speck3.set_max_coeff_bits(header.max_coeff_bits);
            if quality_mode {
                self.speck3
                    .set_mode(CodingMode::Quality { qz_level: header.term as i32 });
                self.speck3
                    .set_bit_buffer(BitBuffer::from_bytes(payload, payload.len() * 8));
            } else {
                let num_bits = header.term as usize;
                if CHUNK_HEADER_SIZE + (num_bits + 7) / 8 != stream.len() {
                    return Err(CodecError::WrongSize);
                }
                self.speck3.set_mode(CodingMode::Rate { budget: num_bits });
                self.speck3
                    .set_bit_buffer(BitBuffer::from_bytes(payload, num_bits));
            }
            self.speck3.decode()?;
            (self.speck3.release_data(), self.speck3.bits_consumed())
        } else {
            self.speck2.set_dims((dims.0, dims.1));
            self.speck2.set_max_coeff_bits(header.max_coeff_bits);
            if quality_mode {
                self.speck2
                    .set_mode(CodingMode::Quality { qz_level: header.term as i32 });
                self.speck2
                    .set_bit_buffer(BitBuffer::from_bytes(payload, payload.len() * 8));
            } else {
                let num_bits = header.term as usize;
                if CHUNK_HEADER_SIZE + (num_bits + 7) / 8 != stream.len() {
                    return Err(CodecError::WrongSize);
                }
                self.speck2.set_mode(CodingMode::Rate { budget: num_bits });
                self.speck2
                    .set_bit_buffer(BitBuffer::from_bytes(payload, num_bits));
            }
            self.speck2.decode()?;
            (self.speck2.release_data(), self.speck2.bits_consumed())
        };

        self.cdf.take_data(coeffs, dims);
        self.cdf.set_mean(header.mean);
        if dims.2 > 1 {
            self.cdf.idwt3d();
        } else {
            self.cdf.idwt2d();
        }
        let mut out = self.cdf.release_data();

        if quality_mode {
            let sperr_off = CHUNK_HEADER_SIZE + (consumed + 7) / 8;
            if sperr_off < stream.len() {
                self.sperr.parse_stream(&stream[sperr_off..])?;
                self.sperr.decode()?;
                for o in self.sperr.outliers() {
                    if o.location >= out.len() {
                        return Err(CodecError::WrongSize);
                    }
                    out[o.location] += o.error;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smooth_chunk(dims: (usize, usize, usize)) -> Vec<f64> {
        let mut out = Vec::with_capacity(dims.0 * dims.1 * dims.2);
        for z in 0..dims.2 {
            for y in 0..dims.1 {
                for x in 0..dims.0 {
                    out.push((x as f64 * 0.3).sin() * (y as f64 * 0.2).cos() + z as f64 * 0.01);
                }
            }
        }
        out
    }

    #[test]
    fn rate_mode_chunk_roundtrip() {
        let dims = (24, 20, 12);
        let orig = smooth_chunk(dims);
        let mut cc = ChunkCompressor::new();
        let (stream, stats) = cc
            .compress(orig.clone(), dims, ChunkMode::Rate { bpp: 16.0 })
            .unwrap();
        assert_eq!(stats, (0, 0));

        let mut cd = ChunkDecompressor::new();
        let out = cd.decompress(&stream, false, dims).unwrap();
        let rmse = (orig
            .iter()
            .zip(&out)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            / orig.len() as f64)
            .sqrt();
        assert!(rmse < 1e-3, "rmse = {rmse}");
    }

    #[test]
    fn quality_mode_chunk_respects_tolerance() {
        let dims = (16, 16, 16);
        let orig = smooth_chunk(dims);
        let tol = 1e-4;
        let mut cc = ChunkCompressor::new();
        let (stream, _) = cc
            .compress(
                orig.clone(),
                dims,
                ChunkMode::Quality { qz_level: 0, tolerance: tol },
            )
            .unwrap();

        let mut cd = ChunkDecompressor::new();
        let out = cd.decompress(&stream, true, dims).unwrap();
        for (a, b) in orig.iter().zip(&out) {
            assert!((a - b).abs() <= tol, "{a} vs {b}");
        }
    }

    #[test]
    fn planar_chunk_uses_2d_path() {
        let dims = (40, 28, 1);
        let orig = smooth_chunk(dims);
        let mut cc = ChunkCompressor::new();
        let (stream, _) = cc
            .compress(orig.clone(), dims, ChunkMode::Rate { bpp: 20.0 })
            .unwrap();
        let mut cd = ChunkDecompressor::new();
        let out = cd.decompress(&stream, false, dims).unwrap();
        let rmse = (orig
            .iter()
            .zip(&out)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            / orig.len() as f64)
            .sqrt();
        assert!(rmse < 1e-3, "rmse = {rmse}");
    }

    #[test]
    fn wrong_expected_dims_is_dim_mismatch() {
        let dims = (16, 16, 16);
        let orig = smooth_chunk(dims);
        let mut cc = ChunkCompressor::new();
        let (stream, _) = cc
            .compress(orig, dims, ChunkMode::Rate { bpp: 4.0 })
            .unwrap();
        let mut cd = ChunkDecompressor::new();
        match cd.decompress(&stream, false, (16, 16, 8)) {
            Err(CodecError::DimMismatch) => {}
            other => panic!("expected DimMismatch, got {other:?}"),
        }
    }
}
