//! Public compressor/decompressor pair: chunked, rayon-parallel
//! drivers around the per-chunk pipeline, plus the top-level bitstream
//! framing.
//!
//! Top header layout (little-endian): version byte, flags byte, two
//! reserved zero bytes, six u32 (volume dims, chunk dims), then one
//! u32 length per chunk stream. Flag bit 0 marks an outer generic
//! compression pass (never produced here), bit 1 a 3D payload, bit 2 a
//! fixed-quality payload.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use ndarray::{Array3, ArrayView3};
use rayon::prelude::*;

use crate::chunk::{chunk_volume, gather_chunk, scatter_chunk, Chunk};
use crate::error::{CodecError, Result};
use crate::pipeline::{ChunkCompressor, ChunkDecompressor, ChunkMode, OutlierStats, Sample};

pub(crate) const VERSION_MAJOR: u8 = 1;
pub(crate) const VERSION_MINOR: u8 = 0;

const TOP_HEADER_SIZE: usize = 28;

const FLAG_GENERIC_COMPRESSION: u8 = 1 << 0;
const FLAG_3D: u8 = 1 << 1;
const FLAG_FIXED_QUALITY: u8 = 1 << 2;

fn version_byte() -> u8 {
    10 * VERSION_MAJOR + VERSION_MINOR
}

fn build_pool(num_threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|_| CodecError::Other("failed to build thread pool"))
}

/// Volume encoder. Configure with the setters, hand over the samples,
/// then call [`compress`](Compressor::compress).
#[derive(Default)]
pub struct Compressor {
    dims: (usize, usize, usize),
    chunk_dims: (usize, usize, usize),
    num_threads: usize,
    bpp: Option<f64>,
    qz_level: Option<i32>,
    tolerance: Option<f64>,
    chunk_buffers: Vec<Vec<f64>>,
    outlier_stats: Vec<OutlierStats>,
    bitstream: Vec<u8>,
}

impl Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_volume_dims(&mut self, x: usize, y: usize, z: usize) {
        self.dims = (x, y, z);
    }

    /// Preferred chunk extents; 0 on an axis means "use the volume
    /// extent".
    pub fn set_chunk_dims(&mut self, x: usize, y: usize, z: usize) {
        self.chunk_dims = (x, y, z);
    }

    /// Worker count for the per-chunk passes; 0 selects the hardware
    /// parallelism.
    pub fn set_num_threads(&mut self, n: usize) {
        self.num_threads = n;
    }

    /// Rate mode: stop each chunk after `bpp` bits per sample.
    pub fn set_bits_per_pixel(&mut self, bpp: f64) -> Result<()> {
        if !(bpp > 0.0 && bpp <= 64.0) {
            return Err(CodecError::InvalidParam("bpp must be in (0, 64]"));
        }
        self.bpp = Some(bpp);
        Ok(())
    }

    /// Fixed-quality mode: quantization floor for the SPECK stage.
    pub fn set_quantization_level(&mut self, q: i32) {
        self.qz_level = Some(q);
    }

    /// Fixed-quality mode: point-wise error bound enforced by the
    /// outlier corrector.
    pub fn set_tolerance(&mut self, tolerance: f64) -> Result<()> {
        if tolerance <= 0.0 {
            return Err(CodecError::InvalidParam("tolerance must be positive"));
        }
        self.tolerance = Some(tolerance);
        Ok(())
    }

    /// Copy the volume in, chunked. Length must equal the product of
    /// the volume dimensions.
    pub fn use_volume<T: Sample>(&mut self, samples: &[T]) -> Result<()> {
        let (dx, dy, dz) = self.dims;
        if dx == 0 || dy == 0 || dz == 0 {
            return Err(CodecError::InvalidParam("volume dimensions not set"));
        }
        if samples.len() != dx * dy * dz {
            return Err(CodecError::WrongSize);
        }
        let view =
            ArrayView3::from_shape((dz, dy, dx), samples).map_err(|_| CodecError::WrongSize)?;
        let chunks = chunk_volume(self.dims, self.resolved_chunk_dims());
        self.chunk_buffers = chunks.iter().map(|c| gather_chunk(&view, c)).collect();
        Ok(())
    }

    pub fn compress(&mut self) -> Result<()> {
        let mode = match (self.bpp, self.qz_level, self.tolerance) {
            (Some(bpp), None, None) => ChunkMode::Rate { bpp },
            (None, Some(qz_level), Some(tolerance)) => ChunkMode::Quality { qz_level, tolerance },
            _ => {
                return Err(CodecError::InvalidParam(
                    "set either bits-per-pixel or quantization level plus tolerance",
                ))
            }
        };
        let chunks = chunk_volume(self.dims, self.resolved_chunk_dims());
        if self.chunk_buffers.len() != chunks.len() {
            return Err(CodecError::Other("use_volume must be called first"));
        }
        debug!(
            "compressing {}x{}x{} as {} chunks ({:?})",
            self.dims.0,
            self.dims.1,
            self.dims.2,
            chunks.len(),
            mode
        );

        let buffers = std::mem::take(&mut self.chunk_buffers);
        let pool = build_pool(self.num_threads)?;
        let results: Result<Vec<(Vec<u8>, OutlierStats)>> = pool.install(|| {
            chunks
                .par_iter()
                .zip(buffers.into_par_iter())
                .map_init(ChunkCompressor::new, |cc, (chunk, buf)| {
                    cc.compress(buf, chunk.dims(), mode)
                })
                .collect()
        });
        // A single failed chunk fails the whole operation; no partial
        // bitstream is kept.
        let results = results?;

        let mut streams = Vec::with_capacity(results.len());
        self.outlier_stats = Vec::with_capacity(results.len());
        for (stream, stats) in results {
            streams.push(stream);
            self.outlier_stats.push(stats);
        }
        self.bitstream =
            self.assemble(&chunks, &streams, matches!(mode, ChunkMode::Quality { .. }))?;
        Ok(())
    }

    /// The assembled bitstream; empty until
    /// [`compress`](Compressor::compress) succeeds.
    pub fn encoded_bitstream(&self) -> &[u8] {
        &self.bitstream
    }

    /// Aggregate over all chunks: (outliers corrected, SPERR payload
    /// bytes). Both zero in rate mode.
    pub fn outlier_stats(&self) -> (u64, u64) {
        self.outlier_stats
            .iter()
            .fold((0, 0), |acc, s| (acc.0 + s.0, acc.1 + s.1))
    }

    fn resolved_chunk_dims(&self) -> (usize, usize, usize) {
        let (cx, cy, cz) = self.chunk_dims;
        (
            if cx == 0 { self.dims.0 } else { cx },
            if cy == 0 { self.dims.1 } else { cy },
            if cz == 0 { self.dims.2 } else { cz },
        )
    }

    fn assemble(&self, chunks: &[Chunk], streams: &[Vec<u8>], quality: bool) -> Result<Vec<u8>> {
        let payload: usize = streams.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(TOP_HEADER_SIZE + 4 * streams.len() + payload);

        out.push(version_byte());
        let mut flags = 0u8;
        if self.dims.2 > 1 {
            flags |= FLAG_3D;
        }
        if quality {
            flags |= FLAG_FIXED_QUALITY;
        }
        out.push(flags);
        out.extend_from_slice(&[0, 0]); // reserved

        let (cx, cy, cz) = self.resolved_chunk_dims();
        for d in [self.dims.0, self.dims.1, self.dims.2, cx, cy, cz] {
            out.write_u32::<LittleEndian>(
                u32::try_from(d).map_err(|_| CodecError::InvalidParam("dimension exceeds u32"))?,
            )?;
        }
        debug_assert_eq!(chunks.len(), streams.len());
        for s in streams {
            out.write_u32::<LittleEndian>(
                u32::try_from(s.len()).map_err(|_| CodecError::Other("chunk stream too long"))?,
            )?;
        }
        for s in streams {
            out.extend_from_slice(s);
        }
        Ok(out)
    }
}

/// Volume decoder: parse with
/// [`use_bitstream`](Decompressor::use_bitstream), then
/// [`decompress`](Decompressor::decompress) and read the samples out.
#[derive(Default)]
pub struct Decompressor {
    dims: (usize, usize, usize),
    chunk_dims: (usize, usize, usize),
    num_threads: usize,
    quality_mode: bool,
    chunk_streams: Vec<Vec<u8>>,
    volume: Vec<f64>,
}

impl Decompressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_num_threads(&mut self, n: usize) {
        self.num_threads = n;
    }

    /// Parse the top header and slice the payload into per-chunk
    /// streams.
    pub fn use_bitstream(&mut self, stream: &[u8]) -> Result<()> {
        if stream.len() < TOP_HEADER_SIZE {
            return Err(CodecError::WrongSize);
        }
        let version = stream[0];
        if version / 10 != VERSION_MAJOR {
            return Err(CodecError::VersionMismatch(version));
        }
        let flags = stream[1];
        if flags & FLAG_GENERIC_COMPRESSION != 0 {
            return Err(CodecError::CompressionError);
        }

        let mut cur = Cursor::new(&stream[4..TOP_HEADER_SIZE]);
        let mut d = [0u32; 6];
        for v in &mut d {
            *v = cur.read_u32::<LittleEndian>()?;
        }
        if d[..3].iter().any(|&v| v == 0) {
            return Err(CodecError::DimMismatch);
        }
        let is_3d = d[2] > 1;
        if is_3d != (flags & FLAG_3D != 0) {
            return Err(CodecError::DimMismatch);
        }
        self.dims = (d[0] as usize, d[1] as usize, d[2] as usize);
        self.chunk_dims = (
            if d[3] == 0 { self.dims.0 } else { d[3] as usize },
            if d[4] == 0 { self.dims.1 } else { d[4] as usize },
            if d[5] == 0 { self.dims.2 } else { d[5] as usize },
        );
        self.quality_mode = flags & FLAG_FIXED_QUALITY != 0;

        let chunks = chunk_volume(self.dims, self.chunk_dims);
        let table_end = TOP_HEADER_SIZE + 4 * chunks.len();
        if stream.len() < table_end {
            return Err(CodecError::WrongSize);
        }
        let mut cur = Cursor::new(&stream[TOP_HEADER_SIZE..table_end]);
        let mut lengths = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            lengths.push(cur.read_u32::<LittleEndian>()? as usize);
        }
        // The payload must match the declared lengths exactly.
        if stream.len() != table_end + lengths.iter().sum::<usize>() {
            return Err(CodecError::WrongSize);
        }

        self.chunk_streams.clear();
        let mut pos = table_end;
        for len in lengths {
            self.chunk_streams.push(stream[pos..pos + len].to_vec());
            pos += len;
        }
        self.volume.clear();
        Ok(())
    }

    pub fn decompress(&mut self) -> Result<()> {
        if self.chunk_streams.is_empty() {
            return Err(CodecError::Other("use_bitstream must be called first"));
        }
        let chunks = chunk_volume(self.dims, self.chunk_dims);
        debug!(
            "decompressing {}x{}x{} from {} chunks",
            self.dims.0,
            self.dims.1,
            self.dims.2,
            chunks.len()
        );

        let quality = self.quality_mode;
        let pool = build_pool(self.num_threads)?;
        let decoded: Result<Vec<Vec<f64>>> = pool.install(|| {
            chunks
                .par_iter()
                .zip(self.chunk_streams.par_iter())
                .map_init(ChunkDecompressor::new, |cd, (chunk, stream)| {
                    cd.decompress(stream, quality, chunk.dims())
                })
                .collect()
        });
        let decoded = decoded?;

        let (dx, dy, dz) = self.dims;
        let mut out = Array3::zeros((dz, dy, dx));
        for (chunk, data) in chunks.iter().zip(&decoded) {
            scatter_chunk(&mut out.view_mut(), data, chunk);
        }
        self.volume = out.into_raw_vec();
        Ok(())
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    /// The decoded samples, x fastest; empty until
    /// [`decompress`](Decompressor::decompress) succeeds.
    pub fn volume<T: Sample>(&self) -> Vec<T> {
        self.volume.iter().map(|&v| T::from_f64(v)).collect()
    }
}
