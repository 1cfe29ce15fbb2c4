//! Partitioning of a volume into rectangular chunks and the dense
//! copies in and out of chunk-local buffers.

use ndarray::{s, ArrayView3, ArrayViewMut3};

use crate::pipeline::Sample;

/// One rectangular subvolume: offsets and lengths per axis. Chunks
/// tile the volume without overlap; the last chunk per axis may be
/// shorter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub ox: usize,
    pub oy: usize,
    pub oz: usize,
    pub lx: usize,
    pub ly: usize,
    pub lz: usize,
}

impl Chunk {
    pub fn num_vals(&self) -> usize {
        self.lx * self.ly * self.lz
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.lx, self.ly, self.lz)
    }
}

/// Enumerate chunks in coding order: z outer, y middle, x inner.
pub(crate) fn chunk_volume(
    dims: (usize, usize, usize),
    chunk: (usize, usize, usize),
) -> Vec<Chunk> {
    debug_assert!(chunk.0 > 0 && chunk.1 > 0 && chunk.2 > 0);
    let mut out = Vec::new();
    for oz in (0..dims.2).step_by(chunk.2) {
        let lz = chunk.2.min(dims.2 - oz);
        for oy in (0..dims.1).step_by(chunk.1) {
            let ly = chunk.1.min(dims.1 - oy);
            for ox in (0..dims.0).step_by(chunk.0) {
                let lx = chunk.0.min(dims.0 - ox);
                out.push(Chunk {
                    ox,
                    oy,
                    oz,
                    lx,
                    ly,
                    lz,
                });
            }
        }
    }
    out
}

/// Dense copy of one chunk's samples, x fastest, converted to f64.
pub(crate) fn gather_chunk<T: Sample>(vol: &ArrayView3<'_, T>, c: &Chunk) -> Vec<f64> {
    vol.slice(s![c.oz..c.oz + c.lz, c.oy..c.oy + c.ly, c.ox..c.ox + c.lx])
        .iter()
        .map(|&v| v.to_f64())
        .collect()
}

/// Write a decoded chunk back into the output volume at its offsets.
pub(crate) fn scatter_chunk(out: &mut ArrayViewMut3<'_, f64>, data: &[f64], c: &Chunk) {
    debug_assert_eq!(data.len(), c.num_vals());
    let mut view = out.slice_mut(s![c.oz..c.oz + c.lz, c.oy..c.oy + c.ly, c.ox..c.ox + c.lx]);
    for (dst, &src) in view.iter_mut().zip(data) {
        *dst = src;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn eight_chunks_in_coding_order() {
        let chunks = chunk_volume((128, 128, 128), (64, 64, 64));
        assert_eq!(chunks.len(), 8);
        // x inner, then y, then z
        assert_eq!(chunks[0], Chunk { ox: 0, oy: 0, oz: 0, lx: 64, ly: 64, lz: 64 });
        assert_eq!(chunks[1].ox, 64);
        assert_eq!(chunks[2].oy, 64);
        assert_eq!(chunks[4].oz, 64);
    }

    #[test]
    fn last_chunk_is_clipped() {
        let chunks = chunk_volume((10, 7, 1), (4, 4, 4));
        assert_eq!(chunks.len(), 6);
        let last = chunks[chunks.len() - 1];
        assert_eq!((last.lx, last.ly, last.lz), (2, 3, 1));
        let total: usize = chunks.iter().map(Chunk::num_vals).sum();
        assert_eq!(total, 70);
    }

    #[test]
    fn gather_scatter_roundtrip() {
        let dims = (5usize, 4usize, 3usize);
        let vol = Array3::from_shape_fn((dims.2, dims.1, dims.0), |(z, y, x)| {
            (z * 100 + y * 10 + x) as f64
        });
        let mut out = Array3::zeros((dims.2, dims.1, dims.0));
        for c in chunk_volume(dims, (2, 3, 2)) {
            let data = gather_chunk(&vol.view(), &c);
            scatter_chunk(&mut out.view_mut(), &data, &c);
        }
        assert_eq!(vol, out);
    }
}
