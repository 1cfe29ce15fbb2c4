//! End-to-end round-trip tests through the public API.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use volpack::{CodecError, Compressor, Decompressor};

fn rmse(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    (a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>() / a.len() as f64).sqrt()
}

fn linf(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

fn mean(v: &[f64]) -> f64 {
    v.iter().sum::<f64>() / v.len() as f64
}

/// Product of single tones, as a plain deterministic field.
fn tone_volume(dims: (usize, usize, usize)) -> Vec<f64> {
    let mut out = Vec::with_capacity(dims.0 * dims.1 * dims.2);
    for z in 0..dims.2 {
        for y in 0..dims.1 {
            for x in 0..dims.0 {
                out.push((x as f64).sin() * (y as f64).cos() * (z as f64).sin());
            }
        }
    }
    out
}

/// Random low-frequency field in [-1, 1]: a seeded mixture of slow
/// sinusoid products, so the transform stage has realistic structure.
fn smooth_random_volume(dims: (usize, usize, usize), seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut terms = Vec::new();
    let mut amp_sum = 0.0;
    for _ in 0..3 {
        let amp: f64 = rng.gen_range(0.1..0.5);
        amp_sum += amp;
        terms.push((
            amp,
            rng.gen_range(0.03..0.15),
            rng.gen_range(0.03..0.15),
            rng.gen_range(0.03..0.15),
            rng.gen_range(0.0..std::f64::consts::TAU),
        ));
    }
    let mut out = Vec::with_capacity(dims.0 * dims.1 * dims.2);
    for z in 0..dims.2 {
        for y in 0..dims.1 {
            for x in 0..dims.0 {
                let mut v = 0.0;
                for &(a, fx, fy, fz, phase) in &terms {
                    v += a
                        * (x as f64 * fx + phase).sin()
                        * (y as f64 * fy).cos()
                        * (z as f64 * fz + phase).sin();
                }
                out.push(v / amp_sum);
            }
        }
    }
    out
}

/// Smooth field with white noise mixed in, for rate-mode stress.
fn noisy_volume(dims: (usize, usize, usize), seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    smooth_random_volume(dims, seed)
        .into_iter()
        .map(|v| 0.7 * v + 0.3 * rng.gen_range(-1.0..1.0))
        .collect()
}

fn compress_rate(
    volume: &[f64],
    dims: (usize, usize, usize),
    chunk: (usize, usize, usize),
    bpp: f64,
    threads: usize,
) -> Vec<u8> {
    let mut c = Compressor::new();
    c.set_volume_dims(dims.0, dims.1, dims.2);
    c.set_chunk_dims(chunk.0, chunk.1, chunk.2);
    c.set_num_threads(threads);
    c.set_bits_per_pixel(bpp).unwrap();
    c.use_volume(volume).unwrap();
    c.compress().unwrap();
    c.encoded_bitstream().to_vec()
}

fn decompress(stream: &[u8]) -> (Vec<f64>, (usize, usize, usize)) {
    let mut d = Decompressor::new();
    d.use_bitstream(stream).unwrap();
    d.decompress().unwrap();
    (d.volume(), d.dims())
}

// E1: all-zero volume at 1 bpp decodes to all zeros and the stream is
// exactly as long as its header declares.
#[test]
fn e1_zero_volume() {
    let dims = (8, 8, 8);
    let volume = vec![0.0f64; 512];
    let stream = compress_rate(&volume, dims, (0, 0, 0), 1.0, 1);

    // one chunk: header + 4-byte length table
    let declared = u32::from_le_bytes(stream[28..32].try_into().unwrap()) as usize;
    assert_eq!(stream.len(), 28 + 4 + declared);

    let (out, odims) = decompress(&stream);
    assert_eq!(odims, dims);
    assert!(out.iter().all(|&v| v == 0.0));
}

// E2: smooth 32^3 volume at 4 bpp reconstructs with small RMSE.
#[test]
fn e2_tone_volume_4bpp() {
    let dims = (32, 32, 32);
    let volume = tone_volume(dims);
    let stream = compress_rate(&volume, dims, (0, 0, 0), 4.0, 0);
    let (out, _) = decompress(&stream);
    let err = rmse(&volume, &out);
    assert!(err < 1e-2, "rmse = {err}");
}

// E3: odd non-power-of-two dims round-trip exactly; the smooth random
// field reconstructs well below the RMSE bound and the mean survives.
#[test]
fn e3_odd_dims_8bpp() {
    let dims = (17, 19, 23);
    let volume = smooth_random_volume(dims, 42);
    let stream = compress_rate(&volume, dims, (0, 0, 0), 8.0, 0);
    let (out, odims) = decompress(&stream);
    assert_eq!(odims, dims);
    let err = rmse(&volume, &out);
    assert!(err < 1e-3, "rmse = {err}");
    let mean_err = (mean(&volume) - mean(&out)).abs();
    assert!(mean_err < 1e-3, "mean drift = {mean_err}");
}

// A constant volume reconstructs its mean essentially exactly.
#[test]
fn constant_volume_mean_recovery() {
    let dims = (16, 16, 16);
    let volume = vec![std::f64::consts::FRAC_PI_3; 4096];
    let stream = compress_rate(&volume, dims, (0, 0, 0), 8.0, 0);
    let (out, _) = decompress(&stream);
    let mean_err = (mean(&volume) - mean(&out)).abs();
    assert!(mean_err < 1e-12, "mean drift = {mean_err}");
}

// E4: fixed-quality mode bounds every sample's error by the tolerance,
// and reports outliers when the SPECK stage alone cannot meet it.
#[test]
fn e4_fixed_quality_tolerance() {
    let dims = (64, 64, 64);
    let volume = smooth_random_volume(dims, 7);
    let tol = 1e-3;

    let mut c = Compressor::new();
    c.set_volume_dims(dims.0, dims.1, dims.2);
    c.set_chunk_dims(0, 0, 0);
    c.set_quantization_level(0);
    c.set_tolerance(tol).unwrap();
    c.use_volume(&volume).unwrap();
    c.compress().unwrap();
    // At floor 0 the SPECK stage is far coarser than the tolerance, so
    // corrections must be present.
    let (outliers, sperr_bytes) = c.outlier_stats();
    assert!(outliers > 0);
    assert!(sperr_bytes > 0);

    let (out, _) = decompress(c.encoded_bitstream());
    let err = linf(&volume, &out);
    assert!(err <= tol, "max error = {err}");
}

// Fixed-quality with a floor far below the tolerance: the SPECK stage
// alone suffices and no outliers are coded.
#[test]
fn fixed_quality_without_outliers() {
    let dims = (16, 16, 16);
    let volume = smooth_random_volume(dims, 13);
    let tol = 1e-3;

    let mut c = Compressor::new();
    c.set_volume_dims(dims.0, dims.1, dims.2);
    c.set_quantization_level(-40);
    c.set_tolerance(tol).unwrap();
    c.use_volume(&volume).unwrap();
    c.compress().unwrap();
    assert_eq!(c.outlier_stats(), (0, 0));

    let (out, _) = decompress(c.encoded_bitstream());
    assert!(linf(&volume, &out) <= tol);
}

// E5: 128^3 split into 8 chunks; the bitstream and reconstruction are
// a pure function of the input, whatever the worker count.
#[test]
fn e5_thread_count_invariance() {
    let dims = (128, 128, 128);
    let volume = noisy_volume(dims, 99);

    let streams: Vec<Vec<u8>> = [1usize, 4, 8]
        .iter()
        .map(|&t| compress_rate(&volume, dims, (64, 64, 64), 1.0, t))
        .collect();
    assert_eq!(streams[0], streams[1]);
    assert_eq!(streams[0], streams[2]);

    // 8 chunk lengths in the table
    let table = &streams[0][28..28 + 32];
    assert_eq!(table.len(), 32);

    let mut reference: Option<Vec<f64>> = None;
    for threads in [1usize, 4, 8] {
        let mut d = Decompressor::new();
        d.set_num_threads(threads);
        d.use_bitstream(&streams[0]).unwrap();
        d.decompress().unwrap();
        let out: Vec<f64> = d.volume();
        match &reference {
            None => reference = Some(out),
            Some(r) => assert_eq!(r, &out),
        }
    }
}

// E6: a truncated stream and a bad version byte are rejected with the
// right error classes.
#[test]
fn e6_corrupt_streams() {
    let dims = (16, 16, 16);
    let volume = smooth_random_volume(dims, 3);
    let stream = compress_rate(&volume, dims, (0, 0, 0), 2.0, 1);

    let truncated = &stream[..stream.len() - 1];
    let mut d = Decompressor::new();
    match d.use_bitstream(truncated) {
        Err(CodecError::WrongSize) => {}
        other => panic!("expected WrongSize, got {other:?}"),
    }

    let mut bad_version = stream.clone();
    bad_version[0] = 0xFF;
    let mut d = Decompressor::new();
    match d.use_bitstream(&bad_version) {
        Err(CodecError::VersionMismatch(0xFF)) => {}
        other => panic!("expected VersionMismatch, got {other:?}"),
    }
}

// Rate-mode monotonicity: a larger budget never reconstructs worse.
#[test]
fn rate_monotonicity() {
    let dims = (32, 32, 32);
    let volume = noisy_volume(dims, 55);
    let lo = compress_rate(&volume, dims, (0, 0, 0), 0.5, 1);
    let hi = compress_rate(&volume, dims, (0, 0, 0), 4.0, 1);
    let (out_lo, _) = decompress(&lo);
    let (out_hi, _) = decompress(&hi);
    assert!(rmse(&volume, &out_hi) <= rmse(&volume, &out_lo));
}

// A Dz = 1 volume takes the 2D coding path end to end.
#[test]
fn planar_volume_roundtrip() {
    let dims = (64, 48, 1);
    let volume = smooth_random_volume(dims, 21);
    let stream = compress_rate(&volume, dims, (32, 0, 0), 8.0, 2);
    // flags byte: not 3D, not fixed-quality
    assert_eq!(stream[1] & 0b10, 0);
    let (out, odims) = decompress(&stream);
    assert_eq!(odims, dims);
    let err = rmse(&volume, &out);
    assert!(err < 1e-3, "rmse = {err}");
}

// f32 volumes go in and come out through the same pipeline.
#[test]
fn f32_volume_roundtrip() {
    let dims = (24, 24, 24);
    let volume: Vec<f32> = smooth_random_volume(dims, 77)
        .into_iter()
        .map(|v| v as f32)
        .collect();

    let mut c = Compressor::new();
    c.set_volume_dims(dims.0, dims.1, dims.2);
    c.set_bits_per_pixel(16.0).unwrap();
    c.use_volume(&volume).unwrap();
    c.compress().unwrap();

    let mut d = Decompressor::new();
    d.use_bitstream(c.encoded_bitstream()).unwrap();
    d.decompress().unwrap();
    let out: Vec<f32> = d.volume();
    let err = volume
        .iter()
        .zip(&out)
        .map(|(a, b)| (a - b).abs() as f64)
        .fold(0.0, f64::max);
    assert!(err < 1e-3, "max error = {err}");
}

#[test]
fn parameter_validation() {
    let mut c = Compressor::new();
    assert!(c.set_bits_per_pixel(0.0).is_err());
    assert!(c.set_bits_per_pixel(64.5).is_err());
    assert!(c.set_tolerance(-1.0).is_err());

    // dims not set yet
    assert!(c.use_volume(&[0.0f64; 8]).is_err());

    c.set_volume_dims(4, 4, 4);
    match c.use_volume(&[0.0f64; 63]) {
        Err(CodecError::WrongSize) => {}
        other => panic!("expected WrongSize, got {other:?}"),
    }

    // no mode configured
    c.use_volume(&[0.0f64; 64]).unwrap();
    assert!(c.compress().is_err());

    // both modes configured at once is also rejected
    c.set_bits_per_pixel(2.0).unwrap();
    c.set_quantization_level(0);
    c.set_tolerance(1e-3).unwrap();
    assert!(c.compress().is_err());

    let mut d = Decompressor::new();
    assert!(d.decompress().is_err());
}
