use std::time::Instant;

use rand_distr::{Distribution, StandardNormal};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use volpack::{Compressor, Decompressor};

const DIMS: (usize, usize, usize) = (256, 256, 128);
const CHUNK: (usize, usize, usize) = (64, 64, 64);
const BPP: f64 = 4.0;

fn main() {
    TermLogger::init(
        LevelFilter::Debug,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    // A correlated Gaussian field: running average of white noise so
    // the wavelet stage has something to exploit.
    let n = DIMS.0 * DIMS.1 * DIMS.2;
    let normal = StandardNormal;
    let mut rng = rand::thread_rng();
    let mut volume = Vec::with_capacity(n);
    let mut acc = 0.0f64;
    for _ in 0..n {
        let w: f64 = normal.sample(&mut rng);
        acc = 0.95 * acc + 0.05 * w;
        volume.push(acc);
    }

    let start = Instant::now();
    let mut compressor = Compressor::new();
    compressor.set_volume_dims(DIMS.0, DIMS.1, DIMS.2);
    compressor.set_chunk_dims(CHUNK.0, CHUNK.1, CHUNK.2);
    compressor.set_bits_per_pixel(BPP).unwrap();
    compressor.use_volume(&volume).unwrap();
    compressor.compress().unwrap();
    let stream = compressor.encoded_bitstream();
    println!(
        "compressed {} samples to {} bytes ({:.3} bpp) in {:?}",
        n,
        stream.len(),
        stream.len() as f64 * 8.0 / n as f64,
        start.elapsed()
    );

    let start = Instant::now();
    let mut decompressor = Decompressor::new();
    decompressor.use_bitstream(stream).unwrap();
    decompressor.decompress().unwrap();
    let recovered: Vec<f64> = decompressor.volume();
    println!("decompressed in {:?}", start.elapsed());

    let rmse = (volume
        .iter()
        .zip(&recovered)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        / n as f64)
        .sqrt();
    let linf = volume
        .iter()
        .zip(&recovered)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f64, f64::max);
    println!("rmse = {rmse:.3e}, max error = {linf:.3e}");
}
