//! Codec benchmarks: encode/decode bandwidth per format and fused dot
//! throughput against the q8 dot-side operands.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dagml::quant::decode::*;
use dagml::quant::dot;
use dagml::quant::encode::*;
use dagml::quant::*;

const N: usize = 4096;

fn test_values(n: usize) -> Vec<f32> {
    (0..n).map(|i| ((i * 37 % 255) as f32 - 127.0) * 0.01).collect()
}

macro_rules! codec_bench {
    ($group:expr, $name:literal, $blk:ty, $elems:expr, $enc:ident, $dec:ident, $x:expr) => {{
        let x = $x;
        let mut blocks = vec![unsafe { std::mem::zeroed::<$blk>() }; N / $elems];
        $group.bench_function(BenchmarkId::new("encode", $name), |b| {
            b.iter(|| $enc(black_box(&x), black_box(&mut blocks)))
        });
        $enc(&x, &mut blocks);
        let mut out = vec![0.0f32; N];
        $group.bench_function(BenchmarkId::new("decode", $name), |b| {
            b.iter(|| $dec(black_box(&blocks), black_box(&mut out)))
        });
    }};
}

fn bench_codecs(c: &mut Criterion) {
    let mut group = c.benchmark_group("quant/codec");
    group.warm_up_time(Duration::from_millis(300));
    group.measurement_time(Duration::from_secs(2));
    group.throughput(Throughput::Elements(N as u64));

    let x = test_values(N);
    codec_bench!(group, "q4_0", BlockQ4_0, 32, quantize_row_q4_0, dequantize_row_q4_0, x.clone());
    codec_bench!(group, "q8_0", BlockQ8_0, 32, quantize_row_q8_0, dequantize_row_q8_0, x.clone());
    codec_bench!(group, "q4_K", BlockQ4K, 256, quantize_row_q4_k, dequantize_row_q4_k, x.clone());
    codec_bench!(group, "q6_K", BlockQ6K, 256, quantize_row_q6_k, dequantize_row_q6_k, x);
    group.finish();
}

fn bench_dots(c: &mut Criterion) {
    let mut group = c.benchmark_group("quant/dot");
    group.warm_up_time(Duration::from_millis(300));
    group.measurement_time(Duration::from_secs(2));
    group.throughput(Throughput::Elements(2 * N as u64));

    let x = test_values(N);
    let y = test_values(N);

    let mut q4 = vec![unsafe { std::mem::zeroed::<BlockQ4_0>() }; N / 32];
    let mut q8 = vec![unsafe { std::mem::zeroed::<BlockQ8_0>() }; N / 32];
    quantize_row_q4_0(&x, &mut q4);
    quantize_row_q8_0(&y, &mut q8);
    group.bench_function("q4_0_q8_0", |b| {
        b.iter(|| unsafe {
            black_box(dot::vec_dot_q4_0_q8_0(
                N,
                q4.as_ptr() as *const u8,
                q8.as_ptr() as *const u8,
            ))
        })
    });

    let mut q4k = vec![unsafe { std::mem::zeroed::<BlockQ4K>() }; N / 256];
    let mut q8k = vec![unsafe { std::mem::zeroed::<BlockQ8K>() }; N / 256];
    quantize_row_q4_k(&x, &mut q4k);
    quantize_row_q8_k(&y, &mut q8k);
    group.bench_function("q4_K_q8_K", |b| {
        b.iter(|| unsafe {
            black_box(dot::vec_dot_q4_k_q8_k(
                N,
                q4k.as_ptr() as *const u8,
                q8k.as_ptr() as *const u8,
            ))
        })
    });

    group.bench_function("f32_f32", |b| {
        b.iter(|| unsafe { black_box(dagml::simd::vec_dot_f32(N, x.as_ptr(), y.as_ptr())) })
    });
    group.finish();
}

criterion_group!(benches, bench_codecs, bench_dots);
criterion_main!(benches);
