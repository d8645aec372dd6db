//! SIMD-accelerated row kernels
//!
//! The instruction set is detected once per process, so every call in a run
//! takes the same code path and produces the same rounding.

use std::sync::OnceLock;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;
#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsaLevel {
    Scalar,
    Sse,
    Avx2,
    Neon,
}

static ISA_LEVEL: OnceLock<IsaLevel> = OnceLock::new();

pub fn isa_level() -> IsaLevel {
    *ISA_LEVEL.get_or_init(detect_isa)
}

#[cfg(target_arch = "x86_64")]
fn detect_isa() -> IsaLevel {
    if is_x86_feature_detected!("avx2") {
        IsaLevel::Avx2
    } else {
        // SSE2 is part of the x86_64 baseline
        IsaLevel::Sse
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_isa() -> IsaLevel {
    IsaLevel::Neon
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_isa() -> IsaLevel {
    IsaLevel::Scalar
}

/// `out[i] = a[i] - b[i]`
pub fn sub(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());

    match isa_level() {
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Avx2 => unsafe { sub_avx2(a, b, out) },
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Sse => unsafe { sub_sse(a, b, out) },
        #[cfg(target_arch = "aarch64")]
        IsaLevel::Neon => unsafe { sub_neon(a, b, out) },
        _ => sub_scalar(a, b, out),
    }
}

/// `Σ x[i]²`
pub fn squared_norm(x: &[f32]) -> f32 {
    match isa_level() {
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Avx2 => unsafe { squared_norm_avx2(x) },
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Sse => unsafe { squared_norm_sse(x) },
        #[cfg(target_arch = "aarch64")]
        IsaLevel::Neon => unsafe { squared_norm_neon(x) },
        _ => squared_norm_scalar(x),
    }
}

/// `out[i] = alpha * x[i]`, overwriting whatever `out` held.
pub fn scale(alpha: f32, x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());

    match isa_level() {
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Avx2 => unsafe { scale_avx2(alpha, x, out) },
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Sse => unsafe { scale_sse(alpha, x, out) },
        #[cfg(target_arch = "aarch64")]
        IsaLevel::Neon => unsafe { scale_neon(alpha, x, out) },
        _ => scale_scalar(alpha, x, out),
    }
}

fn sub_scalar(a: &[f32], b: &[f32], out: &mut [f32]) {
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x - y;
    }
}

fn squared_norm_scalar(x: &[f32]) -> f32 {
    x.iter().fold(0.0f32, |acc, &v| acc + v * v)
}

fn scale_scalar(alpha: f32, x: &[f32], out: &mut [f32]) {
    for (o, &v) in out.iter_mut().zip(x) {
        *o = alpha * v;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn sub_avx2(a: &[f32], b: &[f32], out: &mut [f32]) {
    let chunks = a.chunks_exact(8);
    let tail = chunks.len() * 8;

    for ((a_chunk, b_chunk), out_chunk) in chunks.zip(b.chunks_exact(8)).zip(out.chunks_exact_mut(8)) {
        let a_vec = _mm256_loadu_ps(a_chunk.as_ptr());
        let b_vec = _mm256_loadu_ps(b_chunk.as_ptr());
        _mm256_storeu_ps(out_chunk.as_mut_ptr(), _mm256_sub_ps(a_vec, b_vec));
    }

    sub_scalar(&a[tail..], &b[tail..], &mut out[tail..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn sub_sse(a: &[f32], b: &[f32], out: &mut [f32]) {
    let chunks = a.chunks_exact(4);
    let tail = chunks.len() * 4;

    for ((a_chunk, b_chunk), out_chunk) in chunks.zip(b.chunks_exact(4)).zip(out.chunks_exact_mut(4)) {
        let a_vec = _mm_loadu_ps(a_chunk.as_ptr());
        let b_vec = _mm_loadu_ps(b_chunk.as_ptr());
        _mm_storeu_ps(out_chunk.as_mut_ptr(), _mm_sub_ps(a_vec, b_vec));
    }

    sub_scalar(&a[tail..], &b[tail..], &mut out[tail..]);
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn sub_neon(a: &[f32], b: &[f32], out: &mut [f32]) {
    let chunks = a.chunks_exact(4);
    let tail = chunks.len() * 4;

    for ((a_chunk, b_chunk), out_chunk) in chunks.zip(b.chunks_exact(4)).zip(out.chunks_exact_mut(4)) {
        let a_vec = vld1q_f32(a_chunk.as_ptr());
        let b_vec = vld1q_f32(b_chunk.as_ptr());
        vst1q_f32(out_chunk.as_mut_ptr(), vsubq_f32(a_vec, b_vec));
    }

    sub_scalar(&a[tail..], &b[tail..], &mut out[tail..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn squared_norm_avx2(x: &[f32]) -> f32 {
    let mut sum_vec = _mm256_setzero_ps();
    let chunks = x.chunks_exact(8);
    let remainder = chunks.remainder();

    for chunk in chunks {
        let v = _mm256_loadu_ps(chunk.as_ptr());
        sum_vec = _mm256_add_ps(sum_vec, _mm256_mul_ps(v, v));
    }

    // Horizontal sum of the AVX2 register
    let sum_high = _mm256_extractf128_ps(sum_vec, 1);
    let sum_low = _mm256_castps256_ps128(sum_vec);
    let sum_128 = _mm_add_ps(sum_high, sum_low);
    let sum_64 = _mm_add_ps(sum_128, _mm_movehl_ps(sum_128, sum_128));
    let sum_32 = _mm_add_ss(sum_64, _mm_shuffle_ps(sum_64, sum_64, 1));

    let mut result = _mm_cvtss_f32(sum_32);
    for &v in remainder {
        result += v * v;
    }
    result
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn squared_norm_sse(x: &[f32]) -> f32 {
    let mut sum_vec = _mm_setzero_ps();
    let chunks = x.chunks_exact(4);
    let remainder = chunks.remainder();

    for chunk in chunks {
        let v = _mm_loadu_ps(chunk.as_ptr());
        sum_vec = _mm_add_ps(sum_vec, _mm_mul_ps(v, v));
    }

    let sum_64 = _mm_add_ps(sum_vec, _mm_movehl_ps(sum_vec, sum_vec));
    let sum_32 = _mm_add_ss(sum_64, _mm_shuffle_ps(sum_64, sum_64, 1));

    let mut result = _mm_cvtss_f32(sum_32);
    for &v in remainder {
        result += v * v;
    }
    result
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn squared_norm_neon(x: &[f32]) -> f32 {
    let mut sum_vec = vdupq_n_f32(0.0);
    let chunks = x.chunks_exact(4);
    let remainder = chunks.remainder();

    for chunk in chunks {
        let v = vld1q_f32(chunk.as_ptr());
        sum_vec = vaddq_f32(sum_vec, vmulq_f32(v, v));
    }

    let mut result = vaddvq_f32(sum_vec);
    for &v in remainder {
        result += v * v;
    }
    result
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn scale_avx2(alpha: f32, x: &[f32], out: &mut [f32]) {
    let alpha_vec = _mm256_set1_ps(alpha);
    let chunks = x.chunks_exact(8);
    let tail = chunks.len() * 8;

    for (x_chunk, out_chunk) in chunks.zip(out.chunks_exact_mut(8)) {
        let v = _mm256_loadu_ps(x_chunk.as_ptr());
        _mm256_storeu_ps(out_chunk.as_mut_ptr(), _mm256_mul_ps(alpha_vec, v));
    }

    scale_scalar(alpha, &x[tail..], &mut out[tail..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn scale_sse(alpha: f32, x: &[f32], out: &mut [f32]) {
    let alpha_vec = _mm_set1_ps(alpha);
    let chunks = x.chunks_exact(4);
    let tail = chunks.len() * 4;

    for (x_chunk, out_chunk) in chunks.zip(out.chunks_exact_mut(4)) {
        let v = _mm_loadu_ps(x_chunk.as_ptr());
        _mm_storeu_ps(out_chunk.as_mut_ptr(), _mm_mul_ps(alpha_vec, v));
    }

    scale_scalar(alpha, &x[tail..], &mut out[tail..]);
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn scale_neon(alpha: f32, x: &[f32], out: &mut [f32]) {
    let chunks = x.chunks_exact(4);
    let tail = chunks.len() * 4;

    for (x_chunk, out_chunk) in chunks.zip(out.chunks_exact_mut(4)) {
        let v = vld1q_f32(x_chunk.as_ptr());
        vst1q_f32(out_chunk.as_mut_ptr(), vmulq_n_f32(v, alpha));
    }

    scale_scalar(alpha, &x[tail..], &mut out[tail..]);
}
