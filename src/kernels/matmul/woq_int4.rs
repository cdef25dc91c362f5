//! Grouped int4 weight-only dequantization + matmul
//!
//! # Format
//! - Weights: unsigned nibbles addressed through a `(K, N)` u4 descriptor
//!   laid over packed 32-bit containers. Nibble `e` lives in byte `e / 2`,
//!   low half first, so container `c` holds nibbles `8c..8c+8` from its
//!   least significant bits upwards.
//! - Scales: one value per (group of G rows along K, single column) block,
//!   gathered as a row-major `[K / G, N]` table.
//! - Zero point: a single signed 8-bit scalar for the whole tensor.
//! - Dequantization: `w = round_fp((q - zp) * scale)`; accumulation is f32.

use rayon::prelude::*;

use crate::memory::MemoryDesc;

/// Precision dequantized weights are rounded to before the multiply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntermediatePrecision {
    /// No rounding
    #[default]
    F32,
    Bf16,
    F16,
}

impl IntermediatePrecision {
    #[inline(always)]
    pub fn round(self, value: f32) -> f32 {
        match self {
            IntermediatePrecision::F32 => value,
            IntermediatePrecision::Bf16 => half::bf16::from_f32(value).to_f32(),
            IntermediatePrecision::F16 => half::f16::from_f32(value).to_f32(),
        }
    }
}

/// Extract nibble `index` (unsigned, 0..15) from little-endian packed bytes
#[inline(always)]
pub fn unpack_u4(bytes: &[u8], index: usize) -> u8 {
    let byte = bytes[index / 2];
    if index % 2 == 0 {
        byte & 0x0F
    } else {
        byte >> 4
    }
}

/// Convert the applied zero point to its narrow signed type
///
/// Returns `None` when the value is fractional or outside `i8`.
pub fn narrow_zero_point(value: f32) -> Option<i8> {
    if value.fract() != 0.0 || value < i8::MIN as f32 || value > i8::MAX as f32 {
        return None;
    }
    Some(value as i8)
}

/// Grouped dequantization parameters for one weight tensor
#[derive(Debug, Clone, Copy)]
pub struct DequantParams<'a> {
    /// Row-major `[K / group_size, N]`
    pub scales: &'a [f32],
    pub zero_point: i8,
    pub group_size: usize,
    pub precision: IntermediatePrecision,
}

/// Dequantize a `(K, N)` u4 weight into a row-major `K x N` f32 panel
///
/// `weights` are the bytes of the buffer the u4 descriptor is bound to.
pub fn dequantize_panel(
    weights: &[u8],
    weight_desc: &MemoryDesc,
    params: &DequantParams<'_>,
    panel: &mut [f32],
) {
    let n = weight_desc.dims()[1];
    let zero_point = params.zero_point as f32;

    panel
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(k, row)| {
            let group_scales = &params.scales[(k / params.group_size) * n..][..n];
            for (col, out) in row.iter_mut().enumerate() {
                let q = unpack_u4(weights, weight_desc.offset_of(&[k, col])) as f32;
                *out = params.precision.round((q - zero_point) * group_scales[col]);
            }
        });
}

/// `out[M x N] = src[M x K] x panel[K x N]`, all row-major, f32 accumulation
pub fn matmul_panel(src: &[f32], panel: &[f32], m: usize, k: usize, n: usize, out: &mut [f32]) {
    debug_assert_eq!(src.len(), m * k);
    debug_assert_eq!(panel.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
        out_row.fill(0.0);
        let src_row = &src[row * k..][..k];
        for (kk, &a) in src_row.iter().enumerate() {
            let w_row = &panel[kk * n..][..n];
            for (acc, &w) in out_row.iter_mut().zip(w_row) {
                *acc += a * w;
            }
        }
    });
}
