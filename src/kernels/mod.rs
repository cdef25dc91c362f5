//! Kernels run by the emulated device
//!
//! - `matmul`: grouped int4 weight-only dequantization + matmul

pub mod matmul;
