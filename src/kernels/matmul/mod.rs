//! Matrix multiplication kernel implementations
//!
//! - `woq_int4`: grouped int4 weight-only dequantization + matmul executed
//!   by the device engine

pub mod woq_int4;

pub use woq_int4::{
    dequantize_panel, matmul_panel, narrow_zero_point, unpack_u4, DequantParams,
    IntermediatePrecision,
};
