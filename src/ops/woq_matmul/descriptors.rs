//! Shape derivation plus user and compute memory descriptors
//!
//! User descriptors record how each operand is physically stored. Compute
//! descriptors record how the engine interprets those same bytes: the
//! packed `s32` weight is read as a `(K, N)` grid of u4 values and the
//! zero point is declared as u4 as well.

use crate::error::{WoqError, WoqResult};
use crate::memory::MemoryDesc;
use crate::tensor::{DataType, DeviceTensor};

use super::layout::{
    packed_weight_strides, scale_view_strides, NIBBLES_PER_CONTAINER, UNPACKED_WEIGHT_TAG,
};

/// Problem dimensions of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulShape {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub group_size: usize,
    pub compressed_k: usize,
    pub num_groups: usize,
}

fn leading_rows(tensor: &DeviceTensor) -> usize {
    tensor.dims()[..tensor.dim() - 1].iter().product()
}

impl MatmulShape {
    /// Validate every operand against the problem and derive its dimensions
    ///
    /// Runs before any allocation or submission.
    pub fn derive(
        dst: &DeviceTensor,
        mat1: &DeviceTensor,
        mat2: &DeviceTensor,
        scale: &DeviceTensor,
        zp: &DeviceTensor,
        group_size: usize,
    ) -> WoqResult<Self> {
        if dst.dim() != 2 && dst.dim() != 3 {
            return Err(WoqError::InvalidDimensionality {
                operand: "destination",
                expected: "2D or 3D",
                actual: dst.dim(),
            });
        }
        if mat1.dim() != 2 && mat1.dim() != 3 {
            return Err(WoqError::InvalidDimensionality {
                operand: "activation",
                expected: "2D or 3D",
                actual: mat1.dim(),
            });
        }

        let m = leading_rows(mat1);
        let k = mat1.size(-1);
        let n = dst.size(-1);
        if m == 0 || k == 0 || n == 0 {
            return Err(WoqError::InvalidPrecondition(format!(
                "empty problem: M={} K={} N={}",
                m, k, n
            )));
        }

        if group_size == 0 || k % group_size != 0 {
            return Err(WoqError::GroupSizeMismatch { k, group_size });
        }
        if k % NIBBLES_PER_CONTAINER != 0 {
            return Err(WoqError::InvalidPrecondition(format!(
                "K={} must be a multiple of {} to unpack int4 containers",
                k, NIBBLES_PER_CONTAINER
            )));
        }
        let compressed_k = k / NIBBLES_PER_CONTAINER;
        let num_groups = k / group_size;

        if leading_rows(dst) != m {
            let mut expected = mat1.dims().to_vec();
            if let Some(last) = expected.last_mut() {
                *last = n;
            }
            return Err(WoqError::ShapeMismatch {
                operand: "destination",
                expected,
                actual: dst.dims().to_vec(),
            });
        }

        for (operand, tensor) in [("activation", mat1), ("destination", dst)] {
            if !tensor.dtype().is_float() {
                return Err(WoqError::UnsupportedDtype {
                    operand,
                    dtype: tensor.dtype(),
                });
            }
        }

        if mat2.dtype() != DataType::S32 {
            return Err(WoqError::UnsupportedDtype {
                operand: "packed weight",
                dtype: mat2.dtype(),
            });
        }
        // [N, K/8] as packed, or its (K/8, N) view
        if mat2.dims() != [n, compressed_k] && mat2.dims() != [compressed_k, n] {
            return Err(WoqError::ShapeMismatch {
                operand: "packed weight",
                expected: vec![compressed_k, n],
                actual: mat2.dims().to_vec(),
            });
        }

        // (K/G, N) or its physical [N, K/G] transpose
        if scale.dims() != [num_groups, n] && scale.dims() != [n, num_groups] {
            return Err(WoqError::ShapeMismatch {
                operand: "scale",
                expected: vec![num_groups, n],
                actual: scale.dims().to_vec(),
            });
        }
        if !scale.dtype().is_float() {
            return Err(WoqError::UnsupportedDtype {
                operand: "scale",
                dtype: scale.dtype(),
            });
        }

        if zp.numel() != 1 {
            return Err(WoqError::ShapeMismatch {
                operand: "zero point",
                expected: vec![1],
                actual: zp.dims().to_vec(),
            });
        }

        Ok(MatmulShape {
            m,
            k,
            n,
            group_size,
            compressed_k,
            num_groups,
        })
    }
}

/// Physical layout of every operand
#[derive(Debug, Clone)]
pub struct UserDescs {
    pub src: MemoryDesc,
    pub packed_weight: MemoryDesc,
    pub scale: MemoryDesc,
    pub zero_point: MemoryDesc,
    pub dst: MemoryDesc,
}

impl UserDescs {
    /// `src` and `dst` must already be flattened to 2-D and `scale`
    /// oriented as `[N, num_groups]`
    pub fn new(
        shape: &MatmulShape,
        src: &DeviceTensor,
        packed_weight: &DeviceTensor,
        scale: &DeviceTensor,
        zero_point: &DeviceTensor,
        dst: &DeviceTensor,
    ) -> WoqResult<Self> {
        Ok(UserDescs {
            src: MemoryDesc::new(vec![shape.m, shape.k], src.dtype(), src.strides().to_vec())?,
            packed_weight: MemoryDesc::new(
                vec![shape.compressed_k, shape.n],
                packed_weight.dtype(),
                packed_weight_strides(shape.compressed_k),
            )?,
            scale: MemoryDesc::new(
                vec![shape.num_groups, shape.n],
                scale.dtype(),
                scale_view_strides(scale),
            )?,
            zero_point: MemoryDesc::new(vec![1], zero_point.dtype(), vec![1])?,
            dst: MemoryDesc::new(vec![shape.m, shape.n], dst.dtype(), dst.strides().to_vec())?,
        })
    }
}

/// Algebraic interpretation the engine computes with
#[derive(Debug, Clone)]
pub struct ComputeDescs {
    pub src: MemoryDesc,
    /// `(K, N)` u4 over the packed weight bytes
    pub weights: MemoryDesc,
    pub scale: MemoryDesc,
    /// Declared u4 although the applied zero point is a single s8 value;
    /// which of the two is intended is unresolved, so both are kept as-is.
    pub zero_point: MemoryDesc,
    pub dst: MemoryDesc,
}

impl ComputeDescs {
    pub fn new(shape: &MatmulShape, user: &UserDescs) -> WoqResult<Self> {
        Ok(ComputeDescs {
            src: user.src.clone(),
            weights: MemoryDesc::from_format_tag(
                vec![shape.k, shape.n],
                DataType::U4,
                UNPACKED_WEIGHT_TAG,
            )?,
            scale: user.scale.clone(),
            zero_point: MemoryDesc::new(vec![1], DataType::U4, vec![1])?,
            dst: user.dst.clone(),
        })
    }
}
