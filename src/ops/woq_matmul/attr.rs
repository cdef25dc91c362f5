//! Primitive attributes: grouped quantization, fpmath, scratchpad, post-ops

use crate::kernels::matmul::IntermediatePrecision;
use crate::tensor::DataType;

use super::config::{FpMathMode, WoqConfig};
use super::descriptors::MatmulShape;
use super::post_ops::PostOps;

/// Scale mask: both the K-group axis (bit 0) and the N axis (bit 1) vary
pub const WEIGHT_SCALE_MASK: u32 = (1 << 0) | (1 << 1);

/// Zero-point mask: one value for the whole tensor
pub const WEIGHT_ZERO_POINT_MASK: u32 = 0;

/// Who provides the scratchpad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScratchpadMode {
    /// The primitive allocates its own working memory per execution
    #[default]
    Library,
    /// The caller binds a buffer under [`ArgRole::Scratchpad`]
    ///
    /// [`ArgRole::Scratchpad`]: super::args::ArgRole::Scratchpad
    User,
}

/// Quantization parameters attached to the weights
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantParams {
    pub mask: u32,
    /// Block of weight elements sharing one value; empty for a single value
    pub group_dims: Vec<usize>,
    pub dtype: DataType,
}

#[derive(Debug, Clone, Default)]
pub struct PrimitiveAttr {
    post_ops: PostOps,
    scratchpad_mode: ScratchpadMode,
    weight_scales: Option<QuantParams>,
    weight_zero_points: Option<QuantParams>,
    fpmath_mode: FpMathMode,
    fpmath_apply_to_int: bool,
}

impl PrimitiveAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes for grouped int4 weights described by `shape`
    pub fn grouped_int4(
        shape: &MatmulShape,
        scale_dtype: DataType,
        config: &WoqConfig,
        post_ops: PostOps,
    ) -> Self {
        let mut attr = PrimitiveAttr::new();
        attr.set_post_ops(post_ops);
        attr.set_scratchpad_mode(ScratchpadMode::User);
        attr.set_scales(WEIGHT_SCALE_MASK, vec![shape.group_size, 1], scale_dtype);
        attr.set_zero_points(WEIGHT_ZERO_POINT_MASK, Vec::new(), config.zero_point_dtype);
        attr.set_fpmath_mode(config.fpmath_mode, config.fpmath_apply_to_int);
        attr
    }

    pub fn set_post_ops(&mut self, post_ops: PostOps) {
        self.post_ops = post_ops;
    }

    pub fn set_scratchpad_mode(&mut self, mode: ScratchpadMode) {
        self.scratchpad_mode = mode;
    }

    pub fn set_scales(&mut self, mask: u32, group_dims: Vec<usize>, dtype: DataType) {
        self.weight_scales = Some(QuantParams {
            mask,
            group_dims,
            dtype,
        });
    }

    pub fn set_zero_points(&mut self, mask: u32, group_dims: Vec<usize>, dtype: DataType) {
        self.weight_zero_points = Some(QuantParams {
            mask,
            group_dims,
            dtype,
        });
    }

    pub fn set_fpmath_mode(&mut self, mode: FpMathMode, apply_to_int: bool) {
        self.fpmath_mode = mode;
        self.fpmath_apply_to_int = apply_to_int;
    }

    pub fn post_ops(&self) -> &PostOps {
        &self.post_ops
    }

    pub fn scratchpad_mode(&self) -> ScratchpadMode {
        self.scratchpad_mode
    }

    pub fn weight_scales(&self) -> Option<&QuantParams> {
        self.weight_scales.as_ref()
    }

    pub fn weight_zero_points(&self) -> Option<&QuantParams> {
        self.weight_zero_points.as_ref()
    }

    pub fn fpmath_mode(&self) -> (FpMathMode, bool) {
        (self.fpmath_mode, self.fpmath_apply_to_int)
    }

    pub fn intermediate_precision(&self) -> IntermediatePrecision {
        self.fpmath_mode
            .intermediate_precision(self.fpmath_apply_to_int)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouped_int4_attr() {
        let shape = MatmulShape {
            m: 1,
            k: 64,
            n: 4,
            group_size: 32,
            compressed_k: 8,
            num_groups: 2,
        };
        let attr = PrimitiveAttr::grouped_int4(
            &shape,
            DataType::Bf16,
            &WoqConfig::default(),
            PostOps::new(),
        );
        assert_eq!(attr.scratchpad_mode(), ScratchpadMode::User);
        assert_eq!(
            attr.weight_scales(),
            Some(&QuantParams {
                mask: 0b11,
                group_dims: vec![32, 1],
                dtype: DataType::Bf16
            })
        );
        let zp = attr.weight_zero_points().unwrap();
        assert_eq!(zp.mask, 0);
        assert!(zp.group_dims.is_empty());
        assert_eq!(zp.dtype, DataType::S8);
        assert_eq!(attr.fpmath_mode(), (FpMathMode::Bf16, true));
        assert_eq!(attr.intermediate_precision(), IntermediatePrecision::Bf16);
    }

    #[test]
    fn test_default_attr_is_empty() {
        let attr = PrimitiveAttr::new();
        assert!(attr.post_ops().is_empty());
        assert!(attr.weight_scales().is_none());
        assert_eq!(attr.scratchpad_mode(), ScratchpadMode::Library);
        assert_eq!(attr.intermediate_precision(), IntermediatePrecision::F32);
    }
}
