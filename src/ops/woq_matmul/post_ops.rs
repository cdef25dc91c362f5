//! Fused post-operations
//!
//! [`PostOps`] is the engine-side list applied to the f32 accumulator
//! before it is converted into the destination. [`FusionAttr`] is the
//! seam through which callers describe fusions; [`Attr`] is the concrete
//! builder used by the crate.

use std::collections::HashMap;

use crate::error::{WoqError, WoqResult};
use crate::memory::{Memory, MemoryDesc};
use crate::tensor::DeviceTensor;

use super::args::{ArgRole, ExecArgs};
use super::primitive::MatmulPrimitiveDesc;

/// Elementwise activation algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltwiseAlg {
    /// `x > 0 ? x : alpha * x`
    Relu,
    /// Tanh approximation
    Gelu,
    /// `x * sigmoid(alpha * x)`
    Silu,
    /// `alpha * x + beta`
    Linear,
}

impl EltwiseAlg {
    #[inline]
    pub fn apply(self, x: f32, alpha: f32, beta: f32) -> f32 {
        match self {
            EltwiseAlg::Relu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            EltwiseAlg::Gelu => {
                const SQRT_2_OVER_PI: f32 = 0.797_884_6;
                0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
            }
            EltwiseAlg::Silu => x / (1.0 + (-alpha * x).exp()),
            EltwiseAlg::Linear => alpha * x + beta,
        }
    }
}

/// Binary algorithms combining the accumulator with a second operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryAlg {
    Add,
    Mul,
    Sub,
    Div,
    Max,
    Min,
}

impl BinaryAlg {
    #[inline]
    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            BinaryAlg::Add => lhs + rhs,
            BinaryAlg::Mul => lhs * rhs,
            BinaryAlg::Sub => lhs - rhs,
            BinaryAlg::Div => lhs / rhs,
            BinaryAlg::Max => lhs.max(rhs),
            BinaryAlg::Min => lhs.min(rhs),
        }
    }
}

/// One fused operation
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    /// Accumulate onto the previous destination contents
    Sum { scale: f32 },
    Eltwise {
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
    },
    /// `src_desc` is 2-D; a dim of size 1 broadcasts
    Binary { alg: BinaryAlg, src_desc: MemoryDesc },
}

/// Ordered list of fused operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostOps {
    ops: Vec<PostOp>,
}

impl PostOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_sum(&mut self, scale: f32) {
        self.ops.push(PostOp::Sum { scale });
    }

    pub fn append_eltwise(&mut self, alg: EltwiseAlg, alpha: f32, beta: f32) {
        self.ops.push(PostOp::Eltwise { alg, alpha, beta });
    }

    pub fn append_binary(&mut self, alg: BinaryAlg, src_desc: MemoryDesc) {
        self.ops.push(PostOp::Binary { alg, src_desc });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PostOp> {
        self.ops.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PostOp> {
        self.ops.iter()
    }

    /// True when the previous destination contents are read
    pub fn has_sum(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, PostOp::Sum { .. }))
    }

    /// `(index, desc)` of every binary post-op
    pub fn binary_descs(&self) -> impl Iterator<Item = (usize, &MemoryDesc)> {
        self.ops.iter().enumerate().filter_map(|(idx, op)| match op {
            PostOp::Binary { src_desc, .. } => Some((idx, src_desc)),
            _ => None,
        })
    }

    /// Apply every op in order to a row-major `m x n` accumulator
    ///
    /// `prior_dst` holds the destination contents before the call (needed
    /// only with a sum op); `binary_srcs` maps post-op index to the
    /// operand gathered in row-major order.
    pub fn apply(
        &self,
        acc: &mut [f32],
        n: usize,
        prior_dst: Option<&[f32]>,
        binary_srcs: &HashMap<usize, Vec<f32>>,
    ) -> Result<(), String> {
        for (idx, op) in self.ops.iter().enumerate() {
            match op {
                PostOp::Sum { scale } => {
                    let prior = prior_dst.ok_or("sum post-op without destination contents")?;
                    for (x, &p) in acc.iter_mut().zip(prior) {
                        *x += scale * p;
                    }
                }
                PostOp::Eltwise { alg, alpha, beta } => {
                    for x in acc.iter_mut() {
                        *x = alg.apply(*x, *alpha, *beta);
                    }
                }
                PostOp::Binary { alg, src_desc } => {
                    let src = binary_srcs
                        .get(&idx)
                        .ok_or_else(|| format!("binary post-op {} has no operand", idx))?;
                    let (rows, cols) = (src_desc.dims()[0], src_desc.dims()[1]);
                    for (i, row) in acc.chunks_mut(n).enumerate() {
                        let r = if rows == 1 { 0 } else { i };
                        for (j, x) in row.iter_mut().enumerate() {
                            let c = if cols == 1 { 0 } else { j };
                            *x = alg.apply(*x, src[r * cols + c]);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Point-of-use contract of a fusion attribute
pub trait FusionAttr {
    /// True when any post-op needs a bound second operand
    fn with_binary(&self) -> bool;

    /// Engine post-op list for a call writing the 2-D `dst`
    fn extract_post_ops(&self, dst: &DeviceTensor) -> WoqResult<PostOps>;

    /// Bind binary operands under [`ArgRole::PostOpBinarySrc`]
    fn construct_post_binary(
        &self,
        pd: &MatmulPrimitiveDesc,
        args: &mut ExecArgs,
    ) -> WoqResult<()>;
}

#[derive(Debug, Clone)]
enum AttrOp {
    Sum { scale: f32 },
    Eltwise {
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
    },
    Binary { alg: BinaryAlg, operand: DeviceTensor },
}

/// Fusion attribute builder
///
/// ```ignore
/// let attr = Attr::new()
///     .append_bias(bias)
///     .append_eltwise(EltwiseAlg::Gelu, 0.0, 0.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Attr {
    ops: Vec<AttrOp>,
}

impl Attr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_sum(mut self, scale: f32) -> Self {
        self.ops.push(AttrOp::Sum { scale });
        self
    }

    pub fn append_eltwise(mut self, alg: EltwiseAlg, alpha: f32, beta: f32) -> Self {
        self.ops.push(AttrOp::Eltwise { alg, alpha, beta });
        self
    }

    /// Bias `[N]`, `[1, N]` or `[M, N]`, added to every row
    pub fn append_bias(self, bias: DeviceTensor) -> Self {
        self.append_binary(BinaryAlg::Add, bias)
    }

    pub fn append_binary(mut self, alg: BinaryAlg, operand: DeviceTensor) -> Self {
        self.ops.push(AttrOp::Binary { alg, operand });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// 2-D view of a binary operand
fn binary_view(operand: &DeviceTensor) -> WoqResult<DeviceTensor> {
    match operand.dim() {
        1 => operand.with_layout(vec![1, operand.size(0)], vec![0, operand.stride(0)]),
        2 => Ok(operand.clone()),
        3 => operand.flatten_rows().ok_or_else(|| {
            WoqError::InvalidPrecondition(format!(
                "binary post-op operand {:?} strides {:?} cannot be viewed as 2-D",
                operand.dims(),
                operand.strides()
            ))
        }),
        rank => Err(WoqError::InvalidDimensionality {
            operand: "binary post-op operand",
            expected: "1D, 2D or 3D",
            actual: rank,
        }),
    }
}

impl FusionAttr for Attr {
    fn with_binary(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, AttrOp::Binary { .. }))
    }

    fn extract_post_ops(&self, _dst: &DeviceTensor) -> WoqResult<PostOps> {
        let mut post_ops = PostOps::new();
        for op in &self.ops {
            match op {
                AttrOp::Sum { scale } => post_ops.append_sum(*scale),
                AttrOp::Eltwise { alg, alpha, beta } => {
                    post_ops.append_eltwise(*alg, *alpha, *beta)
                }
                AttrOp::Binary { alg, operand } => {
                    let view = binary_view(operand)?;
                    let desc =
                        MemoryDesc::new(view.dims().to_vec(), view.dtype(), view.strides().to_vec())?;
                    post_ops.append_binary(*alg, desc);
                }
            }
        }
        Ok(post_ops)
    }

    fn construct_post_binary(
        &self,
        pd: &MatmulPrimitiveDesc,
        args: &mut ExecArgs,
    ) -> WoqResult<()> {
        for (idx, op) in self.ops.iter().enumerate() {
            let AttrOp::Binary { operand, .. } = op else {
                continue;
            };
            let desc = match pd.attr().post_ops().get(idx) {
                Some(PostOp::Binary { src_desc, .. }) => src_desc.clone(),
                _ => {
                    return Err(WoqError::InvalidArgument(format!(
                        "plan has no binary post-op at index {}",
                        idx
                    )))
                }
            };
            args.insert(
                ArgRole::PostOpBinarySrc(idx),
                Memory::new(desc, operand.buffer().clone())?,
            );
        }
        Ok(())
    }
}
