//! Matmul execution plan and its asynchronous execution
//!
//! [`MatmulPrimitiveDesc`] checks that a set of descriptors and attributes
//! describes a computation the int4 kernel can run and plans the
//! scratchpad. [`MatmulPrimitive::execute`] binds memories and enqueues a
//! single unit of device work.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{DeviceError, Event, Stream};
use crate::error::{WoqError, WoqResult};
use crate::kernels::matmul::{dequantize_panel, matmul_panel, narrow_zero_point, DequantParams};
use crate::memory::{Memory, MemoryDesc};
use crate::primitive_error;
use crate::tensor::DataType;

use super::args::{ArgRole, ExecArgs};
use super::attr::{PrimitiveAttr, ScratchpadMode, WEIGHT_SCALE_MASK, WEIGHT_ZERO_POINT_MASK};

/// Validated matmul plan: `dst[M, N] = src[M, K] x weights[K, N]`
#[derive(Debug, Clone)]
pub struct MatmulPrimitiveDesc {
    src_md: MemoryDesc,
    weights_md: MemoryDesc,
    dst_md: MemoryDesc,
    attr: PrimitiveAttr,
    group_size: usize,
    scratchpad_md: Option<MemoryDesc>,
}

impl MatmulPrimitiveDesc {
    pub fn new(
        src_md: &MemoryDesc,
        weights_md: &MemoryDesc,
        dst_md: &MemoryDesc,
        attr: PrimitiveAttr,
    ) -> WoqResult<Self> {
        for (name, md) in [("src", src_md), ("weights", weights_md), ("dst", dst_md)] {
            if md.ndims() != 2 {
                return Err(primitive_error!("{} must be 2-D, got {:?}", name, md.dims()));
            }
        }
        let (m, k) = (src_md.dims()[0], src_md.dims()[1]);
        let n = weights_md.dims()[1];
        if weights_md.dims()[0] != k {
            return Err(primitive_error!(
                "src {:?} and weights {:?} disagree on K",
                src_md.dims(),
                weights_md.dims()
            ));
        }
        if dst_md.dims() != [m, n] {
            return Err(primitive_error!(
                "dst {:?} does not match ({}, {})",
                dst_md.dims(),
                m,
                n
            ));
        }

        if !matches!(weights_md.dtype(), DataType::U4 | DataType::S4) {
            return Err(primitive_error!(
                "weights must be u4/s4 for weight-only quantization, got {}",
                weights_md.dtype()
            ));
        }
        for (name, md) in [("src", src_md), ("dst", dst_md)] {
            if !md.dtype().is_float() {
                return Err(primitive_error!("{} must be floating point, got {}", name, md.dtype()));
            }
        }

        let scales = attr
            .weight_scales()
            .ok_or_else(|| primitive_error!("int4 weights need grouped scales"))?;
        let group_size = match (scales.mask, scales.group_dims.as_slice()) {
            (WEIGHT_SCALE_MASK, &[g, 1]) if g > 0 && k % g == 0 => g,
            _ => {
                return Err(primitive_error!(
                    "scales need mask {:#b} with groups [G, 1] dividing K={}, got mask {:#b} groups {:?}",
                    WEIGHT_SCALE_MASK,
                    k,
                    scales.mask,
                    scales.group_dims
                ))
            }
        };
        if !scales.dtype.is_float() {
            return Err(primitive_error!("scales must be floating point, got {}", scales.dtype));
        }

        if let Some(zp) = attr.weight_zero_points() {
            if zp.mask != WEIGHT_ZERO_POINT_MASK || !zp.group_dims.is_empty() {
                return Err(primitive_error!(
                    "only a single weight zero point is supported, got mask {:#b} groups {:?}",
                    zp.mask,
                    zp.group_dims
                ));
            }
            if zp.dtype != DataType::S8 {
                return Err(primitive_error!(
                    "weight zero point must be applied as s8, got {}",
                    zp.dtype
                ));
            }
        }

        for (idx, desc) in attr.post_ops().binary_descs() {
            let dims = desc.dims();
            let fits = dims.len() == 2
                && (dims[0] == 1 || dims[0] == m)
                && (dims[1] == 1 || dims[1] == n);
            if !fits || !desc.dtype().is_float() {
                return Err(primitive_error!(
                    "binary post-op {} operand {:?} {} does not broadcast to ({}, {})",
                    idx,
                    dims,
                    desc.dtype(),
                    m,
                    n
                ));
            }
        }

        // Dequantized weight panel
        let scratchpad_md = match attr.scratchpad_mode() {
            ScratchpadMode::User => Some(MemoryDesc::new(
                vec![k, n],
                DataType::F32,
                vec![n, 1],
            )?),
            ScratchpadMode::Library => None,
        };

        tracing::debug!(
            "MatmulPrimitiveDesc: M={} K={} N={} G={} post_ops={} scratchpad={:?}",
            m,
            k,
            n,
            group_size,
            attr.post_ops().len(),
            scratchpad_md.as_ref().map(MemoryDesc::byte_size)
        );

        Ok(MatmulPrimitiveDesc {
            src_md: src_md.clone(),
            weights_md: weights_md.clone(),
            dst_md: dst_md.clone(),
            attr,
            group_size,
            scratchpad_md,
        })
    }

    pub fn src_desc(&self) -> &MemoryDesc {
        &self.src_md
    }

    pub fn weights_desc(&self) -> &MemoryDesc {
        &self.weights_md
    }

    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.dst_md
    }

    pub fn attr(&self) -> &PrimitiveAttr {
        &self.attr
    }

    /// Scratchpad the caller must bind; `None` when the primitive owns it
    pub fn scratchpad_desc(&self) -> Option<&MemoryDesc> {
        self.scratchpad_md.as_ref()
    }

    pub fn m(&self) -> usize {
        self.src_md.dims()[0]
    }

    pub fn k(&self) -> usize {
        self.src_md.dims()[1]
    }

    pub fn n(&self) -> usize {
        self.weights_md.dims()[1]
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }
}

/// Executable matmul
#[derive(Debug, Clone)]
pub struct MatmulPrimitive {
    pd: Arc<MatmulPrimitiveDesc>,
}

/// Memories captured by one submitted execution
struct Bound {
    src: Memory,
    weights: Memory,
    dst: Memory,
    scales: Memory,
    zero_point: Option<Memory>,
    scratchpad: Option<Memory>,
    binary: Vec<(usize, Memory)>,
}

impl MatmulPrimitive {
    pub fn new(pd: MatmulPrimitiveDesc) -> Self {
        MatmulPrimitive { pd: Arc::new(pd) }
    }

    pub fn desc(&self) -> &MatmulPrimitiveDesc {
        &self.pd
    }

    /// Check that `args` binds every memory the plan needs, with matching descriptors
    pub fn check_args(&self, args: &ExecArgs) -> WoqResult<()> {
        self.bind(args).map(|_| ())
    }

    fn bind(&self, args: &ExecArgs) -> WoqResult<Bound> {
        let pd = &self.pd;
        let exact = |role: ArgRole, expected: &MemoryDesc| -> WoqResult<Memory> {
            let memory = args.require(role)?;
            if memory.desc() != expected {
                return Err(WoqError::InvalidArgument(format!(
                    "{:?} bound with {:?}, plan expects {:?}",
                    role,
                    memory.desc(),
                    expected
                )));
            }
            Ok(memory.clone())
        };

        let src = exact(ArgRole::Src, &pd.src_md)?;
        let weights = exact(ArgRole::Weights, &pd.weights_md)?;
        let dst = exact(ArgRole::Dst, &pd.dst_md)?;

        let scales = args.require(ArgRole::WeightScales)?.clone();
        let num_groups = pd.k() / pd.group_size;
        if scales.desc().dims() != [num_groups, pd.n()] {
            return Err(WoqError::InvalidArgument(format!(
                "weight scales bound as {:?}, plan expects [{}, {}]",
                scales.desc().dims(),
                num_groups,
                pd.n()
            )));
        }

        let zero_point = match pd.attr.weight_zero_points() {
            Some(_) => {
                let zp = args.require(ArgRole::WeightZeroPoints)?;
                if zp.desc().nelems() != 1 {
                    return Err(WoqError::InvalidArgument(format!(
                        "weight zero point bound as {:?}, plan expects one value",
                        zp.desc().dims()
                    )));
                }
                Some(zp.clone())
            }
            None => None,
        };

        let scratchpad = match &pd.scratchpad_md {
            Some(expected) => {
                let memory = args.require(ArgRole::Scratchpad)?;
                if memory.desc().byte_size() < expected.byte_size() {
                    return Err(WoqError::InvalidArgument(format!(
                        "scratchpad holds {} bytes, plan needs {}",
                        memory.desc().byte_size(),
                        expected.byte_size()
                    )));
                }
                Some(memory.clone())
            }
            None => None,
        };

        let binary = pd
            .attr
            .post_ops()
            .binary_descs()
            .map(|(idx, desc)| -> WoqResult<(usize, Memory)> {
                Ok((idx, exact(ArgRole::PostOpBinarySrc(idx), desc)?))
            })
            .collect::<WoqResult<Vec<_>>>()?;

        Ok(Bound {
            src,
            weights,
            dst,
            scales,
            zero_point,
            scratchpad,
            binary,
        })
    }

    /// Enqueue the matmul after every event in `deps`
    ///
    /// Returns without waiting; device-side faults are reported by the
    /// returned event.
    pub fn execute(&self, stream: &Stream, args: &ExecArgs, deps: &[Event]) -> WoqResult<Event> {
        let bound = self.bind(args)?;
        let pd = Arc::clone(&self.pd);
        let event = stream.submit("woq_matmul_int4", deps, move || run(&pd, bound))?;
        tracing::debug!(
            "MatmulPrimitive::execute: submitted event #{} after {} dependencies",
            event.id(),
            deps.len()
        );
        Ok(event)
    }
}

fn run(pd: &MatmulPrimitiveDesc, bound: Bound) -> Result<(), DeviceError> {
    let (m, k, n) = (pd.m(), pd.k(), pd.n());
    let post_ops = pd.attr.post_ops();

    let src = bound.src.read_f32()?;
    let scales = bound.scales.read_f32()?;
    let zero_point = match &bound.zero_point {
        Some(memory) => {
            let value = memory.read_f32()?.first().copied().unwrap_or(0.0);
            narrow_zero_point(value).ok_or_else(|| {
                DeviceError::ExecutionFault(format!(
                    "zero point {} is not representable as s8",
                    value
                ))
            })?
        }
        None => 0,
    };
    let binary_srcs = bound
        .binary
        .iter()
        .map(|(idx, memory)| -> Result<(usize, Vec<f32>), DeviceError> {
            Ok((*idx, memory.read_f32()?))
        })
        .collect::<Result<HashMap<_, _>, DeviceError>>()?;
    let prior_dst = if post_ops.has_sum() {
        Some(bound.dst.read_f32()?)
    } else {
        None
    };

    let params = DequantParams {
        scales: &scales,
        zero_point,
        group_size: pd.group_size,
        precision: pd.attr.intermediate_precision(),
    };
    let mut acc = vec![0.0f32; m * n];
    let mut compute = |panel: &mut [f32]| -> Result<(), DeviceError> {
        bound
            .weights
            .buffer()
            .with_bytes(|w| dequantize_panel(w, bound.weights.desc(), &params, panel))?;
        matmul_panel(&src, panel, m, k, n, &mut acc);
        Ok(())
    };

    match &bound.scratchpad {
        Some(scratch) => scratch.buffer().with_bytes_mut(|bytes| {
            let panel: &mut [f32] = bytemuck::try_cast_slice_mut(&mut bytes[..k * n * 4])
                .map_err(|e| {
                    DeviceError::ExecutionFault(format!("misaligned scratchpad: {}", e))
                })?;
            compute(panel)
        })??,
        None => compute(vec![0.0f32; k * n].as_mut_slice())?,
    }

    post_ops
        .apply(&mut acc, n, prior_dst.as_deref(), &binary_srcs)
        .map_err(DeviceError::ExecutionFault)?;
    bound.dst.write_f32(&acc)
}
