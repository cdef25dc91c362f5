//! Weight-only int4 quantized matmul
//!
//! `result[M, N] = mat1[M, K] x dequant(mat2)[K, N]` where `mat2` holds
//! eight unsigned 4-bit weights per 32-bit container and is dequantized
//! per group of `group_size` rows along K with one scale per
//! (group, column) and a single zero point.
//!
//! # Pipeline
//! 1. Validate shapes (no allocation, no submission on failure)
//! 2. Normalize operand layouts, compacting only what the engine rejects
//! 3. Describe the physical (user) layout of every operand
//! 4. Describe the compute layout; the packed weight is reinterpreted as
//!    u4 in place
//! 5. Configure grouped quantization, fpmath and post-ops, build the plan
//! 6. Allocate the scratchpad, bind arguments, enqueue the copies and the
//!    matmul behind the caller's dependencies
//!
//! The host never waits on the device; the returned [`Event`] completes
//! once `result` holds the product.

mod args;
mod attr;
mod config;
mod descriptors;
mod layout;
mod post_ops;
mod primitive;

pub use args::{ArgRole, ExecArgs};
pub use attr::{
    PrimitiveAttr, QuantParams, ScratchpadMode, WEIGHT_SCALE_MASK, WEIGHT_ZERO_POINT_MASK,
};
pub use config::{FpMathMode, WoqConfig, FPMATH_ENV};
pub use descriptors::{ComputeDescs, MatmulShape, UserDescs};
pub use layout::{
    is_engine_strides, normalize, packed_weight_strides, packed_weight_view,
    scale_physical_view, scale_view_strides, Normalized, OperandRole, NIBBLES_PER_CONTAINER,
    UNPACKED_WEIGHT_TAG,
};
pub use post_ops::{Attr, BinaryAlg, EltwiseAlg, FusionAttr, PostOp, PostOps};
pub use primitive::{MatmulPrimitive, MatmulPrimitiveDesc};

use crate::backend::{Event, Stream};
use crate::error::{WoqError, WoqResult};
use crate::memory::Memory;
use crate::tensor::DeviceTensor;

/// Enqueue `result = mat1 x dequant(mat2)` with the default [`WoqConfig`]
///
/// * `result` - `[M, N]` or `[B, M', N]` destination, written in place
/// * `mat1` - `[M, K]` or `[B, M', K]` activation
/// * `mat2` - packed `s32` weight, `[N, K / 8]` or its `(K / 8, N)` view
/// * `scale` - `[N, K / group_size]` or `(K / group_size, N)` floating
///   scales; a square scale is read as `[N, K / group_size]`
/// * `zp` - single zero point, applied as s8
/// * `deps` - work that must finish before any of this call's device work
#[allow(clippy::too_many_arguments)]
pub fn woq_matmul_int4(
    stream: &Stream,
    result: &DeviceTensor,
    mat1: &DeviceTensor,
    mat2: &DeviceTensor,
    scale: &DeviceTensor,
    zp: &DeviceTensor,
    group_size: usize,
    attr: &dyn FusionAttr,
    deps: &[Event],
) -> WoqResult<Event> {
    woq_matmul_int4_with_config(
        stream,
        result,
        mat1,
        mat2,
        scale,
        zp,
        group_size,
        attr,
        deps,
        &WoqConfig::default(),
    )
}

/// [`woq_matmul_int4`] with explicit configuration
#[allow(clippy::too_many_arguments)]
pub fn woq_matmul_int4_with_config(
    stream: &Stream,
    result: &DeviceTensor,
    mat1: &DeviceTensor,
    mat2: &DeviceTensor,
    scale: &DeviceTensor,
    zp: &DeviceTensor,
    group_size: usize,
    attr: &dyn FusionAttr,
    deps: &[Event],
    config: &WoqConfig,
) -> WoqResult<Event> {
    let shape = MatmulShape::derive(result, mat1, mat2, scale, zp, group_size)?;
    let span = tracing::debug_span!(
        "woq_matmul_int4",
        m = shape.m,
        n = shape.n,
        k = shape.k,
        group_size = shape.group_size
    );
    let _enter = span.enter();

    // Layout normalization
    let engine = stream.engine();
    let mat2_view = packed_weight_view(mat2, shape.compressed_k, shape.n)?;
    let scale_view = scale_physical_view(scale, shape.num_groups, shape.n)?;
    let m1 = normalize(mat1, OperandRole::Activation, engine)?;
    let m2 = normalize(&mat2_view, OperandRole::PackedWeight, engine)?;
    let scale_ = normalize(&scale_view, OperandRole::Scale, engine)?;
    let zp_ = normalize(zp, OperandRole::ZeroPoint, engine)?;
    let dst = normalize(result, OperandRole::Destination, engine)?;

    let src_2d = m1.tensor().flatten_rows().ok_or_else(|| {
        WoqError::Internal(format!(
            "normalized activation {:?} is not row-mergeable",
            m1.tensor().strides()
        ))
    })?;
    let dst_2d = dst.tensor().flatten_rows().ok_or_else(|| {
        WoqError::Internal(format!(
            "normalized destination {:?} is not row-mergeable",
            dst.tensor().strides()
        ))
    })?;

    // User layout
    let user = UserDescs::new(
        &shape,
        &src_2d,
        m2.tensor(),
        scale_.tensor(),
        zp_.tensor(),
        &dst_2d,
    )?;
    let src_m = Memory::new(user.src.clone(), src_2d.buffer().clone())?;
    let packed_m = Memory::new(user.packed_weight.clone(), m2.tensor().buffer().clone())?;
    let scale_m = Memory::new(user.scale.clone(), scale_.tensor().buffer().clone())?;
    let zp_m = Memory::new(user.zero_point.clone(), zp_.tensor().buffer().clone())?;
    let dst_m = Memory::new(user.dst.clone(), dst_2d.buffer().clone())?;

    // Compute layout: u4 view over the packed containers
    let compute = ComputeDescs::new(&shape, &user)?;
    let weights_m = packed_m.reinterpret(compute.weights.clone())?;
    tracing::trace!(
        "woq_matmul_int4: packed {:?} s32 reinterpreted as {:?} u4 (zero point declared {})",
        user.packed_weight.dims(),
        compute.weights.dims(),
        compute.zero_point.dtype()
    );

    // Quantization and fusion
    let post_ops = attr.extract_post_ops(&dst_2d)?;
    let pattr = PrimitiveAttr::grouped_int4(&shape, scale_.tensor().dtype(), config, post_ops);
    let pd = MatmulPrimitiveDesc::new(&compute.src, weights_m.desc(), &compute.dst, pattr)?;
    let primitive = MatmulPrimitive::new(pd);

    // Execution
    let mut args = ExecArgs::new();
    if let Some(desc) = primitive.desc().scratchpad_desc() {
        let buffer = engine.allocate_buffer(desc.byte_size())?;
        args.insert(ArgRole::Scratchpad, Memory::new(desc.clone(), buffer)?);
    }
    if attr.with_binary() {
        attr.construct_post_binary(primitive.desc(), &mut args)?;
    }
    args.insert(ArgRole::Src, src_m);
    args.insert(ArgRole::Weights, weights_m);
    args.insert(ArgRole::Dst, dst_m);
    args.insert(ArgRole::WeightScales, scale_m);
    args.insert(ArgRole::WeightZeroPoints, zp_m);
    primitive.check_args(&args)?;

    let mut wait_set = deps.to_vec();
    for operand in [&m1, &m2, &scale_, &zp_, &dst] {
        if let Some(ready) = operand.submit_copy(stream, deps)? {
            wait_set.push(ready);
        }
    }

    let done = primitive.execute(stream, &args, &wait_set)?;
    tracing::debug!(
        "woq_matmul_int4: submitted event #{} waiting on {} event(s)",
        done.id(),
        wait_set.len()
    );

    match &dst {
        Normalized::Owned { tensor, source } => {
            let written = tensor.copy_into_on(source, stream, &[done])?;
            tracing::debug!(
                "woq_matmul_int4: copying compacted result back to the caller's destination"
            );
            Ok(written)
        }
        Normalized::Borrowed(_) => Ok(done),
    }
}
