//! Layout normalization and the fixed stride conventions of packed operands
//!
//! Operands whose strides the engine accepts pass through untouched.
//! Anything else gets a compact row-major buffer allocated here, with the
//! copy itself only enqueued once the execution plan has been built, so a
//! call that fails synchronously never leaves device work behind.

use crate::backend::{Engine, Event, Stream};
use crate::error::WoqResult;
use crate::memory::FormatTag;
use crate::tensor::DeviceTensor;

/// Sub-byte weights stored in one 32-bit container
pub const NIBBLES_PER_CONTAINER: usize = 8;

/// Layout tag of the unpacked `(K, N)` u4 weight view: K is the fastest axis
pub const UNPACKED_WEIGHT_TAG: FormatTag = FormatTag::Ba;

/// Strides of the packed `(K / 8, N)` weight descriptor
///
/// The compressed K axis is contiguous and columns are the outer axis,
/// which is how the packer lays containers out. Reversing this order
/// decodes garbage without any error.
pub fn packed_weight_strides(compressed_k: usize) -> Vec<usize> {
    vec![1, compressed_k]
}

/// Strides of the logical `(num_groups, N)` scale view
///
/// Scales are stored physically as `[N, num_groups]`; the logical view
/// swaps the two physical strides.
pub fn scale_view_strides(physical: &DeviceTensor) -> Vec<usize> {
    vec![physical.stride(1), physical.stride(0)]
}

/// Orient a 2-D operand as `[rows, cols]`, transposing a `[cols, rows]` tensor
///
/// A square tensor is taken as already `[rows, cols]`. Callers validate
/// the dims first.
fn oriented(tensor: &DeviceTensor, rows: usize, cols: usize) -> WoqResult<DeviceTensor> {
    if tensor.dims() == [rows, cols] {
        Ok(tensor.clone())
    } else {
        tensor.transpose(0, 1)
    }
}

/// The packed weight as `[N, K / 8]`, compressed K along the last dim
///
/// A `(K / 8, N)` tensor strided `packed_weight_strides` becomes a
/// contiguous view; any other `(K / 8, N)` layout becomes a strided view
/// that normalization compacts in this order.
pub fn packed_weight_view(
    mat2: &DeviceTensor,
    compressed_k: usize,
    n: usize,
) -> WoqResult<DeviceTensor> {
    oriented(mat2, n, compressed_k)
}

/// The scale as `[N, num_groups]`, the physical order the logical view expects
///
/// When `num_groups == N` the tensor is read as `[N, num_groups]`.
pub fn scale_physical_view(
    scale: &DeviceTensor,
    num_groups: usize,
    n: usize,
) -> WoqResult<DeviceTensor> {
    oriented(scale, n, num_groups)
}

/// Role an operand plays in the matmul
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRole {
    Activation,
    PackedWeight,
    Scale,
    ZeroPoint,
    Destination,
}

impl OperandRole {
    pub fn name(self) -> &'static str {
        match self {
            OperandRole::Activation => "activation",
            OperandRole::PackedWeight => "packed weight",
            OperandRole::Scale => "scale",
            OperandRole::ZeroPoint => "zero point",
            OperandRole::Destination => "destination",
        }
    }
}

/// True when the engine can consume `tensor` in place for `role`
pub fn is_engine_strides(tensor: &DeviceTensor, role: OperandRole) -> bool {
    match role {
        OperandRole::ZeroPoint if tensor.numel() == 1 => return true,
        // Packed descriptors ignore the tensor's strides entirely
        OperandRole::PackedWeight => return tensor.is_contiguous(),
        _ => {}
    }

    let rank = tensor.dim();
    if rank != 2 && rank != 3 {
        return tensor.is_contiguous();
    }
    if tensor.is_contiguous() {
        return true;
    }
    if tensor.has_overlap() || tensor.has_broadcast() {
        return false;
    }

    let inner = tensor.stride(-1);
    let outer = tensor.stride(-2);
    let strides_ok = match role {
        OperandRole::Destination => inner == 1,
        _ => inner == 1 || outer == 1,
    };
    if !strides_ok {
        return false;
    }

    // Activation and destination are consumed as 2-D row blocks
    match role {
        OperandRole::Activation | OperandRole::Destination => tensor.flatten_rows().is_some(),
        _ => true,
    }
}

/// An operand in an engine-acceptable layout
///
/// `Borrowed` is the caller's tensor itself. `Owned` is a freshly
/// allocated compact tensor that holds the caller's data only after
/// [`Normalized::submit_copy`] has been enqueued.
#[derive(Debug)]
pub enum Normalized<'a> {
    Borrowed(&'a DeviceTensor),
    Owned {
        tensor: DeviceTensor,
        source: &'a DeviceTensor,
    },
}

impl<'a> Normalized<'a> {
    pub fn tensor(&self) -> &DeviceTensor {
        match self {
            Normalized::Borrowed(tensor) => tensor,
            Normalized::Owned { tensor, .. } => tensor,
        }
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, Normalized::Owned { .. })
    }

    /// Enqueue the compaction copy; `None` on the fast path
    pub fn submit_copy(&self, stream: &Stream, deps: &[Event]) -> WoqResult<Option<Event>> {
        match self {
            Normalized::Borrowed(_) => Ok(None),
            Normalized::Owned { tensor, source } => {
                source.copy_into_on(tensor, stream, deps).map(Some)
            }
        }
    }
}

/// Pass `tensor` through, or allocate a compact buffer for it
pub fn normalize<'a>(
    tensor: &'a DeviceTensor,
    role: OperandRole,
    engine: &Engine,
) -> WoqResult<Normalized<'a>> {
    if is_engine_strides(tensor, role) {
        return Ok(Normalized::Borrowed(tensor));
    }

    tracing::warn!(
        "woq_matmul: {} {:?} strides {:?} not engine-compatible, compacting",
        role.name(),
        tensor.dims(),
        tensor.strides()
    );
    let compact = DeviceTensor::empty(engine, tensor.dims(), tensor.dtype())?;
    Ok(Normalized::Owned {
        tensor: compact,
        source: tensor,
    })
}
