//! Strided device tensors
//!
//! [`DeviceTensor`] is the caller-facing tensor handle: a shared device
//! buffer plus logical dims, element strides and an element type. Views
//! (transposes, flattened rows) share the buffer; only
//! [`DeviceTensor::contiguous_on`] allocates.

mod dtype;

pub use dtype::DataType;

use crate::backend::{DeviceBuffer, DeviceError, Engine, Event, Stream};
use crate::error::{WoqError, WoqResult};

/// Row-major (C order) element strides for `dims`
pub fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut stride = 1usize;
    for (i, &dim) in dims.iter().enumerate().rev() {
        strides[i] = stride;
        stride = stride.saturating_mul(dim.max(1));
    }
    strides
}

/// Element offsets of every logical index of `dims`, in row-major order
pub fn element_offsets(dims: &[usize], strides: &[usize]) -> Vec<usize> {
    let count: usize = dims.iter().product();
    let mut offsets = Vec::with_capacity(count);
    if count == 0 {
        return offsets;
    }
    let mut index = vec![0usize; dims.len()];
    for _ in 0..count {
        offsets.push(index.iter().zip(strides).map(|(i, s)| i * s).sum());
        for d in (0..dims.len()).rev() {
            index[d] += 1;
            if index[d] < dims[d] {
                break;
            }
            index[d] = 0;
        }
    }
    offsets
}

/// One past the furthest element addressed by `dims`/`strides`
pub fn span_elements(dims: &[usize], strides: &[usize]) -> usize {
    if dims.iter().any(|&d| d == 0) {
        return 0;
    }
    1 + dims
        .iter()
        .zip(strides)
        .map(|(&d, &s)| (d - 1) * s)
        .sum::<usize>()
}

/// Strided tensor living in device memory
#[derive(Debug, Clone)]
pub struct DeviceTensor {
    buffer: DeviceBuffer,
    dims: Vec<usize>,
    strides: Vec<usize>,
    dtype: DataType,
}

impl DeviceTensor {
    /// Wrap an existing buffer, validating that the layout fits inside it
    pub fn from_buffer(
        buffer: DeviceBuffer,
        dims: Vec<usize>,
        strides: Vec<usize>,
        dtype: DataType,
    ) -> WoqResult<Self> {
        if dims.len() != strides.len() {
            return Err(WoqError::InvalidPrecondition(format!(
                "tensor has {} dims but {} strides",
                dims.len(),
                strides.len()
            )));
        }
        let required = dtype.bytes_for(span_elements(&dims, &strides));
        if required > buffer.size() {
            return Err(WoqError::MemoryViewOutOfBounds {
                required,
                available: buffer.size(),
            });
        }
        Ok(DeviceTensor {
            buffer,
            dims,
            strides,
            dtype,
        })
    }

    /// Allocate a zero-filled contiguous tensor
    pub fn empty(engine: &Engine, dims: &[usize], dtype: DataType) -> WoqResult<Self> {
        let numel: usize = dims.iter().product();
        let buffer = engine.allocate_buffer(dtype.bytes_for(numel))?;
        Self::from_buffer(buffer, dims.to_vec(), contiguous_strides(dims), dtype)
    }

    /// Allocate a contiguous tensor holding `values` converted to `dtype`
    pub fn from_host_f32(
        engine: &Engine,
        dims: &[usize],
        dtype: DataType,
        values: &[f32],
    ) -> WoqResult<Self> {
        let numel: usize = dims.iter().product();
        if values.len() != numel {
            return Err(WoqError::ShapeMismatch {
                operand: "host data",
                expected: dims.to_vec(),
                actual: vec![values.len()],
            });
        }
        let width = dtype
            .size_in_bytes()
            .ok_or(WoqError::UnsupportedDtype { operand: "host data", dtype })?;
        let mut bytes = vec![0u8; numel * width];
        for (chunk, &value) in bytes.chunks_exact_mut(width).zip(values) {
            dtype.encode(value, chunk);
        }
        Self::from_host_bytes(engine, dims, dtype, &bytes)
    }

    /// Allocate a contiguous tensor from raw little-endian element bytes
    pub fn from_host_bytes(
        engine: &Engine,
        dims: &[usize],
        dtype: DataType,
        bytes: &[u8],
    ) -> WoqResult<Self> {
        let numel: usize = dims.iter().product();
        let expected = dtype.bytes_for(numel);
        if bytes.len() != expected {
            return Err(WoqError::InvalidPrecondition(format!(
                "{:?} {} tensor needs {} bytes, got {}",
                dims,
                dtype,
                expected,
                bytes.len()
            )));
        }
        let buffer = engine.allocate_buffer(expected)?;
        buffer.copy_from_host(bytes)?;
        Self::from_buffer(buffer, dims.to_vec(), contiguous_strides(dims), dtype)
    }

    /// Allocate a contiguous `S32` tensor from packed 32-bit containers
    pub fn from_host_u32(engine: &Engine, dims: &[usize], containers: &[u32]) -> WoqResult<Self> {
        Self::from_host_bytes(engine, dims, DataType::S32, bytemuck::cast_slice(containers))
    }

    /// Strided view over the same buffer
    pub fn with_layout(&self, dims: Vec<usize>, strides: Vec<usize>) -> WoqResult<Self> {
        Self::from_buffer(self.buffer.clone(), dims, strides, self.dtype)
    }

    /// View with dims `a` and `b` swapped
    pub fn transpose(&self, a: usize, b: usize) -> WoqResult<Self> {
        if a >= self.dim() || b >= self.dim() {
            return Err(WoqError::InvalidPrecondition(format!(
                "transpose({}, {}) on a {}D tensor",
                a,
                b,
                self.dim()
            )));
        }
        let mut dims = self.dims.clone();
        let mut strides = self.strides.clone();
        dims.swap(a, b);
        strides.swap(a, b);
        self.with_layout(dims, strides)
    }

    /// Merge all leading dims of a 3-D tensor into rows, if expressible as a view
    pub fn flatten_rows(&self) -> Option<Self> {
        match self.dim() {
            2 => Some(self.clone()),
            3 => {
                let (batch, rows, cols) = (self.dims[0], self.dims[1], self.dims[2]);
                if batch > 1 && rows > 1 && self.strides[0] != rows * self.strides[1] {
                    return None;
                }
                // A single-row batch steps by the batch stride
                let row_stride = if rows == 1 { self.strides[0] } else { self.strides[1] };
                Some(DeviceTensor {
                    buffer: self.buffer.clone(),
                    dims: vec![batch * rows, cols],
                    strides: vec![row_stride, self.strides[2]],
                    dtype: self.dtype,
                })
            }
            _ => None,
        }
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Number of dimensions
    pub fn dim(&self) -> usize {
        self.dims.len()
    }

    fn wrap_dim(&self, dim: isize) -> usize {
        if dim < 0 {
            (self.dims.len() as isize + dim) as usize
        } else {
            dim as usize
        }
    }

    /// Size of `dim`; negative indices count from the end
    ///
    /// # Panics
    /// If `dim` is out of range for the tensor's rank.
    pub fn size(&self, dim: isize) -> usize {
        self.dims[self.wrap_dim(dim)]
    }

    /// Element stride of `dim`; negative indices count from the end
    ///
    /// # Panics
    /// If `dim` is out of range for the tensor's rank.
    pub fn stride(&self, dim: isize) -> usize {
        self.strides[self.wrap_dim(dim)]
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// True for a dense row-major layout (size-1 dims may have any stride)
    pub fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(&self.dims);
        self.dims
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(&d, (&s, &e))| d == 1 || s == e)
    }

    /// Elements addressed by the layout, counting gaps
    pub fn span_elements(&self) -> usize {
        span_elements(&self.dims, &self.strides)
    }

    /// True when distinct logical indices may share an element
    pub fn has_overlap(&self) -> bool {
        self.span_elements() < self.numel()
    }

    /// True when a non-trivial dim has a zero (broadcast) stride
    pub fn has_broadcast(&self) -> bool {
        self.dims
            .iter()
            .zip(&self.strides)
            .any(|(&d, &s)| d > 1 && s == 0)
    }

    /// Bytes of the buffer the layout actually reaches
    pub fn byte_len(&self) -> usize {
        self.dtype.bytes_for(self.span_elements())
    }

    /// Allocate a compact row-major copy and enqueue the copy on `stream`
    ///
    /// The returned tensor is valid for device work that waits on the
    /// returned event.
    pub fn contiguous_on(&self, stream: &Stream, deps: &[Event]) -> WoqResult<(Self, Event)> {
        let compact = DeviceTensor::empty(stream.engine(), &self.dims, self.dtype)?;
        let ready = self.copy_into_on(&compact, stream, deps)?;
        Ok((compact, ready))
    }

    /// Enqueue an element-wise strided copy of `self` into `dst`
    pub fn copy_into_on(
        &self,
        dst: &DeviceTensor,
        stream: &Stream,
        deps: &[Event],
    ) -> WoqResult<Event> {
        if self.dims != dst.dims || self.dtype != dst.dtype {
            return Err(WoqError::ShapeMismatch {
                operand: "copy destination",
                expected: self.dims.clone(),
                actual: dst.dims.clone(),
            });
        }
        let width = self
            .dtype
            .size_in_bytes()
            .ok_or(WoqError::UnsupportedDtype { operand: "strided copy", dtype: self.dtype })?;

        let src_offsets = element_offsets(&self.dims, &self.strides);
        let dst_offsets = element_offsets(&dst.dims, &dst.strides);
        let src_buffer = self.buffer.clone();
        let dst_buffer = dst.buffer.clone();

        let event = stream.submit("strided_copy", deps, move || {
            let gathered: Vec<u8> = src_buffer.with_bytes(|bytes| {
                src_offsets
                    .iter()
                    .flat_map(|&off| bytes[off * width..(off + 1) * width].iter().copied())
                    .collect()
            })?;
            dst_buffer.with_bytes_mut(|bytes| {
                for (chunk, &off) in gathered.chunks_exact(width).zip(&dst_offsets) {
                    bytes[off * width..(off + 1) * width].copy_from_slice(chunk);
                }
            })?;
            Ok::<(), DeviceError>(())
        })?;
        Ok(event)
    }

    /// Read the tensor back in logical row-major order as f32
    ///
    /// Host-synchronous; callers must wait on the events that write it.
    pub fn to_host_f32(&self) -> WoqResult<Vec<f32>> {
        let width = self
            .dtype
            .size_in_bytes()
            .ok_or(WoqError::UnsupportedDtype { operand: "host readback", dtype: self.dtype })?;
        let offsets = element_offsets(&self.dims, &self.strides);
        let dtype = self.dtype;
        let values = self.buffer.with_bytes(|bytes| {
            offsets
                .iter()
                .map(|&off| dtype.decode(&bytes[off * width..]))
                .collect()
        })?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueOrder;

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[5]), vec![1]);
    }

    #[test]
    fn test_element_offsets_follow_strides() {
        // 2x3 column-major
        assert_eq!(element_offsets(&[2, 3], &[1, 2]), vec![0, 2, 4, 1, 3, 5]);
    }

    #[test]
    fn test_transpose_is_view() {
        let engine = Engine::new(0);
        let t = DeviceTensor::from_host_f32(&engine, &[2, 3], DataType::F32, &[
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0,
        ])
        .unwrap();
        let tt = t.transpose(0, 1).unwrap();
        assert_eq!(tt.dims(), &[3, 2]);
        assert!(!tt.is_contiguous());
        assert_eq!(tt.to_host_f32().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(engine.stats().allocations(), 1);
    }

    #[test]
    fn test_contiguous_on_compacts() {
        let engine = Engine::new(0);
        let stream = engine.create_stream(QueueOrder::InOrder).unwrap();
        let t = DeviceTensor::from_host_f32(&engine, &[2, 2], DataType::Bf16, &[
            1.0, 2.0, 3.0, 4.0,
        ])
        .unwrap();
        let (compact, ready) = t.transpose(0, 1).unwrap().contiguous_on(&stream, &[]).unwrap();
        ready.wait().unwrap();
        assert!(compact.is_contiguous());
        assert_eq!(compact.to_host_f32().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_overlap_and_broadcast_detection() {
        let engine = Engine::new(0);
        let t = DeviceTensor::empty(&engine, &[4], DataType::F32).unwrap();
        let broadcast = t.with_layout(vec![3, 4], vec![0, 1]).unwrap();
        assert!(broadcast.has_broadcast());
        assert!(broadcast.has_overlap());
    }

    #[test]
    fn test_from_buffer_rejects_out_of_bounds_layout() {
        let engine = Engine::new(0);
        let buffer = engine.allocate_buffer(8).unwrap();
        let err = DeviceTensor::from_buffer(buffer, vec![2, 2], vec![2, 1], DataType::F32)
            .unwrap_err();
        assert!(matches!(err, WoqError::MemoryViewOutOfBounds { required: 16, available: 8 }));
    }

    #[test]
    fn test_flatten_rows() {
        let engine = Engine::new(0);
        let t = DeviceTensor::empty(&engine, &[2, 3, 4], DataType::F32).unwrap();
        let flat = t.flatten_rows().unwrap();
        assert_eq!(flat.dims(), &[6, 4]);
        assert_eq!(flat.strides(), &[4, 1]);

        // Batch-major transpose cannot merge rows as a view
        let permuted = t.with_layout(vec![2, 3, 4], vec![4, 8, 1]).unwrap();
        assert!(permuted.flatten_rows().is_none());
    }

    #[test]
    fn test_negative_dim_indexing() {
        let engine = Engine::new(0);
        let t = DeviceTensor::empty(&engine, &[2, 3, 5], DataType::F16).unwrap();
        assert_eq!(t.size(-1), 5);
        assert_eq!(t.size(-2), 3);
        assert_eq!(t.stride(-2), 5);
    }
}
