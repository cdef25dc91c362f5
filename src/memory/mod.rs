//! Memory descriptors and buffer-bound memory views
//!
//! A [`MemoryDesc`] is a (dims, data type, strides) triple describing one
//! interpretation of a buffer. A [`Memory`] binds a descriptor to a
//! [`DeviceBuffer`] without owning any storage of its own; two memories may
//! alias the same buffer under different descriptors (for example a packed
//! `s32` weight and its `u4` reinterpretation). Every binding is validated
//! against the byte size of the buffer when it is created.

use crate::backend::{DeviceBuffer, DeviceResult};
use crate::error::{WoqError, WoqResult};
use crate::tensor::{contiguous_strides, element_offsets, span_elements, DataType};

/// Plain layout tags for 1-D and 2-D descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTag {
    /// 1-D dense
    A,
    /// 2-D row-major: last dim contiguous
    Ab,
    /// 2-D column-major: first dim contiguous
    Ba,
}

/// Layout descriptor: dims, element type and element strides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    dtype: DataType,
    strides: Vec<usize>,
}

impl MemoryDesc {
    pub fn new(dims: Vec<usize>, dtype: DataType, strides: Vec<usize>) -> WoqResult<Self> {
        if dims.is_empty() || dims.len() != strides.len() {
            return Err(WoqError::InvalidPrecondition(format!(
                "memory descriptor needs matching non-empty dims/strides, got {:?}/{:?}",
                dims, strides
            )));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(WoqError::InvalidPrecondition(format!(
                "memory descriptor dims must be positive, got {:?}",
                dims
            )));
        }
        Ok(MemoryDesc {
            dims,
            dtype,
            strides,
        })
    }

    /// Descriptor with strides implied by a plain format tag
    pub fn from_format_tag(dims: Vec<usize>, dtype: DataType, tag: FormatTag) -> WoqResult<Self> {
        let strides = match (tag, dims.as_slice()) {
            (FormatTag::A, [_]) => vec![1],
            (FormatTag::Ab, [_, _]) => contiguous_strides(&dims),
            (FormatTag::Ba, [rows, _]) => vec![1, *rows],
            _ => {
                return Err(WoqError::InvalidPrecondition(format!(
                    "format tag {:?} does not apply to dims {:?}",
                    tag, dims
                )))
            }
        };
        Self::new(dims, dtype, strides)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn nelems(&self) -> usize {
        self.dims.iter().product()
    }

    /// Element offset of a logical index
    pub fn offset_of(&self, index: &[usize]) -> usize {
        index.iter().zip(&self.strides).map(|(i, s)| i * s).sum()
    }

    /// Bytes spanned by the layout (sub-byte types counted in bits)
    pub fn byte_size(&self) -> usize {
        self.dtype.bytes_for(span_elements(&self.dims, &self.strides))
    }

    /// Same layout with a different element type
    pub fn with_dtype(&self, dtype: DataType) -> Self {
        MemoryDesc {
            dims: self.dims.clone(),
            dtype,
            strides: self.strides.clone(),
        }
    }
}

/// A descriptor bound to a device buffer
#[derive(Debug, Clone)]
pub struct Memory {
    desc: MemoryDesc,
    buffer: DeviceBuffer,
}

impl Memory {
    /// Bind `desc` to `buffer`, failing when the layout does not fit
    pub fn new(desc: MemoryDesc, buffer: DeviceBuffer) -> WoqResult<Self> {
        let required = desc.byte_size();
        if required > buffer.size() {
            return Err(WoqError::MemoryViewOutOfBounds {
                required,
                available: buffer.size(),
            });
        }
        tracing::trace!(
            "Memory::new: {:?} {} strides {:?} on allocation #{}",
            desc.dims,
            desc.dtype,
            desc.strides,
            buffer.allocation_id()
        );
        Ok(Memory { desc, buffer })
    }

    /// Reinterpret the same bytes under another descriptor
    pub fn reinterpret(&self, desc: MemoryDesc) -> WoqResult<Self> {
        Memory::new(desc, self.buffer.clone())
    }

    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// True when both memories start at the same bytes
    pub fn aliases(&self, other: &Memory) -> bool {
        self.buffer.aliases(&other.buffer)
    }

    /// Gather all elements in logical row-major order as f32
    pub fn read_f32(&self) -> DeviceResult<Vec<f32>> {
        let dtype = self.desc.dtype;
        let offsets = element_offsets(&self.desc.dims, &self.desc.strides);
        self.buffer.with_bytes(|bytes| {
            offsets
                .iter()
                .map(|&off| {
                    if dtype.is_sub_byte() {
                        let byte = bytes[off / 2];
                        let nibble = if off % 2 == 0 { byte } else { byte >> 4 };
                        dtype.decode(&[nibble])
                    } else {
                        let width = dtype.bits() / 8;
                        dtype.decode(&bytes[off * width..])
                    }
                })
                .collect()
        })
    }

    /// Scatter `values` (logical row-major order) into the buffer
    pub fn write_f32(&self, values: &[f32]) -> DeviceResult<()> {
        let dtype = self.desc.dtype;
        let offsets = element_offsets(&self.desc.dims, &self.desc.strides);
        self.buffer.with_bytes_mut(|bytes| {
            for (&off, &value) in offsets.iter().zip(values) {
                if dtype.is_sub_byte() {
                    let mut nibble = [0u8];
                    dtype.encode(value, &mut nibble);
                    let byte = &mut bytes[off / 2];
                    if off % 2 == 0 {
                        *byte = (*byte & 0xF0) | nibble[0];
                    } else {
                        *byte = (*byte & 0x0F) | (nibble[0] << 4);
                    }
                } else {
                    let width = dtype.bits() / 8;
                    dtype.encode(value, &mut bytes[off * width..(off + 1) * width]);
                }
            }
        })
    }
}
