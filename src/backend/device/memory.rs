//! Device buffer wrapper for emulated device memory

use std::sync::{Arc, RwLock};

use bytemuck::Pod;

use super::engine::AllocationStats;
use super::error::{DeviceError, DeviceResult};

/// Backing storage for one allocation.
///
/// Stored as `u64` words so that any view starting at an 8-byte aligned
/// offset can be cast to `f32`/`u32` slices.
#[derive(Debug)]
struct Allocation {
    id: u64,
    size: usize,
    words: RwLock<Vec<u64>>,
    stats: Arc<AllocationStats>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        tracing::trace!("DeviceBuffer: releasing allocation #{} ({} bytes)", self.id, self.size);
        self.stats.record_free(self.size);
    }
}

/// DeviceBuffer wrapper using Arc for safe, cheap cloning
///
/// Clones and sub-buffer views share the same allocation; the allocation is
/// released when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    inner: Arc<Allocation>,
    // For sub-allocated buffers: offset from the allocation start in bytes
    offset: usize,
    size: usize,
}

impl DeviceBuffer {
    pub(super) fn allocate(id: u64, size: usize, stats: Arc<AllocationStats>) -> Self {
        let words = vec![0u64; size.div_ceil(8)];
        stats.record_alloc(size);
        DeviceBuffer {
            inner: Arc::new(Allocation {
                id,
                size,
                words: RwLock::new(words),
                stats,
            }),
            offset: 0,
            size,
        }
    }

    /// Get buffer size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte offset of this view inside its allocation
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Identifier of the underlying allocation
    pub fn allocation_id(&self) -> u64 {
        self.inner.id
    }

    /// True when both handles address the same bytes of the same allocation
    pub fn aliases(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.offset == other.offset
    }

    /// Create a view into this buffer at a specific byte offset.
    /// No new device memory is allocated.
    pub fn sub_buffer_view(&self, offset: usize, size: usize) -> DeviceResult<Self> {
        if offset + size > self.size {
            return Err(DeviceError::MemoryAllocationFailed(format!(
                "sub-buffer view out of range: offset={} size={} > buffer_size={}",
                offset, size, self.size
            )));
        }

        Ok(DeviceBuffer {
            inner: Arc::clone(&self.inner),
            offset: self.offset + offset,
            size,
        })
    }

    /// Run `f` over the bytes of this view under a shared lock
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> DeviceResult<R> {
        let words = self.inner.words.read()?;
        let bytes: &[u8] = bytemuck::cast_slice(words.as_slice());
        Ok(f(&bytes[self.offset..self.offset + self.size]))
    }

    /// Run `f` over the bytes of this view under an exclusive lock
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> DeviceResult<R> {
        let mut words = self.inner.words.write()?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
        Ok(f(&mut bytes[self.offset..self.offset + self.size]))
    }

    /// Copy data from host to device
    pub fn copy_from_host<T: Pod>(&self, data: &[T]) -> DeviceResult<()> {
        let src: &[u8] = bytemuck::cast_slice(data);
        if src.len() > self.size {
            return Err(DeviceError::MemoryCopyFailed(format!(
                "Source data too large: {} > {}",
                src.len(),
                self.size
            )));
        }
        self.with_bytes_mut(|dst| dst[..src.len()].copy_from_slice(src))
    }

    /// Copy data from device to host
    pub fn copy_to_host<T: Pod>(&self, data: &mut [T]) -> DeviceResult<()> {
        let dst: &mut [u8] = bytemuck::cast_slice_mut(data);
        if dst.len() > self.size {
            return Err(DeviceError::MemoryCopyFailed(format!(
                "Destination too large: {} > {}",
                dst.len(),
                self.size
            )));
        }
        let len = dst.len();
        self.with_bytes(|src| dst.copy_from_slice(&src[..len]))
    }

    /// Snapshot the whole view into a host vector
    pub fn to_host_bytes(&self) -> DeviceResult<Vec<u8>> {
        self.with_bytes(|bytes| bytes.to_vec())
    }
}
