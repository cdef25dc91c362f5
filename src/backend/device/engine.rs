//! Emulated device engine: allocation entry point and accounting

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::error::{DeviceError, DeviceResult};
use super::memory::DeviceBuffer;
use super::stream::{QueueOrder, Stream};

/// Allocation counters shared by every buffer of one engine
#[derive(Debug, Default)]
pub struct AllocationStats {
    allocations: AtomicUsize,
    allocated_bytes: AtomicUsize,
    live_allocations: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl AllocationStats {
    /// Total number of allocations made so far
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    /// Total bytes ever allocated
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    /// Allocations still referenced by at least one handle
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Acquire)
    }

    /// Bytes still referenced by at least one handle
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub(super) fn record_alloc(&self, size: usize) {
        self.allocations.fetch_add(1, Ordering::AcqRel);
        self.allocated_bytes.fetch_add(size, Ordering::AcqRel);
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(size, Ordering::AcqRel);
    }

    pub(super) fn record_free(&self, size: usize) {
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(size, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct EngineInner {
    index: usize,
    max_allocation: usize,
    next_allocation_id: AtomicU64,
    stats: Arc<AllocationStats>,
}

/// Handle to one emulated accelerator device
///
/// Cloning is cheap; clones share allocation accounting.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Largest single allocation accepted by default (1 GiB)
pub const DEFAULT_MAX_ALLOCATION: usize = 1 << 30;

impl Engine {
    /// Create a device engine with the default allocation limit
    pub fn new(index: usize) -> Self {
        Self::with_max_allocation(index, DEFAULT_MAX_ALLOCATION)
    }

    /// Create a device engine that refuses allocations above `max_allocation` bytes
    pub fn with_max_allocation(index: usize, max_allocation: usize) -> Self {
        tracing::debug!(
            "Engine::new: device {} (max allocation {} bytes)",
            index,
            max_allocation
        );
        Engine {
            inner: Arc::new(EngineInner {
                index,
                max_allocation,
                next_allocation_id: AtomicU64::new(0),
                stats: Arc::new(AllocationStats::default()),
            }),
        }
    }

    /// Device index
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Allocation accounting for this device
    pub fn stats(&self) -> &AllocationStats {
        &self.inner.stats
    }

    /// Allocate a zero-initialized device buffer
    pub fn allocate_buffer(&self, size: usize) -> DeviceResult<DeviceBuffer> {
        if size > self.inner.max_allocation {
            tracing::error!(
                "Engine::allocate_buffer: {} bytes exceeds device limit of {} bytes",
                size,
                self.inner.max_allocation
            );
            return Err(DeviceError::MemoryAllocationFailed(format!(
                "requested {} bytes, device {} limit is {} bytes",
                size, self.inner.index, self.inner.max_allocation
            )));
        }

        let id = self.inner.next_allocation_id.fetch_add(1, Ordering::AcqRel);
        tracing::trace!("Engine::allocate_buffer: allocation #{} of {} bytes", id, size);
        Ok(DeviceBuffer::allocate(id, size, Arc::clone(&self.inner.stats)))
    }

    /// Create a new execution queue on this device
    pub fn create_stream(&self, order: QueueOrder) -> DeviceResult<Stream> {
        Stream::new(self.clone(), order)
    }

    /// True when both handles refer to the same device
    pub fn same_device(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
