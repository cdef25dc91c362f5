//! Emulated accelerator device
//!
//! Host-resident stand-in for an accelerator runtime: an [`Engine`] owns
//! allocation accounting and hands out [`DeviceBuffer`]s, and [`Stream`]s
//! execute submitted work asynchronously on worker threads, ordered by
//! [`Event`] wait-sets.

mod engine;
mod error;
mod event;
mod memory;
mod stream;

pub use engine::{AllocationStats, Engine, DEFAULT_MAX_ALLOCATION};
pub use error::{DeviceError, DeviceResult};
pub use event::{Event, EventStatus};
pub use memory::DeviceBuffer;
pub use stream::{DeviceWork, QueueOrder, Stream, OUT_OF_ORDER_WORKERS};
