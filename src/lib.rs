//! woqforge - weight-only int4 quantized matmul
//!
//! Multiplies floating-point activations by 4-bit packed weights that are
//! dequantized per group along K, submitted asynchronously to a device
//! queue behind caller-supplied dependencies.

#![allow(clippy::too_many_arguments)] // Operator entry points mirror the full operand list
#![allow(clippy::needless_range_loop)] // Clearer for index-heavy kernel code
#![allow(clippy::manual_slice_size_calculation)] // Common in buffer sizing code

pub mod backend;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod memory;
pub mod ops;
pub mod tensor;

pub use backend::{DeviceBuffer, DeviceError, Engine, Event, EventStatus, QueueOrder, Stream};
pub use error::{ErrorCategory, WoqError, WoqResult};
pub use memory::{FormatTag, Memory, MemoryDesc};
pub use ops::woq_matmul::{
    woq_matmul_int4, woq_matmul_int4_with_config, Attr, BinaryAlg, EltwiseAlg, FpMathMode,
    FusionAttr, WoqConfig,
};
pub use tensor::{DataType, DeviceTensor};
