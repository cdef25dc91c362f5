//! Accelerator backend

pub mod device;

pub use device::*;
