//! Device operations

pub mod woq_matmul;

pub use woq_matmul::{woq_matmul_int4, woq_matmul_int4_with_config, Attr, FusionAttr, WoqConfig};
