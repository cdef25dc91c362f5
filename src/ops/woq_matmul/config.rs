//! Configuration for the WoQ matmul
//!
//! [`WoqConfig`] controls the intermediate floating precision the engine
//! uses when integer weights are dequantized, and the element type the
//! zero point is applied in.

use std::str::FromStr;

use crate::kernels::matmul::IntermediatePrecision;
use crate::tensor::DataType;

/// Environment variable selecting the fpmath mode
pub const FPMATH_ENV: &str = "WOQFORGE_FPMATH";

/// Floating-point math mode for the dequantized weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FpMathMode {
    /// Keep full f32 precision
    Strict,
    /// Round dequantized values to bf16
    #[default]
    Bf16,
    /// Round dequantized values to f16
    F16,
    /// Engine's choice
    Any,
}

impl FpMathMode {
    /// Precision the kernel rounds dequantized weights to
    ///
    /// Integer primitives only see the reduced precision when
    /// `apply_to_int` is set; otherwise they stay in f32.
    pub fn intermediate_precision(self, apply_to_int: bool) -> IntermediatePrecision {
        if !apply_to_int {
            return IntermediatePrecision::F32;
        }
        match self {
            FpMathMode::Strict => IntermediatePrecision::F32,
            FpMathMode::Bf16 | FpMathMode::Any => IntermediatePrecision::Bf16,
            FpMathMode::F16 => IntermediatePrecision::F16,
        }
    }
}

impl FromStr for FpMathMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" | "f32" => Ok(FpMathMode::Strict),
            "bf16" => Ok(FpMathMode::Bf16),
            "f16" | "fp16" => Ok(FpMathMode::F16),
            "any" => Ok(FpMathMode::Any),
            other => Err(format!("unknown fpmath mode '{}'", other)),
        }
    }
}

/// Configuration for a WoQ matmul call
#[derive(Debug, Clone)]
pub struct WoqConfig {
    /// Intermediate precision for dequantized weights
    pub fpmath_mode: FpMathMode,

    /// Whether the fpmath mode also applies to integer-typed primitives
    pub fpmath_apply_to_int: bool,

    /// Element type the scalar zero point is applied in
    pub zero_point_dtype: DataType,
}

impl Default for WoqConfig {
    fn default() -> Self {
        WoqConfig {
            fpmath_mode: FpMathMode::Bf16,
            fpmath_apply_to_int: true,
            zero_point_dtype: DataType::S8,
        }
    }
}

impl WoqConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `WOQFORGE_FPMATH` when it holds a valid mode
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(FPMATH_ENV) {
            match value.parse::<FpMathMode>() {
                Ok(mode) => config.fpmath_mode = mode,
                Err(e) => tracing::warn!("Ignoring {}: {}", FPMATH_ENV, e),
            }
        }
        config
    }

    /// Set fpmath mode
    pub fn with_fpmath_mode(mut self, fpmath_mode: FpMathMode) -> Self {
        self.fpmath_mode = fpmath_mode;
        self
    }

    /// Set whether fpmath applies to integer primitives
    pub fn with_fpmath_apply_to_int(mut self, apply_to_int: bool) -> Self {
        self.fpmath_apply_to_int = apply_to_int;
        self
    }

    /// Set the zero point element type
    pub fn with_zero_point_dtype(mut self, dtype: DataType) -> Self {
        self.zero_point_dtype = dtype;
        self
    }

    /// Precision the kernel rounds dequantized weights to
    pub fn intermediate_precision(&self) -> IntermediatePrecision {
        self.fpmath_mode.intermediate_precision(self.fpmath_apply_to_int)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = WoqConfig::default();
        assert_eq!(config.fpmath_mode, FpMathMode::Bf16);
        assert!(config.fpmath_apply_to_int);
        assert_eq!(config.zero_point_dtype, DataType::S8);
        assert_eq!(config.intermediate_precision(), IntermediatePrecision::Bf16);
    }

    #[test]
    fn test_builder() {
        let config = WoqConfig::new()
            .with_fpmath_mode(FpMathMode::F16)
            .with_fpmath_apply_to_int(false);
        assert_eq!(config.fpmath_mode, FpMathMode::F16);
        assert_eq!(config.intermediate_precision(), IntermediatePrecision::F32);
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!("STRICT".parse::<FpMathMode>(), Ok(FpMathMode::Strict));
        assert_eq!(" any ".parse::<FpMathMode>(), Ok(FpMathMode::Any));
        assert!("fp8".parse::<FpMathMode>().is_err());
        assert_eq!(
            FpMathMode::Any.intermediate_precision(true),
            IntermediatePrecision::Bf16
        );
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(FPMATH_ENV, "strict");
        assert_eq!(WoqConfig::from_env().fpmath_mode, FpMathMode::Strict);

        std::env::set_var(FPMATH_ENV, "bogus");
        assert_eq!(WoqConfig::from_env().fpmath_mode, FpMathMode::Bf16);

        std::env::remove_var(FPMATH_ENV);
        assert_eq!(WoqConfig::from_env().fpmath_mode, FpMathMode::Bf16);
    }
}
