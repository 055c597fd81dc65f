use std::{fmt, str::FromStr};

use candle_core::DType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DTypeConversionError {
    #[error("`{0}` is not a supported activation data type.")]
    Unsupported(String),
}

/// Floating point type of activations and the KV cache.
///
/// Serialized with torch-style names (`"float16"`, `"bfloat16"`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NumericType(DType);

impl NumericType {
    pub fn new(dtype: DType) -> Result<Self, DTypeConversionError> {
        match dtype {
            DType::F16 | DType::BF16 | DType::F32 | DType::F64 => Ok(Self(dtype)),
            other => Err(DTypeConversionError::Unsupported(format!("{other:?}"))),
        }
    }

    pub fn dtype(&self) -> DType {
        self.0
    }

    pub fn element_size(&self) -> usize {
        self.0.size_in_bytes()
    }
}

impl Default for NumericType {
    fn default() -> Self {
        Self(DType::F32)
    }
}

impl FromStr for NumericType {
    type Err = DTypeConversionError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(match s {
            "float32" | "float" | "f32" => DType::F32,
            "float64" | "double" | "f64" => DType::F64,
            "float16" | "half" | "f16" => DType::F16,
            "bfloat16" | "bf16" => DType::BF16,
            other => return Err(DTypeConversionError::Unsupported(other.to_string())),
        }))
    }
}

impl TryFrom<String> for NumericType {
    type Error = DTypeConversionError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NumericType> for String {
    fn from(value: NumericType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for NumericType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            DType::F32 => write!(f, "float32"),
            DType::F64 => write!(f, "float64"),
            DType::F16 => write!(f, "float16"),
            DType::BF16 => write!(f, "bfloat16"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Data type of the KV arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PagedCacheType {
    /// Same as the activations.
    #[default]
    Auto,
    F16,
    BF16,
    F32,
    /// 8-bit float, e4m3. Halves an f16 cache at reduced precision.
    F8E4M3,
}

impl PagedCacheType {
    pub fn to_dtype(&self, act_dtype: DType) -> DType {
        match self {
            PagedCacheType::Auto => act_dtype,
            PagedCacheType::F16 => DType::F16,
            PagedCacheType::BF16 => DType::BF16,
            PagedCacheType::F32 => DType::F32,
            PagedCacheType::F8E4M3 => DType::F8E4M3,
        }
    }
}

impl FromStr for PagedCacheType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "f16" => Ok(Self::F16),
            "bf16" => Ok(Self::BF16),
            "f32" => Ok(Self::F32),
            "f8e4m3" => Ok(Self::F8E4M3),
            other => Err(format!(
                "Unexpected `PagedCacheType`, got `{other}` but expected `auto`, `f16`, `bf16`, `f32` or `f8e4m3`."
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_type_names() {
        let t: NumericType = "half".parse().unwrap();
        assert_eq!(t.dtype(), DType::F16);
        assert_eq!(t.element_size(), 2);
        assert_eq!(t.to_string(), "float16");
        assert!("int8".parse::<NumericType>().is_err());
        assert!(NumericType::new(DType::U32).is_err());
    }

    #[test]
    fn test_numeric_type_serde() {
        let t: NumericType = serde_json::from_str("\"bfloat16\"").unwrap();
        assert_eq!(t.dtype(), DType::BF16);
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"bfloat16\"");
        assert!(serde_json::from_str::<NumericType>("\"uint8\"").is_err());
    }

    #[test]
    fn test_cache_type() {
        assert_eq!(PagedCacheType::Auto.to_dtype(DType::BF16), DType::BF16);
        assert_eq!(PagedCacheType::F32.to_dtype(DType::F16), DType::F32);
        assert_eq!("bf16".parse::<PagedCacheType>().unwrap(), PagedCacheType::BF16);
        let t: PagedCacheType = serde_json::from_str("\"f16\"").unwrap();
        assert_eq!(t, PagedCacheType::F16);
        let t: PagedCacheType = serde_json::from_str("\"f8e4m3\"").unwrap();
        assert_eq!(t.to_dtype(DType::F32), DType::F8E4M3);
        assert_eq!("f8e4m3".parse::<PagedCacheType>().unwrap(), t);
        assert!("f8e5m2".parse::<PagedCacheType>().is_err());
    }
}
