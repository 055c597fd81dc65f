//! Engine configuration, loaded from JSON and validated once at startup.

use candle_core::DType;
use kvserve_paged_attn::{AttentionBackendKind, KvCacheGeometry};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    paged_attention::{kv_cache_geometry, CacheConfig, ModelGeometry},
    utils::dtype::NumericType,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RopeScalingKind {
    #[default]
    Default,
    /// Positions are divided by the factor; the table grows by the factor.
    Linear,
    /// NTK-aware: the base grows with the factor; the table grows by the factor.
    Dynamic,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RopeScaling {
    #[serde(rename = "type")]
    pub kind: RopeScalingKind,
    pub factor: f64,
}

fn default_rope_base() -> f64 {
    10000.0
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RotaryConfig {
    pub max_position_embeddings: usize,
    /// Defaults to the head dim.
    #[serde(default)]
    pub rotary_dim: Option<usize>,
    #[serde(default = "default_rope_base")]
    pub base: f64,
    #[serde(default = "default_true")]
    pub is_neox: bool,
    #[serde(default)]
    pub scaling: Option<RopeScaling>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingConfig {
    /// Largest chunk, in bytes, one execution unit copies at a time.
    pub max_block_size: usize,
    pub max_used_core_num: usize,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            max_block_size: 256,
            max_used_core_num: 48,
        }
    }
}

fn default_num_ranks() -> usize {
    1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model: ModelGeometry,
    pub cache: CacheConfig,
    pub rotary: RotaryConfig,
    #[serde(default)]
    pub tiling: TilingConfig,
    #[serde(default)]
    pub backend: AttentionBackendKind,
    /// Activation dtype.
    #[serde(default)]
    pub dtype: NumericType,
    #[serde(default = "default_num_ranks")]
    pub num_ranks: usize,
}

impl EngineConfig {
    /// Parse and validate.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        if m.num_layers == 0 || m.num_attn_heads == 0 || m.num_kv_heads == 0 || m.head_dim == 0 {
            return Err(Error::Config(format!(
                "model geometry has a zero dimension: {m:?}"
            )));
        }
        if !m.num_attn_heads.is_multiple_of(m.num_kv_heads) {
            return Err(Error::Config(format!(
                "{} attention heads are not a multiple of {} kv heads",
                m.num_attn_heads, m.num_kv_heads
            )));
        }
        let c = &self.cache;
        if c.block_size == 0 || c.num_gpu_blocks == 0 || c.max_blocks_per_seq == 0 {
            return Err(Error::Config(format!(
                "block size, block count and max blocks per sequence must be non-zero: {c:?}"
            )));
        }
        let r = &self.rotary;
        let rotary_dim = self.rotary_dim();
        if r.max_position_embeddings == 0 || rotary_dim == 0 || !rotary_dim.is_multiple_of(2) {
            return Err(Error::Config(format!(
                "rotary needs positions and an even non-zero dim, got {} and {rotary_dim}",
                r.max_position_embeddings
            )));
        }
        if rotary_dim > m.head_dim {
            return Err(Error::Config(format!(
                "rotary dim {rotary_dim} exceeds head dim {}",
                m.head_dim
            )));
        }
        if r.base.partial_cmp(&0.0) != Some(std::cmp::Ordering::Greater) {
            return Err(Error::Config(format!(
                "rotary base must be positive, got {}",
                r.base
            )));
        }
        if let Some(scaling) = r.scaling {
            if scaling.factor.partial_cmp(&1.0) == Some(std::cmp::Ordering::Less)
                || !scaling.factor.is_finite()
            {
                return Err(Error::Config(format!(
                    "rope scaling factor must be at least 1, got {}",
                    scaling.factor
                )));
            }
            if scaling.kind == RopeScalingKind::Dynamic && rotary_dim <= 2 {
                return Err(Error::Config(
                    "dynamic rope scaling needs a rotary dim above 2".to_string(),
                ));
            }
        }
        if self.tiling.max_block_size == 0 || self.tiling.max_used_core_num == 0 {
            return Err(Error::Config(format!(
                "tiling limits must be non-zero: {:?}",
                self.tiling
            )));
        }
        if self.num_ranks == 0 {
            return Err(Error::Config(
                "at least one device rank is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary.rotary_dim.unwrap_or(self.model.head_dim)
    }

    pub fn softmax_scale(&self) -> f32 {
        1.0 / (self.model.head_dim as f32).sqrt()
    }

    pub fn act_dtype(&self) -> DType {
        self.dtype.dtype()
    }

    pub fn cache_dtype(&self) -> DType {
        self.cache.cache_type.to_dtype(self.act_dtype())
    }

    pub fn kv_cache_geometry(&self) -> KvCacheGeometry {
        kv_cache_geometry(&self.model, &self.cache)
    }
}
