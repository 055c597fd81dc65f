use kvserve_paged_attn::KvCacheGeometry;
use serde::{Deserialize, Serialize};

use crate::utils::dtype::PagedCacheType;

pub trait ModelConfigLike {
    fn num_layers(&self) -> usize;
    fn hidden_size(&self) -> usize;
    fn num_kv_heads(&self) -> usize;
    fn num_attn_heads(&self) -> usize;
    fn head_dim(&self) -> usize {
        self.hidden_size() / self.num_attn_heads()
    }
}

/// Attention shape of the served model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelGeometry {
    pub num_layers: usize,
    pub num_attn_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl ModelConfigLike for ModelGeometry {
    fn hidden_size(&self) -> usize {
        self.num_attn_heads * self.head_dim
    }
    fn num_attn_heads(&self) -> usize {
        self.num_attn_heads
    }
    fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }
    fn num_layers(&self) -> usize {
        self.num_layers
    }
    fn head_dim(&self) -> usize {
        self.head_dim
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Token slots per block.
    pub block_size: usize,
    /// Blocks in each rank's pool.
    pub num_gpu_blocks: usize,
    pub max_blocks_per_seq: usize,
    #[serde(default)]
    pub cache_type: PagedCacheType,
    /// Byte budget of each rank's contiguous allocator. Unlimited when unset.
    #[serde(default)]
    pub max_contiguous_bytes: Option<usize>,
}

/// Arena layout for a model and cache config.
pub fn kv_cache_geometry(model: &dyn ModelConfigLike, cache: &CacheConfig) -> KvCacheGeometry {
    KvCacheGeometry {
        num_layers: model.num_layers(),
        num_kv_heads: model.num_kv_heads(),
        head_dim: model.head_dim(),
        block_size: cache.block_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_from_model() {
        let model = ModelGeometry {
            num_layers: 4,
            num_attn_heads: 8,
            num_kv_heads: 2,
            head_dim: 16,
        };
        assert_eq!(model.hidden_size(), 128);
        let cache = CacheConfig {
            block_size: 16,
            num_gpu_blocks: 8,
            max_blocks_per_seq: 4,
            cache_type: PagedCacheType::Auto,
            max_contiguous_bytes: None,
        };
        let g = kv_cache_geometry(&model, &cache);
        assert_eq!(g.row_elems(), 32);
        assert_eq!(g.rows_per_block(), 4 * 2 * 16);
    }
}
