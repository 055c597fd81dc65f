/// Per-rank device memory: KV pools plus contiguous buffers for long-lived tensors.
mod block_manager;
/// The lower-level owner of a rank's KV arena. Hands out fixed-size blocks by id.
mod block_pool;
mod config;
/// The higher-level manager of the blocks allocated: one block table per sequence.
mod kv_cache_manager;
mod layers;
mod tensor_manager;

pub use block_manager::{BlockManager, RankMemory};
pub use block_pool::{Block, BlockPool};
pub use config::{kv_cache_geometry, CacheConfig, ModelConfigLike, ModelGeometry};
pub use kv_cache_manager::{KvBlockTable, KvCacheManager, SequenceKernelView};
pub use layers::{
    AttentionDispatcher, BatchDescriptor, DispatcherState, LayerParams,
    PagedAttentionInputMetadata, SequenceSlice, Stage,
};
pub use tensor_manager::{TensorManager, WeightTensor};
