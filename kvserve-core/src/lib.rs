//! Paged KV cache and attention dispatch.
//!
//! Each device rank owns a [`BlockPool`] carved into fixed-size KV blocks, a
//! [`KvCacheManager`] mapping sequences to blocks, a [`TilingCache`] of
//! memoized slice tilings and one [`AttentionDispatcher`] per layer. A
//! [`RankWorker`] bundles them for a single worker thread; ranks share nothing.

mod config;
mod error;
mod paged_attention;
mod rope;
mod tiling;
mod utils;
mod worker;

pub use config::{EngineConfig, RopeScaling, RopeScalingKind, RotaryConfig, TilingConfig};
pub use error::{BlockId, Error, Result, SeqId};
pub use paged_attention::{
    kv_cache_geometry, AttentionDispatcher, BatchDescriptor, Block, BlockManager, BlockPool,
    CacheConfig, DispatcherState, KvBlockTable, KvCacheManager, LayerParams, ModelConfigLike,
    ModelGeometry, PagedAttentionInputMetadata, RankMemory, SequenceKernelView, SequenceSlice,
    Stage, TensorManager, WeightTensor,
};
pub use rope::RotaryPositionCache;
pub use tiling::{DeviceTiling, TilingCache, TilingCacheStats, TilingSignature};
pub use utils::dtype::{DTypeConversionError, NumericType, PagedCacheType};
pub use worker::RankWorker;

pub use kvserve_paged_attn::{AttentionBackendKind, DeviceDataPtr, DeviceStream, KvCacheGeometry};
