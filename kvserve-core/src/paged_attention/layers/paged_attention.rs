use std::sync::Arc;

use candle_core::Tensor;
use kvserve_paged_attn::{
    backend_for, AttentionBackend, AttentionBackendKind, DeviceStream, KvCacheArgs, KvLayout,
    PagedAttentionArgs,
};
use tracing::{debug, info};

use super::input_metadata::{BatchDescriptor, PagedAttentionInputMetadata};
use crate::{
    config::EngineConfig,
    error::{Error, Result},
    paged_attention::KvCacheManager,
    rope::RotaryPositionCache,
    tiling::{TilingCache, TilingSignature},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Uninitialized,
    Ready,
    Forwarding,
}

/// Fixed per-layer parameters, set once by `initialize`.
#[derive(Clone, Debug)]
pub struct LayerParams {
    pub layer_index: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub block_size: usize,
    pub softmax_scale: f32,
    pub backend: AttentionBackendKind,
    pub rotary: Arc<RotaryPositionCache>,
}

impl LayerParams {
    pub fn from_config(
        config: &EngineConfig,
        layer_index: usize,
        rotary: Arc<RotaryPositionCache>,
    ) -> Self {
        Self {
            layer_index,
            num_heads: config.model.num_attn_heads,
            num_kv_heads: config.model.num_kv_heads,
            head_dim: config.model.head_dim,
            block_size: config.cache.block_size,
            softmax_scale: config.softmax_scale(),
            backend: config.backend,
            rotary,
        }
    }
}

struct Layer {
    params: LayerParams,
    backend: Box<dyn AttentionBackend>,
}

/// Attention of one transformer layer over the paged KV cache.
///
/// The backend kernel is resolved once in `initialize`; each `forward` only
/// assembles arguments and launches it.
pub struct AttentionDispatcher {
    tilings: Arc<TilingCache>,
    state: DispatcherState,
    layer: Option<Layer>,
}

impl AttentionDispatcher {
    /// `tilings` is shared by every dispatcher of the rank.
    pub fn new(tilings: Arc<TilingCache>) -> Self {
        Self {
            tilings,
            state: DispatcherState::Uninitialized,
            layer: None,
        }
    }

    pub fn initialize(&mut self, params: LayerParams) -> Result<()> {
        if self.state != DispatcherState::Uninitialized {
            return Err(Error::AlreadyInitialized);
        }
        let LayerParams {
            num_heads,
            num_kv_heads,
            head_dim,
            block_size,
            ..
        } = params;
        if num_heads == 0 || num_kv_heads == 0 || head_dim == 0 || block_size == 0 {
            return Err(Error::Config(format!(
                "layer {} has a zero dimension: {num_heads} heads, {num_kv_heads} kv heads, head dim {head_dim}, block size {block_size}",
                params.layer_index
            )));
        }
        if !num_heads.is_multiple_of(num_kv_heads) {
            return Err(Error::Config(format!(
                "{num_heads} heads cannot be grouped over {num_kv_heads} kv heads"
            )));
        }
        if params.rotary.rotary_dim() > head_dim {
            return Err(Error::Config(format!(
                "rotary dim {} exceeds head dim {head_dim}",
                params.rotary.rotary_dim()
            )));
        }
        let backend = backend_for(params.backend);
        info!(
            layer = params.layer_index,
            backend = backend.name(),
            num_heads,
            num_kv_heads,
            head_dim,
            "initialized attention dispatcher"
        );
        self.layer = Some(Layer { params, backend });
        self.state = DispatcherState::Ready;
        Ok(())
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.layer.as_ref().map(|l| l.backend.name())
    }

    pub fn layer_index(&self) -> Option<usize> {
        self.layer.as_ref().map(|l| l.params.layer_index)
    }

    /// Attend `qkv` (`[tokens, (heads + 2 * kv_heads) * head_dim]`) for `batch`,
    /// writing the new keys and values into `kv_cache`.
    ///
    /// The tokens of `batch` must already be appended to `kv_cache`.
    pub fn forward(
        &mut self,
        qkv: &Tensor,
        batch: &BatchDescriptor,
        kv_cache: &KvCacheManager,
        stream: &DeviceStream,
    ) -> Result<Tensor> {
        if self.state == DispatcherState::Uninitialized {
            return Err(Error::NotInitialized);
        }
        let metadata = PagedAttentionInputMetadata::assemble(batch, kv_cache, stream)?;
        self.forward_with_metadata(qkv, &metadata, kv_cache, stream)
    }

    /// As [`forward`](Self::forward), with metadata assembled once and shared by every layer.
    pub fn forward_with_metadata(
        &mut self,
        qkv: &Tensor,
        metadata: &PagedAttentionInputMetadata,
        kv_cache: &KvCacheManager,
        stream: &DeviceStream,
    ) -> Result<Tensor> {
        let Some(layer) = self.layer.as_ref() else {
            return Err(Error::NotInitialized);
        };
        let p = &layer.params;
        let (num_tokens, width) = qkv.dims2()?;
        let q_width = p.num_heads * p.head_dim;
        let kv_width = p.num_kv_heads * p.head_dim;
        if num_tokens != metadata.total_token_num || width != q_width + 2 * kv_width {
            return Err(Error::ShapeMismatch(format!(
                "qkv is {:?} but the batch has {} tokens of width {}",
                qkv.dims(),
                metadata.total_token_num,
                q_width + 2 * kv_width
            )));
        }
        let geometry = *kv_cache.geometry();
        if geometry.num_kv_heads != p.num_kv_heads
            || geometry.head_dim != p.head_dim
            || geometry.block_size != p.block_size
            || p.layer_index >= geometry.num_layers
        {
            return Err(Error::ShapeMismatch(format!(
                "layer {} does not fit the KV cache geometry {geometry:?}",
                p.layer_index
            )));
        }

        let element_size = qkv.dtype().size_in_bytes();
        let slice = |start, length| TilingSignature {
            start,
            length,
            step: width,
            times: num_tokens,
            element_size,
        };
        let q_tiling = self.tilings.get_or_compute(&slice(0, q_width), stream)?;
        let k_tiling = self
            .tilings
            .get_or_compute(&slice(q_width, kv_width), stream)?;
        let v_tiling = self
            .tilings
            .get_or_compute(&slice(q_width + kv_width, kv_width), stream)?;

        let kv_args = match layer.backend.layout() {
            KvLayout::PointerList => KvCacheArgs::PointerList {
                kv_list: &metadata.kv_list,
                arena_base: metadata.arena_base,
            },
            KvLayout::OffsetTable => KvCacheArgs::OffsetTable {
                block_ids: &metadata.block_ids,
            },
        };
        let args = PagedAttentionArgs {
            qkv,
            seq_offsets: &metadata.seq_offsets,
            context_lens: &metadata.context_lens,
            block_offsets: &metadata.block_offsets,
            kv_cache: kv_args,
            kv_arena: kv_cache.block_pool().storage(),
            geometry,
            rope_pos: &metadata.rope_pos,
            cos_sin_cache: p.rotary.cos_sin(),
            is_neox: p.rotary.is_neox(),
            qkv_tilings: [
                q_tiling.slice_ref(),
                k_tiling.slice_ref(),
                v_tiling.slice_ref(),
            ],
            num_heads: p.num_heads,
            num_kv_heads: p.num_kv_heads,
            head_dim: p.head_dim,
            softmax_scale: p.softmax_scale,
            batch_size: metadata.batch_size,
            total_token_num: metadata.total_token_num,
            total_block_num: metadata.total_block_num,
            layer_index: p.layer_index,
            is_multi_token_forward: metadata.is_multi_token_forward(),
            stream,
        };

        debug!(
            layer = p.layer_index,
            backend = layer.backend.name(),
            stage = ?metadata.stage,
            batch_size = metadata.batch_size,
            num_tokens,
            "launching attention kernel"
        );
        self.state = DispatcherState::Forwarding;
        let out = layer.backend.forward(&args);
        self.state = DispatcherState::Ready;
        out.map_err(|source| Error::KernelLaunchFailure {
            backend: layer.backend.name(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RotaryConfig, TilingConfig};
    use candle_core::{DType, Device};

    fn rotary() -> Arc<RotaryPositionCache> {
        let cfg = RotaryConfig {
            max_position_embeddings: 8,
            rotary_dim: None,
            base: 10000.0,
            is_neox: true,
            scaling: None,
        };
        Arc::new(RotaryPositionCache::new(&cfg, 4, DType::F32, &Device::Cpu).unwrap())
    }

    fn params(backend: AttentionBackendKind) -> LayerParams {
        LayerParams {
            layer_index: 0,
            num_heads: 2,
            num_kv_heads: 1,
            head_dim: 4,
            block_size: 2,
            softmax_scale: 0.5,
            backend,
            rotary: rotary(),
        }
    }

    #[test]
    fn test_state_machine() {
        let mut d = AttentionDispatcher::new(Arc::new(TilingCache::new(TilingConfig::default())));
        assert_eq!(d.state(), DispatcherState::Uninitialized);
        assert_eq!(d.backend_name(), None);
        d.initialize(params(AttentionBackendKind::Paged)).unwrap();
        assert_eq!(d.state(), DispatcherState::Ready);
        assert_eq!(d.backend_name(), Some("paged"));
        assert_eq!(d.layer_index(), Some(0));
        assert!(matches!(
            d.initialize(params(AttentionBackendKind::Flash)),
            Err(Error::AlreadyInitialized)
        ));
        assert_eq!(d.backend_name(), Some("paged"));
    }

    #[test]
    fn test_rejects_bad_grouping() {
        let mut d = AttentionDispatcher::new(Arc::new(TilingCache::new(TilingConfig::default())));
        let mut p = params(AttentionBackendKind::Naive);
        p.num_heads = 3;
        p.num_kv_heads = 2;
        assert!(matches!(d.initialize(p), Err(Error::Config(_))));
        assert_eq!(d.state(), DispatcherState::Uninitialized);
    }
}
