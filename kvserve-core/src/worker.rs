use std::sync::Arc;

use candle_core::Tensor;
use tracing::info;

use crate::{
    config::EngineConfig,
    error::{Error, Result, SeqId},
    paged_attention::{
        AttentionDispatcher, BatchDescriptor, KvCacheManager, LayerParams,
        PagedAttentionInputMetadata, RankMemory,
    },
    rope::RotaryPositionCache,
    tiling::TilingCache,
};

/// Everything one rank needs to run attention for every layer.
///
/// Owned by a single worker thread. Nothing in it is shared with other ranks.
pub struct RankWorker {
    memory: RankMemory,
    tilings: Arc<TilingCache>,
    rotary: Arc<RotaryPositionCache>,
    layers: Vec<AttentionDispatcher>,
}

impl RankWorker {
    pub fn new(config: &EngineConfig, memory: RankMemory) -> Result<Self> {
        let stream = memory.stream();
        let tilings = Arc::new(TilingCache::new(config.tiling));
        let rotary = Arc::new(RotaryPositionCache::new(
            &config.rotary,
            config.model.head_dim,
            config.act_dtype(),
            stream.device(),
        )?);
        let layers = (0..config.model.num_layers)
            .map(|layer| {
                let mut dispatcher = AttentionDispatcher::new(tilings.clone());
                dispatcher.initialize(LayerParams::from_config(config, layer, rotary.clone()))?;
                Ok(dispatcher)
            })
            .collect::<Result<Vec<_>>>()?;
        info!(
            rank = stream.rank(),
            num_layers = layers.len(),
            backend = %config.backend,
            "rank worker ready"
        );
        Ok(Self {
            memory,
            tilings,
            rotary,
            layers,
        })
    }

    pub fn rank(&self) -> usize {
        self.memory.stream().rank()
    }

    pub fn kv_cache(&self) -> &KvCacheManager {
        self.memory.kv_cache()
    }

    pub fn kv_cache_mut(&mut self) -> &mut KvCacheManager {
        self.memory.kv_cache_mut()
    }

    pub fn tilings(&self) -> &Arc<TilingCache> {
        &self.tilings
    }

    pub fn rotary(&self) -> &Arc<RotaryPositionCache> {
        &self.rotary
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Reserve cache room for the new tokens of `batch`, registering unseen
    /// sequences. The whole batch is checked first, so a rejected batch
    /// leaves every sequence and the pool untouched.
    pub fn schedule(&mut self, batch: &BatchDescriptor) -> Result<()> {
        batch.validate()?;
        let appends = batch
            .sequences
            .iter()
            .map(|s| (s.seq_id, s.num_new_tokens))
            .collect::<Vec<_>>();
        let kv_cache = self.memory.kv_cache_mut();
        kv_cache.can_append_batch(&appends)?;
        for (seq_id, num_tokens) in appends {
            if !kv_cache.contains(seq_id) {
                kv_cache.create_sequence(seq_id)?;
            }
            kv_cache.append(seq_id, num_tokens)?;
        }
        Ok(())
    }

    /// Metadata shared by every layer of one forward pass.
    pub fn prepare(&self, batch: &BatchDescriptor) -> Result<PagedAttentionInputMetadata> {
        PagedAttentionInputMetadata::assemble(batch, self.memory.kv_cache(), self.memory.stream())
    }

    /// Run layer `layer`'s attention on its packed `qkv`.
    pub fn forward_layer(
        &mut self,
        layer: usize,
        qkv: &Tensor,
        metadata: &PagedAttentionInputMetadata,
    ) -> Result<Tensor> {
        let num_layers = self.layers.len();
        let dispatcher = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| Error::ShapeMismatch(format!("layer {layer} out of {num_layers}")))?;
        dispatcher.forward_with_metadata(
            qkv,
            metadata,
            self.memory.kv_cache(),
            self.memory.stream(),
        )
    }

    /// Free a finished sequence's blocks.
    pub fn finish(&mut self, seq_id: SeqId) -> Result<()> {
        self.memory.kv_cache_mut().evict(seq_id)
    }
}
