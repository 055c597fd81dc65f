//! Per-rank device memory: the KV cache of each rank plus an allocator for
//! long-lived contiguous buffers such as weights.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use kvserve_paged_attn::{get_tensor_device_ptr, DeviceDataPtr, DeviceStream};
use tracing::{debug, info};

use super::{block_pool::BlockPool, kv_cache_manager::KvCacheManager};
use crate::{
    config::EngineConfig,
    error::{BlockId, Error, Result},
};

/// A variable-size device buffer.
#[derive(Debug)]
struct ContiguousBlock {
    storage: Tensor,
    address: DeviceDataPtr,
}

/// Contiguous buffers of one rank, each its own allocation.
#[derive(Debug)]
struct ContiguousAllocator {
    blocks: HashMap<BlockId, ContiguousBlock>,
    next_id: BlockId,
    used_bytes: usize,
    max_bytes: Option<usize>,
}

impl ContiguousAllocator {
    fn new(max_bytes: Option<usize>) -> Self {
        Self {
            blocks: HashMap::new(),
            next_id: 0,
            used_bytes: 0,
            max_bytes,
        }
    }
}

/// Everything one device rank owns.
pub struct RankMemory {
    stream: DeviceStream,
    kv_cache: KvCacheManager,
    contiguous: ContiguousAllocator,
}

impl RankMemory {
    pub fn stream(&self) -> &DeviceStream {
        &self.stream
    }

    pub fn kv_cache(&self) -> &KvCacheManager {
        &self.kv_cache
    }

    pub fn kv_cache_mut(&mut self) -> &mut KvCacheManager {
        &mut self.kv_cache
    }
}

/// Device memory of every rank, addressed through the active rank.
pub struct BlockManager {
    ranks: Vec<RankMemory>,
    active: usize,
}

impl BlockManager {
    /// One KV pool and contiguous allocator per stream; `streams[i]` must be rank `i`.
    pub fn new(config: &EngineConfig, streams: Vec<DeviceStream>) -> Result<Self> {
        if streams.is_empty() {
            return Err(Error::Config(
                "block manager needs at least one device".to_string(),
            ));
        }
        let geometry = config.kv_cache_geometry();
        let dtype = config.cache_dtype();
        let ranks = streams
            .into_iter()
            .enumerate()
            .map(|(rank, stream)| {
                if stream.rank() != rank {
                    return Err(Error::InvalidDevice {
                        rank: stream.rank(),
                        num_devices: rank + 1,
                    });
                }
                let pool = BlockPool::for_kv_cache(&config.model, &config.cache, dtype, &stream)?;
                Ok(RankMemory {
                    kv_cache: KvCacheManager::new(pool, geometry, config.cache.max_blocks_per_seq)?,
                    contiguous: ContiguousAllocator::new(config.cache.max_contiguous_bytes),
                    stream,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        info!(num_ranks = ranks.len(), "initialized block manager");
        Ok(Self { ranks, active: 0 })
    }

    pub fn num_devices(&self) -> usize {
        self.ranks.len()
    }

    pub fn set_active_device(&mut self, rank: usize) -> Result<()> {
        if rank >= self.ranks.len() {
            return Err(Error::InvalidDevice {
                rank,
                num_devices: self.ranks.len(),
            });
        }
        self.active = rank;
        Ok(())
    }

    pub fn active_device(&self) -> usize {
        self.active
    }

    pub fn rank(&self, rank: usize) -> Result<&RankMemory> {
        self.ranks.get(rank).ok_or(Error::InvalidDevice {
            rank,
            num_devices: self.ranks.len(),
        })
    }

    pub fn rank_mut(&mut self, rank: usize) -> Result<&mut RankMemory> {
        let num_devices = self.ranks.len();
        self.ranks
            .get_mut(rank)
            .ok_or(Error::InvalidDevice { rank, num_devices })
    }

    pub fn active(&self) -> &RankMemory {
        &self.ranks[self.active]
    }

    pub fn active_mut(&mut self) -> &mut RankMemory {
        &mut self.ranks[self.active]
    }

    /// Split into per-rank memories, e.g. to hand one to each worker thread.
    pub fn into_ranks(self) -> Vec<RankMemory> {
        self.ranks
    }

    /// Allocate a zeroed `byte_length` buffer on the active rank. Zero-length
    /// buffers are allowed and still get their own id.
    pub fn allocate_contiguous(&mut self, byte_length: usize) -> Result<BlockId> {
        let rank = self.active;
        let memory = &mut self.ranks[rank];
        let alloc = &mut memory.contiguous;
        if let Some(max) = alloc.max_bytes {
            if alloc.used_bytes + byte_length > max {
                return Err(Error::AllocationFailure {
                    rank,
                    reason: format!(
                        "{byte_length} bytes requested with {} of {max} in use",
                        alloc.used_bytes
                    ),
                });
            }
        }
        let storage = Tensor::zeros(byte_length, DType::U8, memory.stream.device())
            .map_err(|e| Error::AllocationFailure {
                rank,
                reason: e.to_string(),
            })?;
        let address = get_tensor_device_ptr(&storage)?;
        let id = alloc.next_id;
        alloc.next_id += 1;
        alloc.used_bytes += byte_length;
        alloc.blocks.insert(id, ContiguousBlock { storage, address });
        debug!(rank, id, byte_length, address = %address, "allocated contiguous block");
        Ok(id)
    }

    pub fn free_contiguous(&mut self, id: BlockId) -> Result<()> {
        let rank = self.active;
        let alloc = &mut self.ranks[rank].contiguous;
        let block = alloc
            .blocks
            .remove(&id)
            .ok_or(Error::InvalidBlockId { rank, block_id: id })?;
        alloc.used_bytes -= block.storage.elem_count();
        Ok(())
    }

    /// Address of a contiguous block on the active rank.
    pub fn resolve(&self, id: BlockId) -> Result<DeviceDataPtr> {
        self.contiguous_block(id).map(|b| b.address)
    }

    /// The `[byte_length]` u8 buffer behind a contiguous block on the active rank.
    pub fn storage(&self, id: BlockId) -> Result<&Tensor> {
        self.contiguous_block(id).map(|b| &b.storage)
    }

    pub fn contiguous_bytes_in_use(&self) -> usize {
        self.active().contiguous.used_bytes
    }

    fn contiguous_block(&self, id: BlockId) -> Result<&ContiguousBlock> {
        self.active()
            .contiguous
            .blocks
            .get(&id)
            .ok_or(Error::InvalidBlockId {
                rank: self.active,
                block_id: id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_contiguous_bytes: Option<usize>) -> EngineConfig {
        let mut config = EngineConfig::from_json_str(
            r#"{
                "model": { "num_layers": 1, "num_attn_heads": 2, "num_kv_heads": 1, "head_dim": 4 },
                "cache": { "block_size": 2, "num_gpu_blocks": 4, "max_blocks_per_seq": 4 },
                "rotary": { "max_position_embeddings": 16 }
            }"#,
        )
        .unwrap();
        config.cache.max_contiguous_bytes = max_contiguous_bytes;
        config
    }

    fn streams(n: usize) -> Vec<DeviceStream> {
        (0..n).map(DeviceStream::cpu).collect()
    }

    #[test]
    fn test_active_device() {
        let mut m = BlockManager::new(&config(None), streams(2)).unwrap();
        assert_eq!(m.num_devices(), 2);
        m.set_active_device(1).unwrap();
        assert_eq!(m.active().stream().rank(), 1);
        assert!(matches!(
            m.set_active_device(2),
            Err(Error::InvalidDevice {
                rank: 2,
                num_devices: 2
            })
        ));
        assert_eq!(m.active_device(), 1);
    }

    #[test]
    fn test_contiguous_budget() {
        let mut m = BlockManager::new(&config(Some(100)), streams(1)).unwrap();
        let a = m.allocate_contiguous(60).unwrap();
        assert!(matches!(
            m.allocate_contiguous(41),
            Err(Error::AllocationFailure { rank: 0, .. })
        ));
        let empty = m.allocate_contiguous(0).unwrap();
        assert_eq!(m.storage(empty).unwrap().dims(), &[0]);
        let b = m.allocate_contiguous(40).unwrap();
        assert_ne!(empty, b);
        assert_ne!(a, b);
        assert_eq!(m.storage(b).unwrap().dims(), &[40]);
        m.free_contiguous(a).unwrap();
        assert_eq!(m.contiguous_bytes_in_use(), 40);
        assert!(m.resolve(a).is_err());
        assert!(!m.resolve(b).unwrap().is_null());
        assert!(m.free_contiguous(a).is_err());
    }

    #[test]
    fn test_ranks_do_not_alias() {
        let mut m = BlockManager::new(&config(None), streams(2)).unwrap();
        let a = m.allocate_contiguous(8).unwrap();
        m.set_active_device(1).unwrap();
        assert!(m.resolve(a).is_err());
        let b = m.allocate_contiguous(8).unwrap();
        assert_eq!(a, b);
        assert_ne!(
            m.rank(0).unwrap().kv_cache().block_pool().base_address(),
            m.rank(1).unwrap().kv_cache().block_pool().base_address()
        );
    }

    #[test]
    fn test_stream_rank_order() {
        let streams = vec![DeviceStream::cpu(1)];
        assert!(matches!(
            BlockManager::new(&config(None), streams),
            Err(Error::InvalidDevice { .. })
        ));
    }
}
