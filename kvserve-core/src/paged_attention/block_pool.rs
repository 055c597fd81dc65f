//! Block pool for the paged KV cache.
//!
//! One pool owns one flat device arena, cut into `num_blocks` equal blocks.
//! Block records live in a `Vec` indexed by id, so resolving an id to its
//! address is O(1). Free ids are kept on a LIFO stack:
//! - O(1) allocation (pop)
//! - O(1) free (push), so a just-freed block is the next one handed out
//! - addresses are `base + id * block_bytes` and never move

use std::collections::HashSet;

use candle_core::{DType, Tensor};
use kvserve_paged_attn::{get_tensor_device_ptr, DeviceDataPtr, DeviceStream};
use tracing::info;

use super::config::CacheConfig;
use crate::error::{BlockId, Error, Result};

/// Metadata for one fixed-size block of device memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub size_bytes: usize,
    pub rank: usize,
    pub address: DeviceDataPtr,
    /// Whether the block is currently handed out.
    pub allocated: bool,
}

/// Owns every KV block of one rank.
#[derive(Debug)]
pub struct BlockPool {
    blocks: Vec<Block>,
    /// Stack of free ids; the top is allocated next.
    free_list: Vec<BlockId>,
    storage: Tensor,
    base: DeviceDataPtr,
    block_bytes: usize,
    rank: usize,
}

impl BlockPool {
    /// Allocate a zeroed arena of `num_blocks` blocks of `block_bytes` each.
    ///
    /// `block_bytes` must be a multiple of `dtype`'s size.
    pub fn new(
        stream: &DeviceStream,
        num_blocks: usize,
        block_bytes: usize,
        dtype: DType,
    ) -> Result<Self> {
        let rank = stream.rank();
        let elem_size = dtype.size_in_bytes();
        if num_blocks == 0 || block_bytes == 0 || !block_bytes.is_multiple_of(elem_size) {
            return Err(Error::AllocationFailure {
                rank,
                reason: format!(
                    "cannot carve {num_blocks} blocks of {block_bytes} bytes out of {dtype:?} elements"
                ),
            });
        }
        let storage = Tensor::zeros(
            (num_blocks, block_bytes / elem_size),
            dtype,
            stream.device(),
        )
        .map_err(|e| Error::AllocationFailure {
            rank,
            reason: e.to_string(),
        })?;
        let base = get_tensor_device_ptr(&storage)?;
        let blocks = (0..num_blocks)
            .map(|id| Block {
                id,
                size_bytes: block_bytes,
                rank,
                address: base.offset(id * block_bytes),
                allocated: false,
            })
            .collect();
        info!(
            rank,
            num_blocks,
            block_bytes,
            ?dtype,
            base = %base,
            "allocated KV block pool"
        );
        Ok(Self {
            blocks,
            free_list: (0..num_blocks).rev().collect(),
            storage,
            base,
            block_bytes,
            rank,
        })
    }

    /// A pool sized for the KV cache of `cache` blocks, each holding every layer's
    /// keys and values for `block_size` tokens.
    pub fn for_kv_cache(
        model: &dyn super::ModelConfigLike,
        cache: &CacheConfig,
        dtype: DType,
        stream: &DeviceStream,
    ) -> Result<Self> {
        let geometry = super::kv_cache_geometry(model, cache);
        Self::new(stream, cache.num_gpu_blocks, geometry.block_bytes(dtype), dtype)
    }

    /// Reserve one block with room for at least `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<BlockId> {
        if size > self.block_bytes {
            return Err(Error::AllocationFailure {
                rank: self.rank,
                reason: format!("{size} bytes do not fit a {} byte block", self.block_bytes),
            });
        }
        let id = self.free_list.pop().ok_or_else(|| Error::AllocationFailure {
            rank: self.rank,
            reason: format!("all {} blocks are in use", self.blocks.len()),
        })?;
        self.blocks[id].allocated = true;
        Ok(id)
    }

    /// Reserve `n` whole blocks, or none if fewer than `n` are free.
    pub fn allocate_many(&mut self, n: usize) -> Result<Vec<BlockId>> {
        if n > self.free_list.len() {
            return Err(Error::AllocationFailure {
                rank: self.rank,
                reason: format!(
                    "{n} blocks requested but only {} are free",
                    self.free_list.len()
                ),
            });
        }
        (0..n).map(|_| self.allocate(self.block_bytes)).collect()
    }

    /// Return a block to the pool. Unknown and already free ids are rejected.
    pub fn free(&mut self, id: BlockId) -> Result<()> {
        match self.blocks.get_mut(id) {
            Some(block) if block.allocated => {
                block.allocated = false;
                self.free_list.push(id);
                Ok(())
            }
            _ => Err(Error::InvalidBlockId {
                rank: self.rank,
                block_id: id,
            }),
        }
    }

    /// Free blocks in reverse, so that reallocating hands them out in the same order.
    ///
    /// Either every id is freed or, if any is unknown, free or repeated, none is.
    pub fn free_many(&mut self, ids: &[BlockId]) -> Result<()> {
        let mut seen = HashSet::with_capacity(ids.len());
        if let Some(&bad) = ids
            .iter()
            .find(|&&id| !self.is_allocated(id) || !seen.insert(id))
        {
            return Err(Error::InvalidBlockId {
                rank: self.rank,
                block_id: bad,
            });
        }
        for &id in ids.iter().rev() {
            self.free(id)?;
        }
        Ok(())
    }

    pub fn resolve(&self, id: BlockId) -> Result<DeviceDataPtr> {
        self.block(id).map(|b| b.address)
    }

    pub fn block(&self, id: BlockId) -> Result<&Block> {
        self.blocks.get(id).ok_or(Error::InvalidBlockId {
            rank: self.rank,
            block_id: id,
        })
    }

    pub fn is_allocated(&self, id: BlockId) -> bool {
        self.blocks.get(id).is_some_and(|b| b.allocated)
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    /// Fraction of blocks in use, in [0.0, 1.0].
    #[allow(clippy::cast_precision_loss)]
    pub fn usage(&self) -> f64 {
        1.0 - (self.num_free_blocks() as f64 / self.num_blocks() as f64)
    }

    /// The arena, `[num_blocks, block_elems]`.
    pub fn storage(&self) -> &Tensor {
        &self.storage
    }

    pub fn base_address(&self) -> DeviceDataPtr {
        self.base
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }
}
