//! KV cache manager for paged attention.
//!
//! The manager owns a rank's `BlockPool` and one block table per live
//! sequence. Every block of a table stores all layers' keys and values for
//! `block_size` consecutive tokens, so a single table serves every layer.
//!
//! - `append`: grow a sequence, filling its last block before taking new ones.
//! - `evict`: return all of a sequence's blocks to the pool.
//! - `build_kernel_view`: the ordered block ids and addresses kernels read.

use std::collections::HashMap;

use kvserve_paged_attn::{DeviceDataPtr, KvCacheGeometry};
use tracing::{debug, info};

use super::block_pool::BlockPool;
use crate::error::{BlockId, Error, Result, SeqId};

/// Ordered blocks of one sequence and the fill of the last one.
///
/// Tokens = `(block_ids.len() - 1) * capacity + last_block_fill`, and 0 with no blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvBlockTable {
    block_ids: Vec<BlockId>,
    last_block_fill: usize,
    capacity: usize,
}

impl KvBlockTable {
    fn new(capacity: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            last_block_fill: 0,
            capacity,
        }
    }

    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    pub fn last_block_fill(&self) -> usize {
        self.last_block_fill
    }

    /// Token slots per block.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_tokens(&self) -> usize {
        match self.block_ids.len() {
            0 => 0,
            n => (n - 1) * self.capacity + self.last_block_fill,
        }
    }

    fn free_slots(&self) -> usize {
        if self.block_ids.is_empty() {
            0
        } else {
            self.capacity - self.last_block_fill
        }
    }

    /// Blocks needed to hold `extra` more tokens.
    fn blocks_needed(&self, extra: usize) -> usize {
        extra
            .saturating_sub(self.free_slots())
            .div_ceil(self.capacity)
    }
}

/// What a kernel needs to address one sequence's cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceKernelView {
    pub seq_id: SeqId,
    pub block_ids: Vec<BlockId>,
    /// Base address of each block, in `block_ids` order.
    pub block_addresses: Vec<DeviceDataPtr>,
    pub num_tokens: usize,
}

pub struct KvCacheManager {
    block_pool: BlockPool,
    geometry: KvCacheGeometry,
    max_blocks_per_seq: usize,
    tables: HashMap<SeqId, KvBlockTable>,
}

impl KvCacheManager {
    /// `block_pool` must have been sized for `geometry`.
    pub fn new(
        block_pool: BlockPool,
        geometry: KvCacheGeometry,
        max_blocks_per_seq: usize,
    ) -> Result<Self> {
        let expected = geometry.block_bytes(block_pool.dtype());
        if block_pool.block_bytes() != expected {
            return Err(Error::ShapeMismatch(format!(
                "pool blocks are {} bytes but the KV geometry needs {expected}",
                block_pool.block_bytes()
            )));
        }
        if geometry.block_size == 0 || max_blocks_per_seq == 0 {
            return Err(Error::Config(format!(
                "block size and max blocks per sequence must be non-zero, got {} and {max_blocks_per_seq}",
                geometry.block_size
            )));
        }
        Ok(Self {
            block_pool,
            geometry,
            max_blocks_per_seq,
            tables: HashMap::new(),
        })
    }

    pub fn block_pool(&self) -> &BlockPool {
        &self.block_pool
    }

    pub fn block_pool_mut(&mut self) -> &mut BlockPool {
        &mut self.block_pool
    }

    pub fn geometry(&self) -> &KvCacheGeometry {
        &self.geometry
    }

    /// Token slots per block.
    pub fn block_size(&self) -> usize {
        self.geometry.block_size
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_blocks_per_seq
    }

    pub fn usage(&self) -> f64 {
        self.block_pool.usage()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_pool.num_free_blocks()
    }

    /// Start tracking an empty sequence.
    pub fn create_sequence(&mut self, seq_id: SeqId) -> Result<()> {
        if self.tables.contains_key(&seq_id) {
            return Err(Error::DuplicateSequence(seq_id));
        }
        self.tables
            .insert(seq_id, KvBlockTable::new(self.geometry.block_size));
        Ok(())
    }

    pub fn contains(&self, seq_id: SeqId) -> bool {
        self.tables.contains_key(&seq_id)
    }

    pub fn num_sequences(&self) -> usize {
        self.tables.len()
    }

    pub fn block_table(&self, seq_id: SeqId) -> Result<&KvBlockTable> {
        self.tables
            .get(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))
    }

    pub fn num_tokens(&self, seq_id: SeqId) -> Result<usize> {
        Ok(self.block_table(seq_id)?.num_tokens())
    }

    /// Check that `num_tokens` more tokens fit both the per-sequence cap and the pool.
    pub fn can_append(&self, seq_id: SeqId, num_tokens: usize) -> Result<()> {
        self.block_table(seq_id)?;
        self.can_append_batch(&[(seq_id, num_tokens)])
    }

    /// Check a whole batch of appends at once, against each sequence's cap and
    /// the combined demand on the pool. Untracked ids count as empty sequences.
    pub fn can_append_batch(&self, appends: &[(SeqId, usize)]) -> Result<()> {
        let empty = KvBlockTable::new(self.geometry.block_size);
        let mut total_needed = 0;
        for &(seq_id, num_tokens) in appends {
            let table = self.tables.get(&seq_id).unwrap_or(&empty);
            let needed = table.blocks_needed(num_tokens);
            let required = table.block_ids.len() + needed;
            if required > self.max_blocks_per_seq {
                return Err(Error::CapacityExceeded {
                    seq_id,
                    required,
                    max: self.max_blocks_per_seq,
                });
            }
            total_needed += needed;
        }
        if total_needed > self.block_pool.num_free_blocks() {
            return Err(Error::AllocationFailure {
                rank: self.block_pool.rank(),
                reason: format!(
                    "{total_needed} new blocks needed but only {} are free",
                    self.block_pool.num_free_blocks()
                ),
            });
        }
        Ok(())
    }

    /// Reserve room for `num_tokens` more tokens. On error the table is unchanged.
    pub fn append(&mut self, seq_id: SeqId, num_tokens: usize) -> Result<()> {
        self.can_append(seq_id, num_tokens)?;
        let capacity = self.geometry.block_size;
        let table = self
            .tables
            .get_mut(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))?;
        let new_blocks = self
            .block_pool
            .allocate_many(table.blocks_needed(num_tokens))?;

        let mut remaining = num_tokens;
        let fill = remaining.min(table.free_slots());
        table.last_block_fill += fill;
        remaining -= fill;
        for id in new_blocks {
            table.block_ids.push(id);
            table.last_block_fill = remaining.min(capacity);
            remaining -= table.last_block_fill;
        }
        debug!(
            seq_id,
            num_tokens,
            total_tokens = table.num_tokens(),
            num_blocks = table.block_ids.len(),
            "appended tokens"
        );
        Ok(())
    }

    /// Stop tracking a sequence and free all of its blocks. On error the
    /// sequence and its blocks are left as they were.
    pub fn evict(&mut self, seq_id: SeqId) -> Result<()> {
        let table = self
            .tables
            .get(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))?;
        self.block_pool.free_many(&table.block_ids)?;
        let num_blocks = table.block_ids.len();
        self.tables.remove(&seq_id);
        info!(
            seq_id,
            num_blocks,
            free_blocks = self.block_pool.num_free_blocks(),
            "evicted sequence"
        );
        Ok(())
    }

    pub fn build_kernel_view(&self, seq_id: SeqId) -> Result<SequenceKernelView> {
        let table = self.block_table(seq_id)?;
        let block_addresses = table
            .block_ids
            .iter()
            .map(|&id| self.block_pool.resolve(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(SequenceKernelView {
            seq_id,
            block_ids: table.block_ids.clone(),
            block_addresses,
            num_tokens: table.num_tokens(),
        })
    }

    /// `(block_id, slot)` of each absolute token position in `positions`.
    pub fn slot_mapping(
        &self,
        seq_id: SeqId,
        positions: std::ops::Range<usize>,
    ) -> Result<Vec<(BlockId, usize)>> {
        let table = self.block_table(seq_id)?;
        if positions.end > table.num_tokens() {
            return Err(Error::ShapeMismatch(format!(
                "positions {positions:?} exceed the {} tokens of sequence {seq_id}",
                table.num_tokens()
            )));
        }
        let bs = self.geometry.block_size;
        Ok(positions
            .map(|p| (table.block_ids[p / bs], p % bs))
            .collect())
    }
}
