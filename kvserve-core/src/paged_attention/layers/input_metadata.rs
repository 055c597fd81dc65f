use std::collections::HashSet;

use candle_core::Tensor;
use kvserve_paged_attn::{DeviceDataPtr, DeviceStream};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result, SeqId},
    paged_attention::KvCacheManager,
};

/// Execution stage of a batch. A batch is never mixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Any number of new tokens per sequence.
    Prefill,
    /// Exactly one new token per sequence.
    Decode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSlice {
    pub seq_id: SeqId,
    pub num_new_tokens: usize,
}

/// A batch as handed over by the scheduler. The new tokens of every sequence
/// must already be appended to its block table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub stage: Stage,
    /// In the order their tokens appear in the packed activations.
    pub sequences: Vec<SequenceSlice>,
    /// Rotary position of every new token.
    pub rope_positions: Vec<u32>,
}

impl BatchDescriptor {
    pub fn total_tokens(&self) -> usize {
        self.sequences.iter().map(|s| s.num_new_tokens).sum()
    }

    /// Shape checks that need no cache state: a non-empty batch of distinct
    /// sequences, token counts that fit the stage, one position per token.
    pub fn validate(&self) -> Result<()> {
        if self.sequences.is_empty() {
            return Err(Error::ShapeMismatch("batch has no sequences".to_string()));
        }
        let total_tokens = self.total_tokens();
        if self.rope_positions.len() != total_tokens {
            return Err(Error::ShapeMismatch(format!(
                "{} rotary positions for {total_tokens} tokens",
                self.rope_positions.len()
            )));
        }
        let mut seen = HashSet::new();
        for &SequenceSlice {
            seq_id,
            num_new_tokens,
        } in &self.sequences
        {
            if !seen.insert(seq_id) {
                return Err(Error::ShapeMismatch(format!(
                    "sequence {seq_id} appears twice in the batch"
                )));
            }
            match self.stage {
                Stage::Decode if num_new_tokens != 1 => {
                    return Err(Error::ShapeMismatch(format!(
                        "decode batch has {num_new_tokens} new tokens for sequence {seq_id}"
                    )))
                }
                Stage::Prefill if num_new_tokens == 0 => {
                    return Err(Error::ShapeMismatch(format!(
                        "prefill batch has no new tokens for sequence {seq_id}"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Device-side description of a batch, in both KV layouts.
#[derive(Debug, Clone)]
pub struct PagedAttentionInputMetadata {
    pub stage: Stage,
    pub batch_size: usize,
    pub total_token_num: usize,
    pub total_block_num: usize,
    pub max_context_len: usize,
    /// `[batch_size + 1]` u32 token offsets.
    pub seq_offsets: Tensor,
    /// `[batch_size]` u32 cached plus new tokens of each sequence.
    pub context_lens: Tensor,
    /// `[batch_size + 1]` u32 cumulative block counts.
    pub block_offsets: Tensor,
    /// `[total_block_num]` u32 block ids, sequences concatenated.
    pub block_ids: Tensor,
    /// `[num_layers, total_block_num, 2]` i64 key and value block addresses.
    pub kv_list: Tensor,
    pub arena_base: DeviceDataPtr,
    /// `[total_token_num]` u32.
    pub rope_pos: Tensor,
}

impl PagedAttentionInputMetadata {
    /// Validate `batch` against the block tables and lay it out for the kernels.
    pub fn assemble(
        batch: &BatchDescriptor,
        kv_cache: &KvCacheManager,
        stream: &DeviceStream,
    ) -> Result<Self> {
        batch.validate()?;
        let total_token_num = batch.total_tokens();

        let pool = kv_cache.block_pool();
        let geometry = kv_cache.geometry();
        let dtype = pool.dtype();
        let layer_stride = geometry.layer_stride_bytes(dtype);
        let value_offset = geometry.value_offset_bytes(dtype) as i64;

        let mut seq_offsets = vec![0u32];
        let mut block_offsets = vec![0u32];
        let mut context_lens = Vec::with_capacity(batch.sequences.len());
        let mut block_ids = Vec::new();
        let mut addresses = Vec::new();
        for slice in &batch.sequences {
            let SequenceSlice {
                seq_id,
                num_new_tokens,
            } = *slice;
            let view = kv_cache.build_kernel_view(seq_id)?;
            if view.block_ids.len() > kv_cache.max_blocks_per_seq() {
                return Err(Error::CapacityExceeded {
                    seq_id,
                    required: view.block_ids.len(),
                    max: kv_cache.max_blocks_per_seq(),
                });
            }
            if view.num_tokens < num_new_tokens {
                return Err(Error::ShapeMismatch(format!(
                    "sequence {seq_id} holds {} tokens but {num_new_tokens} are new",
                    view.num_tokens
                )));
            }
            let last_token = seq_offsets[seq_offsets.len() - 1] as usize + num_new_tokens;
            seq_offsets.push(to_u32(last_token)?);
            context_lens.push(to_u32(view.num_tokens)?);
            for &id in &view.block_ids {
                block_ids.push(to_u32(id)?);
            }
            block_offsets.push(to_u32(block_ids.len())?);
            addresses.extend(view.block_addresses);
        }

        let total_block_num = block_ids.len();
        let num_layers = geometry.num_layers;
        let mut kv_list = Vec::with_capacity(num_layers * total_block_num * 2);
        for layer in 0..num_layers {
            for address in &addresses {
                let key = address.offset(layer * layer_stride).as_ptr_int() as i64;
                kv_list.push(key);
                kv_list.push(key + value_offset);
            }
        }

        let dev = stream.device();
        let batch_size = batch.sequences.len();
        Ok(Self {
            stage: batch.stage,
            batch_size,
            total_token_num,
            total_block_num,
            max_context_len: context_lens.iter().copied().max().unwrap_or(0) as usize,
            seq_offsets: Tensor::from_vec(seq_offsets, batch_size + 1, dev)?,
            context_lens: Tensor::from_vec(context_lens, batch_size, dev)?,
            block_offsets: Tensor::from_vec(block_offsets, batch_size + 1, dev)?,
            block_ids: Tensor::from_vec(block_ids, total_block_num, dev)?,
            kv_list: Tensor::from_vec(kv_list, (num_layers, total_block_num, 2), dev)?,
            arena_base: pool.base_address(),
            rope_pos: Tensor::from_slice(&batch.rope_positions, total_token_num, dev)?,
        })
    }

    pub fn is_multi_token_forward(&self) -> bool {
        self.stage == Stage::Prefill
    }
}

fn to_u32(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::ShapeMismatch(format!("{v} does not fit in a u32 index")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paged_attention::BlockPool;
    use candle_core::DType;
    use kvserve_paged_attn::KvCacheGeometry;

    fn manager() -> KvCacheManager {
        let geometry = KvCacheGeometry {
            num_layers: 2,
            num_kv_heads: 1,
            head_dim: 2,
            block_size: 2,
        };
        let pool = BlockPool::new(
            &DeviceStream::cpu(0),
            8,
            geometry.block_bytes(DType::F32),
            DType::F32,
        )
        .unwrap();
        KvCacheManager::new(pool, geometry, 4).unwrap()
    }

    fn prefill(seqs: &[(SeqId, usize)]) -> BatchDescriptor {
        BatchDescriptor {
            stage: Stage::Prefill,
            sequences: seqs
                .iter()
                .map(|&(seq_id, num_new_tokens)| SequenceSlice {
                    seq_id,
                    num_new_tokens,
                })
                .collect(),
            rope_positions: seqs.iter().flat_map(|&(_, n)| 0..n as u32).collect(),
        }
    }

    #[test]
    fn test_layouts() {
        let mut m = manager();
        m.create_sequence(0).unwrap();
        m.create_sequence(1).unwrap();
        m.append(0, 3).unwrap();
        m.append(1, 1).unwrap();
        let stream = DeviceStream::cpu(0);
        let batch = prefill(&[(0, 3), (1, 1)]);
        let meta = PagedAttentionInputMetadata::assemble(&batch, &m, &stream).unwrap();
        assert_eq!(meta.total_token_num, 4);
        assert_eq!(meta.total_block_num, 3);
        assert_eq!(meta.max_context_len, 3);
        assert_eq!(meta.seq_offsets.to_vec1::<u32>().unwrap(), vec![0, 3, 4]);
        assert_eq!(meta.context_lens.to_vec1::<u32>().unwrap(), vec![3, 1]);
        assert_eq!(meta.block_offsets.to_vec1::<u32>().unwrap(), vec![0, 2, 3]);
        assert_eq!(meta.block_ids.to_vec1::<u32>().unwrap(), vec![0, 1, 2]);
        assert!(meta.is_multi_token_forward());

        let g = m.geometry();
        let base = m.block_pool().base_address().as_ptr_int() as i64;
        let block_bytes = g.block_bytes(DType::F32) as i64;
        let value_offset = g.value_offset_bytes(DType::F32) as i64;
        let kv_list = meta.kv_list.to_vec3::<i64>().unwrap();
        let key = base + 2 * block_bytes;
        assert_eq!(kv_list[0][2], vec![key, key + value_offset]);
        let key = base + block_bytes + g.layer_stride_bytes(DType::F32) as i64;
        assert_eq!(kv_list[1][1], vec![key, key + value_offset]);
    }

    #[test]
    fn test_decode_requires_single_tokens() {
        let mut m = manager();
        m.create_sequence(0).unwrap();
        m.append(0, 2).unwrap();
        let mut batch = prefill(&[(0, 2)]);
        batch.stage = Stage::Decode;
        assert!(matches!(
            PagedAttentionInputMetadata::assemble(&batch, &m, &DeviceStream::cpu(0)),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_rejects_inconsistent_batches() {
        let mut m = manager();
        m.create_sequence(0).unwrap();
        m.append(0, 2).unwrap();
        let stream = DeviceStream::cpu(0);

        let mut batch = prefill(&[(0, 2)]);
        batch.rope_positions.pop();
        assert!(matches!(
            PagedAttentionInputMetadata::assemble(&batch, &m, &stream),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(
            PagedAttentionInputMetadata::assemble(&prefill(&[(0, 3)]), &m, &stream),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(
            PagedAttentionInputMetadata::assemble(&prefill(&[(5, 1)]), &m, &stream),
            Err(Error::UnknownSequence(5))
        ));
        assert!(matches!(
            PagedAttentionInputMetadata::assemble(&prefill(&[(0, 1), (0, 1)]), &m, &stream),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(
            PagedAttentionInputMetadata::assemble(&prefill(&[]), &m, &stream),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
