use std::time::Instant;

use candle_core::{bail, DType, Device, IndexOp, Result, Tensor};
use tracing::trace;

use super::{
    cache::{gather_rows, reshape_and_cache, rows_as_u32},
    rope::apply_rotary_embedding,
    slice::slice_rows,
    AttentionBackend, KvCacheArgs, KvLayout, PagedAttentionArgs,
};
use crate::telemetry::{self, AttentionCallMetrics, CacheUpdateMetrics};

/// Block-wise attention with an online softmax, reading an offset table.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashAttentionBackend;

/// Dense attention over per-layer key/value block addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct PagedPointerBackend;

/// Dense attention reading an offset table.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveAttentionBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Softmax {
    Dense,
    Online { chunk: usize },
}

impl AttentionBackend for FlashAttentionBackend {
    fn name(&self) -> &'static str {
        "flash"
    }

    fn layout(&self) -> KvLayout {
        KvLayout::OffsetTable
    }

    fn forward(&self, args: &PagedAttentionArgs<'_>) -> Result<Tensor> {
        let blocks = offset_table_blocks(args)?;
        run(
            self.name(),
            args,
            &blocks,
            Softmax::Online {
                chunk: args.geometry.block_size,
            },
        )
    }
}

impl AttentionBackend for PagedPointerBackend {
    fn name(&self) -> &'static str {
        "paged"
    }

    fn layout(&self) -> KvLayout {
        KvLayout::PointerList
    }

    fn forward(&self, args: &PagedAttentionArgs<'_>) -> Result<Tensor> {
        let blocks = pointer_list_blocks(args)?;
        run(self.name(), args, &blocks, Softmax::Dense)
    }
}

impl AttentionBackend for NaiveAttentionBackend {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn layout(&self) -> KvLayout {
        KvLayout::OffsetTable
    }

    fn forward(&self, args: &PagedAttentionArgs<'_>) -> Result<Tensor> {
        let blocks = offset_table_blocks(args)?;
        run(self.name(), args, &blocks, Softmax::Dense)
    }
}

fn read_u32(t: &Tensor, what: &str, len: usize) -> Result<Vec<u32>> {
    let v = t.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    if v.len() != len {
        bail!("{what} has {} entries, expected {len}", v.len());
    }
    Ok(v)
}

fn block_offsets(args: &PagedAttentionArgs<'_>) -> Result<Vec<usize>> {
    let offsets = read_u32(args.block_offsets, "block_offsets", args.batch_size + 1)?;
    if offsets.first().copied() != Some(0) || offsets.windows(2).any(|w| w[1] < w[0]) {
        bail!("block_offsets must start at 0 and be non-decreasing, got {offsets:?}");
    }
    let total = offsets[args.batch_size] as usize;
    if total != args.total_block_num {
        bail!(
            "block_offsets cover {total} blocks but total_block_num is {}",
            args.total_block_num
        );
    }
    Ok(offsets.into_iter().map(|o| o as usize).collect())
}

/// Per-sequence block ids from the contiguous id list.
fn offset_table_blocks(args: &PagedAttentionArgs<'_>) -> Result<Vec<Vec<usize>>> {
    let KvCacheArgs::OffsetTable { block_ids } = args.kv_cache else {
        bail!("backend expects an offset table but was given a pointer list");
    };
    let offsets = block_offsets(args)?;
    let ids = read_u32(block_ids, "block_ids", args.total_block_num)?;
    Ok(offsets
        .windows(2)
        .map(|w| ids[w[0]..w[1]].iter().map(|&id| id as usize).collect())
        .collect())
}

/// Per-sequence block ids recovered from this layer's key/value addresses.
fn pointer_list_blocks(args: &PagedAttentionArgs<'_>) -> Result<Vec<Vec<usize>>> {
    let KvCacheArgs::PointerList {
        kv_list,
        arena_base,
    } = args.kv_cache
    else {
        bail!("backend expects a pointer list but was given an offset table");
    };
    let offsets = block_offsets(args)?;
    let (num_layers, total_blocks, pair) = kv_list.dims3()?;
    if pair != 2 || total_blocks != args.total_block_num || args.layer_index >= num_layers {
        bail!(
            "kv_list has shape {:?}, expected [>{}, {}, 2]",
            kv_list.dims(),
            args.layer_index,
            args.total_block_num
        );
    }
    let dtype = args.kv_arena.dtype();
    let g = &args.geometry;
    let block_bytes = g.block_bytes(dtype) as u64;
    let layer_base =
        arena_base.as_ptr_int() + (args.layer_index * g.layer_stride_bytes(dtype)) as u64;
    let value_offset = g.value_offset_bytes(dtype) as u64;
    let num_blocks =
        (args.kv_arena.elem_count() * dtype.size_in_bytes()) as u64 / block_bytes;

    let pairs = kv_list
        .i(args.layer_index)?
        .to_dtype(DType::I64)?
        .to_vec2::<i64>()?;
    let mut ids = Vec::with_capacity(pairs.len());
    for kv in pairs {
        let (k, v) = (kv[0] as u64, kv[1] as u64);
        let rel = k.wrapping_sub(layer_base);
        if k < layer_base || !rel.is_multiple_of(block_bytes) || rel / block_bytes >= num_blocks {
            bail!("key address {k:#x} is not a layer {} block", args.layer_index);
        }
        if v != k + value_offset {
            bail!("value address {v:#x} does not pair with key address {k:#x}");
        }
        ids.push((rel / block_bytes) as usize);
    }
    Ok(offsets
        .windows(2)
        .map(|w| ids[w[0]..w[1]].to_vec())
        .collect())
}

fn run(
    backend: &'static str,
    args: &PagedAttentionArgs<'_>,
    blocks: &[Vec<usize>],
    softmax: Softmax,
) -> Result<Tensor> {
    let start = Instant::now();
    let (heads, kv_heads, head_dim) = (args.num_heads, args.num_kv_heads, args.head_dim);
    if heads == 0 || kv_heads == 0 || !heads.is_multiple_of(kv_heads) {
        bail!("{heads} query heads cannot be grouped over {kv_heads} kv heads");
    }
    if kv_heads != args.geometry.num_kv_heads
        || head_dim != args.geometry.head_dim
        || args.layer_index >= args.geometry.num_layers
    {
        bail!(
            "layer {} with {kv_heads}x{head_dim} kv heads does not match the arena geometry {:?}",
            args.layer_index,
            args.geometry
        );
    }
    let (num_tokens, width) = args.qkv.dims2()?;
    if num_tokens != args.total_token_num || width != (heads + 2 * kv_heads) * head_dim {
        bail!(
            "qkv has shape {:?}, expected [{}, {}]",
            args.qkv.dims(),
            args.total_token_num,
            (heads + 2 * kv_heads) * head_dim
        );
    }
    let seq_offsets = read_u32(args.seq_offsets, "seq_offsets", args.batch_size + 1)?;
    let context_lens = read_u32(args.context_lens, "context_lens", args.batch_size)?;
    if seq_offsets[0] != 0 || seq_offsets[args.batch_size] as usize != num_tokens {
        bail!(
            "seq_offsets cover {} tokens but qkv has {num_tokens}",
            seq_offsets[args.batch_size]
        );
    }

    let [qt, kt, vt] = args.qkv_tilings;
    let q = slice_rows(args.qkv, qt.tiling, qt.block_dim)?.reshape((num_tokens, heads, head_dim))?;
    let k =
        slice_rows(args.qkv, kt.tiling, kt.block_dim)?.reshape((num_tokens, kv_heads, head_dim))?;
    let v =
        slice_rows(args.qkv, vt.tiling, vt.block_dim)?.reshape((num_tokens, kv_heads, head_dim))?;
    let q = apply_rotary_embedding(&q, args.cos_sin_cache, args.rope_pos, args.is_neox)?;
    let k = apply_rotary_embedding(&k, args.cos_sin_cache, args.rope_pos, args.is_neox)?;

    let g = &args.geometry;
    let kv_rows = g.rows_view(args.kv_arena)?;
    let mut outputs = Vec::with_capacity(args.batch_size);
    let mut max_context_len = 0;
    for (i, seq_blocks) in blocks.iter().enumerate() {
        let (lo, hi) = (seq_offsets[i] as usize, seq_offsets[i + 1] as usize);
        if hi < lo {
            bail!("seq_offsets must be non-decreasing, got {seq_offsets:?}");
        }
        let num_new = hi - lo;
        let context_len = context_lens[i] as usize;
        if num_new == 0 {
            continue;
        }
        if !args.is_multi_token_forward && num_new != 1 {
            bail!("single-token forward got {num_new} tokens for sequence {i}");
        }
        if context_len < num_new || context_len.div_ceil(g.block_size) > seq_blocks.len() {
            bail!(
                "sequence {i} has {num_new} new tokens, context length {context_len} and {} blocks of {}",
                seq_blocks.len(),
                g.block_size
            );
        }
        max_context_len = max_context_len.max(context_len);
        let cached = context_len - num_new;
        let slot = |pos: usize| (seq_blocks[pos / g.block_size], pos % g.block_size);

        let (new_keys, new_values): (Vec<_>, Vec<_>) = (cached..context_len)
            .map(|pos| {
                let (block, s) = slot(pos);
                (
                    g.key_row(block, args.layer_index, s),
                    g.value_row(block, args.layer_index, s),
                )
            })
            .unzip();
        reshape_and_cache(
            &k.narrow(0, lo, num_new)?,
            &v.narrow(0, lo, num_new)?,
            &kv_rows,
            &new_keys,
            &new_values,
        )?;

        let (ctx_keys, ctx_values): (Vec<_>, Vec<_>) = (0..context_len)
            .map(|pos| {
                let (block, s) = slot(pos);
                (
                    g.key_row(block, args.layer_index, s),
                    g.value_row(block, args.layer_index, s),
                )
            })
            .unzip();
        let ctx_k = gather_rows(&kv_rows, &rows_as_u32(&ctx_keys)?)?
            .reshape((context_len, kv_heads, head_dim))?;
        let ctx_v = gather_rows(&kv_rows, &rows_as_u32(&ctx_values)?)?
            .reshape((context_len, kv_heads, head_dim))?;

        let out = attend(
            &q.narrow(0, lo, num_new)?,
            &ctx_k,
            &ctx_v,
            cached,
            args.softmax_scale,
            softmax,
        )?;
        outputs.push(out.to_dtype(args.qkv.dtype())?);
    }

    telemetry::record_cache_update(&CacheUpdateMetrics {
        num_tokens,
        num_kv_heads: kv_heads,
        head_dim,
        block_size: g.block_size,
    });
    let out = if outputs.is_empty() {
        Tensor::zeros((0, heads * head_dim), args.qkv.dtype(), args.qkv.device())?
    } else {
        Tensor::cat(&outputs, 0)?
    };
    let elapsed = start.elapsed().as_secs_f64() * 1e3;
    telemetry::record_attention_call(&AttentionCallMetrics {
        backend,
        num_sequences: args.batch_size,
        num_heads: heads,
        num_kv_heads: kv_heads,
        head_dim,
        num_tokens,
        num_blocks: args.total_block_num,
        block_size: g.block_size,
        max_context_len,
        softmax_scale: args.softmax_scale,
        is_multi_token_forward: args.is_multi_token_forward,
    });
    telemetry::record_attention_duration(backend, elapsed);
    trace!(
        backend,
        layer = args.layer_index,
        num_tokens,
        elapsed_ms = elapsed,
        "attention forward"
    );
    Ok(out)
}

/// `[num_new, num_kv_heads, d]` to `[num_heads, num_new, d]`, repeating each kv
/// head for the query heads grouped onto it.
fn expand_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    let (len, kv_heads, head_dim) = x.dims3()?;
    let x = if n_rep == 1 {
        x.clone()
    } else {
        x.unsqueeze(2)?
            .expand((len, kv_heads, n_rep, head_dim))?
            .reshape((len, kv_heads * n_rep, head_dim))?
    };
    x.transpose(0, 1)?.contiguous()
}

/// `-inf` above the causal diagonal: new token `j` sees context `0..=cached + j`.
fn causal_mask(
    num_new: usize,
    context: std::ops::Range<usize>,
    cached: usize,
    device: &Device,
) -> Result<Tensor> {
    let len = context.len();
    let mask: Vec<f32> = (0..num_new)
        .flat_map(|j| {
            context
                .clone()
                .map(move |c| if c > cached + j { f32::NEG_INFINITY } else { 0. })
        })
        .collect();
    Tensor::from_vec(mask, (num_new, len), device)
}

/// Grouped-query attention of `q` `[num_new, H, d]` over `k`/`v` `[ctx, KVH, d]`.
/// Returns `[num_new, H * d]` in f32.
fn attend(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    cached: usize,
    scale: f32,
    softmax: Softmax,
) -> Result<Tensor> {
    let (num_new, heads, head_dim) = q.dims3()?;
    let (context_len, kv_heads, _) = k.dims3()?;
    let n_rep = heads / kv_heads;
    let q = q.to_dtype(DType::F32)?.transpose(0, 1)?.contiguous()?;
    let k = expand_kv(&k.to_dtype(DType::F32)?, n_rep)?;
    let v = expand_kv(&v.to_dtype(DType::F32)?, n_rep)?;
    let needs_mask = num_new > 1;

    let out = match softmax {
        Softmax::Dense => {
            let mut scores = (q.matmul(&k.t()?.contiguous()?)? * scale as f64)?;
            if needs_mask {
                let mask = causal_mask(num_new, 0..context_len, cached, q.device())?;
                scores = scores.broadcast_add(&mask)?;
            }
            let probs = candle_nn::ops::softmax_last_dim(&scores)?;
            probs.matmul(&v)?
        }
        Softmax::Online { chunk } => {
            let chunk = chunk.max(1);
            let mut state: Option<(Tensor, Tensor, Tensor)> = None;
            for lo in (0..context_len).step_by(chunk) {
                let len = chunk.min(context_len - lo);
                let kc = k.narrow(1, lo, len)?;
                let vc = v.narrow(1, lo, len)?.contiguous()?;
                let mut s = (q.matmul(&kc.t()?.contiguous()?)? * scale as f64)?;
                if needs_mask {
                    let mask = causal_mask(num_new, lo..lo + len, cached, q.device())?;
                    s = s.broadcast_add(&mask)?;
                }
                let chunk_max = s.max_keepdim(2)?;
                state = Some(match state {
                    None => {
                        let p = s.broadcast_sub(&chunk_max)?.exp()?;
                        (chunk_max, p.sum_keepdim(2)?, p.matmul(&vc)?)
                    }
                    Some((m, l, acc)) => {
                        let m_new = m.maximum(&chunk_max)?;
                        let p = s.broadcast_sub(&m_new)?.exp()?;
                        let alpha = (m - &m_new)?.exp()?;
                        let l = (l.broadcast_mul(&alpha)? + p.sum_keepdim(2)?)?;
                        let acc = (acc.broadcast_mul(&alpha)? + p.matmul(&vc)?)?;
                        (m_new, l, acc)
                    }
                });
            }
            let Some((_, l, acc)) = state else {
                bail!("attention over an empty context");
            };
            acc.broadcast_div(&l)?
        }
    };
    out.transpose(0, 1)?.reshape((num_new, heads * head_dim))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask() {
        let mask = causal_mask(3, 0..5, 2, &Device::Cpu)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let inf = f32::NEG_INFINITY;
        assert_eq!(mask[0], vec![0., 0., 0., inf, inf]);
        assert_eq!(mask[1], vec![0., 0., 0., 0., inf]);
        assert_eq!(mask[2], vec![0., 0., 0., 0., 0.]);
    }

    #[test]
    fn test_online_softmax_matches_dense() {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1., (3, 4, 8), &device).unwrap();
        let k = Tensor::randn(0f32, 1., (7, 2, 8), &device).unwrap();
        let v = Tensor::randn(0f32, 1., (7, 2, 8), &device).unwrap();
        let dense = attend(&q, &k, &v, 4, 0.35, Softmax::Dense).unwrap();
        let online = attend(&q, &k, &v, 4, 0.35, Softmax::Online { chunk: 3 }).unwrap();
        let diff = (dense - online)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "max diff {diff}");
    }

    #[test]
    fn test_single_key_returns_value() {
        let device = Device::Cpu;
        let q = Tensor::ones((1, 2, 2), DType::F32, &device).unwrap();
        let k = Tensor::ones((1, 1, 2), DType::F32, &device).unwrap();
        let v = Tensor::new(&[[[3f32, -1.]]], &device).unwrap();
        let out = attend(&q, &k, &v, 0, 1., Softmax::Dense).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![3., -1., 3., -1.]]);
    }
}
