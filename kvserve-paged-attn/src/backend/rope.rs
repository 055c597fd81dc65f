use candle_core::{bail, DType, Result, Tensor, D};

/// Rotary-embed `x` (`[num_tokens, num_heads, head_dim]`) at `positions`.
///
/// `cos_sin_cache` is `[max_position, rotary_dim]` with the cosines in the first
/// half of each row and the sines in the second. Only the first `rotary_dim`
/// features of each head are rotated; the rest pass through. `is_neox` selects
/// the rotate-half pairing, otherwise adjacent features are paired.
pub fn apply_rotary_embedding(
    x: &Tensor,
    cos_sin_cache: &Tensor,
    positions: &Tensor,
    is_neox: bool,
) -> Result<Tensor> {
    let (num_tokens, num_heads, head_dim) = x.dims3()?;
    let (max_position, rotary_dim) = cos_sin_cache.dims2()?;
    if !rotary_dim.is_multiple_of(2) || rotary_dim > head_dim {
        bail!("rotary dim {rotary_dim} must be even and at most the head dim {head_dim}");
    }
    if positions.dims1()? != num_tokens {
        bail!(
            "got {} rotary positions for {num_tokens} tokens",
            positions.dims1()?
        );
    }
    if num_tokens == 0 || rotary_dim == 0 {
        return Ok(x.clone());
    }
    let positions = positions.to_dtype(DType::U32)?;
    if let Some(&p) = positions
        .to_vec1::<u32>()?
        .iter()
        .find(|&&p| p as usize >= max_position)
    {
        bail!("rotary position {p} is outside the cache of {max_position} positions");
    }

    let half = rotary_dim / 2;
    let cos_sin = cos_sin_cache.index_select(&positions, 0)?;
    let cos = cos_sin
        .narrow(1, 0, half)?
        .to_dtype(x.dtype())?
        .contiguous()?;
    let sin = cos_sin
        .narrow(1, half, half)?
        .to_dtype(x.dtype())?
        .contiguous()?;

    // The fused kernels take `[batch, heads, tokens, dim]`.
    let rot = x
        .narrow(D::Minus1, 0, rotary_dim)?
        .transpose(0, 1)?
        .unsqueeze(0)?
        .contiguous()?;
    let rot = if is_neox {
        candle_nn::rotary_emb::rope(&rot, &cos, &sin)?
    } else {
        candle_nn::rotary_emb::rope_i(&rot, &cos, &sin)?
    };
    let rot = rot.squeeze(0)?.transpose(0, 1)?;
    if rotary_dim == head_dim {
        return rot.contiguous();
    }
    let pass = x.narrow(D::Minus1, rotary_dim, head_dim - rotary_dim)?;
    Tensor::cat(&[&rot, &pass], D::Minus1)?
        .reshape((num_tokens, num_heads, head_dim))?
        .contiguous()
}
