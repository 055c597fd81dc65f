use candle_core::{bail, Result, Tensor};

/// Write each token's key and value row into the KV arena.
///
/// `key` and `value` are `[num_tokens, row_elems]` (or any shape with that many
/// elements per token); `kv_rows` is the arena viewed as `[rows, row_elems]`.
/// Token `i` lands in `key_rows[i]` and `value_rows[i]`. Values are cast to the
/// arena's dtype.
pub fn reshape_and_cache(
    key: &Tensor,
    value: &Tensor,
    kv_rows: &Tensor,
    key_rows: &[usize],
    value_rows: &[usize],
) -> Result<()> {
    let (num_rows, row_elems) = kv_rows.dims2()?;
    let num_tokens = key_rows.len();
    if value_rows.len() != num_tokens {
        bail!(
            "got {num_tokens} key slots but {} value slots",
            value_rows.len()
        );
    }
    if num_tokens == 0 {
        return Ok(());
    }
    let key = key
        .reshape((num_tokens, row_elems))?
        .to_dtype(kv_rows.dtype())?;
    let value = value
        .reshape((num_tokens, row_elems))?
        .to_dtype(kv_rows.dtype())?;
    if let Some(&row) = key_rows.iter().chain(value_rows).find(|&&r| r >= num_rows) {
        bail!("kv slot row {row} is outside the arena of {num_rows} rows");
    }

    write_runs(&key, kv_rows, key_rows)?;
    write_runs(&value, kv_rows, value_rows)
}

/// Copy `src` rows into `dst`, one `slice_set` per run of consecutive target rows.
fn write_runs(src: &Tensor, dst: &Tensor, rows: &[usize]) -> Result<()> {
    let mut start = 0;
    while start < rows.len() {
        let mut end = start + 1;
        while end < rows.len() && rows[end] == rows[end - 1] + 1 {
            end += 1;
        }
        let run = src.narrow(0, start, end - start)?.contiguous()?;
        dst.slice_set(&run, 0, rows[start])?;
        start = end;
    }
    Ok(())
}

/// Gather `rows` of the arena view `[rows, row_elems]` into a dense tensor.
pub fn gather_rows(kv_rows: &Tensor, rows: &[u32]) -> Result<Tensor> {
    let (_, row_elems) = kv_rows.dims2()?;
    if rows.is_empty() {
        return Tensor::zeros((0, row_elems), kv_rows.dtype(), kv_rows.device());
    }
    let ids = Tensor::from_slice(rows, rows.len(), kv_rows.device())?;
    kv_rows.index_select(&ids, 0)
}

/// Token-major rows as u32 indices, as `index_select` takes them.
pub(crate) fn rows_as_u32(rows: &[usize]) -> Result<Vec<u32>> {
    rows.iter()
        .map(|&r| {
            u32::try_from(r).map_err(|_| {
                candle_core::Error::Msg(format!("kv row {r} does not fit in a u32 index"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_write_then_gather() {
        let device = Device::Cpu;
        let arena = Tensor::zeros(32, DType::F32, &device).unwrap();
        let rows = arena.reshape((8, 4)).unwrap();
        let key = Tensor::arange(1f32, 9f32, &device)
            .unwrap()
            .reshape((2, 4))
            .unwrap();
        let value = key.neg().unwrap();
        reshape_and_cache(&key, &value, &rows, &[2, 3], &[6, 0]).unwrap();

        // The arena itself was written, not a copy.
        let flat = arena.to_vec1::<f32>().unwrap();
        assert_eq!(&flat[8..16], &[1., 2., 3., 4., 5., 6., 7., 8.]);
        assert_eq!(&flat[0..4], &[-5., -6., -7., -8.]);

        let got = gather_rows(&rows, &[6, 3]).unwrap();
        assert_eq!(
            got.to_vec2::<f32>().unwrap(),
            vec![vec![-1., -2., -3., -4.], vec![5., 6., 7., 8.]]
        );
    }

    #[test]
    fn test_write_casts_to_arena_dtype() {
        let device = Device::Cpu;
        let arena = Tensor::zeros(8, DType::F16, &device).unwrap();
        let rows = arena.reshape((4, 2)).unwrap();
        let key = Tensor::new(&[[0.5f32, 1.5]], &device).unwrap();
        reshape_and_cache(&key, &key, &rows, &[1], &[2]).unwrap();
        let got = gather_rows(&rows, &[1])
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap();
        assert_eq!(got.to_vec2::<f32>().unwrap(), vec![vec![0.5, 1.5]]);
    }

    #[test]
    fn test_fp8_arena_round_trip() {
        let device = Device::Cpu;
        let arena = Tensor::zeros(8, DType::F8E4M3, &device).unwrap();
        let rows = arena.reshape((4, 2)).unwrap();
        let key = Tensor::new(&[[0.5f32, -3.0], [1.5, 0.3]], &device).unwrap();
        let value = key.affine(2.0, 0.0).unwrap();
        reshape_and_cache(&key, &value, &rows, &[0, 1], &[2, 3]).unwrap();
        let keys = gather_rows(&rows, &[0, 1])
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(&keys[0], &[0.5, -3.0]);
        assert_eq!(keys[1][0], 1.5);
        // 0.3 is not representable with three mantissa bits.
        assert!((keys[1][1] - 0.3).abs() < 0.02);
        let values = gather_rows(&rows, &[2])
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap();
        assert_eq!(values.to_vec2::<f32>().unwrap(), vec![vec![1.0, -6.0]]);
    }

    #[test]
    fn test_out_of_range_slot() {
        let device = Device::Cpu;
        let rows = Tensor::zeros((4, 2), DType::F32, &device).unwrap();
        let key = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
        assert!(reshape_and_cache(&key, &key, &rows, &[4], &[0]).is_err());
    }
}
