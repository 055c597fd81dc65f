use candle_core::{bail, DType, Result, Tensor};

/// Tiling of a strided row slice across the device's execution units.
///
/// `start`, `length` and `step` are in bytes. A row of `length` bytes is cut
/// into `step_block_num` chunks of `block_size` bytes, the last one being
/// `tail_block_size`; the `times` rows give `times * step_block_num` work
/// items spread over `used_core_num` cores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct SliceTilingData {
    pub start: u32,
    pub length: u32,
    pub step: u32,
    pub times: u32,
    pub block_size: u32,
    pub tail_block_size: u32,
    pub step_block_num: u32,
    pub used_core_num: u32,
}

impl SliceTilingData {
    pub const NUM_WORDS: usize = 8;

    #[allow(clippy::too_many_arguments)]
    pub fn generate(
        start: usize,
        length: usize,
        step: usize,
        times: usize,
        elem_size: usize,
        max_block_size: usize,
        max_used_core_num: usize,
    ) -> Result<Self> {
        let to_u32 = |v: usize, what: &str| -> Result<u32> {
            u32::try_from(v).map_err(|_| {
                candle_core::Error::Msg(format!("slice tiling {what} of {v} does not fit in u32"))
            })
        };
        if max_block_size == 0 || max_used_core_num == 0 {
            bail!("slice tiling needs a non-zero max block size and core count");
        }
        let length = length * elem_size;
        let (block_size, tail_block_size, step_block_num) = if length < max_block_size {
            (length, length, 1)
        } else {
            let tail = length % max_block_size;
            let tail_block_size = if tail != 0 { tail } else { max_block_size };
            (max_block_size, tail_block_size, length.div_ceil(max_block_size))
        };
        let work_items = times * step_block_num;
        let used_core_num = if work_items < max_used_core_num {
            work_items
        } else {
            max_used_core_num
        };
        Ok(Self {
            start: to_u32(start * elem_size, "start")?,
            length: to_u32(length, "length")?,
            step: to_u32(step * elem_size, "step")?,
            times: to_u32(times, "times")?,
            block_size: to_u32(block_size, "block size")?,
            tail_block_size: to_u32(tail_block_size, "tail block size")?,
            step_block_num: to_u32(step_block_num, "step block num")?,
            used_core_num: to_u32(used_core_num, "used core num")?,
        })
    }

    pub fn to_words(&self) -> [u32; Self::NUM_WORDS] {
        [
            self.start,
            self.length,
            self.step,
            self.times,
            self.block_size,
            self.tail_block_size,
            self.step_block_num,
            self.used_core_num,
        ]
    }

    pub fn from_words(words: &[u32]) -> Result<Self> {
        let &[
            start,
            length,
            step,
            times,
            block_size,
            tail_block_size,
            step_block_num,
            used_core_num,
        ] = words
        else {
            bail!(
                "slice tiling expects {} words, got {}",
                Self::NUM_WORDS,
                words.len()
            );
        };
        Ok(Self {
            start,
            length,
            step,
            times,
            block_size,
            tail_block_size,
            step_block_num,
            used_core_num,
        })
    }

    /// Copy the tiling into a device buffer that kernels read.
    pub fn to_device(&self, device: &candle_core::Device) -> Result<Tensor> {
        Tensor::from_slice(&self.to_words(), Self::NUM_WORDS, device)
    }
}

/// Strided slice kernel: for each of `times` rows of `input`, copy `length`
/// bytes starting at `start`, rows being `step` bytes apart.
///
/// `tiling` is the device-resident [`SliceTilingData`]; `block_dim` is the
/// core count the launch was sized for and must match it.
pub fn slice_rows(input: &Tensor, tiling: &Tensor, block_dim: usize) -> Result<Tensor> {
    if tiling.dtype() != DType::U32 {
        bail!("slice tiling must be u32, got {:?}", tiling.dtype());
    }
    let t = SliceTilingData::from_words(&tiling.flatten_all()?.to_vec1::<u32>()?)?;
    if block_dim == 0 || block_dim != t.used_core_num as usize {
        bail!(
            "slice launched on {block_dim} cores but tiling was built for {}",
            t.used_core_num
        );
    }
    let elem_size = input.dtype().size_in_bytes();
    let to_elems = |bytes: u32| -> Result<usize> {
        let bytes = bytes as usize;
        if !bytes.is_multiple_of(elem_size) {
            bail!("slice tiling byte count {bytes} is not a multiple of element size {elem_size}");
        }
        Ok(bytes / elem_size)
    };
    let (start, length, step) = (to_elems(t.start)?, to_elems(t.length)?, to_elems(t.step)?);
    let (block, tail) = (to_elems(t.block_size)?, to_elems(t.tail_block_size)?);
    let times = t.times as usize;
    let chunks = t.step_block_num as usize;

    let flat = input.flatten_all()?;
    let needed = if times == 0 {
        0
    } else {
        (times - 1) * step + start + length
    };
    if needed > flat.elem_count() {
        bail!(
            "slice reads {needed} elements but the input only has {}",
            flat.elem_count()
        );
    }
    if times == 0 || length == 0 {
        return Tensor::zeros((times, length), input.dtype(), input.device());
    }

    let num_items = times * chunks;
    let mut pieces: Vec<Option<Tensor>> = vec![None; num_items];
    for core in 0..block_dim {
        for item in (core..num_items).step_by(block_dim) {
            let (row, chunk) = (item / chunks, item % chunks);
            let len = if chunk + 1 == chunks { tail } else { block };
            let src = row * step + start + chunk * block;
            pieces[item] = Some(flat.narrow(0, src, len)?);
        }
    }
    let pieces = pieces.into_iter().flatten().collect::<Vec<_>>();
    if pieces.len() != num_items {
        bail!("slice left {} work items unassigned", num_items - pieces.len());
    }
    Tensor::cat(&pieces, 0)?.reshape((times, length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    #[test]
    fn test_generate_single_block() {
        let t = SliceTilingData::generate(0, 200, 200, 1, 1, 256, 48).unwrap();
        assert_eq!(t.block_size, 200);
        assert_eq!(t.tail_block_size, 200);
        assert_eq!(t.step_block_num, 1);
        assert_eq!(t.used_core_num, 1);
    }

    #[test]
    fn test_generate_with_tail() {
        let t = SliceTilingData::generate(0, 300, 300, 1, 1, 256, 48).unwrap();
        assert_eq!(t.block_size, 256);
        assert_eq!(t.tail_block_size, 44);
        assert_eq!(t.step_block_num, 2);
    }

    #[test]
    fn test_generate_exact_multiple_and_byte_scaling() {
        // 256 f16 elements are 512 bytes: two full blocks, no short tail.
        let t = SliceTilingData::generate(8, 256, 1024, 3, 2, 256, 48).unwrap();
        assert_eq!(t.start, 16);
        assert_eq!(t.length, 512);
        assert_eq!(t.step, 2048);
        assert_eq!(t.block_size, 256);
        assert_eq!(t.tail_block_size, 256);
        assert_eq!(t.step_block_num, 2);
        assert_eq!(t.used_core_num, 6);
    }

    #[test]
    fn test_generate_core_cap() {
        let t = SliceTilingData::generate(0, 300, 300, 40, 1, 256, 48).unwrap();
        assert_eq!(t.used_core_num, 48);
        let t = SliceTilingData::generate(0, 300, 300, 23, 1, 256, 48).unwrap();
        assert_eq!(t.used_core_num, 46);
    }

    #[test]
    fn test_words_round_trip_rejects_short() {
        assert!(SliceTilingData::from_words(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_slice_rows_matches_narrow() {
        let device = Device::Cpu;
        // 5 rows of 200 f32; take columns [72, 72 + 100).
        let input = Tensor::arange(0f32, 1000f32, &device)
            .unwrap()
            .reshape((5, 200))
            .unwrap();
        let tiling = SliceTilingData::generate(72, 100, 200, 5, 4, 256, 48).unwrap();
        assert_eq!(tiling.step_block_num, 2);
        let dev_tiling = tiling.to_device(&device).unwrap();
        let out = slice_rows(&input, &dev_tiling, tiling.used_core_num as usize).unwrap();
        let expected = input.narrow(1, 72, 100).unwrap();
        assert_eq!(out.dims(), &[5, 100]);
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            expected.to_vec2::<f32>().unwrap()
        );
        assert_eq!(out.i((4, 99)).unwrap().to_scalar::<f32>().unwrap(), 971.0);
    }

    #[test]
    fn test_slice_rows_rejects_wrong_block_dim() {
        let device = Device::Cpu;
        let input = Tensor::zeros((2, 8), DType::F32, &device).unwrap();
        let tiling = SliceTilingData::generate(0, 4, 8, 2, 4, 256, 48).unwrap();
        let dev_tiling = tiling.to_device(&device).unwrap();
        assert!(slice_rows(&input, &dev_tiling, 7).is_err());
    }
}
